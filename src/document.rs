//! Documents as opaque bytes plus a page count.

use std::{collections::BTreeMap, fmt, sync::Arc};

use tokio::{process::Command, sync::OnceCell};

use crate::{async_utils::check_for_command_failure, extract::ExtractError, prelude::*};

/// The only MIME type we accept.
const PDF_MIME_TYPE: &str = "application/pdf";

/// A document to reconcile. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

#[derive(Debug)]
struct DocumentInner {
    id: String,
    bytes: Vec<u8>,
    page_count: usize,
    /// A copy of `bytes` on disk, created the first time a command-line tool
    /// needs one.
    spool: OnceCell<SpooledPdf>,
}

/// A PDF written to a temporary directory. Deleted on drop.
#[derive(Debug)]
struct SpooledPdf {
    #[allow(dead_code)]
    tmpdir: tempfile::TempDir,
    path: PathBuf,
}

impl Document {
    /// Create a document with a page count declared by the caller.
    pub fn new(id: impl Into<String>, bytes: Vec<u8>, page_count: usize) -> Self {
        Self {
            inner: Arc::new(DocumentInner {
                id: id.into(),
                bytes,
                page_count,
                spool: OnceCell::new(),
            }),
        }
    }

    /// Load a PDF, computing its page count with `pdfinfo`.
    #[instrument(level = "debug", skip(bytes), fields(len = bytes.len()))]
    pub async fn load(id: &str, bytes: Vec<u8>) -> Result<Self, ExtractError> {
        let mime_type = infer::get(&bytes).map(|kind| kind.mime_type());
        if mime_type != Some(PDF_MIME_TYPE) {
            return Err(ExtractError::CorruptDocument {
                document_id: id.to_owned(),
                details: format!(
                    "expected {PDF_MIME_TYPE}, found {}",
                    mime_type.unwrap_or("unknown data")
                ),
            });
        }

        let spooled = SpooledPdf::create(&bytes)
            .await
            .map_err(|source| ExtractError::Io {
                document_id: id.to_owned(),
                source,
            })?;
        let page_count = get_pdf_page_count(id, &spooled.path).await?;
        debug!(id, page_count, "Loaded PDF");
        Ok(Self {
            inner: Arc::new(DocumentInner {
                id: id.to_owned(),
                bytes,
                page_count,
                spool: OnceCell::new_with(Some(spooled)),
            }),
        })
    }

    /// Our document ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Our raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    /// The number of pages in this document.
    pub fn page_count(&self) -> usize {
        self.inner.page_count
    }

    /// Make sure that `page` is a valid 1-based page number.
    pub fn check_page(&self, page: usize) -> Result<(), ExtractError> {
        if page == 0 || page > self.page_count() {
            Err(ExtractError::InvalidPageIndex {
                page,
                total_pages: self.page_count(),
            })
        } else {
            Ok(())
        }
    }

    /// Get the path to an on-disk copy of this document, creating it if
    /// necessary.
    pub async fn spool_path(&self) -> Result<&Path, ExtractError> {
        let spooled = self
            .inner
            .spool
            .get_or_try_init(|| SpooledPdf::create(&self.inner.bytes))
            .await
            .map_err(|source| ExtractError::Io {
                document_id: self.id().to_owned(),
                source,
            })?;
        Ok(&spooled.path)
    }

    /// Build a [`ExtractError::CorruptDocument`] for this document.
    pub fn corrupt(&self, details: impl fmt::Display) -> ExtractError {
        corrupt(self.id(), details)
    }
}

impl SpooledPdf {
    async fn create(bytes: &[u8]) -> std::io::Result<Self> {
        let tmpdir = tempfile::TempDir::with_prefix("quote")?;
        let path = tmpdir.path().join("document.pdf");
        tokio::fs::write(&path, bytes).await?;
        Ok(Self { tmpdir, path })
    }
}

fn corrupt(document_id: &str, details: impl fmt::Display) -> ExtractError {
    ExtractError::CorruptDocument {
        document_id: document_id.to_owned(),
        details: details.to_string(),
    }
}

/// Get the number of pages in a PDF using `pdfinfo`.
#[instrument(level = "debug", skip(path))]
async fn get_pdf_page_count(id: &str, path: &Path) -> Result<usize, ExtractError> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .map_err(|err| ExtractError::ToolUnavailable {
            tool: "pdfinfo",
            details: err.to_string(),
        })?;
    check_for_command_failure("pdfinfo", &output, None)
        .map_err(|err| corrupt(id, format!("{err:#}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let properties = stdout
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties
        .get("Pages")
        .ok_or_else(|| corrupt(id, "pdfinfo did not report a page count"))?;
    let page_count = pages
        .parse::<usize>()
        .map_err(|err| corrupt(id, format!("bad page count {pages:?}: {err}")))?;
    if page_count == 0 {
        return Err(corrupt(id, "PDF has no pages"));
    }
    Ok(page_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_page_bounds() {
        let document = Document::new("doc", vec![], 3);
        assert!(document.check_page(1).is_ok());
        assert!(document.check_page(3).is_ok());
        assert!(matches!(
            document.check_page(0),
            Err(ExtractError::InvalidPageIndex { page: 0, total_pages: 3 })
        ));
        assert!(matches!(
            document.check_page(4),
            Err(ExtractError::InvalidPageIndex { page: 4, total_pages: 3 })
        ));
    }

    #[tokio::test]
    async fn load_rejects_non_pdf_bytes() {
        let err = Document::load("notes", b"just some text".to_vec())
            .await
            .unwrap_err();
        match err {
            ExtractError::CorruptDocument { document_id, .. } => {
                assert_eq!(document_id, "notes")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spool_path_writes_bytes_once() {
        let document = Document::new("doc", b"%PDF-1.4 fake".to_vec(), 1);
        let first = document.spool_path().await.unwrap().to_owned();
        let second = document.clone().spool_path().await.unwrap().to_owned();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"%PDF-1.4 fake");
    }
}
