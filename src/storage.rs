//! Where document bytes come from, and where combined documents go.
//!
//! The pipeline never talks to storage directly. Callers pass a
//! [`DocumentStore`] in, so tests and other backends can swap it out.

use tokio::fs;

use crate::{assemble::CombinedDocument, prelude::*};

/// A place to load PDFs from and save combined documents to.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Load the bytes at `location`.
    async fn load(&self, location: &str) -> Result<Vec<u8>>;

    /// Persist a combined document, returning the locations written.
    async fn save_combined(
        &self,
        document_id: &str,
        combined: &CombinedDocument,
    ) -> Result<Vec<String>>;
}

/// A [`DocumentStore`] backed by the local filesystem.
///
/// Relative locations are resolved against `input_root`. Cloud storage URIs
/// of the form `gs://bucket/some/path.pdf` are treated as `some/path.pdf`
/// under `input_root`, so a synced copy of a bucket can be used directly.
#[derive(Clone, Debug)]
pub struct LocalStore {
    input_root: PathBuf,
    output_dir: Option<PathBuf>,
}

impl LocalStore {
    /// Create a new store. If `output_dir` is `None`, combined documents are
    /// not persisted.
    pub fn new(input_root: impl Into<PathBuf>, output_dir: Option<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_dir,
        }
    }

    /// Map a location to a local path.
    pub fn resolve(&self, location: &str) -> PathBuf {
        let relative = match location.strip_prefix("gs://") {
            Some(rest) => rest.split_once('/').map(|(_bucket, path)| path).unwrap_or(""),
            None => location,
        };
        self.input_root.join(relative)
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    #[instrument(level = "debug", skip(self))]
    async fn load(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location);
        fs::read(&path)
            .await
            .with_context(|| format!("Failed to read document at {:?}", path.display()))
    }

    #[instrument(level = "debug", skip(self, combined))]
    async fn save_combined(
        &self,
        document_id: &str,
        combined: &CombinedDocument,
    ) -> Result<Vec<String>> {
        let Some(output_dir) = &self.output_dir else {
            return Ok(vec![]);
        };
        check_file_stem(document_id)?;
        fs::create_dir_all(output_dir).await.with_context(|| {
            format!("Failed to create output directory {:?}", output_dir.display())
        })?;

        let json_path = output_dir.join(format!("{document_id}.combined.json"));
        let json = serde_json::to_vec_pretty(combined)
            .context("Failed to serialize combined document")?;
        fs::write(&json_path, json)
            .await
            .with_context(|| format!("Failed to write {:?}", json_path.display()))?;

        let report_path = output_dir.join(format!("{document_id}.combined.txt"));
        fs::write(&report_path, combined.render_report())
            .await
            .with_context(|| format!("Failed to write {:?}", report_path.display()))?;

        Ok(vec![
            json_path.display().to_string(),
            report_path.display().to_string(),
        ])
    }
}

/// Make sure a document ID can't escape the output directory when we use it
/// as a file name.
fn check_file_stem(document_id: &str) -> Result<()> {
    if document_id.is_empty()
        || document_id == "."
        || document_id.contains("..")
        || document_id.contains(['/', '\\', '\0'])
    {
        return Err(anyhow!(
            "Document ID {document_id:?} can't be used as a file name"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assemble::{PageTexts, assemble},
        extract::{PageText, TextSource},
        manifest::safe_carrier_name,
        select::select,
    };

    #[test]
    fn resolves_bucket_uris() {
        let store = LocalStore::new("/data", None);
        assert_eq!(
            store.resolve("gs://quotes-bucket/pdf/u1/acme_property.pdf"),
            PathBuf::from("/data/pdf/u1/acme_property.pdf")
        );
        assert_eq!(store.resolve("pdf/a.pdf"), PathBuf::from("/data/pdf/a.pdf"));
    }

    #[tokio::test]
    async fn saves_json_and_report() {
        let tmpdir = tempfile::TempDir::with_prefix("store").unwrap();
        let store = LocalStore::new(tmpdir.path(), Some(tmpdir.path().join("out")));

        let page = PageText::new(1, TextSource::NativeExtraction, "Policy Premium $1,200");
        let decision = select(&page, None);
        let texts = PageTexts::from_iter([page]);
        let combined = assemble(1, vec![decision], &texts).unwrap();

        let written = store.save_combined("acme_property", &combined).await.unwrap();
        assert_eq!(written.len(), 2);
        let json = std::fs::read_to_string(&written[0]).unwrap();
        let parsed: CombinedDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pages()[0].text, combined.pages()[0].text);
        assert_eq!(parsed.generated_at(), combined.generated_at());
        let report = std::fs::read_to_string(&written[1]).unwrap();
        assert!(report.contains("Policy Premium $1,200"));
    }

    #[tokio::test]
    async fn rejects_ids_that_leave_output_dir() {
        let tmpdir = tempfile::TempDir::with_prefix("store").unwrap();
        let out = tmpdir.path().join("out");
        let store = LocalStore::new(tmpdir.path(), Some(out.clone()));
        let texts = PageTexts::new();
        let combined = assemble(0, vec![], &texts).unwrap();

        for id in ["../escaped", "a/b_insurance_property", "a\\b", "..", ""] {
            let err = store.save_combined(id, &combined).await.unwrap_err();
            assert!(err.to_string().contains("can't be used as a file name"), "{id}");
        }
        assert!(!tmpdir.path().join("escaped.combined.json").exists());

        // Manifest IDs built from awkward carrier names are fine.
        let id = format!("{}_property", safe_carrier_name("A/B Insurance"));
        let written = store.save_combined(&id, &combined).await.unwrap();
        assert_eq!(
            PathBuf::from(&written[0]),
            out.join("a_b_insurance_property.combined.json")
        );
    }

    #[tokio::test]
    async fn no_output_dir_writes_nothing() {
        let store = LocalStore::new(".", None);
        let texts = PageTexts::new();
        let combined = assemble(0, vec![], &texts).unwrap();
        assert!(store.save_combined("x", &combined).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_reports_missing_files() {
        let store = LocalStore::new("/nonexistent-root", None);
        let err = store.load("missing.pdf").await.unwrap_err();
        assert!(format!("{err:#}").contains("missing.pdf"));
    }
}
