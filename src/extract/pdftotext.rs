//! Native text extraction using `pdftotext` from `poppler-utils`.

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, document::Document, prelude::*};

use super::{ExtractError, NativeExtractor};

/// Reads a page's embedded text layer with `pdftotext -layout`.
///
/// This will miss any "non-searchable" text in a PDF, which is what the
/// quality checks are for.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct PdfToTextExtractor {}

impl PdfToTextExtractor {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl NativeExtractor for PdfToTextExtractor {
    #[instrument(level = "debug", skip_all, fields(id = %document.id(), page = page_number))]
    async fn extract(
        &self,
        document: &Document,
        page_number: usize,
    ) -> Result<String, ExtractError> {
        document.check_page(page_number)?;
        let path = document.spool_path().await?;

        let page_arg = page_number.to_string();
        let output = Command::new("pdftotext")
            .args(["-f", &page_arg, "-l", &page_arg, "-layout"])
            .arg(path)
            .arg("-")
            .output()
            .await
            .map_err(|err| ExtractError::ToolUnavailable {
                tool: "pdftotext",
                details: err.to_string(),
            })?;
        check_for_command_failure("pdftotext", &output, None)
            .map_err(|err| document.corrupt(format!("page {page_number}: {err:#}")))?;

        Ok(strip_page_breaks(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// `pdftotext` ends every page with a form feed, which would otherwise count
/// as noise.
fn strip_page_breaks(text: &str) -> String {
    text.replace('\x0C', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_feeds_are_removed() {
        assert_eq!(strip_page_breaks("Policy Premium\n\x0C"), "Policy Premium\n");
        assert_eq!(strip_page_breaks(""), "");
    }

    #[tokio::test]
    async fn out_of_range_pages_fail_before_running_tools() {
        let document = Document::new("doc", vec![], 2);
        let err = PdfToTextExtractor::new()
            .extract(&document, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPageIndex { page: 3, .. }));
    }
}
