//! OCR using `pdftocairo` to rasterize pages and `tesseract` to read them.

use std::io;

use tokio::process::Command;

use crate::{async_utils::check_for_command_failure, document::Document, prelude::*};

use super::{ExtractError, OcrExtractor};

/// Tesseract page segmentation settings, tried in order.
const TESSERACT_CONFIGS: &[&[&str]] = &[
    &["--oem", "3", "--psm", "6"],
    &["--oem", "3", "--psm", "3"],
    &[],
];

/// A result with more than this many characters, once trimmed, is good enough
/// to stop trying other configurations.
const GOOD_ENOUGH_CHARS: usize = 50;

/// Default rasterization resolution. Twice the 72 DPI of a PDF page.
pub const DEFAULT_OCR_DPI: u32 = 144;

/// OCR extractor wrapping the `pdftocairo` and `tesseract` CLI tools.
#[derive(Clone, Debug)]
pub struct TesseractExtractor {
    dpi: u32,
    language: String,
}

impl TesseractExtractor {
    /// Create a new `tesseract` extractor.
    pub fn new(dpi: u32, language: impl Into<String>) -> Self {
        Self {
            dpi,
            language: language.into(),
        }
    }

    /// Rasterize a page to PNG, returning the image path.
    async fn rasterize(
        &self,
        document: &Document,
        page_number: usize,
        tmpdir: &Path,
    ) -> Result<PathBuf, ExtractError> {
        let path = document.spool_path().await?;
        let out_prefix = tmpdir.join("page");
        let page_arg = page_number.to_string();
        let output = Command::new("pdftocairo")
            .args(["-png", "-singlefile", "-r", &self.dpi.to_string()])
            .args(["-f", &page_arg, "-l", &page_arg])
            .arg(path)
            .arg(&out_prefix)
            .output()
            .await
            .map_err(|err| ExtractError::ToolUnavailable {
                tool: "pdftocairo",
                details: err.to_string(),
            })?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))
            .map_err(|err| document.corrupt(format!("page {page_number}: {err:#}")))?;
        Ok(out_prefix.with_extension("png"))
    }

    /// Run `tesseract` once with the given extra arguments.
    async fn recognize(&self, image: &Path, config: &[&str]) -> Result<String, ExtractError> {
        let output = Command::new("tesseract")
            .arg(image)
            .arg("stdout")
            .args(["-l", &self.language])
            .args(config)
            .output()
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => {
                    ExtractError::OcrUnavailable("tesseract is not installed".to_owned())
                }
                _ => ExtractError::OcrUnavailable(format!("cannot run tesseract: {err}")),
            })?;
        check_for_command_failure("tesseract", &output, None)
            .map_err(|err| ExtractError::OcrUnavailable(format!("{err:#}")))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl OcrExtractor for TesseractExtractor {
    #[instrument(level = "debug", skip_all, fields(id = %document.id(), page = page_number))]
    async fn extract_via_ocr(
        &self,
        document: &Document,
        page_number: usize,
    ) -> Result<String, ExtractError> {
        document.check_page(page_number)?;
        let tmpdir = tempfile::TempDir::with_prefix("ocr").map_err(|source| {
            ExtractError::Io {
                document_id: document.id().to_owned(),
                source,
            }
        })?;
        let image = self.rasterize(document, page_number, tmpdir.path()).await?;

        let mut best: Option<String> = None;
        let mut last_error = None;
        for config in TESSERACT_CONFIGS {
            match self.recognize(&image, config).await {
                Ok(text) if text.trim().chars().count() > GOOD_ENOUGH_CHARS => {
                    return Ok(text);
                }
                Ok(text) => {
                    trace!(?config, chars = text.len(), "Weak OCR result");
                    if best.as_ref().is_none_or(|b| text.trim().len() > b.trim().len()) {
                        best = Some(text);
                    }
                }
                Err(err @ ExtractError::OcrUnavailable(_)) if best.is_none() => {
                    debug!(?config, %err, "OCR configuration failed");
                    last_error = Some(err);
                }
                Err(err) => debug!(?config, %err, "OCR configuration failed"),
            }
        }

        match (best, last_error) {
            (Some(text), _) => Ok(text),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(String::new()),
        }
    }
}

/// Does this `pdftocairo` stderr line describe a real error?
///
/// Poppler complains about damaged cross-reference tables that it then
/// repairs, so we don't treat those as failures.
fn is_error_line(line: &str) -> bool {
    let line = line.to_ascii_lowercase();
    line.contains("error") && !line.contains("xref")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xref_warnings_are_not_errors() {
        assert!(is_error_line("Syntax Error: Couldn't read page"));
        assert!(!is_error_line("Syntax Error: xref num 12 not found"));
        assert!(!is_error_line("Internal: everything fine"));
    }

    #[tokio::test]
    async fn out_of_range_pages_fail_before_running_tools() {
        let document = Document::new("doc", vec![], 1);
        let err = TesseractExtractor::new(DEFAULT_OCR_DPI, "eng")
            .extract_via_ocr(&document, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPageIndex { page: 0, .. }));
    }
}
