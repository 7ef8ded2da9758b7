//! Upload manifests, which list each carrier's quote PDFs.
//!
//! We only use these as an index into storage. A manifest looks like:
//!
//! ```json
//! {"uploads": [{"uploadId": "upload_20250101_120000", "carriers": [
//!   {"carrierName": "Acme & Sons",
//!    "propertyPDF": {"path": "gs://bucket/pdf/acme_property.pdf"},
//!    "liabilityPDF": null}
//! ]}]}
//! ```

use std::fmt;

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{prelude::*, queues::work::WorkInput};

/// The kinds of quote document a carrier may submit.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Property,
    /// General liability.
    Liability,
    Liquor,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Property => write!(f, "property"),
            DocumentKind::Liability => write!(f, "liability"),
            DocumentKind::Liquor => write!(f, "liquor"),
        }
    }
}

/// Input record for one document to reconcile.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct DocumentInput {
    /// Where to find the PDF. May be a local path or a `gs://` URI.
    pub location: String,

    /// The carrier who submitted this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier_name: Option<String>,

    /// What kind of quote this is. Required for field extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DocumentKind>,

    /// The page count, if the caller already knows it. Otherwise we ask
    /// `pdfinfo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
}

/// A file of uploads.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct UploadManifest {
    pub uploads: Vec<Upload>,
}

/// One user upload, containing documents from several carriers.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub upload_id: String,
    #[serde(default)]
    pub carriers: Vec<CarrierUpload>,
}

/// One carrier's documents.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CarrierUpload {
    #[serde(rename = "carrierName")]
    pub carrier_name: String,
    #[serde(rename = "propertyPDF", default)]
    pub property_pdf: Option<PdfRef>,
    #[serde(rename = "liabilityPDF", default)]
    pub liability_pdf: Option<PdfRef>,
    #[serde(rename = "liquorPDF", default)]
    pub liquor_pdf: Option<PdfRef>,
}

impl CarrierUpload {
    /// Every document this carrier uploaded, with its kind.
    fn documents(&self) -> impl Iterator<Item = (DocumentKind, &PdfRef)> {
        [
            (DocumentKind::Property, self.property_pdf.as_ref()),
            (DocumentKind::Liability, self.liability_pdf.as_ref()),
            (DocumentKind::Liquor, self.liquor_pdf.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, pdf)| pdf.map(|pdf| (kind, pdf)))
    }
}

/// A reference to an uploaded PDF.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct PdfRef {
    pub path: String,
}

impl UploadManifest {
    /// Find an upload by ID. If no ID is given, the manifest must contain
    /// exactly one upload.
    pub fn find_upload(&self, upload_id: Option<&str>) -> Result<&Upload> {
        match upload_id {
            Some(upload_id) => self
                .uploads
                .iter()
                .find(|u| u.upload_id == upload_id)
                .ok_or_else(|| anyhow!("No upload with ID {:?} in manifest", upload_id)),
            None => match self.uploads.as_slice() {
                [upload] => Ok(upload),
                uploads => Err(anyhow!(
                    "Manifest contains {} uploads; choose one with --upload-id",
                    uploads.len()
                )),
            },
        }
    }

    /// Build input records for every document in an upload.
    pub fn document_inputs(
        &self,
        upload_id: Option<&str>,
    ) -> Result<Vec<WorkInput<DocumentInput>>> {
        let upload = self.find_upload(upload_id)?;
        let inputs = upload
            .carriers
            .iter()
            .flat_map(|carrier| {
                carrier.documents().map(move |(kind, pdf)| WorkInput {
                    id: Value::String(format!(
                        "{}_{}",
                        safe_carrier_name(&carrier.carrier_name),
                        kind
                    )),
                    data: DocumentInput {
                        location: pdf.path.clone(),
                        carrier_name: Some(carrier.carrier_name.clone()),
                        kind: Some(kind),
                        page_count: None,
                    },
                })
            })
            .collect::<Vec<_>>();
        debug!(upload_id = %upload.upload_id, count = inputs.len(), "Documents in upload");
        Ok(inputs)
    }
}

/// Turn a carrier name into something safe for IDs and filenames. Only
/// `[a-z0-9_-]` survives; everything else becomes `_`.
pub fn safe_carrier_name(name: &str) -> String {
    name.to_lowercase()
        .replace('&', "and")
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "uploads": [
            {
                "uploadId": "upload_1",
                "uploadedAt": "2025-01-01T12:00:00",
                "carriers": [
                    {
                        "carrierName": "Acme & Sons",
                        "propertyPDF": {"path": "gs://b/pdf/acme_property.pdf", "size": 10},
                        "liabilityPDF": null,
                        "liquorPDF": {"path": "gs://b/pdf/acme_liquor.pdf"}
                    },
                    {"carrierName": "Blue Shield", "liabilityPDF": {"path": "blue.pdf"}}
                ]
            },
            {"uploadId": "upload_2", "carriers": []}
        ]
    }"#;

    #[test]
    fn safe_names() {
        assert_eq!(safe_carrier_name("Acme & Sons"), "acme_and_sons");
        assert_eq!(safe_carrier_name("State Farm"), "state_farm");
        assert_eq!(safe_carrier_name("A/B Insurance"), "a_b_insurance");
        assert_eq!(safe_carrier_name("../Zürich Re."), "___z_rich_re_");
    }

    #[test]
    fn lists_documents_for_upload() {
        let manifest: UploadManifest = serde_json::from_str(MANIFEST).unwrap();
        let inputs = manifest.document_inputs(Some("upload_1")).unwrap();
        let ids = inputs.iter().map(|i| i.id.as_str().unwrap()).collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec!["acme_and_sons_property", "acme_and_sons_liquor", "blue_shield_liability"]
        );
        assert_eq!(inputs[1].data.kind, Some(DocumentKind::Liquor));
        assert_eq!(inputs[2].data.location, "blue.pdf");
    }

    #[test]
    fn upload_must_be_unambiguous() {
        let manifest: UploadManifest = serde_json::from_str(MANIFEST).unwrap();
        assert!(manifest.document_inputs(None).is_err());
        assert!(manifest.document_inputs(Some("nope")).is_err());
        assert!(manifest.document_inputs(Some("upload_2")).unwrap().is_empty());
    }

    #[test]
    fn input_records_parse_from_json() {
        let input = WorkInput::<DocumentInput>::from_json(serde_json::json!({
            "id": "x",
            "location": "a.pdf",
            "kind": "property",
        }))
        .unwrap();
        assert_eq!(input.data.kind, Some(DocumentKind::Property));
        assert_eq!(input.data.carrier_name, None);
    }
}
