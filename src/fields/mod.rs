//! Coverage field extraction from chunks, and merging the per-chunk answers.
//!
//! Extraction itself happens behind [`FieldExtractor`], so the merge rules can
//! be tested without an LLM. See [`openai`] for the real backend.

use std::{collections::BTreeMap, ops::AddAssign};

use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use serde_json::{Map, json};

use crate::{
    assemble::Chunk, async_utils::io::JsonObject, manifest::DocumentKind, prelude::*,
};

pub mod openai;

const PROPERTY_FIELDS: &str = include_str!("property.toml");
const LIABILITY_FIELDS: &str = include_str!("liability.toml");
const LIQUOR_FIELDS: &str = include_str!("liquor.toml");

/// How many chunks of one document we submit at once. The LLM queue applies
/// its own global limit on top of this.
const CHUNKS_IN_FLIGHT: usize = 4;

/// The fields we want from one kind of document.
#[derive(Clone, Debug, Deserialize)]
pub struct FieldList {
    pub fields: Vec<String>,

    /// Extra extraction advice for the prompt.
    #[serde(default)]
    pub hints: Option<String>,
}

impl FieldList {
    /// The built-in field list for `kind`.
    pub fn for_kind(kind: DocumentKind) -> Result<Self> {
        let source = match kind {
            DocumentKind::Property => PROPERTY_FIELDS,
            DocumentKind::Liability => LIABILITY_FIELDS,
            DocumentKind::Liquor => LIQUOR_FIELDS,
        };
        toml::from_str(source)
            .with_context(|| format!("Built-in {kind} field list is invalid"))
    }

    /// A strict JSON Schema for one chunk's answer: an object with every
    /// field, each holding a nullable `value` and `page`.
    pub fn response_schema(&self) -> Value {
        let field_schema = json!({
            "type": "object",
            "properties": {
                "value": { "type": ["string", "null"] },
                "page": { "type": ["integer", "null"] },
            },
            "required": ["value", "page"],
            "additionalProperties": false,
        });
        let properties = self
            .fields
            .iter()
            .map(|field| (field.clone(), field_schema.clone()))
            .collect::<Map<_, _>>();
        json!({
            "title": "ChunkFields",
            "type": "object",
            "properties": properties,
            "required": self.fields,
            "additionalProperties": false,
        })
    }
}

/// One field value, and the page it was found on.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ExtractedField {
    pub value: Option<String>,
    pub page: Option<usize>,
}

impl ExtractedField {
    /// Parse one entry of an LLM response. Models don't always follow the
    /// schema, so bare values and numeric strings are accepted too.
    pub fn from_response(raw: &Value) -> Self {
        match raw {
            Value::Object(obj) => Self {
                value: obj.get("value").and_then(value_as_text),
                page: obj.get("page").and_then(page_number),
            },
            other => Self {
                value: value_as_text(other),
                page: None,
            },
        }
    }

    /// Does this hold a real value? `""` and `"null"` don't count.
    pub fn has_value(&self) -> bool {
        matches!(self.value.as_deref(), Some(v) if !v.is_empty() && v != "null")
    }
}

fn value_as_text(raw: &Value) -> Option<String> {
    match raw {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn page_number(raw: &Value) -> Option<usize> {
    match raw {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Token usage for LLM calls.
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// What one chunk told us.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct ChunkFields {
    pub chunk_number: usize,
    pub page_numbers: Vec<usize>,
    pub fields: BTreeMap<String, ExtractedField>,

    /// Tokens spent on this chunk, if known.
    #[serde(skip)]
    pub token_usage: Option<TokenUsage>,
}

impl ChunkFields {
    /// Build from a JSON object mapping field names to answers.
    pub fn from_response(chunk: &Chunk, response: &Value) -> Result<Self> {
        let obj = response.as_object().ok_or_else(|| {
            anyhow!(
                "Expected a JSON object for chunk {}, found {}",
                chunk.chunk_number,
                response
            )
        })?;
        Ok(Self {
            chunk_number: chunk.chunk_number,
            page_numbers: chunk.page_numbers.clone(),
            fields: obj
                .iter()
                .map(|(name, raw)| (name.clone(), ExtractedField::from_response(raw)))
                .collect(),
            token_usage: None,
        })
    }
}

/// A chunk to extract fields from.
#[derive(Clone, Debug)]
pub struct ChunkRequest {
    pub document_id: String,
    pub kind: DocumentKind,
    pub total_chunks: usize,
    pub chunk: Chunk,
}

impl ChunkRequest {
    /// Template bindings for a field extraction prompt.
    pub fn prompt_bindings(&self, fields: &FieldList) -> JsonObject {
        let pages = self
            .chunk
            .page_numbers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let mut bindings = Map::new();
        bindings.insert("document_kind".to_owned(), json!(self.kind.to_string()));
        bindings.insert("fields".to_owned(), json!(fields.fields));
        bindings.insert("hints".to_owned(), json!(fields.hints));
        bindings.insert("chunk_number".to_owned(), json!(self.chunk.chunk_number));
        bindings.insert("total_chunks".to_owned(), json!(self.total_chunks));
        bindings.insert("pages".to_owned(), json!(pages));
        bindings.insert("chunk_text".to_owned(), json!(self.chunk.text));
        bindings
    }
}

/// Something that can pull fields out of a chunk.
#[async_trait]
pub trait FieldExtractor: Send + Sync + 'static {
    async fn extract_chunk(&self, request: ChunkRequest) -> Result<ChunkFields>;
}

/// Two chunks disagreed about a field.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct FieldConflict {
    pub field: String,
    /// The value we kept, from the earlier chunk.
    pub kept: ExtractedField,
    /// The value we ignored.
    pub ignored: ExtractedField,
    /// The chunk the ignored value came from.
    pub ignored_chunk: usize,
}

/// Fields for a whole document.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
pub struct MergedFields {
    /// Every expected field, plus any extras a chunk reported.
    pub fields: BTreeMap<String, ExtractedField>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<FieldConflict>,

    /// Chunks that answered.
    pub chunks_processed: usize,

    /// Chunks that failed, and were left out of the merge.
    pub chunks_failed: usize,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(skip_serializing_if = "TokenUsage::is_zero")]
    pub token_usage: TokenUsage,
}

impl MergedFields {
    /// How many fields have a value?
    pub fn found_count(&self) -> usize {
        self.fields.values().filter(|f| f.has_value()).count()
    }
}

/// Merge per-chunk answers, in chunk order.
///
/// The first real value for a field wins. A later, different value is
/// recorded as a conflict. Values without a page are credited to the first
/// page of their chunk.
pub fn merge_chunk_fields(
    expected: &[String],
    results: Vec<Result<ChunkFields>>,
) -> MergedFields {
    let mut merged = MergedFields {
        fields: expected
            .iter()
            .map(|field| (field.clone(), ExtractedField::default()))
            .collect(),
        ..MergedFields::default()
    };

    for result in results {
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!("Skipping failed chunk: {err:#}");
                merged.chunks_failed += 1;
                merged.errors.push(format!("{err:#}"));
                continue;
            }
        };
        merged.chunks_processed += 1;
        if let Some(usage) = chunk.token_usage {
            merged.token_usage += usage;
        }

        let first_page = chunk.page_numbers.first().copied();
        for (name, found) in chunk.fields {
            let slot = merged.fields.entry(name.clone()).or_default();
            if !found.has_value() {
                continue;
            }
            let found = ExtractedField {
                page: found.page.or(first_page),
                ..found
            };
            if !slot.has_value() {
                *slot = found;
            } else if slot.value != found.value {
                warn!(
                    field = %name,
                    kept = ?slot.value,
                    ignored = ?found.value,
                    chunk = chunk.chunk_number,
                    "Chunks disagree about field"
                );
                merged.conflicts.push(FieldConflict {
                    field: name,
                    kept: slot.clone(),
                    ignored: found,
                    ignored_chunk: chunk.chunk_number,
                });
            }
        }
    }
    merged
}

/// Extract and merge fields for every chunk of a document.
#[instrument(level = "debug", skip_all, fields(id = %document_id, %kind, chunks = chunks.len()))]
pub async fn extract_document_fields(
    extractor: &dyn FieldExtractor,
    document_id: &str,
    kind: DocumentKind,
    chunks: &[Chunk],
) -> Result<MergedFields> {
    let fields = FieldList::for_kind(kind)?;
    let total_chunks = chunks.len();
    let results = stream::iter(chunks.iter().cloned())
        .map(|chunk| {
            extractor.extract_chunk(ChunkRequest {
                document_id: document_id.to_owned(),
                kind,
                total_chunks,
                chunk,
            })
        })
        .buffered(CHUNKS_IN_FLIGHT)
        .collect::<Vec<_>>()
        .await;
    let merged = merge_chunk_fields(&fields.fields, results);
    debug!(
        found = merged.found_count(),
        failed = merged.chunks_failed,
        "Merged chunk fields"
    );
    Ok(merged)
}
