//! Chat prompts, stored as TOML or JSON, with `handlebars` templates in every
//! message.

use handlebars::Handlebars;
use schemars::JsonSchema;
use serde_json::{Map, json};

use crate::{async_utils::io::JsonObject, prelude::*};

/// Render a prompt component, filling in template values for any string
/// fields.
pub trait RenderTemplate {
    type Output;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output>;
}

/// A chat completion prompt.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChatPrompt {
    /// The developer (aka "system") message, if any.
    #[serde(default)]
    pub developer: Option<String>,

    /// Messages, in order. Usually one user message per prompt, optionally
    /// preceded by worked examples.
    pub messages: Vec<Message>,
}

impl ChatPrompt {
    /// Render the prompt as a JSON array of chat messages.
    ///
    /// Our prompts are plain text, so nothing is HTML-escaped.
    pub fn render_prompt(&self, bindings: &JsonObject) -> Result<Value> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        self.render_template(&handlebars, bindings)
            .context("Error rendering prompt")
    }
}

impl RenderTemplate for ChatPrompt {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let mut messages = Vec::new();
        if let Some(developer) = &self.developer {
            messages.push(json!({
                "role": "system",
                "content": handlebars.render_template(developer, bindings)?,
            }));
        }
        for message in &self.messages {
            messages.extend(message.render_template(handlebars, bindings)?);
        }
        Ok(Value::Array(messages))
    }
}

/// A user message, and optionally an example response.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub user: String,

    /// An example assistant response. Always a JSON object, sent as a JSON
    /// string.
    #[serde(default)]
    pub assistant: Option<JsonObject>,
}

impl RenderTemplate for Message {
    type Output = Vec<Value>;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let user = handlebars.render_template(&self.user, bindings)?;
        let mut messages = vec![json!({ "role": "user", "content": user })];
        if let Some(assistant) = &self.assistant {
            let assistant = assistant.render_template(handlebars, bindings)?;
            messages
                .push(json!({ "role": "assistant", "content": assistant.to_string() }));
        }
        Ok(messages)
    }
}

impl RenderTemplate for Value {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        match self {
            Value::String(s) => Ok(Value::String(handlebars.render_template(s, bindings)?)),
            Value::Object(obj) => obj.render_template(handlebars, bindings),
            Value::Array(arr) => arr
                .iter()
                .map(|value| value.render_template(handlebars, bindings))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            _ => Ok(self.clone()),
        }
    }
}

impl RenderTemplate for JsonObject {
    type Output = Value;

    fn render_template(
        &self,
        handlebars: &Handlebars,
        bindings: &JsonObject,
    ) -> Result<Self::Output> {
        let mut output = Map::new();
        for (key, value) in self {
            output.insert(
                handlebars.render_template(key, bindings)?,
                value.render_template(handlebars, bindings)?,
            );
        }
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(value: Value) -> JsonObject {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn renders_messages_without_escaping() {
        let prompt: ChatPrompt = toml::from_str(
            r#"
developer = "You read {{kind}} quotes."

[[messages]]
user = "Text: {{text}}"
assistant = { "{{field}}" = { value = "{{text}}" } }

[[messages]]
user = "Pages {{pages}}"
"#,
        )
        .unwrap();
        let rendered = prompt
            .render_prompt(&bindings(json!({
                "kind": "liquor",
                "text": "Money & Securities <$5,000>",
                "field": "Theft",
                "pages": "1, 2",
            })))
            .unwrap();
        let messages = rendered.as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["content"], json!("You read liquor quotes."));
        assert_eq!(messages[1]["content"], json!("Text: Money & Securities <$5,000>"));
        let assistant: Value =
            serde_json::from_str(messages[2]["content"].as_str().unwrap()).unwrap();
        assert_eq!(assistant["Theft"]["value"], json!("Money & Securities <$5,000>"));
        assert_eq!(messages[3]["role"], json!("user"));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<ChatPrompt>("sytem = \"typo\"\nmessages = []").is_err());
    }
}
