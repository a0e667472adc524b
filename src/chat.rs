use std::collections::BTreeMap;

use serde::Deserialize;

use crate::upstream::{GenerateContentRequest, Part};
use crate::{RelayError, Result};

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Body of `POST /api/chat`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub files: Vec<Attachment>,
    /// Single-attachment shape sent by the bundled web client.
    #[serde(default)]
    pub file_data: Option<InlineFile>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type", default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InlineFile {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.trim().to_ascii_lowercase().starts_with("image/")
    }
}

/// Caller-facing model names mapped to upstream model ids. Unknown names
/// pass through unchanged.
#[derive(Clone, Debug)]
pub struct ModelAliases {
    default_model: String,
    aliases: BTreeMap<String, String>,
}

impl Default for ModelAliases {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL, default_aliases())
    }
}

pub fn default_aliases() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("gemini-2.5-flash".to_string(), "gemini-1.5-flash".to_string()),
        ("gemini-2.5-pro".to_string(), "gemini-1.5-pro".to_string()),
    ])
}

impl ModelAliases {
    pub fn new(default_model: impl Into<String>, aliases: BTreeMap<String, String>) -> Self {
        Self {
            default_model: default_model.into(),
            aliases,
        }
    }

    pub fn resolve(&self, requested: Option<&str>) -> String {
        let requested = requested
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(&self.default_model);
        self.aliases
            .get(requested)
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    }
}

/// A validated chat request, ready for dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedChat {
    pub model: String,
    pub envelope: GenerateContentRequest,
}

impl ChatRequest {
    pub fn from_json(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|err| RelayError::InvalidRequest(format!("invalid JSON body: {err}")))
    }

    fn attachments(self) -> (String, Option<String>, Vec<Attachment>) {
        let mut files = self.files;
        if let Some(file) = self.file_data {
            files.push(Attachment {
                mime_type: file.mime_type,
                data: file.data,
                name: None,
            });
        }
        (self.message, self.model, files)
    }

    /// Rejects requests carrying neither text nor files. Only image
    /// attachments are forwarded; other files are dropped.
    pub fn prepare(self, aliases: &ModelAliases) -> Result<PreparedChat> {
        let (message, model, files) = self.attachments();
        let message = message.trim();
        if message.is_empty() && files.is_empty() {
            return Err(RelayError::InvalidRequest(
                "a message or a file is required".to_string(),
            ));
        }

        let mut parts = Vec::<Part>::new();
        if !message.is_empty() {
            parts.push(Part::text(message));
        }
        for file in files {
            if file.is_image() {
                parts.push(Part::inline_data(file.mime_type.trim(), file.data));
            } else {
                tracing::debug!(
                    mime_type = %file.mime_type,
                    name = file.name.as_deref().unwrap_or_default(),
                    "dropping non-image attachment"
                );
            }
        }

        Ok(PreparedChat {
            model: aliases.resolve(model.as_deref()),
            envelope: GenerateContentRequest::single_turn(parts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: serde_json::Value) -> ChatRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn rejects_empty_message_without_files() {
        for body in [json!({}), json!({ "message": "   " }), json!({ "message": "", "files": [] })] {
            let err = request(body).prepare(&ModelAliases::default()).unwrap_err();
            assert!(matches!(err, RelayError::InvalidRequest(_)));
        }
    }

    #[test]
    fn rejects_unparseable_bodies() {
        assert!(matches!(
            ChatRequest::from_json(b"{not json").unwrap_err(),
            RelayError::InvalidRequest(_)
        ));
    }

    #[test]
    fn maps_known_aliases_and_passes_others_through() {
        let aliases = ModelAliases::default();
        assert_eq!(aliases.resolve(Some("gemini-2.5-pro")), "gemini-1.5-pro");
        assert_eq!(aliases.resolve(Some("gemini-2.5-flash")), "gemini-1.5-flash");
        assert_eq!(aliases.resolve(Some("gemini-exp-1206")), "gemini-exp-1206");
        assert_eq!(aliases.resolve(None), DEFAULT_MODEL);
        assert_eq!(aliases.resolve(Some(" ")), DEFAULT_MODEL);
    }

    #[test]
    fn forwards_only_image_attachments() -> Result<()> {
        let prepared = request(json!({
            "message": "  what is this?  ",
            "model": "gemini-2.5-pro",
            "files": [
                { "type": "image/png", "data": "cG5n", "name": "a.png" },
                { "type": "application/pdf", "data": "cGRm" },
                { "type": "IMAGE/JPEG", "data": "anBn" }
            ]
        }))
        .prepare(&ModelAliases::default())?;

        assert_eq!(prepared.model, "gemini-1.5-pro");
        assert_eq!(
            prepared.envelope.contents[0].parts,
            vec![
                Part::text("what is this?"),
                Part::inline_data("image/png", "cG5n"),
                Part::inline_data("IMAGE/JPEG", "anBn"),
            ]
        );
        Ok(())
    }

    #[test]
    fn files_alone_are_enough() -> Result<()> {
        let prepared = request(json!({ "files": [{ "type": "image/gif", "data": "R0lG" }] }))
            .prepare(&ModelAliases::default())?;
        assert_eq!(
            prepared.envelope.contents[0].parts,
            vec![Part::inline_data("image/gif", "R0lG")]
        );
        Ok(())
    }

    #[test]
    fn accepts_web_client_file_data_shape() -> Result<()> {
        let prepared = request(json!({
            "message": "",
            "file_data": { "mime_type": "image/webp", "data": "UklG" }
        }))
        .prepare(&ModelAliases::default())?;
        assert_eq!(
            prepared.envelope.contents[0].parts,
            vec![Part::inline_data("image/webp", "UklG")]
        );
        Ok(())
    }

    #[test]
    fn envelope_uses_fixed_generation_settings() -> Result<()> {
        let prepared = request(json!({ "message": "hi" })).prepare(&ModelAliases::default())?;
        let wire = serde_json::to_string(&prepared.envelope)?;
        assert!(wire.contains(r#""generationConfig":{"temperature":0.7,"maxOutputTokens":8192}"#));
        Ok(())
    }
}
