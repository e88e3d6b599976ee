//! Gemini `generateContent` wire types.
//!
//! Requests are written with the snake_case `inline_data` spelling. Responses
//! arrive in camelCase (`inlineData`/`mimeType`) but some gateways echo the
//! snake_case form, so both are accepted.

use serde::{Deserialize, Serialize};

pub const JPEG_MIME_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<RequestContent>,
    #[serde(rename = "safetySettings")]
    pub safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContent {
    pub parts: Vec<RequestPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestPart {
    InlineData { inline_data: InlineBlob },
    Text { text: String },
}

impl RequestPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn jpeg(data_base64: impl Into<String>) -> Self {
        Self::InlineData {
            inline_data: InlineBlob {
                mime_type: JPEG_MIME_TYPE.to_string(),
                data: data_base64.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineBlob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateContentResponse {
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub content: CandidateContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateContent {
    pub parts: Vec<ResponsePart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        default,
        rename = "inlineData",
        alias = "inline_data",
        skip_serializing_if = "Option::is_none"
    )]
    pub inline_data: Option<ResponseBlob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBlob {
    #[serde(rename = "mimeType", alias = "mime_type")]
    pub mime_type: String,
    pub data: String,
}

/// What a response part carries. A part with both text and inline data counts
/// as an image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartKind<'a> {
    InlineImage(&'a ResponseBlob),
    Text(&'a str),
    Empty,
}

impl ResponsePart {
    pub fn kind(&self) -> PartKind<'_> {
        match (&self.inline_data, &self.text) {
            (Some(blob), _) => PartKind::InlineImage(blob),
            (None, Some(text)) => PartKind::Text(text),
            (None, None) => PartKind::Empty,
        }
    }
}

impl GenerateContentResponse {
    /// First inline image of the first candidate, scanning parts in order.
    pub fn first_inline_image(&self) -> Option<&ResponseBlob> {
        self.candidates
            .first()?
            .content
            .parts
            .iter()
            .find_map(|part| match part.kind() {
                PartKind::InlineImage(blob) => Some(blob),
                PartKind::Text(_) | PartKind::Empty => None,
            })
    }

    /// Text parts of the first candidate, typically a refusal or commentary.
    pub fn first_candidate_text(&self) -> Vec<&str> {
        self.candidates
            .first()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .filter_map(|part| match part.kind() {
                        PartKind::Text(text) => Some(text),
                        PartKind::InlineImage(_) | PartKind::Empty => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ErrorEnvelope {
    /// Provider message from an error body, if the body has one.
    pub fn message_from(body: &str) -> Option<String> {
        serde_json::from_str::<ErrorEnvelope>(body)
            .ok()?
            .error?
            .message
            .filter(|message| !message.trim().is_empty())
    }
}
