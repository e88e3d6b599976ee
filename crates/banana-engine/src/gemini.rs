use banana_contracts::wire::{
    ErrorEnvelope, GenerateContentRequest, GenerateContentResponse, RequestContent, RequestPart,
    SafetySetting,
};
use banana_contracts::GenerateError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::codec;

pub const SAFETY_THRESHOLD: &str = "BLOCK_MEDIUM_AND_ABOVE";

pub const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
];

pub fn safety_settings() -> Vec<SafetySetting> {
    SAFETY_CATEGORIES
        .into_iter()
        .map(|category| SafetySetting {
            category: category.to_string(),
            threshold: SAFETY_THRESHOLD.to_string(),
        })
        .collect()
}

/// Image part (if any) first, prompt text last.
pub fn build_payload(prompt: &str, input_jpeg: Option<&[u8]>) -> GenerateContentRequest {
    let mut parts = Vec::with_capacity(2);
    if let Some(jpeg) = input_jpeg {
        parts.push(RequestPart::jpeg(BASE64.encode(jpeg)));
    }
    parts.push(RequestPart::text(prompt));
    GenerateContentRequest {
        contents: vec![RequestContent { parts }],
        safety_settings: safety_settings(),
    }
}

/// Turns an HTTP status and body into image bytes or a classified error.
pub fn parse_response(status: u16, body: &[u8]) -> Result<Vec<u8>, GenerateError> {
    debug!(status, body_bytes = body.len(), "Gemini response received");
    if status != 200 {
        let err = classify_status(status, body);
        warn!(status, error = %err, "Gemini request rejected");
        return Err(err);
    }
    extract_image(body)
}

pub fn classify_status(status: u16, body: &[u8]) -> GenerateError {
    let message = std::str::from_utf8(body)
        .ok()
        .and_then(ErrorEnvelope::message_from);
    match status {
        400 => match message {
            Some(message) if mentions(&message, "api key") => GenerateError::InvalidApiKey,
            Some(message) => GenerateError::ApiError(message),
            None => GenerateError::InvalidRequest,
        },
        401 => GenerateError::InvalidApiKey,
        403 => match message {
            Some(message) if mentions(&message, "quota") => GenerateError::QuotaExceeded,
            _ => GenerateError::InvalidApiKey,
        },
        429 => GenerateError::RateLimitExceeded,
        500..=599 => GenerateError::InvalidResponse,
        _ => message
            .map(GenerateError::ApiError)
            .unwrap_or(GenerateError::InvalidResponse),
    }
}

/// First inline image of the first candidate, base64-decoded and checked to
/// be a decodable image.
pub fn extract_image(body: &[u8]) -> Result<Vec<u8>, GenerateError> {
    let response: GenerateContentResponse = serde_json::from_slice(body).map_err(|err| {
        warn!(error = %err, "Gemini response is not a generateContent envelope");
        GenerateError::InvalidResponse
    })?;
    if response.candidates.is_empty() {
        warn!("Gemini response carried no candidates");
        return Err(GenerateError::NoImageGenerated);
    }
    let Some(blob) = response.first_inline_image() else {
        let text = response.first_candidate_text().join(" ");
        warn!(text = %truncate_text(&text, 240), "Gemini candidate carried no inline image");
        return Err(GenerateError::NoImageGenerated);
    };
    let bytes = BASE64.decode(blob.data.trim().as_bytes()).map_err(|err| {
        warn!(error = %err, mime_type = %blob.mime_type, "Gemini image base64 decode failed");
        GenerateError::InvalidImageFormat
    })?;
    codec::ensure_decodable(&bytes)?;
    debug!(mime_type = %blob.mime_type, bytes = bytes.len(), "Gemini image extracted");
    Ok(bytes)
}

/// Case-insensitive substring match; `needle` must be lowercase.
fn mentions(message: &str, needle: &str) -> bool {
    message.to_lowercase().contains(needle)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
