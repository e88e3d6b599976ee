use thiserror::Error;

/// Every way a generation step can fail.
///
/// The `Display` text of each variant is the one message shown to the user;
/// callers surface it as-is and leave retrying to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error("The request is invalid; check the prompt and try again.")]
    InvalidRequest,
    #[error("The prompt is too long; keep it within 2000 characters.")]
    PromptTooLong,
    #[error("The image is too large; choose an image smaller than 4MB.")]
    ImageTooLarge,
    #[error("Unsupported image format; use a JPEG or PNG image.")]
    InvalidImageFormat,
    #[error("The API key is invalid; check your settings.")]
    InvalidApiKey,
    #[error("Too many requests; wait a moment and try again.")]
    RateLimitExceeded,
    #[error("The API quota is exhausted; check your account status.")]
    QuotaExceeded,
    #[error("Network connection error; check your connection.")]
    NetworkError,
    #[error("The server returned an invalid response.")]
    InvalidResponse,
    #[error("No image was generated; try a different prompt.")]
    NoImageGenerated,
    #[error("API error: {0}")]
    ApiError(String),
    #[error("The operation was cancelled.")]
    Cancelled,
}

impl GenerateError {
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Stable snake_case tag used in event logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::PromptTooLong => "prompt_too_long",
            Self::ImageTooLarge => "image_too_large",
            Self::InvalidImageFormat => "invalid_image_format",
            Self::InvalidApiKey => "invalid_api_key",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::QuotaExceeded => "quota_exceeded",
            Self::NetworkError => "network_error",
            Self::InvalidResponse => "invalid_response",
            Self::NoImageGenerated => "no_image_generated",
            Self::ApiError(_) => "api_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether trying the same request again later has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::NetworkError | Self::InvalidResponse
        )
    }
}
