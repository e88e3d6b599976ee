//! Gemini image generation engine: request validation, a two-tier result
//! cache, self-imposed rate limiting and the batch and iterative workflows
//! built on top of single generations.

pub mod cache;
pub mod codec;
pub mod config;
pub mod gemini;
pub mod generator;
pub mod rate_limit;
pub mod session;
pub mod transport;

pub use cache::{CacheKey, ImageCache};
pub use config::{ConfigError, EngineConfig};
pub use generator::{BatchImage, Generator};
pub use session::Session;
