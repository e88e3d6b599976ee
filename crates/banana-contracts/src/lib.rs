pub mod error;
pub mod events;
pub mod history;
pub mod wire;

pub use error::GenerateError;
