//! Native voice assistant client: tokio drivers for the `voice-session` core.

pub mod api;
pub mod client;
pub mod errors;
pub mod media;
pub mod settings;
pub mod transport;

pub use client::{Entry, VoiceClient};
pub use errors::{ApiError, AppError, TransportError};
pub use settings::Settings;
pub use transport::SessionHandle;
