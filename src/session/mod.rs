//! Streaming session lifecycle: source resolution, transcoder supervision,
//! byte piping to the HTTP client.

pub mod manager;
pub mod stream;

pub use manager::{SessionConfig, SessionError, SessionManager, StreamSession};
pub use stream::SessionStream;
