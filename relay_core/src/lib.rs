//! Rendezvous file-transfer relay.
//!
//! A sender obtains a token, then attaches its byte stream to it; a receiver
//! attaches to the same token and gets the bytes piped straight through,
//! without the relay ever holding more than one chunk of the file.

pub mod config;
pub mod error;
pub mod http;
pub mod latch;
mod read_ahead;
pub mod registry;
pub mod relay;
pub mod session;
pub mod token;

pub use config::RelayConfig;
pub use error::{Party, RelayError};
pub use latch::Latch;
pub use registry::{MemoryRegistry, Registry};
pub use relay::{CHUNK_SIZE, Coordinator, ReceiverClaim, spawn_reaper};
pub use session::{ByteSource, Session, SessionState};
pub use token::{RandomTokens, Token, TokenSource};
