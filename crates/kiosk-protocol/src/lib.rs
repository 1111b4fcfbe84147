//! Device line protocol.
//!
//! Provides:
//! - `ExpectedToken` - The pre-shared token a device must present
//! - `AuthSession` - Two-state authentication machine
//! - `decode_command` - Command code table
//! - `LineDecoder` - Auth + decoding applied to each inbound line

pub mod auth;
pub mod codes;
pub mod decoder;
pub mod error;

pub use auth::{AuthSession, AuthState, ExpectedToken, MAX_COMMAND_LEN};
pub use codes::decode_command;
pub use decoder::{DropReason, LineDecoder, LineEffect};
pub use error::{AuthError, DecodeError};
