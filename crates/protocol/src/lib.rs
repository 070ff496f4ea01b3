//! Command channel between the Warden supervisor and its jailed worker.
//!
//! The worker runs chrooted and unprivileged, so every certificate cache
//! operation it needs is carried to the supervisor as a [`Command`] over a
//! pair of byte streams (the worker's stdin and stdout in production).
//!
//! # Components
//!
//! - [`Command`] / [`CommandKind`]: the message type
//! - [`codec`]: line-framed encoding with explicit payload lengths
//! - [`pump`]: outbound encoder and inbound decoder tasks

pub mod codec;
mod command;
mod errors;
pub mod pump;

pub use codec::{read_command, write_command, MAX_PAYLOAD_SIZE};
pub use command::{
    Command, CommandKind, TOKEN_DELETE, TOKEN_GET, TOKEN_PUT, TOKEN_TERMINATE,
};
pub use errors::ProtocolError;
pub use pump::{CommandChannel, PumpHandles, DEFAULT_IDLE_TIMEOUT};
