//! # parley-shared
//!
//! Types shared by every Parley crate: node identities, signed chat
//! messages, the versioned protocol envelope and slash-command parsing.
//!
//! Signing always goes through [`codec`], which owns the canonical byte
//! form of each signable entity.

pub mod codec;
pub mod command;
pub mod constants;
pub mod error;
pub mod identity;
pub mod message;
pub mod protocol;
pub mod types;

pub use codec::Signable;
pub use command::{Command, CommandContext, SlashCommand};
pub use identity::Identity;
pub use message::{Message, MessageType};
pub use protocol::{EnvelopeType, Payload, ProtocolEnvelope};
pub use types::{RoomId, Role};
