// Protocol module — peer requests and the authentication handshake

pub mod auth;
pub mod command;

pub use auth::{ChunkVerdict, Handshake, SessionMode, SALT_SIZE};
pub use command::{Command, ProtocolError, Request};
