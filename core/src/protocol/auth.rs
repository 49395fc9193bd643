// Salt/signature handshake state for one peer session
//
// Two directions share the sign characteristic. For telemetry the peer
// sends a salt and the node answers with its signature. For a privileged
// command the node sends a fresh salt and the peer answers with four
// signature chunks, verified against the peer key before the command runs.

use rand::RngCore;
use tracing::{debug, info, warn};

use super::command::{Command, ProtocolError};
use crate::crypto::{NodeKeys, PeerKey, SignatureError, SIGNATURE_SIZE};
use crate::platform::CHUNK_SIZE;
use crate::transport::ble::ChunkAssembler;

/// Size of a salt, in either direction
pub const SALT_SIZE: usize = CHUNK_SIZE;

/// What the current session is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// No request from the peer yet
    None,
    /// Telemetry upload
    Rssi,
    /// Privileged command awaiting the peer signature
    Cmd,
}

/// Result of a received signature chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// More chunks expected
    Incomplete,
    /// Signature verified; the staged command, taken exactly once
    Verified(Command),
}

/// Per-session handshake state
#[derive(Debug, Clone)]
pub struct Handshake {
    mode: SessionMode,
    salt: [u8; SALT_SIZE],
    signature: ChunkAssembler,
    command: Option<Command>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            mode: SessionMode::None,
            salt: [0; SALT_SIZE],
            signature: ChunkAssembler::new(SIGNATURE_SIZE, CHUNK_SIZE),
            command: None,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn pending_command(&self) -> Option<Command> {
        self.command
    }

    /// Service resolved: forget chunks and commands of any earlier session
    pub fn begin(&mut self) {
        self.signature.clear();
        self.command = None;
    }

    /// Back to mode None with nothing staged
    pub fn reset(&mut self) {
        self.mode = SessionMode::None;
        self.salt = [0; SALT_SIZE];
        self.signature.clear();
        self.command = None;
    }

    /// Sign the peer salt for a telemetry session
    pub fn on_peer_salt(
        &mut self,
        salt: &[u8; SALT_SIZE],
        keys: &NodeKeys,
    ) -> Result<[u8; SIGNATURE_SIZE], SignatureError> {
        self.mode = SessionMode::Rssi;
        debug!(salt = %hex::encode(salt), "Received salt");
        keys.sign(salt)
    }

    /// Peer skips the handshake
    pub fn on_trust(&mut self) {
        self.mode = SessionMode::Rssi;
    }

    /// Stage `command` and return the salt the peer must sign
    pub fn stage_command<R: RngCore>(&mut self, command: Command, rng: &mut R) -> [u8; SALT_SIZE] {
        info!(?command, "Command requested");
        self.mode = SessionMode::Cmd;
        self.command = Some(command);
        rng.fill_bytes(&mut self.salt);
        self.signature.clear();
        self.salt
    }

    /// Store one signature chunk. Once all are present the signature is
    /// checked over the node salt.
    pub fn on_sign_chunk(
        &mut self,
        index: u8,
        data: &[u8; CHUNK_SIZE],
        peer_key: &PeerKey,
    ) -> Result<ChunkVerdict, ProtocolError> {
        if !self.signature.insert(index, data)? {
            return Ok(ChunkVerdict::Incomplete);
        }

        let verified = self
            .signature
            .payload()
            .is_some_and(|signature| peer_key.verify(&self.salt, signature));
        self.signature.clear();
        if !verified {
            warn!("Peer signature failed verification");
            return Err(ProtocolError::BadSignature);
        }

        self.command
            .take()
            .map(ChunkVerdict::Verified)
            .ok_or(ProtocolError::NoCommand)
    }
}
