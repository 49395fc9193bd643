// Peer requests received on the notify characteristic
//
// Byte 0 selects the request. Handshake requests carry a chunk number in
// byte 1 and 16 data bytes after it; privileged commands carry their
// arguments from byte 2 on.

use thiserror::Error;

use crate::platform::CHUNK_SIZE;
use crate::transport::ble::ChunkError;

pub const CMD_SALT: u8 = 0x00;
pub const CMD_SIGN: u8 = 0x01;
pub const CMD_DFU: u8 = 0x02;
pub const CMD_REBOOT: u8 = 0x03;
pub const CMD_DEPROVISION: u8 = 0x04;
pub const CMD_IDLE: u8 = 0x05;
pub const CMD_RSSI_LIMIT: u8 = 0x06;
pub const CMD_TRUST: u8 = 0x10;

/// Notification length carrying a full chunk
const CHUNK_FRAME_LEN: usize = 2 + CHUNK_SIZE;

/// Errors for peer requests and the handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty notification")]
    Empty,
    #[error("Request 0x{cmd:02X} truncated: need {needed} bytes, got {got}")]
    Truncated { cmd: u8, needed: usize, got: usize },
    #[error("Unknown request 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("Signature chunk rejected: {0}")]
    Chunk(#[from] ChunkError),
    #[error("Signature complete but no command staged")]
    NoCommand,
    #[error("Signature verification failed")]
    BadSignature,
}

/// Privileged command, executed once the peer proves its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Enter the bootloader
    Dfu,
    Reboot,
    /// Delete the configuration and reboot
    Deprovision,
    /// Stay idle for the given number of minutes
    Idle { minutes: u16 },
    /// New RSSI lower limit
    RssiLimit { limit: i8 },
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::Dfu => CMD_DFU,
            Command::Reboot => CMD_REBOOT,
            Command::Deprovision => CMD_DEPROVISION,
            Command::Idle { .. } => CMD_IDLE,
            Command::RssiLimit { .. } => CMD_RSSI_LIMIT,
        }
    }
}

/// A parsed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Peer salt to sign
    Salt([u8; CHUNK_SIZE]),
    /// Peer vouches for a previous handshake
    Trust,
    /// One 1-based chunk of the peer signature
    SignChunk { index: u8, data: [u8; CHUNK_SIZE] },
    Command(Command),
}

fn require(data: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if data.len() < needed {
        return Err(ProtocolError::Truncated {
            cmd: data[0],
            needed,
            got: data.len(),
        });
    }
    Ok(())
}

fn chunk(data: &[u8]) -> [u8; CHUNK_SIZE] {
    let mut out = [0u8; CHUNK_SIZE];
    out.copy_from_slice(&data[2..CHUNK_FRAME_LEN]);
    out
}

impl Request {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let cmd = *data.first().ok_or(ProtocolError::Empty)?;
        let request = match cmd {
            CMD_SALT => {
                require(data, CHUNK_FRAME_LEN)?;
                Request::Salt(chunk(data))
            }
            CMD_TRUST => Request::Trust,
            CMD_SIGN => {
                require(data, CHUNK_FRAME_LEN)?;
                Request::SignChunk {
                    index: data[1],
                    data: chunk(data),
                }
            }
            CMD_DFU => Request::Command(Command::Dfu),
            CMD_REBOOT => Request::Command(Command::Reboot),
            CMD_DEPROVISION => Request::Command(Command::Deprovision),
            CMD_IDLE => {
                require(data, 4)?;
                Request::Command(Command::Idle {
                    minutes: u16::from_be_bytes([data[2], data[3]]),
                })
            }
            CMD_RSSI_LIMIT => {
                require(data, 3)?;
                Request::Command(Command::RssiLimit {
                    limit: data[2] as i8,
                })
            }
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(request)
    }
}
