// Cryptography module — node key pair and peer signature checks

pub mod signature;

pub use signature::{
    NodeKeys, PeerKey, SignatureError, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
