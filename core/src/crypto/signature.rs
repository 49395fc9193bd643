// ECDSA P-256 / SHA-256 signing for the salt handshake

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Raw signature length, `r || s`
pub const SIGNATURE_SIZE: usize = 64;

/// Raw public key length, `x || y`
pub const PUBLIC_KEY_SIZE: usize = 64;

/// Private scalar length
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Errors for signature operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Signing failed")]
    SigningFailed,
}

/// The node key pair
#[derive(Clone)]
pub struct NodeKeys {
    signing_key: SigningKey,
}

impl NodeKeys {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Restore from a stored private scalar
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let signing_key =
            SigningKey::from_slice(bytes).map_err(|_| SignatureError::InvalidPrivateKey)?;
        Ok(Self { signing_key })
    }

    /// Private scalar, wiped on drop
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    /// Public key as raw `x || y`
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        encode_public_key(self.signing_key.verifying_key())
    }

    /// Sign `SHA-256(data)`, returning raw `r || s`
    pub fn sign(&self, data: &[u8]) -> Result<[u8; SIGNATURE_SIZE], SignatureError> {
        let digest = Sha256::digest(data);
        let signature: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .map_err(|_| SignatureError::SigningFailed)?;

        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }
}

/// A peer verification key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerKey {
    verifying_key: VerifyingKey,
}

impl PeerKey {
    /// Parse a raw `x || y` public key
    pub fn from_raw(bytes: &[u8]) -> Result<Self, SignatureError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(SignatureError::InvalidPublicKey);
        }
        let mut sec1 = [0u8; PUBLIC_KEY_SIZE + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(bytes);
        let verifying_key =
            VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(Self { verifying_key })
    }

    pub fn to_raw(&self) -> [u8; PUBLIC_KEY_SIZE] {
        encode_public_key(&self.verifying_key)
    }

    /// Check a raw `r || s` signature over `SHA-256(data)`.
    /// Malformed signatures verify as `false`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        let digest = Sha256::digest(data);
        self.verifying_key
            .verify_prehash(&digest, &signature)
            .is_ok()
    }
}

fn encode_public_key(key: &VerifyingKey) -> [u8; PUBLIC_KEY_SIZE] {
    let point = key.to_encoded_point(false);
    let mut out = [0u8; PUBLIC_KEY_SIZE];
    // Skip the SEC1 tag byte
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}
