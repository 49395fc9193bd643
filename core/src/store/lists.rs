// Allow/deny lists for background-mode peers
//
// Peers that only surface an opaque vendor payload are identified by a
// 16-byte fingerprint. A probe result is remembered for a bounded time so the
// node does not re-probe the same device on every sighting.

use thiserror::Error;
use tracing::debug;

use super::ring::{Fingerprint, PeerId};
use crate::platform::{MAX_PEERS, PEER_ID_SIZE};

/// Errors for list operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListError {
    #[error("List full")]
    ListFull,
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    fingerprint: Fingerprint,
    id: PeerId,
    timestamp_ms: u64,
    active: bool,
}

impl Entry {
    fn expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp_ms) > ttl_ms
    }
}

/// Fixed-capacity fingerprint list with lazy expiry
#[derive(Debug, Clone)]
struct FingerprintList {
    entries: [Entry; MAX_PEERS],
    ttl_ms: u64,
}

impl FingerprintList {
    fn new(ttl_ms: u64) -> Self {
        Self {
            entries: [Entry::default(); MAX_PEERS],
            ttl_ms,
        }
    }

    /// Linear scan. Entries past the TTL are evicted, a live hit refreshes
    /// its timestamp. `None` only sweeps.
    fn lookup(&mut self, fingerprint: Option<&Fingerprint>, now_ms: u64) -> Option<PeerId> {
        let mut found = None;
        for entry in self.entries.iter_mut().filter(|e| e.active) {
            if entry.expired(now_ms, self.ttl_ms) {
                entry.active = false;
            } else if fingerprint == Some(&entry.fingerprint) {
                entry.timestamp_ms = now_ms;
                found = Some(entry.id);
            }
        }
        found
    }

    fn insert(&mut self, fingerprint: &Fingerprint, id: PeerId, now_ms: u64) -> Result<(), ListError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| !e.active)
            .ok_or(ListError::ListFull)?;
        *entry = Entry {
            fingerprint: *fingerprint,
            id,
            timestamp_ms: now_ms,
            active: true,
        };
        Ok(())
    }

    /// Drop `fingerprint` together with every expired entry
    fn remove_with_expired(&mut self, fingerprint: &Fingerprint, now_ms: u64) {
        for entry in self.entries.iter_mut().filter(|e| e.active) {
            if &entry.fingerprint == fingerprint || entry.expired(now_ms, self.ttl_ms) {
                entry.active = false;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    fn clear(&mut self) {
        self.entries = [Entry::default(); MAX_PEERS];
    }
}

/// Fingerprints known to run the service, with the identifier they resolved to
#[derive(Debug, Clone)]
pub struct AllowList(FingerprintList);

impl AllowList {
    pub fn new(ttl_ms: u64) -> Self {
        Self(FingerprintList::new(ttl_ms))
    }

    /// Identifier associated with `fingerprint`, if listed
    pub fn lookup(&mut self, fingerprint: &Fingerprint, now_ms: u64) -> Option<PeerId> {
        self.0.lookup(Some(fingerprint), now_ms)
    }

    /// Evict expired entries
    pub fn sweep(&mut self, now_ms: u64) {
        self.0.lookup(None, now_ms);
    }

    pub fn insert(
        &mut self,
        fingerprint: &Fingerprint,
        id: &PeerId,
        now_ms: u64,
    ) -> Result<(), ListError> {
        self.0.insert(fingerprint, *id, now_ms)?;
        debug!(fingerprint = %hex::encode(fingerprint), "Allow-listed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fingerprints that failed a probe or an authentication
#[derive(Debug, Clone)]
pub struct DenyList(FingerprintList);

impl DenyList {
    pub fn new(ttl_ms: u64) -> Self {
        Self(FingerprintList::new(ttl_ms))
    }

    pub fn contains(&mut self, fingerprint: &Fingerprint, now_ms: u64) -> bool {
        self.0.lookup(Some(fingerprint), now_ms).is_some()
    }

    /// Evict expired entries
    pub fn sweep(&mut self, now_ms: u64) {
        self.0.lookup(None, now_ms);
    }

    /// Deny `fingerprint` and revoke it from `allow`. Expired allow-list
    /// entries are dropped on the way.
    pub fn insert(
        &mut self,
        fingerprint: &Fingerprint,
        allow: &mut AllowList,
        now_ms: u64,
    ) -> Result<(), ListError> {
        allow.0.remove_with_expired(fingerprint, now_ms);
        self.0.insert(fingerprint, [0; PEER_ID_SIZE], now_ms)?;
        debug!(fingerprint = %hex::encode(fingerprint), "Deny-listed");
        Ok(())
    }

    /// Forget every entry; runs on the periodic drop timer
    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
