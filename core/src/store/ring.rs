/// Per-peer sample storage
///
/// Each peer record keeps a circular window of signal samples. One write
/// cursor (`stored`) and two independent read cursors (`sent_a`, `sent_b`)
/// run over the window as modular counters; slot positions are the counters
/// taken mod the window size. A write that lands on a slot still
/// unread by a consumer pushes that consumer forward, so writers never stall.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::platform::{MAX_PEERS, PEER_ID_SIZE, SAMPLES_PER_PEER};

/// 10-byte peer identifier
pub type PeerId = [u8; PEER_ID_SIZE];

/// 16-byte opaque advertisement fingerprint
pub type Fingerprint = [u8; 16];

/// Link-layer address, least significant octet first
pub type MacAddress = [u8; 6];

/// Errors for ring storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("Peer storage full")]
    StorageFull,
    #[error("Insufficient data: {available} unread, {requested} requested")]
    InsufficientData { available: usize, requested: usize },
    #[error("Invalid slot: {0}")]
    InvalidSlot(usize),
}

/// One signal sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub rssi: i8,
    pub angle: u8,
}

impl Sample {
    /// Cleared sample
    pub const EMPTY: Sample = Sample {
        rssi: i8::MIN,
        angle: 0,
    };

    pub fn new(rssi: i8, angle: u8) -> Self {
        Self { rssi, angle }
    }
}

/// Which reader a cursor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumer {
    /// The peer connected to directly
    A,
    /// A secondary recipient (relay variant)
    B,
}

/// Counter over a window of `N` slots, kept modulo `2N` so a full window
/// and an empty one stay distinguishable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingCursor(u32);

impl RingCursor {
    const WINDOW: u32 = SAMPLES_PER_PEER as u32;
    const MODULUS: u32 = 2 * Self::WINDOW;

    pub fn new(value: u32) -> Self {
        Self(value % Self::MODULUS)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Slot index inside the window
    pub fn slot(&self) -> usize {
        (self.0 % Self::WINDOW) as usize
    }

    pub fn advance(&mut self, by: u32) {
        self.0 = (self.0 + by % Self::MODULUS) % Self::MODULUS;
    }

    /// Modular distance from `behind` up to `self`
    pub fn distance_from(&self, behind: RingCursor) -> u32 {
        (self.0 + Self::MODULUS - behind.0) % Self::MODULUS
    }
}

/// Write cursor plus two read cursors over one sample window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiConsumerCursor {
    stored: RingCursor,
    sent_a: RingCursor,
    sent_b: RingCursor,
}

impl MultiConsumerCursor {
    const N: u32 = SAMPLES_PER_PEER as u32;

    pub fn stored(&self) -> RingCursor {
        self.stored
    }

    pub fn sent(&self, consumer: Consumer) -> RingCursor {
        match consumer {
            Consumer::A => self.sent_a,
            Consumer::B => self.sent_b,
        }
    }

    fn sent_mut(&mut self, consumer: Consumer) -> &mut RingCursor {
        match consumer {
            Consumer::A => &mut self.sent_a,
            Consumer::B => &mut self.sent_b,
        }
    }

    /// Unread samples for `consumer`
    pub fn unread(&self, consumer: Consumer) -> usize {
        self.stored.distance_from(self.sent(consumer)) as usize
    }

    /// Claim the next write slot. Readers parked on that slot with unread
    /// data move one step ahead.
    pub fn begin_write(&mut self) -> usize {
        for consumer in [Consumer::A, Consumer::B] {
            if self.stored.distance_from(self.sent(consumer)) >= Self::N {
                self.sent_mut(consumer).advance(1);
            }
        }
        let slot = self.stored.slot();
        self.stored.advance(1);
        self.check();
        slot
    }

    /// Slot of the next unread sample for `consumer`, advancing its cursor
    pub fn read_next(&mut self, consumer: Consumer) -> Option<usize> {
        if self.unread(consumer) == 0 {
            return None;
        }
        let cursor = self.sent_mut(consumer);
        let slot = cursor.slot();
        cursor.advance(1);
        self.check();
        Some(slot)
    }

    /// Leave exactly `remaining` unread samples for `consumer`
    pub fn reduce_remaining_to(
        &mut self,
        consumer: Consumer,
        remaining: usize,
    ) -> Result<(), RingError> {
        let available = self.unread(consumer);
        if available < remaining {
            return Err(RingError::InsufficientData {
                available,
                requested: remaining,
            });
        }
        self.sent_mut(consumer)
            .advance((available - remaining) as u32);
        self.check();
        Ok(())
    }

    fn check(&self) {
        debug_assert!(
            self.stored.distance_from(self.sent_a) <= Self::N,
            "cursor A fell {} behind",
            self.stored.distance_from(self.sent_a)
        );
        debug_assert!(
            self.stored.distance_from(self.sent_b) <= Self::N,
            "cursor B fell {} behind",
            self.stored.distance_from(self.sent_b)
        );
    }
}

/// One discovered advertiser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub mac: MacAddress,
    pub fingerprint: Fingerprint,
    pub active: bool,
    pub samples: [Sample; SAMPLES_PER_PEER],
    pub cursor: MultiConsumerCursor,
    stored_total: u32,
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self {
            id: [0; PEER_ID_SIZE],
            mac: [0; 6],
            fingerprint: [0; 16],
            active: false,
            samples: [Sample::EMPTY; SAMPLES_PER_PEER],
            cursor: MultiConsumerCursor::default(),
            stored_total: 0,
        }
    }
}

impl PeerRecord {
    /// Total samples written since the record was created
    pub fn stored_count(&self) -> u32 {
        self.stored_total
    }

    /// Peer kind byte carried in the identifier
    pub fn kind_byte(&self) -> u8 {
        self.id[0]
    }

    pub fn clear(&mut self) {
        *self = PeerRecord::default();
    }
}

/// Fixed-capacity peer table
#[derive(Debug, Clone)]
pub struct PeerTable {
    records: [PeerRecord; MAX_PEERS],
    threshold: usize,
}

impl PeerTable {
    /// Create a table that reports the connect threshold after
    /// `threshold` samples
    pub fn new(threshold: usize) -> Self {
        Self {
            records: std::array::from_fn(|_| PeerRecord::default()),
            threshold: threshold.clamp(1, SAMPLES_PER_PEER),
        }
    }

    pub fn get(&self, slot: usize) -> Option<&PeerRecord> {
        self.records.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut PeerRecord> {
        self.records.get_mut(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.iter()
    }

    /// Lowest-index active slot
    pub fn first_active(&self) -> Option<usize> {
        self.records.iter().position(|r| r.active)
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.active).count()
    }

    /// Store a sighting and return its slot.
    ///
    /// A known identifier keeps its slot and takes the new address (and
    /// fingerprint when given). A new identifier takes the lowest inactive
    /// slot.
    pub fn save_peer(
        &mut self,
        id: &PeerId,
        mac: &MacAddress,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<usize, RingError> {
        if let Some(slot) = self.records.iter().position(|r| r.active && &r.id == id) {
            let record = &mut self.records[slot];
            record.mac = *mac;
            if let Some(fp) = fingerprint {
                record.fingerprint = *fp;
            }
            return Ok(slot);
        }

        let Some(slot) = self.records.iter().position(|r| !r.active) else {
            warn!("Peer storage full, dropping sighting");
            return Err(RingError::StorageFull);
        };

        let record = &mut self.records[slot];
        record.clear();
        record.id = *id;
        record.mac = *mac;
        if let Some(fp) = fingerprint {
            record.fingerprint = *fp;
        }
        record.active = true;
        debug!(slot, "New peer record");
        Ok(slot)
    }

    /// Append a sample. Returns `true` once the record holds enough unread
    /// samples to warrant a connection.
    pub fn save_sample(&mut self, slot: usize, sample: Sample) -> Result<bool, RingError> {
        let threshold = self.threshold;
        let record = self
            .records
            .get_mut(slot)
            .filter(|r| r.active)
            .ok_or(RingError::InvalidSlot(slot))?;

        let index = record.cursor.begin_write();
        record.samples[index] = sample;
        record.stored_total = record.stored_total.saturating_add(1);
        Ok(record.cursor.unread(Consumer::A) >= threshold)
    }

    /// Drain unread samples for `consumer`, oldest first
    pub fn take_unread(&mut self, slot: usize, consumer: Consumer) -> Vec<Sample> {
        let Some(record) = self.records.get_mut(slot) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(SAMPLES_PER_PEER);
        while let Some(index) = record.cursor.read_next(consumer) {
            out.push(record.samples[index]);
        }
        out
    }

    /// Leave exactly `remaining` unread samples in a record
    pub fn reduce_remaining_to(
        &mut self,
        slot: usize,
        consumer: Consumer,
        remaining: usize,
    ) -> Result<(), RingError> {
        let record = self
            .records
            .get_mut(slot)
            .ok_or(RingError::InvalidSlot(slot))?;
        record.cursor.reduce_remaining_to(consumer, remaining)
    }

    pub fn clear(&mut self, slot: usize) {
        if let Some(record) = self.records.get_mut(slot) {
            record.clear();
        }
    }

    pub fn clear_all(&mut self) {
        for record in self.records.iter_mut() {
            record.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> PeerId {
        let mut id = [0u8; PEER_ID_SIZE];
        id[9] = n;
        id
    }

    #[test]
    fn test_threshold_reached_on_fifth_sample() {
        let mut table = PeerTable::new(SAMPLES_PER_PEER);
        let slot = table.save_peer(&id(1), &[1; 6], None).unwrap();

        for _ in 0..4 {
            assert!(!table.save_sample(slot, Sample::new(-40, 0)).unwrap());
        }
        assert!(table.save_sample(slot, Sample::new(-40, 0)).unwrap());
        assert_eq!(table.get(slot).unwrap().stored_count(), 5);
    }

    #[test]
    fn test_known_id_updates_address() {
        let mut table = PeerTable::new(5);
        let first = table.save_peer(&id(1), &[1; 6], None).unwrap();
        let again = table.save_peer(&id(1), &[2; 6], Some(&[9; 16])).unwrap();

        assert_eq!(first, again);
        let record = table.get(first).unwrap();
        assert_eq!(record.mac, [2; 6]);
        assert_eq!(record.fingerprint, [9; 16]);
    }

    #[test]
    fn test_lowest_inactive_slot_wins() {
        let mut table = PeerTable::new(5);
        for n in 0..3 {
            table.save_peer(&id(n), &[n; 6], None).unwrap();
        }
        table.clear(1);
        assert_eq!(table.save_peer(&id(7), &[7; 6], None).unwrap(), 1);
    }

    #[test]
    fn test_storage_full_drops_sighting() {
        let mut table = PeerTable::new(5);
        for n in 0..MAX_PEERS as u8 {
            table.save_peer(&id(n), &[n; 6], None).unwrap();
        }
        assert_eq!(
            table.save_peer(&id(100), &[0; 6], None),
            Err(RingError::StorageFull)
        );
    }

    #[test]
    fn test_overwrite_advances_reader() {
        let mut table = PeerTable::new(5);
        let slot = table.save_peer(&id(1), &[1; 6], None).unwrap();

        for rssi in 0..7i8 {
            table.save_sample(slot, Sample::new(-rssi, 0)).unwrap();
        }

        let record = table.get(slot).unwrap();
        assert_eq!(record.cursor.unread(Consumer::A), SAMPLES_PER_PEER);
        assert_eq!(record.cursor.unread(Consumer::B), SAMPLES_PER_PEER);

        let drained = table.take_unread(slot, Consumer::A);
        let rssi: Vec<i8> = drained.iter().map(|s| s.rssi).collect();
        assert_eq!(rssi, vec![-2, -3, -4, -5, -6]);
    }

    #[test]
    fn test_consumers_are_independent() {
        let mut table = PeerTable::new(5);
        let slot = table.save_peer(&id(1), &[1; 6], None).unwrap();
        for _ in 0..3 {
            table.save_sample(slot, Sample::new(-50, 1)).unwrap();
        }

        assert_eq!(table.take_unread(slot, Consumer::A).len(), 3);
        assert_eq!(table.get(slot).unwrap().cursor.unread(Consumer::B), 3);
        assert!(table.take_unread(slot, Consumer::A).is_empty());
    }

    #[test]
    fn test_reduce_remaining() {
        let mut table = PeerTable::new(5);
        let slot = table.save_peer(&id(1), &[1; 6], None).unwrap();
        for rssi in 0..4i8 {
            table.save_sample(slot, Sample::new(-rssi, 0)).unwrap();
        }

        assert_eq!(
            table.reduce_remaining_to(slot, Consumer::A, 5),
            Err(RingError::InsufficientData {
                available: 4,
                requested: 5
            })
        );
        assert_eq!(table.get(slot).unwrap().cursor.unread(Consumer::A), 4);

        table.reduce_remaining_to(slot, Consumer::A, 2).unwrap();
        let rssi: Vec<i8> = table
            .take_unread(slot, Consumer::A)
            .iter()
            .map(|s| s.rssi)
            .collect();
        assert_eq!(rssi, vec![-2, -3]);
    }

    #[test]
    fn test_clear_resets_samples() {
        let mut table = PeerTable::new(5);
        let slot = table.save_peer(&id(1), &[1; 6], None).unwrap();
        table.save_sample(slot, Sample::new(-30, 0)).unwrap();
        table.clear(slot);

        let record = table.get(slot).unwrap();
        assert!(!record.active);
        assert_eq!(record.stored_count(), 0);
        assert!(record.samples.iter().all(|s| *s == Sample::EMPTY));
        assert!(table.save_sample(slot, Sample::new(-30, 0)).is_err());
    }

    #[test]
    fn test_cursor_wraps_modulus() {
        let mut cursor = MultiConsumerCursor::default();
        for _ in 0..23 {
            cursor.begin_write();
        }
        assert!(cursor.stored().value() < 10);
        assert_eq!(cursor.unread(Consumer::A), SAMPLES_PER_PEER);

        for _ in 0..SAMPLES_PER_PEER {
            assert!(cursor.read_next(Consumer::A).is_some());
        }
        assert_eq!(cursor.read_next(Consumer::A), None);
        assert_eq!(cursor.unread(Consumer::B), SAMPLES_PER_PEER);
    }
}
