/// Chunked send pipeline towards the connected peer
///
/// One virtual channel is active at a time and steps
/// SIGN -> HEALTH -> RSSI -> FINAL (a session that skips the signature
/// starts at EMPTY and goes straight to HEALTH). Every transmit confirmation
/// calls [`ChunkedSender::continue_sending`], which either produces the next
/// write or reports that a stage is done.

use thiserror::Error;
use tracing::debug;

use super::gatt::Characteristic;
use crate::platform::CHUNK_SIZE;
use crate::store::Sample;

/// Capacity of the outgoing sample queue
pub const RSSI_QUEUE_SIZE: usize = 20;

/// Largest payload the sender streams as chunks
pub const MAX_CHUNKED_PAYLOAD: usize = 64;

/// Bytes per queued sample on the wire
const SAMPLE_WIRE_SIZE: usize = 2;

/// Active virtual channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Empty,
    Sign,
    Health,
    Rssi,
    Final,
}

/// Outcome of one send step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStep {
    Write {
        characteristic: Characteristic,
        data: Vec<u8>,
    },
    DoneSignature,
    DoneHealth,
    DoneRssi,
    /// Nothing left on the FINAL channel
    Idle,
}

/// Circular queue of samples awaiting transmission.
/// Adding to a full queue overwrites the oldest entry.
#[derive(Debug, Clone)]
pub struct RssiQueue {
    entries: [Sample; RSSI_QUEUE_SIZE],
    front: usize,
    back: usize,
}

impl Default for RssiQueue {
    fn default() -> Self {
        Self {
            entries: [Sample::EMPTY; RSSI_QUEUE_SIZE],
            front: 0,
            back: 0,
        }
    }
}

impl RssiQueue {
    pub fn push(&mut self, sample: Sample) {
        self.entries[self.back] = sample;
        self.back = (self.back + 1) % RSSI_QUEUE_SIZE;
        if self.back == self.front {
            self.front = (self.front + 1) % RSSI_QUEUE_SIZE;
        }
    }

    pub fn len(&self) -> usize {
        (self.back + RSSI_QUEUE_SIZE - self.front) % RSSI_QUEUE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.front == self.back
    }

    pub fn clear(&mut self) {
        self.front = 0;
        self.back = 0;
    }

    /// Next batch of at most `batch` entries. Batches never wrap past the
    /// end of the queue. `None` once drained, which also rewinds the queue.
    pub fn next_batch(&mut self, batch: usize) -> Option<Vec<Sample>> {
        if self.is_empty() {
            self.clear();
            return None;
        }

        let count = if self.back > self.front && self.back - self.front < batch {
            self.back - self.front
        } else if self.back < self.front && RSSI_QUEUE_SIZE - self.front < batch {
            RSSI_QUEUE_SIZE - self.front
        } else {
            batch
        };

        let out = self.entries[self.front..self.front + count].to_vec();
        self.front = (self.front + count) % RSSI_QUEUE_SIZE;
        Some(out)
    }
}

/// Stateful multiplexer over the sign, health and rssi characteristics
#[derive(Debug, Clone)]
pub struct ChunkedSender {
    channel: Channel,
    chunk_index: usize,
    payload: Vec<u8>,
    health_general: Option<Vec<u8>>,
    health_fault: Option<Vec<u8>>,
    rssi: RssiQueue,
    rssi_batch: usize,
}

impl ChunkedSender {
    /// Sender for a link with the given ATT MTU
    pub fn new(att_mtu: u16) -> Self {
        let max_write = (att_mtu as usize).saturating_sub(3);
        Self {
            channel: Channel::Empty,
            chunk_index: 0,
            payload: Vec::new(),
            health_general: None,
            health_fault: None,
            rssi: RssiQueue::default(),
            rssi_batch: (max_write / SAMPLE_WIRE_SIZE).clamp(1, RSSI_QUEUE_SIZE),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn rssi_batch(&self) -> usize {
        self.rssi_batch
    }

    pub fn queued_samples(&self) -> usize {
        self.rssi.len()
    }

    /// Back to EMPTY with nothing queued
    pub fn reset(&mut self) {
        self.channel = Channel::Empty;
        self.chunk_index = 0;
        self.payload.clear();
        self.health_general = None;
        self.health_fault = None;
        self.rssi.clear();
    }

    /// Start streaming `payload` on the sign channel. Payloads longer than
    /// [`MAX_CHUNKED_PAYLOAD`] are truncated.
    pub fn send_signature(&mut self, payload: &[u8]) -> SendStep {
        let len = payload.len().min(MAX_CHUNKED_PAYLOAD);
        self.payload.clear();
        self.payload.extend_from_slice(&payload[..len]);
        self.chunk_index = 0;
        self.channel = Channel::Sign;
        self.send_sign_chunk()
    }

    /// Queue the health records. While the health stage is current or
    /// nothing has been sent yet, sending resumes immediately.
    pub fn queue_health(&mut self, general: &[u8], fault: Option<&[u8]>) -> Option<SendStep> {
        self.health_general = Some(general.to_vec());
        self.health_fault = fault.map(<[u8]>::to_vec);
        match self.channel {
            Channel::Empty | Channel::Health => Some(self.continue_sending()),
            _ => None,
        }
    }

    pub fn queue_samples(&mut self, samples: &[Sample]) {
        for sample in samples {
            self.rssi.push(*sample);
        }
    }

    /// Produce the next write for the active channel, or report the stage
    /// as done and move to the next channel.
    pub fn continue_sending(&mut self) -> SendStep {
        match self.channel {
            Channel::Sign => self.send_sign_chunk(),
            Channel::Empty | Channel::Health => {
                self.channel = Channel::Health;
                self.send_health()
            }
            Channel::Rssi => self.send_rssi(),
            Channel::Final => SendStep::Idle,
        }
    }

    fn send_sign_chunk(&mut self) -> SendStep {
        if self.payload.len() <= self.chunk_index * CHUNK_SIZE {
            self.channel = Channel::Health;
            return SendStep::DoneSignature;
        }

        let offset = self.chunk_index * CHUNK_SIZE;
        let end = (offset + CHUNK_SIZE).min(self.payload.len());
        let mut frame = vec![0u8; CHUNK_SIZE + 1];
        frame[0] = (self.chunk_index + 1) as u8;
        frame[1..1 + end - offset].copy_from_slice(&self.payload[offset..end]);
        self.chunk_index += 1;

        SendStep::Write {
            characteristic: Characteristic::Sign,
            data: frame,
        }
    }

    fn send_health(&mut self) -> SendStep {
        let record = self.health_general.take().or_else(|| self.health_fault.take());
        match record {
            Some(data) => SendStep::Write {
                characteristic: Characteristic::Health,
                data,
            },
            None => {
                self.channel = Channel::Rssi;
                SendStep::DoneHealth
            }
        }
    }

    fn send_rssi(&mut self) -> SendStep {
        match self.rssi.next_batch(self.rssi_batch) {
            Some(batch) => {
                debug!(count = batch.len(), "Sending sample batch");
                let mut data = Vec::with_capacity(batch.len() * SAMPLE_WIRE_SIZE);
                for sample in batch {
                    data.push(sample.rssi as u8);
                    data.push(sample.angle);
                }
                SendStep::Write {
                    characteristic: Characteristic::Rssi,
                    data,
                }
            }
            None => {
                self.channel = Channel::Final;
                SendStep::DoneRssi
            }
        }
    }
}

/// Errors reassembling a chunked payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Chunk index {0} out of range")]
    IndexOutOfRange(u8),
    #[error("Duplicate chunk {0}")]
    Duplicate(u8),
}

/// Reassembles a fixed-length payload from 1-based indexed chunks.
/// Every index must arrive exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAssembler {
    buffer: Vec<u8>,
    chunk_size: usize,
    received: u32,
}

impl ChunkAssembler {
    pub fn new(len: usize, chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0);
        debug_assert!(len.div_ceil(chunk_size) <= 32);
        Self {
            buffer: vec![0u8; len],
            chunk_size,
            received: 0,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.buffer.len().div_ceil(self.chunk_size)
    }

    pub fn is_complete(&self) -> bool {
        let count = self.chunk_count();
        count > 0 && self.received.count_ones() as usize == count
    }

    /// Store chunk `index` (1-based). Bytes beyond the payload end are
    /// ignored. Returns `true` once every chunk is present.
    pub fn insert(&mut self, index: u8, data: &[u8]) -> Result<bool, ChunkError> {
        if index == 0 || index as usize > self.chunk_count() {
            return Err(ChunkError::IndexOutOfRange(index));
        }
        let bit = 1u32 << (index - 1);
        if self.received & bit != 0 {
            return Err(ChunkError::Duplicate(index));
        }

        let offset = (index as usize - 1) * self.chunk_size;
        let end = (offset + self.chunk_size).min(self.buffer.len());
        let take = (end - offset).min(data.len());
        self.buffer[offset..offset + take].copy_from_slice(&data[..take]);
        self.received |= bit;
        Ok(self.is_complete())
    }

    /// The payload, once complete
    pub fn payload(&self) -> Option<&[u8]> {
        self.is_complete().then_some(self.buffer.as_slice())
    }

    pub fn clear(&mut self) {
        self.buffer.iter_mut().for_each(|b| *b = 0);
        self.received = 0;
    }
}
