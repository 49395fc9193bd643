/// Advertisement report parsing
///
/// Reports are walked as AD structures `[len, type, data(len - 1)]`. Two
/// shapes are of interest: a complete 128-bit service UUID list carrying the
/// vendor service, and a vendor-specific field with the Apple company prefix
/// that background-mode peers fall back to.

use thiserror::Error;
use tracing::{debug, warn};

use super::gatt::{is_service_uuid, peer_id_from_uuid};
use crate::store::{Fingerprint, PeerId};

/// AD type: complete list of 128-bit service UUIDs
pub const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;

/// AD type: manufacturer specific data
pub const AD_TYPE_MANUFACTURER: u8 = 0xFF;

/// Length byte of a service field holding exactly one UUID
const SERVICE_FIELD_LEN: u8 = 17;

/// Length byte of a background-mode vendor field
const VENDOR_FIELD_LEN: u8 = 20;

/// Company identifier prefix, little-endian 0x004C
const VENDOR_PREFIX: [u8; 2] = [0x4C, 0x00];

/// Kind of peer, carried in UUID octet 11 and identifier byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Android,
    /// Maintenance tool addressing one node
    Tools,
    Background,
    Ios,
    Unknown(u8),
}

impl PeerKind {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => PeerKind::Android,
            0x01 => PeerKind::Tools,
            0x02 => PeerKind::Background,
            0xFF => PeerKind::Ios,
            other => PeerKind::Unknown(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            PeerKind::Android => 0x00,
            PeerKind::Tools => 0x01,
            PeerKind::Background => 0x02,
            PeerKind::Ios => 0xFF,
            PeerKind::Unknown(other) => *other,
        }
    }

    /// Kinds subject to the RSSI lower limit
    fn rssi_filtered(&self) -> bool {
        matches!(self, PeerKind::Android | PeerKind::Ios)
    }
}

/// Why a candidate field was skipped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertReject {
    #[error("Not the vendor service")]
    NotFound,
    #[error("RSSI at or below limit")]
    RssiTooLow,
    #[error("Addressed to node {0:04X}")]
    WrongAddressee(u16),
}

/// Receiver-side filter inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertFilter {
    pub rssi_lower_limit: i8,
    pub node_id: u16,
}

impl AdvertFilter {
    fn rssi_passes(&self, rssi: i8) -> bool {
        rssi > self.rssi_lower_limit
    }
}

/// What a report resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advert {
    /// Vendor service advertised openly
    Service { id: PeerId, kind: PeerKind },
    /// Opaque vendor payload, to be resolved through the lists or a probe
    Vendor { fingerprint: Fingerprint },
}

/// Iterator over complete AD structures, yielding `(ad_type, data)`
pub struct AdStructures<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AdStructures<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    /// `(len, ad_type, data)`
    type Item = (u8, u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let len = *self.data.get(self.pos)?;
            let start = self.pos;
            self.pos += 1 + len as usize;
            if len == 0 {
                continue;
            }
            let end = start + 1 + len as usize;
            if end > self.data.len() {
                return None;
            }
            return Some((len, self.data[start + 1], &self.data[start + 2..end]));
        }
    }
}

fn validate_service_uuid(
    uuid: &[u8],
    rssi: i8,
    filter: &AdvertFilter,
) -> Result<PeerKind, AdvertReject> {
    if !is_service_uuid(uuid) {
        return Err(AdvertReject::NotFound);
    }

    let kind = PeerKind::from_byte(uuid[11]);
    if kind.rssi_filtered() && !filter.rssi_passes(rssi) {
        return Err(AdvertReject::RssiTooLow);
    }
    if kind == PeerKind::Tools {
        let addressee = u16::from(uuid[9]) << 8 | u16::from(uuid[8]);
        if addressee != filter.node_id {
            return Err(AdvertReject::WrongAddressee(addressee));
        }
    }
    Ok(kind)
}

fn validate_vendor(data: &[u8], rssi: i8, filter: &AdvertFilter) -> Result<Fingerprint, AdvertReject> {
    if data.len() < 2 + 16 || data[..2] != VENDOR_PREFIX {
        return Err(AdvertReject::NotFound);
    }
    if !filter.rssi_passes(rssi) {
        return Err(AdvertReject::RssiTooLow);
    }
    let mut fingerprint = [0u8; 16];
    fingerprint.copy_from_slice(&data[2..18]);
    Ok(fingerprint)
}

/// Resolve an advertisement report.
///
/// The first matching service field wins. Vendor fields are only considered
/// when no service field matched.
pub fn parse_advert(data: &[u8], rssi: i8, filter: &AdvertFilter) -> Option<Advert> {
    for (len, ad_type, field) in AdStructures::new(data) {
        if len != SERVICE_FIELD_LEN || ad_type != AD_TYPE_UUID128_COMPLETE {
            continue;
        }
        match validate_service_uuid(field, rssi, filter) {
            Ok(kind) => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(field);
                return Some(Advert::Service {
                    id: peer_id_from_uuid(&uuid),
                    kind,
                });
            }
            Err(AdvertReject::WrongAddressee(addressee)) => {
                warn!(
                    "Tools advert for {:04X}, this node is {:04X}",
                    addressee, filter.node_id
                );
            }
            Err(reason) => debug!(rssi, "Skipping service field: {}", reason),
        }
    }

    for (len, ad_type, field) in AdStructures::new(data) {
        if len != VENDOR_FIELD_LEN || ad_type != AD_TYPE_MANUFACTURER {
            continue;
        }
        match validate_vendor(field, rssi, filter) {
            Ok(fingerprint) => return Some(Advert::Vendor { fingerprint }),
            Err(reason) => debug!(rssi, "Skipping vendor field: {}", reason),
        }
    }

    None
}
