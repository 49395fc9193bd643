// Store module — peer sample rings, fingerprint lists and persistent records

pub mod backend;
pub mod lists;
pub mod ring;

pub use backend::{
    Configuration, MemoryStore, Params, PersistentStore, RecordKey, RecordsExt, SledStore,
    StoreError, VersionRecord,
};
#[cfg(test)]
pub use backend::MockPersistentStore;
pub use lists::{AllowList, DenyList, ListError};
pub use ring::{
    Consumer, Fingerprint, MacAddress, MultiConsumerCursor, PeerId, PeerRecord, PeerTable,
    RingCursor, RingError, Sample,
};
