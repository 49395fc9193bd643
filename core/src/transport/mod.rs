// Transport module — BLE central role towards peers

pub mod ble;

pub use ble::{
    Advert, AddressType, Characteristic, ChunkedSender, DiscoveryError, LinkState, ManualProbe,
    NodeState, PeerKind, ProbeOutcome, SendStep, ServiceHandles, StackError,
};
