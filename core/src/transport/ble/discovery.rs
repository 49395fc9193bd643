/// Service discovery on a connected peer
///
/// Peers that advertise the service UUID openly are resolved by structured
/// discovery: the host enumerates the service named by the UUID and reports
/// its characteristics. Background-mode peers only expose an opaque vendor
/// payload, so the node walks the peer's primary services by handle range
/// and reads the 128-bit UUID of every candidate until the vendor service
/// turns up (the manual probe).

use thiserror::Error;
use tracing::{debug, warn};

use super::gatt::{is_service_uuid, Characteristic, SERVICE_UUID16};
use super::stack::{GattStatus, PrimaryService, StackError, UuidType};

/// First handle of the attribute table
pub const HANDLE_START: u16 = 0x0001;

/// Last handle of the attribute table
pub const HANDLE_END: u16 = 0xFFFF;

/// Busy replies tolerated before the probe gives up
const MAX_BUSY_RETRIES: u8 = 3;

/// Errors resolving the peer service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Vendor service not found")]
    ServiceNotFound,
    #[error("Missing {0:?} characteristic")]
    MissingCharacteristic(Characteristic),
    #[error("Notify characteristic has no CCCD")]
    MissingCccd,
}

/// Result of a manual probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found { uuid: [u8; 16] },
    NotFound,
    Error(StackError),
}

/// Stack calls the probe needs issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeRequest {
    DiscoverPrimaryServices { start_handle: u16 },
    Read { handle: u16 },
}

/// Probe calls that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeCall {
    DiscoverPrimaryServices,
    Read,
}

/// What the caller should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeProgress {
    /// Issue these calls; empty while waiting for outstanding reads
    Continue(Vec<ProbeRequest>),
    Finished(ProbeOutcome),
}

/// Handle-range walk over the peer's primary services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualProbe {
    start_handle: u16,
    end_handle: u16,
    pending_reads: u16,
    busy_retries: u8,
    finished: bool,
}

impl ManualProbe {
    /// Begin at the first handle
    pub fn start() -> (Self, ProbeRequest) {
        debug!("Manual service probe started");
        let probe = Self {
            start_handle: HANDLE_START,
            end_handle: HANDLE_END,
            pending_reads: 0,
            busy_retries: 0,
            finished: false,
        };
        (
            probe,
            ProbeRequest::DiscoverPrimaryServices {
                start_handle: HANDLE_START,
            },
        )
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn pending_reads(&self) -> u16 {
        self.pending_reads
    }

    fn finish(&mut self, outcome: ProbeOutcome) -> ProbeProgress {
        self.finished = true;
        debug!(?outcome, "Manual service probe finished");
        ProbeProgress::Finished(outcome)
    }

    /// Move past the last scanned range
    fn continue_walk(&mut self) -> ProbeProgress {
        if self.start_handle == HANDLE_END {
            return self.finish(ProbeOutcome::NotFound);
        }
        self.start_handle += 1;
        debug!(start_handle = self.start_handle, "Probe continues");
        ProbeProgress::Continue(vec![ProbeRequest::DiscoverPrimaryServices {
            start_handle: self.start_handle,
        }])
    }

    /// Primary service discovery response
    pub fn on_primary_services(
        &mut self,
        status: GattStatus,
        services: &[PrimaryService],
    ) -> ProbeProgress {
        if self.finished {
            return ProbeProgress::Continue(Vec::new());
        }
        self.busy_retries = 0;

        if !status.is_success() {
            debug!(?status, "Primary service discovery ended");
            if self.pending_reads == 0 {
                return self.finish(ProbeOutcome::NotFound);
            }
            return ProbeProgress::Continue(Vec::new());
        }

        let mut requests = Vec::new();
        for service in services {
            self.start_handle = service.start_handle;
            self.end_handle = service.end_handle;

            let candidate = (service.uuid16 == SERVICE_UUID16
                && service.uuid_type == UuidType::Vendor)
                || service.uuid_type == UuidType::Unknown;
            if candidate {
                requests.push(ProbeRequest::Read {
                    handle: service.start_handle,
                });
                self.pending_reads += 1;
            } else {
                debug!(
                    uuid = format_args!("{:04X}", service.uuid16),
                    "Ignored service"
                );
            }
        }

        self.start_handle = self.end_handle;
        if self.pending_reads != 0 {
            return ProbeProgress::Continue(requests);
        }
        self.continue_walk()
    }

    /// Read response for a candidate service declaration
    pub fn on_read_response(&mut self, data: &[u8]) -> ProbeProgress {
        if self.finished {
            return ProbeProgress::Continue(Vec::new());
        }

        if data.len() == 16 && is_service_uuid(data) {
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(data);
            return self.finish(ProbeOutcome::Found { uuid });
        }

        debug!(len = data.len(), "Ignored service declaration");
        self.pending_reads = self.pending_reads.saturating_sub(1);
        if self.pending_reads == 0 {
            return self.continue_walk();
        }
        ProbeProgress::Continue(Vec::new())
    }

    /// A probe call was rejected by the stack
    pub fn on_call_failed(&mut self, call: ProbeCall, error: StackError) -> ProbeProgress {
        if self.finished {
            return ProbeProgress::Continue(Vec::new());
        }

        match (call, error) {
            (ProbeCall::DiscoverPrimaryServices, StackError::Busy)
                if self.busy_retries < MAX_BUSY_RETRIES =>
            {
                self.busy_retries += 1;
                ProbeProgress::Continue(vec![ProbeRequest::DiscoverPrimaryServices {
                    start_handle: self.start_handle,
                }])
            }
            _ => {
                warn!(?call, %error, "Probe call failed");
                self.finish(ProbeOutcome::Error(error))
            }
        }
    }
}
