//! # Vehicle Discovery
//!
//! UDP-side handlers: building vehicle identification requests and
//! collecting `VehicleAnnouncement` responses over a timed window.
//!
//! Discovery is independent of any conversation. A window is opened by the
//! first [`Discover`](crate::runtime::Command::Discover) command; callers
//! arriving while a window is open join it instead of sending a second
//! request. When the window elapses every waiter receives the same
//! collection, deduplicated by logical address in arrival order. An empty
//! collection is a successful result, not an error.

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::DiscoveryError;
use crate::wire::{Message, Payload};
use crate::{VehicleAddrInfo, VehicleInfoRequest};

/// Build the identification request message for a filter
pub(crate) fn build_request(filter: &VehicleInfoRequest) -> Message {
    let payload = match filter {
        VehicleInfoRequest::Any => Payload::VehicleIdentificationRequest,
        VehicleInfoRequest::ByEid(eid) => {
            Payload::VehicleIdentificationRequestWithEid { eid: *eid }
        }
        VehicleInfoRequest::ByVin(vin) => {
            Payload::VehicleIdentificationRequestWithVin { vin: *vin }
        }
    };
    Message::new(payload)
}

/// One open discovery window
pub(crate) struct DiscoverySession {
    deadline: Instant,
    results: Vec<VehicleAddrInfo>,
    waiters: Vec<oneshot::Sender<Result<Vec<VehicleAddrInfo>, DiscoveryError>>>,
}

impl DiscoverySession {
    pub fn new(
        deadline: Instant,
        first_waiter: oneshot::Sender<Result<Vec<VehicleAddrInfo>, DiscoveryError>>,
    ) -> Self {
        Self {
            deadline,
            results: Vec::new(),
            waiters: vec![first_waiter],
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// A later caller joins the already-open window
    pub fn join(
        &mut self,
        waiter: oneshot::Sender<Result<Vec<VehicleAddrInfo>, DiscoveryError>>,
    ) {
        self.waiters.push(waiter);
    }

    /// Record one announcement. Duplicates (reflections, repeated
    /// announcements from the same entity) are suppressed by logical
    /// address; the first arrival wins.
    pub fn absorb(&mut self, info: VehicleAddrInfo) {
        if self
            .results
            .iter()
            .any(|r| r.logical_address == info.logical_address)
        {
            tracing::trace!(
                "Duplicate announcement from {} suppressed",
                info.logical_address
            );
            return;
        }
        self.results.push(info);
    }

    /// The window elapsed: hand the collection to every waiter.
    pub fn finish(self) {
        tracing::debug!(
            "Discovery window closed with {} server(s), {} waiter(s)",
            self.results.len(),
            self.waiters.len()
        );
        for waiter in self.waiters {
            let _ = waiter.send(Ok(self.results.clone()));
        }
    }

    /// The client is shutting down mid-window: wake every waiter with an
    /// error.
    pub fn abort(self) {
        for waiter in self.waiters {
            let _ = waiter.send(Err(DiscoveryError::Shutdown));
        }
    }
}
