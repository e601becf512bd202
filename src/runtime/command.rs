//! # Commands (Internal)
//!
//! The [`Command`] enum carries work from user-facing handles to the
//! scheduler task. Handles never perform I/O themselves: they send a
//! command through an MPSC channel and wait on the embedded oneshot
//! responder.
//!
//! ```text
//! ┌──────────────┐      command channel      ┌───────────────┐
//! │  DiagClient  │ ────────────────────────▶ │   Scheduler   │
//! │ Conversation │   cmd_tx.send(Command)    │  (event loop) │
//! └──────────────┘                           └───────────────┘
//! ```
//!
//! A dropped responder means the scheduler (or channel) went away; handles
//! map that onto the shutdown error of the respective operation.

use std::net::IpAddr;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{
    ConnectError, ConversationError, DisconnectError, DiscoveryError, UdsError,
};
use crate::{LogicalAddress, VehicleAddrInfo, VehicleInfoRequest};

/// Commands sent from handles to the scheduler task
pub(crate) enum Command {
    /// Move a conversation from `Uninit` to `Idle`
    Startup {
        name: String,
        respond: oneshot::Sender<Result<(), ConversationError>>,
    },
    /// Tear a conversation down to `Uninit`, disconnecting if needed
    Shutdown {
        name: String,
        respond: oneshot::Sender<Result<(), ConversationError>>,
    },
    /// Connect a conversation's channel and activate routing
    Connect {
        name: String,
        target: LogicalAddress,
        ip: IpAddr,
        respond: oneshot::Sender<Result<(), ConnectError>>,
    },
    /// Send one UDS request on a conversation's channel
    SendDiagnostic {
        name: String,
        request: Bytes,
        respond: oneshot::Sender<Result<Bytes, UdsError>>,
    },
    /// Close a conversation's channel
    Disconnect {
        name: String,
        respond: oneshot::Sender<Result<(), DisconnectError>>,
    },
    /// Run (or join) a vehicle discovery window
    Discover {
        filter: VehicleInfoRequest,
        respond: oneshot::Sender<Result<Vec<VehicleAddrInfo>, DiscoveryError>>,
    },
    /// Snapshot of servers seen so far (announcements + discovery)
    ServerList {
        respond: oneshot::Sender<Vec<VehicleAddrInfo>>,
    },
    /// Shut the scheduler down; acked once all channels have closed
    Deinitialize {
        respond: oneshot::Sender<()>,
    },
}

/// Notifications from channel tasks back to the scheduler.
///
/// Callers waiting on connect or disconnect are answered by the scheduler
/// when it processes these events, never by the channel task directly.
/// This keeps the bookkeeping (channel slot, active pair set) strictly
/// ahead of the caller: by the time a connect error is observable, the
/// slot is already free for a retry.
///
/// The channel id lets the scheduler ignore stale events from a channel
/// that has already been replaced for the same conversation.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    /// Routing activation succeeded; the conversation is connected
    Activated { name: String, channel_id: u64 },
    /// The channel task exited; the `(source, target)` slot is free again.
    /// Carries the connect outcome when the channel never reached the
    /// active state.
    Closed {
        name: String,
        channel_id: u64,
        connect_failure: Option<ConnectError>,
    },
}
