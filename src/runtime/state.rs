//! # Scheduler State (Internal)
//!
//! All mutable state of the client engine lives in [`SchedulerState`] and
//! is owned exclusively by the scheduler task; no locks, no atomics.
//! Handler code takes `&mut SchedulerState` and returns control to the
//! event loop.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`SchedulerState`] | Top-level state container |
//! | [`ConversationEntry`] | Lifecycle + channel slot of one conversation |
//! | [`ChannelSlot`] | Live channel: id, command sender, join handle |
//!
//! ## Channel identity
//!
//! Every spawned channel gets a fresh `u64` id. Channel-closed events carry
//! that id, and bookkeeping (channel slot, active `(source, target)` pair)
//! is only cleared when the id still matches. This prevents a stale event
//! from an old channel tearing down a newer channel that reused the same
//! conversation or address pair.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::error::{ConnectError, ConversationError, DisconnectError};
use crate::runtime::channel::ChannelCommand;
use crate::runtime::discovery::DiscoverySession;
use crate::VehicleAddrInfo;

/// Conversation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConversationState {
    /// Configured but not started
    Uninit,
    /// Started, no channel
    Idle,
    /// Channel active (routing activated)
    Connected,
    /// Shutdown requested while a channel was still open
    ShuttingDown,
}

/// A live channel owned by a conversation.
///
/// Callers blocked on connect or disconnect park their responders here;
/// the scheduler answers them while processing the channel's events, after
/// its own bookkeeping is done.
pub(crate) struct ChannelSlot {
    pub id: u64,
    pub cmd_tx: mpsc::Sender<ChannelCommand>,
    pub task: JoinHandle<()>,
    /// Caller waiting for the connect + routing activation outcome
    pub pending_connect: Option<oneshot::Sender<Result<(), ConnectError>>>,
    /// Callers waiting for the channel to close
    pub pending_disconnects: Vec<oneshot::Sender<Result<(), DisconnectError>>>,
}

/// Per-conversation bookkeeping
pub(crate) struct ConversationEntry {
    /// Index into `ClientConfig::conversations`
    pub config_index: usize,
    pub lifecycle: ConversationState,
    pub channel: Option<ChannelSlot>,
    /// Responder parked until the channel closes during a shutdown
    pub pending_shutdown: Option<oneshot::Sender<Result<(), ConversationError>>>,
}

/// All mutable state owned by the scheduler task
pub(crate) struct SchedulerState {
    pub conversations: HashMap<String, ConversationEntry>,
    /// Active `(tester source, server logical)` pairs, mapped to the owning
    /// channel id
    pub active_pairs: HashMap<(u16, u16), u64>,
    /// Open discovery window, if any
    pub discovery: Option<DiscoverySession>,
    /// Servers seen so far, deduplicated by logical address
    pub known_servers: Vec<VehicleAddrInfo>,
    /// Malformed UDP datagrams received (counted, never fatal)
    pub malformed_datagrams: u64,
    next_channel_id: u64,
}

impl SchedulerState {
    pub fn new(config: &ClientConfig) -> Self {
        let conversations = config
            .conversations
            .iter()
            .enumerate()
            .map(|(i, conv)| {
                (
                    conv.name.clone(),
                    ConversationEntry {
                        config_index: i,
                        lifecycle: ConversationState::Uninit,
                        channel: None,
                        pending_shutdown: None,
                    },
                )
            })
            .collect();
        Self {
            conversations,
            active_pairs: HashMap::new(),
            discovery: None,
            known_servers: Vec::new(),
            malformed_datagrams: 0,
            next_channel_id: 1,
        }
    }

    pub fn next_channel_id(&mut self) -> u64 {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        id
    }

    /// Fold a vehicle announcement into the server cache and any open
    /// discovery window. Set semantics by logical address: the first
    /// announcement wins within a window, the cache keeps the latest.
    pub fn absorb_announcement(&mut self, info: VehicleAddrInfo) {
        if let Some(session) = &mut self.discovery {
            session.absorb(info.clone());
        }
        match self
            .known_servers
            .iter_mut()
            .find(|s| s.logical_address == info.logical_address)
        {
            Some(existing) => *existing = info,
            None => self.known_servers.push(info),
        }
    }

    /// Deadline of the open discovery window, if one is active
    pub fn discovery_deadline(&self) -> Option<Instant> {
        self.discovery.as_ref().map(DiscoverySession::deadline)
    }
}
