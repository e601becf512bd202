//! # Scheduler Event Loop
//!
//! The background task behind a [`DiagClient`](crate::DiagClient). It owns
//! the shared UDP endpoint and all mutable engine state, and multiplexes in
//! one `select!` loop:
//!
//! - UDP datagrams (vehicle announcements and identification responses)
//! - commands from handles
//! - notifications from channel tasks (activation, close)
//! - the discovery window deadline
//!
//! Channels run as their own tasks; the scheduler only forwards per-channel
//! work with a non-blocking `try_send`, so a stalled conversation can never
//! hold up the loop or another conversation.
//!
//! Shutdown: a `Deinitialize` command (or all handles dropping) wakes every
//! in-flight caller with the shutdown error of its operation, closes all
//! channel tasks and joins them before acking, so no scheduler activity
//! remains observable after `deinitialize` returns.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::config::{ClientConfig, ConversationConfig, TimingConfig};
use crate::error::{ConnectError, ConversationError, DisconnectError, DiscoveryError, UdsError};
use crate::net::{TcpStream, UdpSocket};
use crate::runtime::channel::{channel_task, ChannelCommand, ChannelParams};
use crate::runtime::command::{ChannelEvent, Command};
use crate::runtime::discovery::{self, DiscoverySession};
use crate::runtime::state::{ChannelSlot, ConversationState, SchedulerState};
use crate::wire::{Message, Payload};
use crate::{VehicleAddrInfo, VehicleInfoRequest};

/// The background scheduler task
pub(crate) async fn scheduler_task<U: UdpSocket, T: TcpStream>(
    udp: U,
    config: Arc<ClientConfig>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let mut state = SchedulerState::new(&config);
    let (event_tx, mut event_rx) = mpsc::channel::<ChannelEvent>(32);
    let mut buf = [0u8; 2048];

    tracing::info!(
        "DoIP client scheduler running ({} conversation(s), UDP on {:?})",
        config.conversations.len(),
        udp.local_addr().ok()
    );

    loop {
        let discovery_deadline = state.discovery_deadline();

        tokio::select! {
            // Vehicle announcements and identification responses
            result = udp.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        let Some(datagram) = buf.get(..len) else {
                            continue;
                        };
                        handle_datagram(&mut state, datagram, from, config.max_payload_size);
                    }
                    Err(e) => {
                        tracing::error!("UDP receive error: {}", e);
                    }
                }
            }

            // The discovery window elapsed
            () = async {
                match discovery_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some(session) = state.discovery.take() {
                    session.finish();
                }
            }

            // Channel lifecycle notifications
            Some(event) = event_rx.recv() => {
                handle_channel_event(&mut state, event);
            }

            // Commands from handles
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Deinitialize { respond }) => {
                        shutdown(&mut state, &mut event_rx).await;
                        let _ = respond.send(());
                        break;
                    }
                    None => {
                        // All handles dropped without an explicit deinitialize
                        shutdown(&mut state, &mut event_rx).await;
                        break;
                    }
                    Some(Command::Discover { filter, respond }) => {
                        handle_discover(&mut state, &udp, &config, filter, respond).await;
                    }
                    Some(cmd) => {
                        handle_command::<T>(&mut state, &config, &event_tx, cmd);
                    }
                }
            }
        }
    }

    tracing::info!(
        "DoIP client scheduler stopped ({} malformed datagram(s) seen)",
        state.malformed_datagrams
    );
}

// ============================================================================
// UDP PATH
// ============================================================================

fn handle_datagram(
    state: &mut SchedulerState,
    datagram: &[u8],
    from: SocketAddr,
    max_payload_size: u32,
) {
    let mut bytes = Bytes::copy_from_slice(datagram);
    match Message::decode(&mut bytes, max_payload_size) {
        Ok(message) => match message.payload {
            Payload::VehicleAnnouncement {
                vin,
                logical_address,
                eid,
                gid,
                ..
            } => {
                tracing::debug!(
                    "Announcement from {}: logical {}, VIN {}",
                    from,
                    logical_address,
                    vin
                );
                state.absorb_announcement(VehicleAddrInfo {
                    ip: from.ip(),
                    logical_address,
                    vin,
                    eid,
                    gid,
                });
            }
            other => {
                tracing::debug!(
                    "Ignoring {:?} datagram from {}",
                    other.payload_type(),
                    from
                );
            }
        },
        Err(e) => {
            // Malformed UDP input is counted and dropped, never fatal
            state.malformed_datagrams += 1;
            tracing::warn!(
                "Malformed datagram from {} ({}); {} so far",
                from,
                e,
                state.malformed_datagrams
            );
        }
    }
}

async fn handle_discover<U: UdpSocket>(
    state: &mut SchedulerState,
    udp: &U,
    config: &ClientConfig,
    filter: VehicleInfoRequest,
    respond: oneshot::Sender<Result<Vec<VehicleAddrInfo>, DiscoveryError>>,
) {
    // A window is already collecting: join it instead of re-requesting
    if let Some(session) = &mut state.discovery {
        session.join(respond);
        return;
    }

    let request = discovery::build_request(&filter).encode();
    match udp.send_to(&request, config.discovery_target).await {
        Ok(_) => {
            tracing::debug!(
                "Identification request sent to {}; window {:?}",
                config.discovery_target,
                config.timing.discovery_window
            );
            state.discovery = Some(DiscoverySession::new(
                Instant::now() + config.timing.discovery_window,
                respond,
            ));
        }
        Err(e) => {
            let _ = respond.send(Err(DiscoveryError::UdpSend(e)));
        }
    }
}

// ============================================================================
// COMMAND DISPATCH
// ============================================================================

fn handle_command<T: TcpStream>(
    state: &mut SchedulerState,
    config: &Arc<ClientConfig>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    cmd: Command,
) {
    match cmd {
        Command::Startup { name, respond } => {
            let result = match state.conversations.get_mut(&name) {
                Some(entry) => {
                    if entry.lifecycle == ConversationState::Uninit {
                        entry.lifecycle = ConversationState::Idle;
                        tracing::debug!("[{}] Conversation started", name);
                    }
                    Ok(())
                }
                None => Err(ConversationError::UnknownConversation),
            };
            let _ = respond.send(result);
        }

        Command::Shutdown { name, respond } => {
            let Some(entry) = state.conversations.get_mut(&name) else {
                let _ = respond.send(Err(ConversationError::UnknownConversation));
                return;
            };
            match entry.channel.as_ref() {
                Some(slot) => {
                    // Disconnect first; the caller is answered once the
                    // channel's close event arrives.
                    entry.lifecycle = ConversationState::ShuttingDown;
                    entry.pending_shutdown = Some(respond);
                    forward_disconnect(&name, slot.cmd_tx.clone());
                }
                None => {
                    entry.lifecycle = ConversationState::Uninit;
                    tracing::debug!("[{}] Conversation shut down", name);
                    let _ = respond.send(Ok(()));
                }
            }
        }

        Command::Connect {
            name,
            target,
            ip,
            respond,
        } => {
            let Some(entry) = state.conversations.get_mut(&name) else {
                let _ = respond.send(Err(ConnectError::NotInitialized));
                return;
            };
            if entry.lifecycle == ConversationState::Uninit {
                let _ = respond.send(Err(ConnectError::NotInitialized));
                return;
            }
            if entry.channel.is_some() {
                let _ = respond.send(Err(ConnectError::AlreadyConnected));
                return;
            }
            let conv = &config.conversations[entry.config_index];
            let pair = (conv.source_address.value(), target.value());
            if state.active_pairs.contains_key(&pair) {
                tracing::debug!(
                    "[{}] Pair {} -> {} already active",
                    name,
                    conv.source_address,
                    target
                );
                let _ = respond.send(Err(ConnectError::AlreadyConnected));
                return;
            }

            let channel_id = state.next_channel_id();
            let (cmd_tx, channel_rx) = mpsc::channel::<ChannelCommand>(8);
            let params = ChannelParams {
                conversation: name.clone(),
                channel_id,
                source: conv.source_address,
                target,
                remote: SocketAddr::new(ip, conv.tcp_port),
                activation_type: conv.routing_activation_type,
                rx_buffer_size: conv.rx_buffer_size,
                max_payload_size: config.max_payload_size,
                timing: effective_timing(&config.timing, conv),
            };
            let task = tokio::spawn(channel_task::<T>(params, channel_rx, event_tx.clone()));

            // Reserve the pair for the whole connect attempt; the close
            // event frees it if activation fails. The caller's responder
            // parks in the slot until Activated or Closed arrives.
            let entry = state.conversations.get_mut(&name).expect("checked above");
            entry.channel = Some(ChannelSlot {
                id: channel_id,
                cmd_tx,
                task,
                pending_connect: Some(respond),
                pending_disconnects: Vec::new(),
            });
            state.active_pairs.insert(pair, channel_id);
        }

        Command::SendDiagnostic {
            name,
            request,
            respond,
        } => {
            let slot = state
                .conversations
                .get(&name)
                .and_then(|entry| entry.channel.as_ref());
            let Some(slot) = slot else {
                let _ = respond.send(Err(UdsError::NotConnected));
                return;
            };
            match slot.cmd_tx.try_send(ChannelCommand::SendDiagnostic { request, respond }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(cmd)) => {
                    // The channel is saturated; half-duplex means this can
                    // only be a pile-up of rejected requests.
                    if let ChannelCommand::SendDiagnostic { respond, .. } = cmd {
                        let _ = respond.send(Err(UdsError::Busy));
                    }
                }
                Err(mpsc::error::TrySendError::Closed(cmd)) => {
                    if let ChannelCommand::SendDiagnostic { respond, .. } = cmd {
                        let _ = respond.send(Err(UdsError::NotConnected));
                    }
                }
            }
        }

        Command::Disconnect { name, respond } => {
            let slot = state
                .conversations
                .get_mut(&name)
                .and_then(|entry| entry.channel.as_mut());
            match slot {
                Some(slot) => {
                    // Answered when the channel's close event is processed
                    slot.pending_disconnects.push(respond);
                    forward_disconnect(&name, slot.cmd_tx.clone());
                }
                None => {
                    let _ = respond.send(Err(DisconnectError::NotConnected));
                }
            }
        }

        Command::ServerList { respond } => {
            let _ = respond.send(state.known_servers.clone());
        }

        // Handled directly in the loop
        Command::Discover { .. } | Command::Deinitialize { .. } => unreachable!(),
    }
}

/// Forward a disconnect to a channel without ever blocking the loop
fn forward_disconnect(name: &str, cmd_tx: mpsc::Sender<ChannelCommand>) {
    match cmd_tx.try_send(ChannelCommand::Disconnect) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Rare: retry off the scheduler. A failure here means the
            // channel is already closing, which is the desired outcome.
            tokio::spawn(async move {
                let _ = cmd_tx.send(ChannelCommand::Disconnect).await;
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            // Already closing; the close event does the bookkeeping
            tracing::debug!("[{}] Disconnect rides on channel close", name);
        }
    }
}

fn handle_channel_event(state: &mut SchedulerState, event: ChannelEvent) {
    match event {
        ChannelEvent::Activated { name, channel_id } => {
            let Some(entry) = state.conversations.get_mut(&name) else {
                return;
            };
            let Some(slot) = entry.channel.as_mut().filter(|s| s.id == channel_id) else {
                return;
            };
            if let Some(respond) = slot.pending_connect.take() {
                let _ = respond.send(Ok(()));
            }
            if entry.lifecycle != ConversationState::ShuttingDown {
                entry.lifecycle = ConversationState::Connected;
            }
        }
        ChannelEvent::Closed {
            name,
            channel_id,
            connect_failure,
        } => {
            let Some(entry) = state.conversations.get_mut(&name) else {
                return;
            };
            // Stale events from a replaced channel must not tear down the
            // current one
            if !entry.channel.as_ref().is_some_and(|s| s.id == channel_id) {
                return;
            }
            let slot = entry.channel.take().expect("matched above");
            state.active_pairs.retain(|_, id| *id != channel_id);

            if let Some(respond) = slot.pending_connect {
                let _ = respond.send(Err(
                    connect_failure.unwrap_or(ConnectError::Shutdown),
                ));
            }
            for respond in slot.pending_disconnects {
                let _ = respond.send(Ok(()));
            }

            match entry.lifecycle {
                ConversationState::ShuttingDown => {
                    entry.lifecycle = ConversationState::Uninit;
                    if let Some(respond) = entry.pending_shutdown.take() {
                        let _ = respond.send(Ok(()));
                    }
                    tracing::debug!("[{}] Conversation shut down", name);
                }
                ConversationState::Uninit => {}
                _ => entry.lifecycle = ConversationState::Idle,
            }
        }
    }
}

fn effective_timing(base: &TimingConfig, conv: &ConversationConfig) -> TimingConfig {
    let mut timing = base.clone();
    if let Some(p2) = conv.p2_client_max {
        timing.response_timeout = p2;
    }
    if let Some(p2_star) = conv.p2_star_client_max {
        timing.response_pending_timeout = p2_star;
    }
    timing
}

// ============================================================================
// SHUTDOWN
// ============================================================================

/// Close every channel and join its task. Keeps draining channel events
/// while joining so no task can block on a full event queue.
async fn shutdown(state: &mut SchedulerState, event_rx: &mut mpsc::Receiver<ChannelEvent>) {
    if let Some(session) = state.discovery.take() {
        session.abort();
    }

    let mut tasks = Vec::new();
    for entry in state.conversations.values_mut() {
        if let Some(slot) = entry.channel.take() {
            // Dropping the command sender makes the channel task close the
            // stream and fail any in-flight request with Shutdown
            drop(slot.cmd_tx);
            if let Some(respond) = slot.pending_connect {
                let _ = respond.send(Err(ConnectError::Shutdown));
            }
            for respond in slot.pending_disconnects {
                let _ = respond.send(Ok(()));
            }
            tasks.push(slot.task);
        }
        if let Some(respond) = entry.pending_shutdown.take() {
            let _ = respond.send(Ok(()));
        }
        entry.lifecycle = ConversationState::Uninit;
    }
    state.active_pairs.clear();

    tracing::debug!("Joining {} channel task(s) for shutdown", tasks.len());
    for mut task in tasks {
        loop {
            tokio::select! {
                result = &mut task => {
                    if let Err(e) = result {
                        tracing::error!("Channel task panicked during shutdown: {}", e);
                    }
                    break;
                }
                Some(_) = event_rx.recv() => {}
            }
        }
    }
}
