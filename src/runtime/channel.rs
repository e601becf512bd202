//! # TCP Channel State Machine
//!
//! One channel is one TCP connection to a diagnostic server, plus its
//! routing-activation and diagnostic-exchange state. Each channel runs as
//! its own task that exclusively owns the stream, the receive reassembly
//! buffer, the single in-flight request slot and all timers; every event
//! for the channel (socket readability, commands, timer expiry) is
//! serialized through one `select!` loop, so no two events for the same
//! channel ever execute concurrently.
//!
//! ## States
//!
//! ```text
//! Closed ──Connect──▶ Connecting ──tcp ready──▶ ConnectedNotActivated
//!                          │                            │
//!                     fail/timeout              RoutingActivationReq
//!                          ▼                            ▼
//!                       Closed ◀──deny/timeout──── Activating
//!                                                       │ code 0x10
//!                                                       ▼
//!      ┌────────────────────────────────────────────▶ Active
//!      │                                                │ SendDiagnostic
//!      │ response / timeout                             ▼
//! WaitingResponse ◀──positive ack─── WaitingAck ◀── Sending
//!      │                                  │
//!      │ 0x78: extend timer, stay         │ negative ack / ack timeout
//!      └──────(repeats N ≥ 0 times)       ▶ Active
//! ```
//!
//! Peer close or general inactivity from any post-activation state drops
//! the channel to `Closed` and fails an in-flight request with
//! `Disconnected`.
//!
//! ## Timing
//!
//! | Timer | Armed | Expiry |
//! |-------|-------|--------|
//! | connect | entering `Connecting` | `TcpConnectTimeout` |
//! | `T_TCP_Initial_Inactivity` | TCP ready | `RoutingActivationTimeout` |
//! | `T_A_DoIP_Ctrl` | activation request sent | `RoutingActivationTimeout` |
//! | `T_A_DoIP_Diagnostic_Ack` | diagnostic message sent | `AckTimeout` |
//! | response (`P2Client_max`) | positive ack received | `ResponseTimeout` |
//! | response-pending (`P2*Client_max`) | each `7F xx 78` | `ResponseTimeout` |
//! | `T_TCP_General_Inactivity` | activation success, reset on traffic | close |

use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};

use crate::config::TimingConfig;
use crate::error::{ConnectError, UdsError};
use crate::net::TcpStream;
use crate::runtime::command::ChannelEvent;
use crate::runtime::uds;
use crate::wire::{activation_code, diag_ack_code, DecodeError, Header, Message, Payload};
use crate::LogicalAddress;

/// Commands a channel accepts from the scheduler.
///
/// Disconnect carries no responder: the caller is parked at the scheduler
/// and answered when the channel's close event has been processed, so the
/// `(source, target)` slot is already free when the caller wakes.
pub(crate) enum ChannelCommand {
    SendDiagnostic {
        request: Bytes,
        respond: oneshot::Sender<Result<Bytes, UdsError>>,
    },
    Disconnect,
}

/// Channel lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Closed,
    /// Exists only while the connect future is pending; the task does not
    /// dispatch events before the stream is up
    #[allow(dead_code)]
    Connecting,
    ConnectedNotActivated,
    Activating,
    Active,
    Sending,
    WaitingAck,
    WaitingResponse,
    Closing,
}

/// Everything a channel task needs to run
pub(crate) struct ChannelParams {
    pub conversation: String,
    pub channel_id: u64,
    pub source: LogicalAddress,
    pub target: LogicalAddress,
    pub remote: SocketAddr,
    pub activation_type: u8,
    pub rx_buffer_size: usize,
    pub max_payload_size: u32,
    /// Timing with per-conversation response overrides already applied
    pub timing: TimingConfig,
}

/// Why the channel task exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    Inactivity,
    Io,
    ProtocolError,
    LocalDisconnect,
    Shutdown,
}

/// The request slot. At most one request is in flight per channel.
struct InFlight {
    request: Bytes,
    respond: oneshot::Sender<Result<Bytes, UdsError>>,
    deadline: Instant,
    /// A diagnostic message that raced ahead of its positive ack. Held
    /// until the ack is processed, then delivered.
    buffered_response: Option<Bytes>,
}

struct Channel<T: TcpStream> {
    params: ChannelParams,
    stream: T,
    rx: BytesMut,
    state: ChannelState,
    inflight: Option<InFlight>,
    general_deadline: Instant,
}

/// Entry point: owns the connection from connect to close.
///
/// All outcomes flow to the scheduler through `events`: activation success
/// as `Activated`, everything else as `Closed` (carrying the connect error
/// when the channel never became active).
pub(crate) async fn channel_task<T: TcpStream>(
    params: ChannelParams,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let name = params.conversation.clone();
    let channel_id = params.channel_id;

    tracing::debug!(
        "[{}] Connecting to {} (target {})",
        name,
        params.remote,
        params.target
    );

    // Closed -> Connecting
    let stream = match timeout(params.timing.tcp_connect, T::connect(params.remote)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!("[{}] TCP connect failed: {}", name, e);
            notify_closed(&events, name, channel_id, Some(ConnectError::TcpConnect(e))).await;
            return;
        }
        Err(_) => {
            tracing::debug!("[{}] TCP connect timed out", name);
            notify_closed(&events, name, channel_id, Some(ConnectError::TcpConnectTimeout)).await;
            return;
        }
    };

    let mut channel = Channel::new(params, stream);

    if let Err(e) = channel.activate_routing(&mut cmd_rx).await {
        tracing::debug!("[{}] Routing activation failed: {}", name, e);
        channel.close_stream().await;
        notify_closed(&events, name, channel_id, Some(e)).await;
        return;
    }

    tracing::info!(
        "[{}] Channel active: {} -> {} at {}",
        name,
        channel.params.source,
        channel.params.target,
        channel.params.remote
    );
    let _ = events
        .send(ChannelEvent::Activated {
            name: name.clone(),
            channel_id,
        })
        .await;

    let reason = channel.run(&mut cmd_rx).await;
    channel.fail_inflight(match reason {
        CloseReason::Shutdown => UdsError::Shutdown,
        _ => UdsError::Disconnected,
    });
    channel.close_stream().await;

    tracing::debug!("[{}] Channel closed ({:?})", name, reason);
    notify_closed(&events, name, channel_id, None).await;
}

async fn notify_closed(
    events: &mpsc::Sender<ChannelEvent>,
    name: String,
    channel_id: u64,
    connect_failure: Option<ConnectError>,
) {
    let _ = events
        .send(ChannelEvent::Closed {
            name,
            channel_id,
            connect_failure,
        })
        .await;
}

/// Pull one complete frame out of the reassembly buffer.
///
/// `Ok(None)` means more bytes are needed; header validation errors are
/// surfaced so the caller can nack and close per ISO 13400-2 §7.1.5.
fn extract_frame(rx: &mut BytesMut, max_payload_size: u32) -> Result<Option<Message>, DecodeError> {
    if rx.len() < Header::SIZE {
        return Ok(None);
    }
    let mut peek: &[u8] = &rx[..];
    let Some(header) = Header::parse(&mut peek) else {
        return Ok(None);
    };
    let payload_type = header.validate(max_payload_size)?;

    let total = Header::SIZE + header.payload_length as usize;
    if rx.len() < total {
        return Ok(None);
    }

    let frame = rx.split_to(total).freeze();
    let payload = Payload::decode(payload_type, frame.slice(Header::SIZE..))?;
    Ok(Some(Message {
        protocol_version: header.protocol_version,
        payload,
    }))
}

impl<T: TcpStream> Channel<T> {
    fn new(params: ChannelParams, stream: T) -> Self {
        let general_deadline = Instant::now() + params.timing.tcp_general_inactivity;
        Self {
            params,
            stream,
            rx: BytesMut::with_capacity(Header::SIZE + 256),
            state: ChannelState::ConnectedNotActivated,
            inflight: None,
            general_deadline,
        }
    }

    async fn send_message(&mut self, message: &Message) -> io::Result<()> {
        self.stream.write_all(&message.encode()).await?;
        self.touch();
        Ok(())
    }

    /// Any socket traffic restarts the general inactivity timer
    fn touch(&mut self) {
        self.general_deadline = Instant::now() + self.params.timing.tcp_general_inactivity;
    }

    async fn close_stream(&mut self) {
        self.state = ChannelState::Closing;
        let _ = self.stream.shutdown().await;
        self.state = ChannelState::Closed;
    }

    fn fail_inflight(&mut self, error: UdsError) {
        if let Some(inflight) = self.inflight.take() {
            let _ = inflight.respond.send(Err(error));
        }
    }

    /// Send a generic header negative acknowledge for a codec error.
    /// Best effort: the channel is about to close either way.
    async fn send_nack(&mut self, error: &DecodeError) {
        if let Some(code) = error.nack_code() {
            let nack = Message::new(Payload::GenericNack {
                nack_code: code as u8,
            });
            if let Err(e) = self.send_message(&nack).await {
                tracing::debug!(
                    "[{}] Could not send header nack: {}",
                    self.params.conversation,
                    e
                );
            }
        }
    }

    // ========================================================================
    // ROUTING ACTIVATION
    // ========================================================================

    /// ConnectedNotActivated -> Activating -> Active (or error).
    ///
    /// Bounded by both `T_TCP_Initial_Inactivity` (server-side closing
    /// deadline) and `T_A_DoIP_Ctrl` (control response deadline).
    async fn activate_routing(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<ChannelCommand>,
    ) -> Result<(), ConnectError> {
        let initial_deadline = Instant::now() + self.params.timing.tcp_initial_inactivity;

        let request = Message::new(Payload::RoutingActivationRequest {
            source_address: self.params.source,
            activation_type: self.params.activation_type,
            reserved: [0; 4],
            oem: None,
        });
        self.send_message(&request)
            .await
            .map_err(ConnectError::TcpConnect)?;

        self.state = ChannelState::Activating;
        let deadline = initial_deadline.min(Instant::now() + self.params.timing.ctrl_timeout);
        let mut chunk = vec![0u8; self.params.rx_buffer_size];

        loop {
            tokio::select! {
                result = self.stream.read(&mut chunk) => {
                    let n = match result {
                        Ok(0) => {
                            return Err(ConnectError::TcpConnect(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "peer closed during routing activation",
                            )));
                        }
                        Ok(n) => n,
                        Err(e) => return Err(ConnectError::TcpConnect(e)),
                    };
                    self.rx.extend_from_slice(&chunk[..n]);

                    loop {
                        match extract_frame(&mut self.rx, self.params.max_payload_size) {
                            Ok(Some(message)) => {
                                if let Some(result) = self.handle_activation_message(message).await? {
                                    return result;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(
                                    "[{}] Codec error during activation: {}",
                                    self.params.conversation,
                                    e
                                );
                                self.send_nack(&e).await;
                                return Err(ConnectError::TcpConnect(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    e.to_string(),
                                )));
                            }
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::SendDiagnostic { respond, .. }) => {
                            let _ = respond.send(Err(UdsError::NotConnected));
                        }
                        // Locally aborted mid-activation
                        Some(ChannelCommand::Disconnect) | None => {
                            return Err(ConnectError::Shutdown);
                        }
                    }
                }

                () = sleep_until(deadline) => {
                    return Err(ConnectError::RoutingActivationTimeout);
                }
            }
        }
    }

    /// Returns `Ok(Some(result))` when activation concluded, `Ok(None)` to
    /// keep waiting.
    #[allow(clippy::type_complexity)]
    async fn handle_activation_message(
        &mut self,
        message: Message,
    ) -> Result<Option<Result<(), ConnectError>>, ConnectError> {
        match message.payload {
            Payload::RoutingActivationResponse {
                tester_address,
                entity_address,
                response_code,
                ..
            } => {
                if tester_address != self.params.source {
                    // A response for a different tester is not ours
                    tracing::warn!(
                        "[{}] Activation response addressed to {}, expected {}; ignored",
                        self.params.conversation,
                        tester_address,
                        self.params.source
                    );
                    return Ok(None);
                }
                if response_code == activation_code::SUCCESS {
                    tracing::debug!(
                        "[{}] Routing activated by entity {}",
                        self.params.conversation,
                        entity_address
                    );
                    self.state = ChannelState::Active;
                    self.touch();
                    Ok(Some(Ok(())))
                } else {
                    Ok(Some(Err(ConnectError::RoutingActivationDenied(
                        response_code,
                    ))))
                }
            }
            Payload::AliveCheckRequest => {
                // Routing is not activated yet, so the tester address is
                // not asserted: answer with source 0x0000 and stay.
                let response = Message::new(Payload::AliveCheckResponse {
                    source_address: LogicalAddress::new(0x0000),
                });
                self.send_message(&response)
                    .await
                    .map_err(ConnectError::TcpConnect)?;
                Ok(None)
            }
            other => {
                tracing::debug!(
                    "[{}] Ignoring {:?} during activation",
                    self.params.conversation,
                    other.payload_type()
                );
                Ok(None)
            }
        }
    }

    // ========================================================================
    // ACTIVE PHASE
    // ========================================================================

    fn next_deadline(&self) -> Instant {
        match &self.inflight {
            Some(inflight) => inflight.deadline.min(self.general_deadline),
            None => self.general_deadline,
        }
    }

    async fn run(&mut self, cmd_rx: &mut mpsc::Receiver<ChannelCommand>) -> CloseReason {
        let mut chunk = vec![0u8; self.params.rx_buffer_size];

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                result = self.stream.read(&mut chunk) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!(
                                "[{}] Peer closed the connection",
                                self.params.conversation
                            );
                            return CloseReason::PeerClosed;
                        }
                        Ok(n) => {
                            self.rx.extend_from_slice(&chunk[..n]);
                            self.touch();
                            loop {
                                match extract_frame(&mut self.rx, self.params.max_payload_size) {
                                    Ok(Some(message)) => {
                                        if let Some(reason) = self.handle_message(message).await {
                                            return reason;
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        tracing::warn!(
                                            "[{}] Codec error, closing channel: {}",
                                            self.params.conversation,
                                            e
                                        );
                                        self.send_nack(&e).await;
                                        return CloseReason::ProtocolError;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(
                                "[{}] TCP read error: {}",
                                self.params.conversation,
                                e
                            );
                            return CloseReason::Io;
                        }
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::SendDiagnostic { request, respond }) => {
                            if let Some(reason) = self.handle_send(request, respond).await {
                                return reason;
                            }
                        }
                        Some(ChannelCommand::Disconnect) => {
                            return CloseReason::LocalDisconnect;
                        }
                        None => return CloseReason::Shutdown,
                    }
                }

                () = sleep_until(deadline) => {
                    if let Some(reason) = self.handle_timeout() {
                        return reason;
                    }
                }
            }
        }
    }

    /// Active -> Sending -> WaitingAck. Rejections are synchronous: a
    /// second request while one is in flight gets `Busy` without touching
    /// the wire.
    async fn handle_send(
        &mut self,
        request: Bytes,
        respond: oneshot::Sender<Result<Bytes, UdsError>>,
    ) -> Option<CloseReason> {
        if self.inflight.is_some() {
            let _ = respond.send(Err(UdsError::Busy));
            return None;
        }
        if self.state != ChannelState::Active {
            let _ = respond.send(Err(UdsError::NotConnected));
            return None;
        }
        if let Err(e) = uds::validate_request(&request) {
            let _ = respond.send(Err(e));
            return None;
        }

        let message = Message::new(Payload::DiagnosticMessage {
            source_address: self.params.source,
            target_address: self.params.target,
            user_data: request.clone(),
        });

        self.state = ChannelState::Sending;
        if let Err(e) = self.send_message(&message).await {
            tracing::debug!(
                "[{}] TCP write error: {}",
                self.params.conversation,
                e
            );
            let _ = respond.send(Err(UdsError::Disconnected));
            return Some(CloseReason::Io);
        }

        self.state = ChannelState::WaitingAck;
        self.inflight = Some(InFlight {
            request,
            respond,
            deadline: Instant::now() + self.params.timing.diagnostic_ack_timeout,
            buffered_response: None,
        });
        None
    }

    /// Dispatch one received message in the active phase
    async fn handle_message(&mut self, message: Message) -> Option<CloseReason> {
        match message.payload {
            Payload::DiagnosticMessage {
                source_address,
                target_address,
                user_data,
            } => {
                if target_address != self.params.source {
                    tracing::warn!(
                        "[{}] Diagnostic message for {} on our channel; ignored",
                        self.params.conversation,
                        target_address
                    );
                    return None;
                }
                if source_address != self.params.target {
                    tracing::warn!(
                        "[{}] Diagnostic message from unexpected source {}; ignored",
                        self.params.conversation,
                        source_address
                    );
                    return None;
                }
                self.handle_diagnostic_response(user_data);
                None
            }

            Payload::DiagnosticPositiveAck {
                ack_code, previous, ..
            } => {
                self.handle_positive_ack(ack_code, &previous);
                None
            }

            Payload::DiagnosticNegativeAck {
                nack_code, previous, ..
            } => {
                self.handle_negative_ack(nack_code, &previous);
                None
            }

            Payload::AliveCheckRequest => {
                let response = Message::new(Payload::AliveCheckResponse {
                    source_address: self.params.source,
                });
                if let Err(e) = self.send_message(&response).await {
                    tracing::debug!(
                        "[{}] TCP write error on alive check: {}",
                        self.params.conversation,
                        e
                    );
                    return Some(CloseReason::Io);
                }
                None
            }

            Payload::GenericNack { nack_code } => {
                tracing::warn!(
                    "[{}] Peer sent generic header nack 0x{:02X}",
                    self.params.conversation,
                    nack_code
                );
                None
            }

            other => {
                tracing::debug!(
                    "[{}] Ignoring unexpected {:?} on active channel",
                    self.params.conversation,
                    other.payload_type()
                );
                None
            }
        }
    }

    /// A diagnostic message addressed to us arrived
    fn handle_diagnostic_response(&mut self, user_data: Bytes) {
        match self.state {
            ChannelState::WaitingResponse => self.deliver_response(user_data),
            ChannelState::WaitingAck => {
                // Response overtook its ack: hold it until the ack is
                // processed, then deliver.
                let Some(inflight) = self.inflight.as_mut() else {
                    return;
                };
                if inflight.buffered_response.is_some() {
                    tracing::warn!(
                        "[{}] Second response before ack; keeping the first",
                        self.params.conversation
                    );
                    return;
                }
                tracing::debug!(
                    "[{}] Response arrived before ack; buffering",
                    self.params.conversation
                );
                inflight.buffered_response = Some(user_data);
            }
            _ => {
                tracing::warn!(
                    "[{}] Unsolicited diagnostic message ({} bytes); ignored",
                    self.params.conversation,
                    user_data.len()
                );
            }
        }
    }

    /// Deliver a response to the caller, or restart the response timer on a
    /// response-pending NRC. May repeat any number of times per request.
    fn deliver_response(&mut self, user_data: Bytes) {
        if uds::is_response_pending(&user_data) {
            if let Some(inflight) = self.inflight.as_mut() {
                tracing::debug!(
                    "[{}] Response pending; extending deadline by {:?}",
                    self.params.conversation,
                    self.params.timing.response_pending_timeout
                );
                inflight.deadline =
                    Instant::now() + self.params.timing.response_pending_timeout;
            }
            return;
        }
        if let Some(inflight) = self.inflight.take() {
            let _ = inflight.respond.send(Ok(user_data));
        }
        self.state = ChannelState::Active;
    }

    fn handle_positive_ack(&mut self, ack_code: u8, previous: &Bytes) {
        if self.state != ChannelState::WaitingAck {
            tracing::debug!(
                "[{}] Positive ack outside WaitingAck; ignored",
                self.params.conversation
            );
            return;
        }
        let Some(inflight) = self.inflight.as_mut() else {
            return;
        };
        if !uds::ack_matches_request(previous, &inflight.request) {
            tracing::warn!(
                "[{}] Positive ack echoes an unexpected payload; ignored",
                self.params.conversation
            );
            return;
        }
        if ack_code != diag_ack_code::ACK {
            tracing::warn!(
                "[{}] Positive ack carries code 0x{:02X}; treating as acknowledged",
                self.params.conversation,
                ack_code
            );
        }

        inflight.deadline = Instant::now() + self.params.timing.response_timeout;
        self.state = ChannelState::WaitingResponse;

        // Deliver a response that raced ahead of this ack
        if let Some(buffered) = self.inflight.as_mut().and_then(|i| i.buffered_response.take()) {
            self.deliver_response(buffered);
        }
    }

    fn handle_negative_ack(&mut self, nack_code: u8, previous: &Bytes) {
        if self.state != ChannelState::WaitingAck {
            tracing::debug!(
                "[{}] Negative ack outside WaitingAck; ignored",
                self.params.conversation
            );
            return;
        }
        let Some(inflight) = self.inflight.as_ref() else {
            return;
        };
        if !uds::ack_matches_request(previous, &inflight.request) {
            tracing::warn!(
                "[{}] Negative ack echoes an unexpected payload; ignored",
                self.params.conversation
            );
            return;
        }
        self.fail_inflight(UdsError::NegativeAck(nack_code));
        self.state = ChannelState::Active;
    }

    /// A timer fired: figure out which one and act on it.
    ///
    /// Request timers fail only the request; the channel stays active.
    /// Only the general inactivity timer closes the channel.
    fn handle_timeout(&mut self) -> Option<CloseReason> {
        let now = Instant::now();

        if let Some(inflight) = &self.inflight {
            if inflight.deadline <= now {
                let error = match self.state {
                    ChannelState::WaitingAck => UdsError::AckTimeout,
                    _ => UdsError::ResponseTimeout,
                };
                tracing::debug!(
                    "[{}] Request timer fired in {:?}: {}",
                    self.params.conversation,
                    self.state,
                    error
                );
                self.fail_inflight(error);
                self.state = ChannelState::Active;
                return None;
            }
        }

        if self.general_deadline <= now {
            tracing::info!(
                "[{}] General inactivity timer fired; closing channel",
                self.params.conversation
            );
            return Some(CloseReason::Inactivity);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Message, Payload, PROTOCOL_VERSION_DEFAULT};
    use crate::{Eid, Gid, Vin};

    fn diag_message(data: &'static [u8]) -> Message {
        Message::new(Payload::DiagnosticMessage {
            source_address: LogicalAddress::new(0xFA25),
            target_address: LogicalAddress::new(0x0E80),
            user_data: Bytes::from_static(data),
        })
    }

    #[test]
    fn extract_frame_waits_for_complete_header() {
        let mut rx = BytesMut::new();
        rx.extend_from_slice(&[0x02, 0xFD, 0x80]);
        assert_eq!(extract_frame(&mut rx, 65535).unwrap(), None);
        assert_eq!(rx.len(), 3);
    }

    #[test]
    fn extract_frame_waits_for_complete_payload() {
        let encoded = diag_message(&[0x22, 0xF1, 0x90]).encode();
        let mut rx = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert_eq!(extract_frame(&mut rx, 65535).unwrap(), None);

        // The last byte completes the frame
        rx.extend_from_slice(&encoded[encoded.len() - 1..]);
        let message = extract_frame(&mut rx, 65535).unwrap().unwrap();
        assert!(matches!(message.payload, Payload::DiagnosticMessage { .. }));
        assert!(rx.is_empty());
    }

    #[test]
    fn extract_frame_handles_coalesced_messages() {
        // Two messages delivered in one TCP segment
        let mut rx = BytesMut::new();
        rx.extend_from_slice(&diag_message(&[0x7F, 0x22, 0x78]).encode());
        rx.extend_from_slice(&diag_message(&[0x62, 0xF1, 0x90]).encode());

        let first = extract_frame(&mut rx, 65535).unwrap().unwrap();
        let second = extract_frame(&mut rx, 65535).unwrap().unwrap();
        assert_eq!(extract_frame(&mut rx, 65535).unwrap(), None);

        match (first.payload, second.payload) {
            (
                Payload::DiagnosticMessage { user_data: a, .. },
                Payload::DiagnosticMessage { user_data: b, .. },
            ) => {
                assert_eq!(&a[..], &[0x7F, 0x22, 0x78]);
                assert_eq!(&b[..], &[0x62, 0xF1, 0x90]);
            }
            other => panic!("unexpected payloads: {other:?}"),
        }
    }

    #[test]
    fn extract_frame_rejects_bad_pattern() {
        let mut rx = BytesMut::new();
        rx.extend_from_slice(&[0x02, 0xFC, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00]);
        assert!(matches!(
            extract_frame(&mut rx, 65535),
            Err(DecodeError::IncorrectPatternFormat { .. })
        ));
    }

    #[test]
    fn extract_frame_enforces_max_payload() {
        let mut rx = BytesMut::new();
        // Header claiming 100-byte payload against a 64-byte maximum
        rx.extend_from_slice(&[0x02, 0xFD, 0x80, 0x01, 0x00, 0x00, 0x00, 0x64]);
        assert!(matches!(
            extract_frame(&mut rx, 64),
            Err(DecodeError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn extract_frame_accepts_announcement_version_on_tcp() {
        // Identification-family frames carry the default version; the
        // framing layer must not reject them on version grounds.
        let msg = Message::with_version(
            PROTOCOL_VERSION_DEFAULT,
            Payload::VehicleAnnouncement {
                vin: Vin::parse("ABCDEFGH123456789").unwrap(),
                logical_address: LogicalAddress::new(0xFA25),
                eid: Eid::default(),
                gid: Gid::default(),
                further_action: 0,
                sync_status: None,
            },
        );
        let mut rx = BytesMut::from(&msg.encode()[..]);
        assert!(extract_frame(&mut rx, 65535).unwrap().is_some());
    }
}
