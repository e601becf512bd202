//! Shared test infrastructure: a scripted DoIP server (UDP announcer +
//! TCP ECU) running on the turmoil simulated network.
//!
//! Each test configures an [`EcuBehavior`] describing how the server
//! reacts to routing activation and diagnostic messages, then drives the
//! real client against it.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use doip_client::wire::{activation_code, diag_ack_code, Message, Payload};
use doip_client::{
    ClientConfig, ConversationConfig, DiagClient, Eid, Gid, LogicalAddress, Vin,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use turmoil::net::{TcpListener, TcpStream, UdpSocket};

pub const TESTER_LOGICAL: u16 = 0x0001;
pub const ECU_LOGICAL: u16 = 0xFA25;
pub const VIN_STR: &str = "ABCDEFGH123456789";
pub const EID_STR: &str = "00:02:36:31:00:1c";
pub const GID_STR: &str = "0a:0b:0c:0d:0e:0f";
pub const DOIP_PORT: u16 = 13400;

/// The client type under test: the real engine on simulated sockets
pub type SimClient = DiagClient<turmoil::net::UdpSocket, turmoil::net::TcpStream>;

/// Build a client config with one conversation pointed at the given host
pub fn client_config(conversation: &str, server_host: &str) -> ClientConfig {
    client_config_with(conversation, server_host, TESTER_LOGICAL)
}

pub fn client_config_with(
    conversation: &str,
    server_host: &str,
    source_address: u16,
) -> ClientConfig {
    let server_ip = turmoil::lookup(server_host);
    ClientConfig::builder()
        .udp_ip([0, 0, 0, 0].into())
        .discovery_target((server_ip, DOIP_PORT).into())
        .conversation(ConversationConfig::new(
            conversation,
            LogicalAddress::new(source_address),
            server_ip,
            DOIP_PORT,
        ))
        .build()
        .unwrap()
}

// ============================================================================
// SCRIPTED ECU
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationBehavior {
    /// Reply with routing successful (0x10)
    Accept,
    /// Reply with this denial code
    Deny(u8),
    /// Never reply
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBehavior {
    /// Positive ack echoing the request
    Ack,
    /// Negative ack with this code
    Nack(u8),
    /// No ack at all
    Silent,
}

/// Script for the simulated ECU
#[derive(Clone)]
pub struct EcuBehavior {
    pub logical_address: u16,
    pub vin: &'static str,
    pub eid: &'static str,
    pub gid: &'static str,
    /// Reply to vehicle identification requests
    pub announce: bool,
    /// Copies of each announcement (to exercise deduplication)
    pub announce_copies: u32,
    pub activation: ActivationBehavior,
    pub ack: AckBehavior,
    /// Leave the first N diagnostic messages unacknowledged
    pub silent_acks_before: u32,
    /// Number of `7F xx 78` responses before the final one
    pub pending_responses: u32,
    pub pending_interval: Duration,
    /// Final UDS response; None means ack only, no response
    pub response: Option<Vec<u8>>,
    /// Delay before the final response
    pub response_delay: Duration,
    /// Drop the TCP connection right after the ack
    pub close_after_ack: bool,
}

impl Default for EcuBehavior {
    fn default() -> Self {
        Self {
            logical_address: ECU_LOGICAL,
            vin: VIN_STR,
            eid: EID_STR,
            gid: GID_STR,
            announce: true,
            announce_copies: 1,
            activation: ActivationBehavior::Accept,
            ack: AckBehavior::Ack,
            silent_acks_before: 0,
            pending_responses: 0,
            pending_interval: Duration::from_secs(1),
            response: None,
            response_delay: Duration::ZERO,
            close_after_ack: false,
        }
    }
}

impl EcuBehavior {
    /// Accepts activation and answers every request with `response`
    pub fn responsive(response: Vec<u8>) -> Self {
        Self {
            response: Some(response),
            ..Self::default()
        }
    }

    /// Encoded vehicle announcement, for hand-rolled UDP hosts
    pub fn announcement_message(&self) -> Bytes {
        self.announcement().encode()
    }

    fn announcement(&self) -> Message {
        Message::new(Payload::VehicleAnnouncement {
            vin: Vin::parse(self.vin).unwrap(),
            logical_address: LogicalAddress::new(self.logical_address),
            eid: Eid::parse(self.eid).unwrap(),
            gid: Gid::parse(self.gid).unwrap(),
            further_action: 0x00,
            sync_status: Some(0x00),
        })
    }

    fn identification_matches(&self, payload: &Payload) -> bool {
        match payload {
            Payload::VehicleIdentificationRequest => true,
            Payload::VehicleIdentificationRequestWithEid { eid } => {
                *eid == Eid::parse(self.eid).unwrap()
            }
            Payload::VehicleIdentificationRequestWithVin { vin } => {
                *vin == Vin::parse(self.vin).unwrap()
            }
            _ => false,
        }
    }
}

/// Run the scripted ECU: answers identification requests over UDP and
/// serves DoIP over TCP, one task per accepted connection.
pub async fn run_ecu(behavior: EcuBehavior) -> turmoil::Result {
    let udp = UdpSocket::bind("0.0.0.0:13400").await?;
    let tcp = TcpListener::bind("0.0.0.0:13400").await?;
    let mut buf = [0u8; 256];

    loop {
        tokio::select! {
            result = udp.recv_from(&mut buf) => {
                let (len, from) = result?;
                if !behavior.announce {
                    continue;
                }
                let mut datagram = Bytes::copy_from_slice(&buf[..len]);
                let Ok(message) = Message::decode(&mut datagram, 65535) else {
                    continue;
                };
                if behavior.identification_matches(&message.payload) {
                    let announcement = behavior.announcement().encode();
                    for _ in 0..behavior.announce_copies {
                        udp.send_to(&announcement, from).await?;
                    }
                }
            }
            result = tcp.accept() => {
                let (stream, _) = result?;
                tokio::spawn(serve_connection(stream, behavior.clone()));
            }
        }
    }
}

async fn serve_connection(mut stream: TcpStream, behavior: EcuBehavior) {
    let mut diag_requests_seen = 0u32;

    loop {
        let mut header = [0u8; 8];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let payload_type = u16::from_be_bytes([header[2], header[3]]);
        let payload_len =
            u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; payload_len];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }

        match payload_type {
            // Routing activation request
            0x0005 => {
                let source = u16::from_be_bytes([payload[0], payload[1]]);
                let response_code = match behavior.activation {
                    ActivationBehavior::Accept => activation_code::SUCCESS,
                    ActivationBehavior::Deny(code) => code,
                    ActivationBehavior::Silent => continue,
                };
                let response = Message::new(Payload::RoutingActivationResponse {
                    tester_address: LogicalAddress::new(source),
                    entity_address: LogicalAddress::new(behavior.logical_address),
                    response_code,
                    reserved: [0; 4],
                    oem: None,
                });
                if stream.write_all(&response.encode()).await.is_err() {
                    return;
                }
            }

            // Diagnostic message
            0x8001 => {
                let tester = u16::from_be_bytes([payload[0], payload[1]]);
                let uds = payload[4..].to_vec();
                diag_requests_seen += 1;

                if diag_requests_seen <= behavior.silent_acks_before {
                    continue;
                }

                let (ack_payload, positive) = match behavior.ack {
                    AckBehavior::Ack => (
                        Payload::DiagnosticPositiveAck {
                            source_address: LogicalAddress::new(behavior.logical_address),
                            target_address: LogicalAddress::new(tester),
                            ack_code: diag_ack_code::ACK,
                            previous: Bytes::copy_from_slice(&uds),
                        },
                        true,
                    ),
                    AckBehavior::Nack(code) => (
                        Payload::DiagnosticNegativeAck {
                            source_address: LogicalAddress::new(behavior.logical_address),
                            target_address: LogicalAddress::new(tester),
                            nack_code: code,
                            previous: Bytes::copy_from_slice(&uds),
                        },
                        false,
                    ),
                    AckBehavior::Silent => continue,
                };
                if stream
                    .write_all(&Message::new(ack_payload).encode())
                    .await
                    .is_err()
                {
                    return;
                }
                if !positive {
                    continue;
                }
                if behavior.close_after_ack {
                    return;
                }

                for _ in 0..behavior.pending_responses {
                    tokio::time::sleep(behavior.pending_interval).await;
                    let pending = Message::new(Payload::DiagnosticMessage {
                        source_address: LogicalAddress::new(behavior.logical_address),
                        target_address: LogicalAddress::new(tester),
                        user_data: Bytes::from(vec![0x7F, uds[0], 0x78]),
                    });
                    if stream.write_all(&pending.encode()).await.is_err() {
                        return;
                    }
                }

                if let Some(response) = &behavior.response {
                    tokio::time::sleep(behavior.response_delay).await;
                    let message = Message::new(Payload::DiagnosticMessage {
                        source_address: LogicalAddress::new(behavior.logical_address),
                        target_address: LogicalAddress::new(tester),
                        user_data: Bytes::from(response.clone()),
                    });
                    if stream.write_all(&message.encode()).await.is_err() {
                        return;
                    }
                }
            }

            // Alive check response from the client
            0x0008 => {}

            other => {
                tracing::debug!("ECU ignoring payload type 0x{other:04X}");
            }
        }
    }
}
