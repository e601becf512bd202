//! # Client Configuration
//!
//! Configuration for the DoIP client: the UDP discovery endpoint, DoIP
//! timing parameters, and one descriptor per conversation (tester identity).
//!
//! ## File format
//!
//! [`ClientConfig::load`] reads the JSON layout the diagnostic tooling
//! ecosystem uses. Unknown fields are ignored; missing timing fields take
//! the DoIP defaults below.
//!
//! ```json
//! {
//!   "UdpIpAddress": "172.16.25.1",
//!   "TcpIpAddress": "172.16.25.1",
//!   "Conversation": [
//!     {
//!       "ConversationName": "RemoteDiagnostics",
//!       "SourceAddress": 3712,
//!       "RxBufferSize": 4096,
//!       "P2ClientMax": 2000,
//!       "P2StarClientMax": 5000,
//!       "Network": { "TcpIpAddress": "172.16.25.128", "PortNumber": 13400 }
//!     }
//!   ]
//! }
//! ```
//!
//! ## Builder
//!
//! Programmatic construction (used heavily by the tests) goes through
//! [`ClientConfig::builder`]:
//!
//! ```
//! use doip_client::{ClientConfig, ConversationConfig, LogicalAddress};
//!
//! let config = ClientConfig::builder()
//!     .udp_ip([127, 0, 0, 1].into())
//!     .conversation(ConversationConfig::new(
//!         "Engine",
//!         LogicalAddress::new(0x0E80),
//!         [127, 0, 0, 2].into(),
//!         13400,
//!     ))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.conversations.len(), 1);
//! ```
//!
//! ## Timing defaults
//!
//! | Parameter | Default |
//! |-----------|---------|
//! | TCP connect timeout | 2 s |
//! | `T_TCP_Initial_Inactivity` | 2 s |
//! | `T_TCP_General_Inactivity` | 5 min |
//! | `T_A_DoIP_Ctrl` | 2 s |
//! | `T_A_DoIP_Diagnostic_Ack` | 2 s |
//! | Response timer (`P2Client_max`) | 2 s |
//! | Response-pending timer (`P2*Client_max`) | 5 s |
//! | Discovery window | 2 s |

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::InitError;
use crate::wire::{ACTIVATION_TYPE_DEFAULT, DEFAULT_MAX_PAYLOAD_SIZE, UDP_DISCOVERY_PORT};
use crate::LogicalAddress;

/// Default TCP connect timeout
pub const DEFAULT_TCP_CONNECT: Duration = Duration::from_secs(2);

/// `T_TCP_Initial_Inactivity`: the server closes a connection that has not
/// activated routing within this window; the client bounds activation by it
pub const DEFAULT_TCP_INITIAL_INACTIVITY: Duration = Duration::from_secs(2);

/// `T_TCP_General_Inactivity`: idle limit on an activated connection
pub const DEFAULT_TCP_GENERAL_INACTIVITY: Duration = Duration::from_secs(300);

/// `T_A_DoIP_Ctrl`: deadline for control message responses
/// (routing activation)
pub const DEFAULT_CTRL_TIMEOUT: Duration = Duration::from_secs(2);

/// `T_A_DoIP_Diagnostic_Ack`: deadline for the diagnostic message ack
pub const DEFAULT_DIAGNOSTIC_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Baseline deadline for the diagnostic response (`P2Client_max`)
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Extended response deadline after each response-pending NRC
/// (`P2*Client_max`)
pub const DEFAULT_RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a vehicle identification request collects responses
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

/// Default receive buffer size per channel
pub const DEFAULT_RX_BUFFER_SIZE: usize = 4096;

/// Default discovery target: limited broadcast on the DoIP UDP port
pub const DEFAULT_DISCOVERY_TARGET: SocketAddr = SocketAddr::new(
    IpAddr::V4(Ipv4Addr::BROADCAST),
    UDP_DISCOVERY_PORT,
);

// ============================================================================
// TIMING
// ============================================================================

/// DoIP timing parameters, overridable per client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// TCP connect timeout
    pub tcp_connect: Duration,
    /// `T_TCP_Initial_Inactivity`
    pub tcp_initial_inactivity: Duration,
    /// `T_TCP_General_Inactivity`
    pub tcp_general_inactivity: Duration,
    /// `T_A_DoIP_Ctrl`
    pub ctrl_timeout: Duration,
    /// `T_A_DoIP_Diagnostic_Ack`
    pub diagnostic_ack_timeout: Duration,
    /// Baseline response deadline (`P2Client_max`)
    pub response_timeout: Duration,
    /// Response deadline after a response-pending NRC (`P2*Client_max`)
    pub response_pending_timeout: Duration,
    /// Vehicle discovery collection window
    pub discovery_window: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tcp_connect: DEFAULT_TCP_CONNECT,
            tcp_initial_inactivity: DEFAULT_TCP_INITIAL_INACTIVITY,
            tcp_general_inactivity: DEFAULT_TCP_GENERAL_INACTIVITY,
            ctrl_timeout: DEFAULT_CTRL_TIMEOUT,
            diagnostic_ack_timeout: DEFAULT_DIAGNOSTIC_ACK_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            response_pending_timeout: DEFAULT_RESPONSE_PENDING_TIMEOUT,
            discovery_window: DEFAULT_DISCOVERY_WINDOW,
        }
    }
}

// ============================================================================
// CONVERSATION DESCRIPTOR
// ============================================================================

/// One configured conversation: a tester identity plus the server network
/// endpoint it talks to by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationConfig {
    /// Unique conversation name
    pub name: String,
    /// Tester logical source address
    pub source_address: LogicalAddress,
    /// Receive buffer size for the channel
    pub rx_buffer_size: usize,
    /// Response deadline override (`P2Client_max`)
    pub p2_client_max: Option<Duration>,
    /// Response-pending deadline override (`P2*Client_max`)
    pub p2_star_client_max: Option<Duration>,
    /// Server endpoint
    pub tcp_ip: IpAddr,
    pub tcp_port: u16,
    /// Routing activation type sent on connect
    pub routing_activation_type: u8,
}

impl ConversationConfig {
    pub fn new(
        name: impl Into<String>,
        source_address: LogicalAddress,
        tcp_ip: IpAddr,
        tcp_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            source_address,
            rx_buffer_size: DEFAULT_RX_BUFFER_SIZE,
            p2_client_max: None,
            p2_star_client_max: None,
            tcp_ip,
            tcp_port,
            routing_activation_type: ACTIVATION_TYPE_DEFAULT,
        }
    }
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

/// Immutable client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Local address the shared UDP endpoint binds to
    pub udp_ip: IpAddr,
    /// Local port for the UDP endpoint (the DoIP discovery port, so that
    /// unsolicited vehicle announcements are received too)
    pub udp_port: u16,
    /// Local address TCP channels bind from (currently informational)
    pub tcp_ip: Option<IpAddr>,
    /// Where vehicle identification requests are sent
    pub discovery_target: SocketAddr,
    /// Upper bound enforced on the payload length of received messages
    pub max_payload_size: u32,
    pub timing: TimingConfig,
    /// Conversation descriptors, in configuration order
    pub conversations: Vec<ConversationConfig>,
}

impl ClientConfig {
    /// Create a new builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load and validate a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InitError> {
        let text = fs::read_to_string(path).map_err(InitError::ConfigNotFound)?;
        Self::from_json(&text)
    }

    /// Parse and validate a configuration from a JSON string
    pub fn from_json(text: &str) -> Result<Self, InitError> {
        let file: ConfigFile =
            serde_json::from_str(text).map_err(|e| InitError::ConfigMalformed(e.to_string()))?;
        file.try_into()
    }

    /// Look up a conversation descriptor by name
    pub fn conversation(&self, name: &str) -> Option<&ConversationConfig> {
        self.conversations.iter().find(|c| c.name == name)
    }

    fn validate(self) -> Result<Self, InitError> {
        for (i, conv) in self.conversations.iter().enumerate() {
            if conv.name.is_empty() {
                return Err(InitError::ConfigMalformed(
                    "Conversation name must not be empty".into(),
                ));
            }
            if self.conversations[..i].iter().any(|c| c.name == conv.name) {
                return Err(InitError::ConfigMalformed(format!(
                    "Duplicate conversation name {:?}",
                    conv.name
                )));
            }
        }
        Ok(self)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            udp_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: UDP_DISCOVERY_PORT,
            tcp_ip: None,
            discovery_target: DEFAULT_DISCOVERY_TARGET,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            timing: TimingConfig::default(),
            conversations: Vec::new(),
        }
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the local UDP address
    pub fn udp_ip(mut self, ip: IpAddr) -> Self {
        self.config.udp_ip = ip;
        self
    }

    /// Set the local UDP port (default: 13400)
    pub fn udp_port(mut self, port: u16) -> Self {
        self.config.udp_port = port;
        self
    }

    /// Set the local TCP address
    pub fn tcp_ip(mut self, ip: IpAddr) -> Self {
        self.config.tcp_ip = Some(ip);
        self
    }

    /// Set where identification requests are sent
    pub fn discovery_target(mut self, target: SocketAddr) -> Self {
        self.config.discovery_target = target;
        self
    }

    /// Set the maximum accepted payload length
    pub fn max_payload_size(mut self, max: u32) -> Self {
        self.config.max_payload_size = max;
        self
    }

    /// Replace the timing parameters
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.config.timing = timing;
        self
    }

    /// Add a conversation descriptor
    pub fn conversation(mut self, conversation: ConversationConfig) -> Self {
        self.config.conversations.push(conversation);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<ClientConfig, InitError> {
        self.config.validate()
    }
}

// ============================================================================
// JSON FILE LAYOUT
// ============================================================================

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "UdpIpAddress")]
    udp_ip_address: String,
    #[serde(rename = "TcpIpAddress", default)]
    tcp_ip_address: Option<String>,
    #[serde(rename = "Conversation", default)]
    conversation: Vec<ConversationEntry>,
}

#[derive(Debug, Deserialize)]
struct ConversationEntry {
    #[serde(rename = "ConversationName")]
    conversation_name: String,
    #[serde(rename = "SourceAddress")]
    source_address: u16,
    #[serde(rename = "RxBufferSize", default)]
    rx_buffer_size: Option<u32>,
    #[serde(rename = "P2ClientMax", default)]
    p2_client_max: Option<u64>,
    #[serde(rename = "P2StarClientMax", default)]
    p2_star_client_max: Option<u64>,
    #[serde(rename = "RoutingActivationType", default)]
    routing_activation_type: Option<u8>,
    #[serde(rename = "Network")]
    network: NetworkEntry,
}

#[derive(Debug, Deserialize)]
struct NetworkEntry {
    #[serde(rename = "TcpIpAddress")]
    tcp_ip_address: String,
    #[serde(rename = "PortNumber")]
    port_number: u16,
}

fn parse_ip(text: &str, field: &str) -> Result<IpAddr, InitError> {
    text.parse()
        .map_err(|_| InitError::ConfigMalformed(format!("{field}: invalid IP address {text:?}")))
}

impl TryFrom<ConfigFile> for ClientConfig {
    type Error = InitError;

    fn try_from(file: ConfigFile) -> Result<Self, InitError> {
        let udp_ip = parse_ip(&file.udp_ip_address, "UdpIpAddress")?;
        let tcp_ip = file
            .tcp_ip_address
            .as_deref()
            .map(|s| parse_ip(s, "TcpIpAddress"))
            .transpose()?;

        let mut conversations = Vec::with_capacity(file.conversation.len());
        for entry in file.conversation {
            let tcp_ip = parse_ip(&entry.network.tcp_ip_address, "Network.TcpIpAddress")?;
            conversations.push(ConversationConfig {
                name: entry.conversation_name,
                source_address: LogicalAddress::new(entry.source_address),
                rx_buffer_size: entry
                    .rx_buffer_size
                    .map_or(DEFAULT_RX_BUFFER_SIZE, |v| v as usize),
                p2_client_max: entry.p2_client_max.map(Duration::from_millis),
                p2_star_client_max: entry.p2_star_client_max.map(Duration::from_millis),
                tcp_ip,
                tcp_port: entry.network.port_number,
                routing_activation_type: entry
                    .routing_activation_type
                    .unwrap_or(ACTIVATION_TYPE_DEFAULT),
            });
        }

        ClientConfig {
            udp_ip,
            tcp_ip,
            conversations,
            ..ClientConfig::default()
        }
        .validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "UdpIpAddress": "172.16.25.1",
        "TcpIpAddress": "172.16.25.1",
        "Conversation": [
            {
                "ConversationName": "RemoteDiagnostics",
                "SourceAddress": 1,
                "RxBufferSize": 2048,
                "P2ClientMax": 1500,
                "P2StarClientMax": 6000,
                "Network": { "TcpIpAddress": "172.16.25.128", "PortNumber": 13400 }
            },
            {
                "ConversationName": "BodyDomain",
                "SourceAddress": 2,
                "Network": { "TcpIpAddress": "172.16.25.129", "PortNumber": 13400 }
            }
        ]
    }"#;

    #[test]
    fn parses_full_config() {
        let config = ClientConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.udp_ip, IpAddr::from([172, 16, 25, 1]));
        assert_eq!(config.tcp_ip, Some(IpAddr::from([172, 16, 25, 1])));
        assert_eq!(config.conversations.len(), 2);

        let remote = config.conversation("RemoteDiagnostics").unwrap();
        assert_eq!(remote.source_address, LogicalAddress::new(0x0001));
        assert_eq!(remote.rx_buffer_size, 2048);
        assert_eq!(remote.p2_client_max, Some(Duration::from_millis(1500)));
        assert_eq!(remote.p2_star_client_max, Some(Duration::from_millis(6000)));
        assert_eq!(remote.tcp_ip, IpAddr::from([172, 16, 25, 128]));
        assert_eq!(remote.tcp_port, 13400);
    }

    #[test]
    fn missing_timing_fields_take_defaults() {
        let config = ClientConfig::from_json(SAMPLE).unwrap();
        let body = config.conversation("BodyDomain").unwrap();
        assert_eq!(body.rx_buffer_size, DEFAULT_RX_BUFFER_SIZE);
        assert_eq!(body.p2_client_max, None);
        assert_eq!(body.p2_star_client_max, None);
        assert_eq!(body.routing_activation_type, ACTIVATION_TYPE_DEFAULT);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let config = ClientConfig::from_json(
            r#"{
                "UdpIpAddress": "127.0.0.1",
                "SomeFutureKnob": true,
                "Conversation": []
            }"#,
        )
        .unwrap();
        assert!(config.conversations.is_empty());
    }

    #[test]
    fn rejects_duplicate_conversation_names() {
        let err = ClientConfig::from_json(
            r#"{
                "UdpIpAddress": "127.0.0.1",
                "Conversation": [
                    {
                        "ConversationName": "A",
                        "SourceAddress": 1,
                        "Network": { "TcpIpAddress": "127.0.0.2", "PortNumber": 13400 }
                    },
                    {
                        "ConversationName": "A",
                        "SourceAddress": 2,
                        "Network": { "TcpIpAddress": "127.0.0.3", "PortNumber": 13400 }
                    }
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, InitError::ConfigMalformed(_)));
    }

    #[test]
    fn rejects_bad_ip_address() {
        let err = ClientConfig::from_json(r#"{ "UdpIpAddress": "not-an-ip" }"#).unwrap_err();
        assert!(matches!(err, InitError::ConfigMalformed(_)));
    }

    #[test]
    fn rejects_invalid_json() {
        let err = ClientConfig::from_json("{ this is not json").unwrap_err();
        assert!(matches!(err, InitError::ConfigMalformed(_)));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ClientConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, InitError::ConfigNotFound(_)));
    }
}
