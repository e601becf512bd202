//! Error types for doip-client.
//!
//! Every fallible operation returns a dedicated error enum for its operation
//! group; no out-of-band control flow.

use std::fmt;
use std::io;

/// Errors from [`DiagClient::initialize`](crate::DiagClient::initialize) and
/// [`DiagClient::deinitialize`](crate::DiagClient::deinitialize).
#[derive(Debug)]
pub enum InitError {
    /// The configuration file does not exist or is unreadable
    ConfigNotFound(io::Error),
    /// The configuration file exists but cannot be parsed or validated
    ConfigMalformed(String),
    /// Binding the UDP discovery endpoint failed
    BindFailed(io::Error),
    /// `initialize` was called on an already initialized client
    AlreadyInitialized,
    /// `deinitialize` was called on a client that is not initialized
    NotInitialized,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::ConfigNotFound(e) => write!(f, "Configuration file not found: {e}"),
            InitError::ConfigMalformed(msg) => write!(f, "Configuration malformed: {msg}"),
            InitError::BindFailed(e) => write!(f, "Failed to bind UDP endpoint: {e}"),
            InitError::AlreadyInitialized => write!(f, "Client is already initialized"),
            InitError::NotInitialized => write!(f, "Client is not initialized"),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::ConfigNotFound(e) | InitError::BindFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from vehicle discovery.
///
/// An empty network is not an error: a discovery window with no responders
/// completes with `Ok(vec![])`.
#[derive(Debug)]
pub enum DiscoveryError {
    /// Sending the identification request datagram failed
    UdpSend(io::Error),
    /// The client is not initialized
    NotInitialized,
    /// The client shut down while the discovery window was open
    Shutdown,
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::UdpSend(e) => write!(f, "Failed to send identification request: {e}"),
            DiscoveryError::NotInitialized => write!(f, "Client is not initialized"),
            DiscoveryError::Shutdown => write!(f, "Client shut down during discovery"),
        }
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiscoveryError::UdpSend(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from [`DiagClient::get_conversation`](crate::DiagClient::get_conversation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationError {
    /// No conversation with the given name exists in the configuration
    UnknownConversation,
    /// The client is not initialized
    NotInitialized,
}

impl fmt::Display for ConversationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationError::UnknownConversation => write!(f, "Unknown conversation name"),
            ConversationError::NotInitialized => write!(f, "Client is not initialized"),
        }
    }
}

impl std::error::Error for ConversationError {}

/// Errors from [`Conversation::connect_to_diag_server`](crate::Conversation::connect_to_diag_server).
#[derive(Debug)]
pub enum ConnectError {
    /// The TCP connection could not be established
    TcpConnect(io::Error),
    /// The TCP connection attempt did not complete within the connect timeout
    TcpConnectTimeout,
    /// A channel for this `(tester source, server logical address)` pair is
    /// already active, or the conversation is already connected
    AlreadyConnected,
    /// The server answered routing activation with a non-success code
    RoutingActivationDenied(u8),
    /// No routing activation response arrived within `T_A_DoIP_Ctrl`
    RoutingActivationTimeout,
    /// The conversation has not been started (or the client is shut down)
    NotInitialized,
    /// The client shut down while connecting
    Shutdown,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::TcpConnect(e) => write!(f, "TCP connect failed: {e}"),
            ConnectError::TcpConnectTimeout => write!(f, "TCP connect timed out"),
            ConnectError::AlreadyConnected => write!(f, "Already connected to this server"),
            ConnectError::RoutingActivationDenied(code) => {
                write!(f, "Routing activation denied with code 0x{code:02X}")
            }
            ConnectError::RoutingActivationTimeout => write!(f, "Routing activation timed out"),
            ConnectError::NotInitialized => write!(f, "Conversation is not started"),
            ConnectError::Shutdown => write!(f, "Client shut down during connect"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::TcpConnect(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from [`Conversation::disconnect_from_diag_server`](crate::Conversation::disconnect_from_diag_server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectError {
    /// The conversation has no active channel
    NotConnected,
    /// The client shut down before the disconnect completed
    Shutdown,
}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectError::NotConnected => write!(f, "Not connected"),
            DisconnectError::Shutdown => write!(f, "Client shut down during disconnect"),
        }
    }
}

impl std::error::Error for DisconnectError {}

/// Errors from [`Conversation::send_diagnostic_request`](crate::Conversation::send_diagnostic_request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdsError {
    /// The request payload is empty
    EmptyRequest,
    /// Another request is already in flight on this channel (UDS over DoIP
    /// is half-duplex per channel)
    Busy,
    /// The conversation has no active channel
    NotConnected,
    /// The server did not acknowledge the diagnostic message within
    /// `T_A_DoIP_Diagnostic_Ack`
    AckTimeout,
    /// The server rejected the diagnostic message with this NACK code
    NegativeAck(u8),
    /// No response arrived within the response timer (including any
    /// response-pending extensions)
    ResponseTimeout,
    /// The channel closed while the request was in flight
    Disconnected,
    /// The client shut down while the request was in flight
    Shutdown,
}

impl fmt::Display for UdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdsError::EmptyRequest => write!(f, "Diagnostic request must not be empty"),
            UdsError::Busy => write!(f, "A request is already in flight on this channel"),
            UdsError::NotConnected => write!(f, "Not connected to a diagnostic server"),
            UdsError::AckTimeout => write!(f, "Diagnostic message was not acknowledged in time"),
            UdsError::NegativeAck(code) => {
                write!(f, "Diagnostic message rejected with NACK code 0x{code:02X}")
            }
            UdsError::ResponseTimeout => write!(f, "No diagnostic response within the deadline"),
            UdsError::Disconnected => write!(f, "Channel closed during the request"),
            UdsError::Shutdown => write!(f, "Client shut down during the request"),
        }
    }
}

impl std::error::Error for UdsError {}
