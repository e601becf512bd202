//! # doip-client
//!
//! An async DoIP (Diagnostics over IP, ISO 13400-2) client engine for tokio.
//!
//! The engine lets a host ("tester") discover diagnostic servers ("ECUs") on a
//! vehicle network over UDP, establish routing-activated TCP sessions with one
//! or more servers concurrently, and exchange UDS request/response messages
//! with the timing, retry and segmentation semantics the standard requires.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use doip_client::{create_diagnostic_client, VehicleInfoRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = create_diagnostic_client("diag_client_config.json");
//!     client.initialize().await?;
//!
//!     // Discover servers on the network
//!     let servers = client
//!         .send_vehicle_identification_request(VehicleInfoRequest::Any)
//!         .await?;
//!
//!     // Talk to one of them
//!     let conversation = client.get_conversation("RemoteDiagnostics")?;
//!     conversation.startup().await?;
//!     conversation
//!         .connect_to_diag_server(servers[0].logical_address, servers[0].ip)
//!         .await?;
//!
//!     let response = conversation
//!         .send_diagnostic_request(&[0x22, 0xF1, 0x90])
//!         .await?;
//!     println!("DID F190: {:02X?}", &response[..]);
//!
//!     conversation.disconnect_from_diag_server().await?;
//!     conversation.shutdown().await?;
//!     client.deinitialize().await?;
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::net::IpAddr;

pub mod net;

pub mod config;
pub mod error;
pub mod handle;

/// Wire format encoding and decoding for DoIP headers and payloads.
/// Exposed for testing and interoperability verification.
pub mod wire;

mod runtime;

pub use config::{ClientConfig, ClientConfigBuilder, ConversationConfig, TimingConfig};
pub use error::*;
pub use handle::{create_diagnostic_client, Conversation, DiagClient};

// ============================================================================
// PROTOCOL IDENTIFIERS
// ============================================================================

/// DoIP logical address (tester or diagnostic server).
///
/// Any 16-bit value is representable on the wire; ISO 13400-2 reserves
/// 0x0000 and carves out ranges for testers and ECUs, but gateways in the
/// field use addresses outside those ranges freely, so no range validation
/// is enforced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalAddress(u16);

impl LogicalAddress {
    pub const fn new(addr: u16) -> Self {
        Self(addr)
    }

    /// Get the raw value
    pub const fn value(&self) -> u16 {
        self.0
    }
}

impl From<u16> for LogicalAddress {
    fn from(addr: u16) -> Self {
        Self(addr)
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Entity identification (EID), typically the MAC address of the DoIP entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Eid(pub [u8; 6]);

/// Group identification (GID) of a vehicle's DoIP entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid(pub [u8; 6]);

fn fmt_colon_hex(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            write!(f, ":")?;
        }
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

fn parse_colon_hex(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for slot in &mut out {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

impl Eid {
    /// Parse from `"00:02:36:31:00:1c"` notation.
    pub fn parse(s: &str) -> Option<Self> {
        parse_colon_hex(s).map(Self)
    }
}

impl Gid {
    /// Parse from `"0a:0b:0c:0d:0e:0f"` notation.
    pub fn parse(s: &str) -> Option<Self> {
        parse_colon_hex(s).map(Self)
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_colon_hex(&self.0, f)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_colon_hex(&self.0, f)
    }
}

/// Vehicle identification number, 17 ASCII characters on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vin(pub [u8; 17]);

impl Vin {
    pub const WIRE_SIZE: usize = 17;

    /// Create from a 17-character string. Returns None on length mismatch.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != Self::WIRE_SIZE {
            return None;
        }
        let mut vin = [0u8; Self::WIRE_SIZE];
        vin.copy_from_slice(bytes);
        Some(Self(vin))
    }
}

impl fmt::Display for Vin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

// ============================================================================
// DISCOVERY TYPES
// ============================================================================

/// Filter for a vehicle identification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleInfoRequest {
    /// Plain identification request; every entity on the network replies.
    Any,
    /// Identification request addressed to the entity with this EID.
    ByEid(Eid),
    /// Identification request addressed to the vehicle with this VIN.
    ByVin(Vin),
}

/// One discovered diagnostic server, as reported by a vehicle announcement
/// or vehicle identification response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleAddrInfo {
    /// IP address the announcement came from; this is where the TCP
    /// connection for diagnostics goes.
    pub ip: IpAddr,
    /// Logical address of the DoIP entity.
    pub logical_address: LogicalAddress,
    pub vin: Vin,
    pub eid: Eid,
    pub gid: Gid,
}

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub mod prelude {
    pub use crate::config::{ClientConfig, ClientConfigBuilder, ConversationConfig, TimingConfig};
    pub use crate::error::{
        ConnectError, ConversationError, DisconnectError, DiscoveryError, InitError, UdsError,
    };
    pub use crate::handle::{create_diagnostic_client, Conversation, DiagClient};
    pub use crate::{Eid, Gid, LogicalAddress, VehicleAddrInfo, VehicleInfoRequest, Vin};
}
