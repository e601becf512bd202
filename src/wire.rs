//! # DoIP Wire Format
//!
//! Encoding and decoding of DoIP messages per ISO 13400-2. The codec is
//! pure: it never touches a socket, so the same functions serve the UDP
//! discovery path and the TCP channel path.
//!
//! ## DoIP Header Format (8 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ──────────────────────────────────────────────────────
//!   0      1    Protocol Version
//!   1      1    Inverse Protocol Version (~version)
//!   2      2    Payload Type (big-endian)
//!   4      4    Payload Length (big-endian)
//! ──────────────────────────────────────────────────────
//! ```
//!
//! ## Payload Types
//!
//! | Value  | Name |
//! |--------|------|
//! | 0x0000 | Generic DoIP header negative acknowledge |
//! | 0x0001 | Vehicle identification request |
//! | 0x0002 | Vehicle identification request with EID |
//! | 0x0003 | Vehicle identification request with VIN |
//! | 0x0004 | Vehicle announcement / identification response |
//! | 0x0005 | Routing activation request |
//! | 0x0006 | Routing activation response |
//! | 0x0007 | Alive check request |
//! | 0x0008 | Alive check response |
//! | 0x4001 | DoIP entity status request |
//! | 0x4002 | DoIP entity status response |
//! | 0x4003 | Diagnostic power mode information request |
//! | 0x4004 | Diagnostic power mode information response |
//! | 0x8001 | Diagnostic message |
//! | 0x8002 | Diagnostic message positive acknowledgement |
//! | 0x8003 | Diagnostic message negative acknowledgement |
//!
//! All multi-byte integers are big-endian. Validation order on decode
//! follows ISO 13400-2 §7.1.5: protocol version pattern first, then payload
//! type, then payload length bound, then per-type field widths.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Eid, Gid, LogicalAddress, Vin};

/// Protocol version for ISO 13400-2:2012
pub const PROTOCOL_VERSION_2012: u8 = 0x02;

/// Protocol version for ISO 13400-2:2019
pub const PROTOCOL_VERSION_2019: u8 = 0x03;

/// "Default" version used by vehicle identification requests when the
/// protocol version of the entities is not yet known (ISO 13400-2 Table 12)
pub const PROTOCOL_VERSION_DEFAULT: u8 = 0xFF;

/// Version this engine emits on all non-discovery messages
pub const PROTOCOL_VERSION: u8 = PROTOCOL_VERSION_2012;

/// Default upper bound for the payload length field. One byte more is
/// rejected with [`NackCode::MessageTooLarge`].
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 65535;

/// Well-known DoIP UDP discovery port
pub const UDP_DISCOVERY_PORT: u16 = 13400;

/// Well-known DoIP TCP data port
pub const TCP_DATA_PORT: u16 = 13400;

// ============================================================================
// CODES
// ============================================================================

/// Codes carried in a generic DoIP header negative acknowledge (0x0000)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NackCode {
    IncorrectPatternFormat = 0x00,
    UnknownPayloadType = 0x01,
    MessageTooLarge = 0x02,
    OutOfMemory = 0x03,
    InvalidPayloadLength = 0x04,
}

impl NackCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::IncorrectPatternFormat),
            0x01 => Some(Self::UnknownPayloadType),
            0x02 => Some(Self::MessageTooLarge),
            0x03 => Some(Self::OutOfMemory),
            0x04 => Some(Self::InvalidPayloadLength),
            _ => None,
        }
    }
}

/// Routing activation response codes (ISO 13400-2 Table 25)
pub mod activation_code {
    /// Denied: unknown tester source address
    pub const DENIED_UNKNOWN_SOURCE: u8 = 0x00;
    /// Denied: all concurrently supported TCP sockets are in use
    pub const DENIED_ALL_SOCKETS_TAKEN: u8 = 0x01;
    /// Denied: a different source address is already active on this socket
    pub const DENIED_SOURCE_CHANGED: u8 = 0x02;
    /// Denied: the source address is already activated on another socket
    pub const DENIED_SOURCE_IN_USE: u8 = 0x03;
    /// Denied: missing authentication
    pub const DENIED_MISSING_AUTHENTICATION: u8 = 0x06;
    /// Routing successfully activated
    pub const SUCCESS: u8 = 0x10;
    /// Activation pending confirmation
    pub const PENDING_CONFIRMATION: u8 = 0x11;
}

/// Diagnostic message acknowledge codes
pub mod diag_ack_code {
    /// Positive acknowledgement: message was received and routed
    pub const ACK: u8 = 0x00;
    /// NACK: invalid source address
    pub const INVALID_SOURCE_ADDRESS: u8 = 0x02;
    /// NACK: unknown target address
    pub const UNKNOWN_TARGET_ADDRESS: u8 = 0x03;
    /// NACK: diagnostic message too large
    pub const MESSAGE_TOO_LARGE: u8 = 0x04;
    /// NACK: out of memory
    pub const OUT_OF_MEMORY: u8 = 0x05;
    /// NACK: target unreachable
    pub const TARGET_UNREACHABLE: u8 = 0x06;
}

/// Default routing activation type (ISO 13400-2 Table 23)
pub const ACTIVATION_TYPE_DEFAULT: u8 = 0x00;

// ============================================================================
// PAYLOAD TYPE
// ============================================================================

/// DoIP payload types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PayloadType {
    GenericNack = 0x0000,
    VehicleIdentificationRequest = 0x0001,
    VehicleIdentificationRequestWithEid = 0x0002,
    VehicleIdentificationRequestWithVin = 0x0003,
    VehicleAnnouncement = 0x0004,
    RoutingActivationRequest = 0x0005,
    RoutingActivationResponse = 0x0006,
    AliveCheckRequest = 0x0007,
    AliveCheckResponse = 0x0008,
    EntityStatusRequest = 0x4001,
    EntityStatusResponse = 0x4002,
    PowerModeRequest = 0x4003,
    PowerModeResponse = 0x4004,
    DiagnosticMessage = 0x8001,
    DiagnosticPositiveAck = 0x8002,
    DiagnosticNegativeAck = 0x8003,
}

impl PayloadType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::GenericNack),
            0x0001 => Some(Self::VehicleIdentificationRequest),
            0x0002 => Some(Self::VehicleIdentificationRequestWithEid),
            0x0003 => Some(Self::VehicleIdentificationRequestWithVin),
            0x0004 => Some(Self::VehicleAnnouncement),
            0x0005 => Some(Self::RoutingActivationRequest),
            0x0006 => Some(Self::RoutingActivationResponse),
            0x0007 => Some(Self::AliveCheckRequest),
            0x0008 => Some(Self::AliveCheckResponse),
            0x4001 => Some(Self::EntityStatusRequest),
            0x4002 => Some(Self::EntityStatusResponse),
            0x4003 => Some(Self::PowerModeRequest),
            0x4004 => Some(Self::PowerModeResponse),
            0x8001 => Some(Self::DiagnosticMessage),
            0x8002 => Some(Self::DiagnosticPositiveAck),
            0x8003 => Some(Self::DiagnosticNegativeAck),
            _ => None,
        }
    }

    /// Check if this is one of the vehicle identification request/response
    /// types, which may carry the 0xFF "default" protocol version.
    pub fn is_identification(&self) -> bool {
        matches!(
            self,
            Self::VehicleIdentificationRequest
                | Self::VehicleIdentificationRequestWithEid
                | Self::VehicleIdentificationRequestWithVin
                | Self::VehicleAnnouncement
        )
    }
}

// ============================================================================
// DECODE ERRORS
// ============================================================================

/// Codec errors.
///
/// On TCP these trigger a [`Payload::GenericNack`] back to the peer and a
/// channel close; on UDP the datagram is counted and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes available than the header's payload length promises.
    /// On a stream this means "wait for more data"; on a datagram it is
    /// treated like an invalid payload length.
    Truncated,
    /// Protocol version unsupported or inverse byte does not match
    IncorrectPatternFormat { version: u8, inverse: u8 },
    /// Payload type not defined by ISO 13400-2
    UnknownPayloadType { payload_type: u16 },
    /// Payload length exceeds the configured maximum
    MessageTooLarge { payload_length: u32, max: u32 },
    /// Payload length does not match the fixed layout of the payload type
    InvalidPayloadLength {
        payload_type: PayloadType,
        payload_length: u32,
    },
}

impl DecodeError {
    /// The code to put into the generic header negative acknowledge for
    /// this error, if one is warranted.
    pub fn nack_code(&self) -> Option<NackCode> {
        match self {
            DecodeError::Truncated => Some(NackCode::InvalidPayloadLength),
            DecodeError::IncorrectPatternFormat { .. } => Some(NackCode::IncorrectPatternFormat),
            DecodeError::UnknownPayloadType { .. } => Some(NackCode::UnknownPayloadType),
            DecodeError::MessageTooLarge { .. } => Some(NackCode::MessageTooLarge),
            DecodeError::InvalidPayloadLength { .. } => Some(NackCode::InvalidPayloadLength),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "Message truncated"),
            DecodeError::IncorrectPatternFormat { version, inverse } => write!(
                f,
                "Incorrect pattern format: version 0x{version:02X}, inverse 0x{inverse:02X}"
            ),
            DecodeError::UnknownPayloadType { payload_type } => {
                write!(f, "Unknown payload type 0x{payload_type:04X}")
            }
            DecodeError::MessageTooLarge {
                payload_length,
                max,
            } => write!(f, "Payload length {payload_length} exceeds maximum {max}"),
            DecodeError::InvalidPayloadLength {
                payload_type,
                payload_length,
            } => write!(
                f,
                "Invalid payload length {payload_length} for {payload_type:?}"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// HEADER
// ============================================================================

/// DoIP header (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol_version: u8,
    pub inverse_protocol_version: u8,
    /// Raw payload type; kept raw so an unknown type can still be reported
    pub payload_type: u16,
    pub payload_length: u32,
}

impl Header {
    pub const SIZE: usize = 8;

    pub fn new(version: u8, payload_type: PayloadType, payload_length: u32) -> Self {
        Self {
            protocol_version: version,
            inverse_protocol_version: !version,
            payload_type: payload_type as u16,
            payload_length,
        }
    }

    /// Parse a header from bytes. Returns None if fewer than 8 bytes remain.
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }
        Some(Self {
            protocol_version: buf.get_u8(),
            inverse_protocol_version: buf.get_u8(),
            payload_type: buf.get_u16(),
            payload_length: buf.get_u32(),
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.inverse_protocol_version);
        buf.put_u16(self.payload_type);
        buf.put_u32(self.payload_length);
    }

    /// Validate pattern, payload type and length bound, in the order
    /// ISO 13400-2 §7.1.5 prescribes.
    pub fn validate(&self, max_payload_size: u32) -> Result<PayloadType, DecodeError> {
        if self.inverse_protocol_version != !self.protocol_version {
            return Err(DecodeError::IncorrectPatternFormat {
                version: self.protocol_version,
                inverse: self.inverse_protocol_version,
            });
        }
        let version_ok = match self.protocol_version {
            PROTOCOL_VERSION_2012 | PROTOCOL_VERSION_2019 => true,
            // The default version is only legal for the identification family
            PROTOCOL_VERSION_DEFAULT => PayloadType::from_u16(self.payload_type)
                .is_some_and(|t| t.is_identification()),
            _ => false,
        };
        if !version_ok {
            return Err(DecodeError::IncorrectPatternFormat {
                version: self.protocol_version,
                inverse: self.inverse_protocol_version,
            });
        }
        let payload_type =
            PayloadType::from_u16(self.payload_type).ok_or(DecodeError::UnknownPayloadType {
                payload_type: self.payload_type,
            })?;
        if self.payload_length > max_payload_size {
            return Err(DecodeError::MessageTooLarge {
                payload_length: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(payload_type)
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// A decoded DoIP payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    GenericNack {
        nack_code: u8,
    },
    VehicleIdentificationRequest,
    VehicleIdentificationRequestWithEid {
        eid: Eid,
    },
    VehicleIdentificationRequestWithVin {
        vin: Vin,
    },
    VehicleAnnouncement {
        vin: Vin,
        logical_address: LogicalAddress,
        eid: Eid,
        gid: Gid,
        further_action: u8,
        /// Absent in the 32-byte announcement form
        sync_status: Option<u8>,
    },
    RoutingActivationRequest {
        source_address: LogicalAddress,
        activation_type: u8,
        reserved: [u8; 4],
        oem: Option<[u8; 4]>,
    },
    RoutingActivationResponse {
        tester_address: LogicalAddress,
        entity_address: LogicalAddress,
        response_code: u8,
        reserved: [u8; 4],
        oem: Option<[u8; 4]>,
    },
    AliveCheckRequest,
    AliveCheckResponse {
        source_address: LogicalAddress,
    },
    EntityStatusRequest,
    EntityStatusResponse {
        node_type: u8,
        max_open_sockets: u8,
        open_sockets: u8,
        max_data_size: Option<u32>,
    },
    PowerModeRequest,
    PowerModeResponse {
        power_mode: u8,
    },
    DiagnosticMessage {
        source_address: LogicalAddress,
        target_address: LogicalAddress,
        user_data: Bytes,
    },
    DiagnosticPositiveAck {
        source_address: LogicalAddress,
        target_address: LogicalAddress,
        ack_code: u8,
        /// Echo of (a prefix of) the acknowledged diagnostic message
        previous: Bytes,
    },
    DiagnosticNegativeAck {
        source_address: LogicalAddress,
        target_address: LogicalAddress,
        nack_code: u8,
        previous: Bytes,
    },
}

fn get_addr(buf: &mut impl Buf) -> LogicalAddress {
    LogicalAddress::new(buf.get_u16())
}

fn get_array<const N: usize>(buf: &mut impl Buf) -> [u8; N] {
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    out
}

impl Payload {
    /// The payload type this variant encodes as
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::GenericNack { .. } => PayloadType::GenericNack,
            Payload::VehicleIdentificationRequest => PayloadType::VehicleIdentificationRequest,
            Payload::VehicleIdentificationRequestWithEid { .. } => {
                PayloadType::VehicleIdentificationRequestWithEid
            }
            Payload::VehicleIdentificationRequestWithVin { .. } => {
                PayloadType::VehicleIdentificationRequestWithVin
            }
            Payload::VehicleAnnouncement { .. } => PayloadType::VehicleAnnouncement,
            Payload::RoutingActivationRequest { .. } => PayloadType::RoutingActivationRequest,
            Payload::RoutingActivationResponse { .. } => PayloadType::RoutingActivationResponse,
            Payload::AliveCheckRequest => PayloadType::AliveCheckRequest,
            Payload::AliveCheckResponse { .. } => PayloadType::AliveCheckResponse,
            Payload::EntityStatusRequest => PayloadType::EntityStatusRequest,
            Payload::EntityStatusResponse { .. } => PayloadType::EntityStatusResponse,
            Payload::PowerModeRequest => PayloadType::PowerModeRequest,
            Payload::PowerModeResponse { .. } => PayloadType::PowerModeResponse,
            Payload::DiagnosticMessage { .. } => PayloadType::DiagnosticMessage,
            Payload::DiagnosticPositiveAck { .. } => PayloadType::DiagnosticPositiveAck,
            Payload::DiagnosticNegativeAck { .. } => PayloadType::DiagnosticNegativeAck,
        }
    }

    /// Encoded size in bytes (the header's payload length field)
    pub fn encoded_len(&self) -> u32 {
        let len = match self {
            Payload::GenericNack { .. } => 1,
            Payload::VehicleIdentificationRequest => 0,
            Payload::VehicleIdentificationRequestWithEid { .. } => 6,
            Payload::VehicleIdentificationRequestWithVin { .. } => Vin::WIRE_SIZE,
            Payload::VehicleAnnouncement { sync_status, .. } => {
                32 + usize::from(sync_status.is_some())
            }
            Payload::RoutingActivationRequest { oem, .. } => 7 + if oem.is_some() { 4 } else { 0 },
            Payload::RoutingActivationResponse { oem, .. } => 9 + if oem.is_some() { 4 } else { 0 },
            Payload::AliveCheckRequest => 0,
            Payload::AliveCheckResponse { .. } => 2,
            Payload::EntityStatusRequest => 0,
            Payload::EntityStatusResponse { max_data_size, .. } => {
                3 + if max_data_size.is_some() { 4 } else { 0 }
            }
            Payload::PowerModeRequest => 0,
            Payload::PowerModeResponse { .. } => 1,
            Payload::DiagnosticMessage { user_data, .. } => 4 + user_data.len(),
            Payload::DiagnosticPositiveAck { previous, .. }
            | Payload::DiagnosticNegativeAck { previous, .. } => 5 + previous.len(),
        };
        len as u32
    }

    /// Decode a payload of the given type from exactly `header.payload_length`
    /// bytes. The caller has already validated the header.
    pub fn decode(payload_type: PayloadType, mut buf: Bytes) -> Result<Self, DecodeError> {
        let invalid = |len: usize| DecodeError::InvalidPayloadLength {
            payload_type,
            payload_length: len as u32,
        };
        let len = buf.len();

        match payload_type {
            PayloadType::GenericNack => {
                if len != 1 {
                    return Err(invalid(len));
                }
                Ok(Payload::GenericNack {
                    nack_code: buf.get_u8(),
                })
            }
            PayloadType::VehicleIdentificationRequest => {
                if len != 0 {
                    return Err(invalid(len));
                }
                Ok(Payload::VehicleIdentificationRequest)
            }
            PayloadType::VehicleIdentificationRequestWithEid => {
                if len != 6 {
                    return Err(invalid(len));
                }
                Ok(Payload::VehicleIdentificationRequestWithEid {
                    eid: Eid(get_array(&mut buf)),
                })
            }
            PayloadType::VehicleIdentificationRequestWithVin => {
                if len != Vin::WIRE_SIZE {
                    return Err(invalid(len));
                }
                Ok(Payload::VehicleIdentificationRequestWithVin {
                    vin: Vin(get_array(&mut buf)),
                })
            }
            PayloadType::VehicleAnnouncement => {
                // 32 bytes without sync status, 33 with
                if len != 32 && len != 33 {
                    return Err(invalid(len));
                }
                let vin = Vin(get_array(&mut buf));
                let logical_address = get_addr(&mut buf);
                let eid = Eid(get_array(&mut buf));
                let gid = Gid(get_array(&mut buf));
                let further_action = buf.get_u8();
                let sync_status = (len == 33).then(|| buf.get_u8());
                Ok(Payload::VehicleAnnouncement {
                    vin,
                    logical_address,
                    eid,
                    gid,
                    further_action,
                    sync_status,
                })
            }
            PayloadType::RoutingActivationRequest => {
                if len != 7 && len != 11 {
                    return Err(invalid(len));
                }
                let source_address = get_addr(&mut buf);
                let activation_type = buf.get_u8();
                let reserved = get_array(&mut buf);
                let oem = (len == 11).then(|| get_array(&mut buf));
                Ok(Payload::RoutingActivationRequest {
                    source_address,
                    activation_type,
                    reserved,
                    oem,
                })
            }
            PayloadType::RoutingActivationResponse => {
                if len != 9 && len != 13 {
                    return Err(invalid(len));
                }
                let tester_address = get_addr(&mut buf);
                let entity_address = get_addr(&mut buf);
                let response_code = buf.get_u8();
                let reserved = get_array(&mut buf);
                let oem = (len == 13).then(|| get_array(&mut buf));
                Ok(Payload::RoutingActivationResponse {
                    tester_address,
                    entity_address,
                    response_code,
                    reserved,
                    oem,
                })
            }
            PayloadType::AliveCheckRequest => {
                if len != 0 {
                    return Err(invalid(len));
                }
                Ok(Payload::AliveCheckRequest)
            }
            PayloadType::AliveCheckResponse => {
                if len != 2 {
                    return Err(invalid(len));
                }
                Ok(Payload::AliveCheckResponse {
                    source_address: get_addr(&mut buf),
                })
            }
            PayloadType::EntityStatusRequest => {
                if len != 0 {
                    return Err(invalid(len));
                }
                Ok(Payload::EntityStatusRequest)
            }
            PayloadType::EntityStatusResponse => {
                if len != 3 && len != 7 {
                    return Err(invalid(len));
                }
                let node_type = buf.get_u8();
                let max_open_sockets = buf.get_u8();
                let open_sockets = buf.get_u8();
                let max_data_size = (len == 7).then(|| buf.get_u32());
                Ok(Payload::EntityStatusResponse {
                    node_type,
                    max_open_sockets,
                    open_sockets,
                    max_data_size,
                })
            }
            PayloadType::PowerModeRequest => {
                if len != 0 {
                    return Err(invalid(len));
                }
                Ok(Payload::PowerModeRequest)
            }
            PayloadType::PowerModeResponse => {
                if len != 1 {
                    return Err(invalid(len));
                }
                Ok(Payload::PowerModeResponse {
                    power_mode: buf.get_u8(),
                })
            }
            PayloadType::DiagnosticMessage => {
                if len < 4 {
                    return Err(invalid(len));
                }
                let source_address = get_addr(&mut buf);
                let target_address = get_addr(&mut buf);
                Ok(Payload::DiagnosticMessage {
                    source_address,
                    target_address,
                    user_data: buf,
                })
            }
            PayloadType::DiagnosticPositiveAck => {
                if len < 5 {
                    return Err(invalid(len));
                }
                let source_address = get_addr(&mut buf);
                let target_address = get_addr(&mut buf);
                let ack_code = buf.get_u8();
                Ok(Payload::DiagnosticPositiveAck {
                    source_address,
                    target_address,
                    ack_code,
                    previous: buf,
                })
            }
            PayloadType::DiagnosticNegativeAck => {
                if len < 5 {
                    return Err(invalid(len));
                }
                let source_address = get_addr(&mut buf);
                let target_address = get_addr(&mut buf);
                let nack_code = buf.get_u8();
                Ok(Payload::DiagnosticNegativeAck {
                    source_address,
                    target_address,
                    nack_code,
                    previous: buf,
                })
            }
        }
    }

    /// Serialize just the payload bytes (no header)
    pub fn serialize(&self, buf: &mut impl BufMut) {
        match self {
            Payload::GenericNack { nack_code } => buf.put_u8(*nack_code),
            Payload::VehicleIdentificationRequest
            | Payload::AliveCheckRequest
            | Payload::EntityStatusRequest
            | Payload::PowerModeRequest => {}
            Payload::VehicleIdentificationRequestWithEid { eid } => buf.put_slice(&eid.0),
            Payload::VehicleIdentificationRequestWithVin { vin } => buf.put_slice(&vin.0),
            Payload::VehicleAnnouncement {
                vin,
                logical_address,
                eid,
                gid,
                further_action,
                sync_status,
            } => {
                buf.put_slice(&vin.0);
                buf.put_u16(logical_address.value());
                buf.put_slice(&eid.0);
                buf.put_slice(&gid.0);
                buf.put_u8(*further_action);
                if let Some(sync) = sync_status {
                    buf.put_u8(*sync);
                }
            }
            Payload::RoutingActivationRequest {
                source_address,
                activation_type,
                reserved,
                oem,
            } => {
                buf.put_u16(source_address.value());
                buf.put_u8(*activation_type);
                buf.put_slice(reserved);
                if let Some(oem) = oem {
                    buf.put_slice(oem);
                }
            }
            Payload::RoutingActivationResponse {
                tester_address,
                entity_address,
                response_code,
                reserved,
                oem,
            } => {
                buf.put_u16(tester_address.value());
                buf.put_u16(entity_address.value());
                buf.put_u8(*response_code);
                buf.put_slice(reserved);
                if let Some(oem) = oem {
                    buf.put_slice(oem);
                }
            }
            Payload::AliveCheckResponse { source_address } => {
                buf.put_u16(source_address.value());
            }
            Payload::EntityStatusResponse {
                node_type,
                max_open_sockets,
                open_sockets,
                max_data_size,
            } => {
                buf.put_u8(*node_type);
                buf.put_u8(*max_open_sockets);
                buf.put_u8(*open_sockets);
                if let Some(mds) = max_data_size {
                    buf.put_u32(*mds);
                }
            }
            Payload::PowerModeResponse { power_mode } => buf.put_u8(*power_mode),
            Payload::DiagnosticMessage {
                source_address,
                target_address,
                user_data,
            } => {
                buf.put_u16(source_address.value());
                buf.put_u16(target_address.value());
                buf.put_slice(user_data);
            }
            Payload::DiagnosticPositiveAck {
                source_address,
                target_address,
                ack_code,
                previous,
            } => {
                buf.put_u16(source_address.value());
                buf.put_u16(target_address.value());
                buf.put_u8(*ack_code);
                buf.put_slice(previous);
            }
            Payload::DiagnosticNegativeAck {
                source_address,
                target_address,
                nack_code,
                previous,
            } => {
                buf.put_u16(source_address.value());
                buf.put_u16(target_address.value());
                buf.put_u8(*nack_code);
                buf.put_slice(previous);
            }
        }
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

/// A complete DoIP message (header + decoded payload)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol_version: u8,
    pub payload: Payload,
}

impl Message {
    /// Build a message with the version this engine emits for the payload's
    /// family (0xFF for the identification family, 0x02 otherwise).
    pub fn new(payload: Payload) -> Self {
        let protocol_version = if payload.payload_type().is_identification() {
            PROTOCOL_VERSION_DEFAULT
        } else {
            PROTOCOL_VERSION
        };
        Self {
            protocol_version,
            payload,
        }
    }

    /// Build a message with an explicit protocol version
    pub fn with_version(protocol_version: u8, payload: Payload) -> Self {
        Self {
            protocol_version,
            payload,
        }
    }

    /// Decode a complete message (header + payload) from a buffer.
    ///
    /// Returns [`DecodeError::Truncated`] when the buffer holds fewer bytes
    /// than the header promises; stream callers should wait for more data,
    /// datagram callers should drop.
    pub fn decode(buf: &mut Bytes, max_payload_size: u32) -> Result<Self, DecodeError> {
        let header = Header::parse(buf).ok_or(DecodeError::Truncated)?;
        let payload_type = header.validate(max_payload_size)?;
        if (buf.remaining() as u64) < u64::from(header.payload_length) {
            return Err(DecodeError::Truncated);
        }
        let payload_bytes = buf.copy_to_bytes(header.payload_length as usize);
        let payload = Payload::decode(payload_type, payload_bytes)?;
        Ok(Self {
            protocol_version: header.protocol_version,
            payload,
        })
    }

    /// Serialize header + payload to a fresh buffer
    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload.encoded_len();
        let header = Header::new(self.protocol_version, self.payload.payload_type(), payload_len);
        let mut buf = BytesMut::with_capacity(Header::SIZE + payload_len as usize);
        header.serialize(&mut buf);
        self.payload.serialize(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Payload) -> Message {
        let msg = Message::new(payload);
        let encoded = msg.encode();
        assert_eq!(
            encoded.len(),
            Header::SIZE + msg.payload.encoded_len() as usize
        );
        let mut cursor = encoded;
        let decoded = Message::decode(&mut cursor, DEFAULT_MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(msg, decoded);
        assert!(cursor.is_empty());
        decoded
    }

    #[test_log::test]
    fn header_roundtrip() {
        let header = Header::new(PROTOCOL_VERSION, PayloadType::DiagnosticMessage, 7);
        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), Header::SIZE);

        let mut cursor = buf.freeze();
        let parsed = Header::parse(&mut cursor).unwrap();
        assert_eq!(header, parsed);
        assert_eq!(
            parsed.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap(),
            PayloadType::DiagnosticMessage
        );
    }

    #[test_log::test]
    fn header_rejects_short_input() {
        let mut short = Bytes::from_static(&[0x02, 0xFD, 0x80]);
        assert!(Header::parse(&mut short).is_none());
    }

    #[test_log::test]
    fn header_rejects_bad_inverse_version() {
        // Inverse off by one
        let header = Header {
            protocol_version: 0x02,
            inverse_protocol_version: 0xFC,
            payload_type: 0x8001,
            payload_length: 0,
        };
        assert!(matches!(
            header.validate(DEFAULT_MAX_PAYLOAD_SIZE),
            Err(DecodeError::IncorrectPatternFormat { .. })
        ));
    }

    #[test_log::test]
    fn header_rejects_unsupported_version() {
        let header = Header {
            protocol_version: 0x01,
            inverse_protocol_version: !0x01,
            payload_type: 0x8001,
            payload_length: 0,
        };
        assert!(matches!(
            header.validate(DEFAULT_MAX_PAYLOAD_SIZE),
            Err(DecodeError::IncorrectPatternFormat { .. })
        ));
    }

    #[test_log::test]
    fn default_version_only_valid_for_identification_family() {
        let ident = Header {
            protocol_version: PROTOCOL_VERSION_DEFAULT,
            inverse_protocol_version: !PROTOCOL_VERSION_DEFAULT,
            payload_type: PayloadType::VehicleIdentificationRequest as u16,
            payload_length: 0,
        };
        assert_eq!(
            ident.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap(),
            PayloadType::VehicleIdentificationRequest
        );

        let diag = Header {
            protocol_version: PROTOCOL_VERSION_DEFAULT,
            inverse_protocol_version: !PROTOCOL_VERSION_DEFAULT,
            payload_type: PayloadType::DiagnosticMessage as u16,
            payload_length: 4,
        };
        assert!(matches!(
            diag.validate(DEFAULT_MAX_PAYLOAD_SIZE),
            Err(DecodeError::IncorrectPatternFormat { .. })
        ));
    }

    #[test_log::test]
    fn header_rejects_unknown_payload_type() {
        let header = Header::new(PROTOCOL_VERSION, PayloadType::DiagnosticMessage, 0);
        let header = Header {
            payload_type: 0x1234,
            ..header
        };
        assert_eq!(
            header.validate(DEFAULT_MAX_PAYLOAD_SIZE),
            Err(DecodeError::UnknownPayloadType {
                payload_type: 0x1234
            })
        );
    }

    #[test_log::test]
    fn payload_length_boundary() {
        // Exactly the maximum is fine, one more is rejected
        let at_max = Header::new(PROTOCOL_VERSION, PayloadType::DiagnosticMessage, 100);
        assert!(at_max.validate(100).is_ok());

        let over = Header::new(PROTOCOL_VERSION, PayloadType::DiagnosticMessage, 101);
        assert_eq!(
            over.validate(100),
            Err(DecodeError::MessageTooLarge {
                payload_length: 101,
                max: 100
            })
        );
        assert_eq!(
            over.validate(100).unwrap_err().nack_code(),
            Some(NackCode::MessageTooLarge)
        );
    }

    #[test_log::test]
    fn routing_activation_request_roundtrip() {
        roundtrip(Payload::RoutingActivationRequest {
            source_address: LogicalAddress::new(0x0E80),
            activation_type: ACTIVATION_TYPE_DEFAULT,
            reserved: [0; 4],
            oem: None,
        });
        roundtrip(Payload::RoutingActivationRequest {
            source_address: LogicalAddress::new(0x0E80),
            activation_type: 0x01,
            reserved: [0xAA; 4],
            oem: Some([1, 2, 3, 4]),
        });
    }

    #[test_log::test]
    fn routing_activation_response_roundtrip() {
        let msg = roundtrip(Payload::RoutingActivationResponse {
            tester_address: LogicalAddress::new(0x0001),
            entity_address: LogicalAddress::new(0xFA25),
            response_code: activation_code::SUCCESS,
            reserved: [0; 4],
            oem: None,
        });
        // Non-identification messages carry the 2012 version
        assert_eq!(msg.protocol_version, PROTOCOL_VERSION_2012);
    }

    #[test_log::test]
    fn vehicle_announcement_roundtrip_both_forms() {
        let vin = Vin::parse("ABCDEFGH123456789").unwrap();
        let eid = Eid([0x00, 0x02, 0x36, 0x31, 0x00, 0x1c]);
        let gid = Gid([0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f]);

        let without_sync = roundtrip(Payload::VehicleAnnouncement {
            vin,
            logical_address: LogicalAddress::new(0xFA25),
            eid,
            gid,
            further_action: 0x00,
            sync_status: None,
        });
        assert_eq!(without_sync.payload.encoded_len(), 32);

        let with_sync = roundtrip(Payload::VehicleAnnouncement {
            vin,
            logical_address: LogicalAddress::new(0xFA25),
            eid,
            gid,
            further_action: 0x00,
            sync_status: Some(0x00),
        });
        assert_eq!(with_sync.payload.encoded_len(), 33);
    }

    #[test_log::test]
    fn identification_request_uses_default_version() {
        let msg = Message::new(Payload::VehicleIdentificationRequest);
        let encoded = msg.encode();
        assert_eq!(encoded[0], PROTOCOL_VERSION_DEFAULT);
        assert_eq!(encoded[1], !PROTOCOL_VERSION_DEFAULT);
        assert_eq!(&encoded[2..4], &[0x00, 0x01]);
        assert_eq!(&encoded[4..8], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test_log::test]
    fn identification_request_with_vin_roundtrip() {
        roundtrip(Payload::VehicleIdentificationRequestWithVin {
            vin: Vin::parse("ABCDEFGH123456789").unwrap(),
        });
        roundtrip(Payload::VehicleIdentificationRequestWithEid {
            eid: Eid([1, 2, 3, 4, 5, 6]),
        });
    }

    #[test_log::test]
    fn diagnostic_message_wire_layout() {
        let msg = Message::new(Payload::DiagnosticMessage {
            source_address: LogicalAddress::new(0x0E80),
            target_address: LogicalAddress::new(0xFA25),
            user_data: Bytes::from_static(&[0x22, 0xF1, 0x90]),
        });
        let encoded = msg.encode();
        assert_eq!(
            &encoded[..],
            &[
                0x02, 0xFD, // version + inverse
                0x80, 0x01, // diagnostic message
                0x00, 0x00, 0x00, 0x07, // payload length
                0x0E, 0x80, // source
                0xFA, 0x25, // target
                0x22, 0xF1, 0x90, // UDS request
            ]
        );
    }

    #[test_log::test]
    fn diagnostic_message_rejects_short_payload() {
        assert!(matches!(
            Payload::decode(
                PayloadType::DiagnosticMessage,
                Bytes::from_static(&[0x0E, 0x80, 0xFA])
            ),
            Err(DecodeError::InvalidPayloadLength { .. })
        ));
    }

    #[test_log::test]
    fn diagnostic_acks_roundtrip() {
        roundtrip(Payload::DiagnosticPositiveAck {
            source_address: LogicalAddress::new(0xFA25),
            target_address: LogicalAddress::new(0x0E80),
            ack_code: diag_ack_code::ACK,
            previous: Bytes::from_static(&[0x22, 0xF1, 0x90]),
        });
        roundtrip(Payload::DiagnosticNegativeAck {
            source_address: LogicalAddress::new(0xFA25),
            target_address: LogicalAddress::new(0x0E80),
            nack_code: diag_ack_code::UNKNOWN_TARGET_ADDRESS,
            previous: Bytes::new(),
        });
    }

    #[test_log::test]
    fn alive_check_roundtrip() {
        roundtrip(Payload::AliveCheckRequest);
        roundtrip(Payload::AliveCheckResponse {
            source_address: LogicalAddress::new(0x0E80),
        });
    }

    #[test_log::test]
    fn entity_status_and_power_mode_roundtrip() {
        roundtrip(Payload::EntityStatusRequest);
        roundtrip(Payload::EntityStatusResponse {
            node_type: 0x00,
            max_open_sockets: 4,
            open_sockets: 1,
            max_data_size: Some(0xFFFF),
        });
        roundtrip(Payload::PowerModeRequest);
        roundtrip(Payload::PowerModeResponse { power_mode: 0x01 });
    }

    #[test_log::test]
    fn generic_nack_roundtrip() {
        roundtrip(Payload::GenericNack {
            nack_code: NackCode::IncorrectPatternFormat as u8,
        });
    }

    #[test_log::test]
    fn decode_reports_truncated_stream() {
        let msg = Message::new(Payload::DiagnosticMessage {
            source_address: LogicalAddress::new(0x0E80),
            target_address: LogicalAddress::new(0xFA25),
            user_data: Bytes::from_static(&[0x10, 0x03]),
        });
        let encoded = msg.encode();

        // Header only
        let mut partial = encoded.slice(..Header::SIZE);
        assert_eq!(
            Message::decode(&mut partial, DEFAULT_MAX_PAYLOAD_SIZE),
            Err(DecodeError::Truncated)
        );

        // Header + half the payload
        let mut partial = encoded.slice(..Header::SIZE + 3);
        assert_eq!(
            Message::decode(&mut partial, DEFAULT_MAX_PAYLOAD_SIZE),
            Err(DecodeError::Truncated)
        );
    }

    #[test_log::test]
    fn announcement_rejects_wrong_width() {
        assert!(matches!(
            Payload::decode(PayloadType::VehicleAnnouncement, Bytes::from_static(&[0u8; 31])),
            Err(DecodeError::InvalidPayloadLength { .. })
        ));
        assert!(matches!(
            Payload::decode(PayloadType::VehicleAnnouncement, Bytes::from_static(&[0u8; 34])),
            Err(DecodeError::InvalidPayloadLength { .. })
        ));
    }
}
