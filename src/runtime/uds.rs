//! # UDS Transport Helpers
//!
//! The pieces of ISO 14229 the transport has to understand: nothing about
//! service semantics, only the negative-response framing that affects
//! timing. Service IDs and parameters are opaque bytes to this engine.

use crate::error::UdsError;

/// First byte of a UDS negative response
pub(crate) const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// NRC "requestCorrectlyReceived-ResponsePending": the server needs more
/// time; the response timer is extended without re-sending the request.
pub(crate) const NRC_RESPONSE_PENDING: u8 = 0x78;

/// Validate a request payload before it is wrapped into a diagnostic
/// message. The transport only requires that there is at least a service
/// ID byte.
pub(crate) fn validate_request(request: &[u8]) -> Result<(), UdsError> {
    if request.is_empty() {
        return Err(UdsError::EmptyRequest);
    }
    Ok(())
}

/// Check whether a diagnostic response is a response-pending negative
/// response (`7F <sid> 78`). Such a response restarts the response timer
/// with the extended deadline and is never delivered to the caller.
pub(crate) fn is_response_pending(user_data: &[u8]) -> bool {
    user_data.len() == 3
        && user_data[0] == NEGATIVE_RESPONSE_SID
        && user_data[2] == NRC_RESPONSE_PENDING
}

/// Check whether an ack's echo of the previous diagnostic message refers to
/// the request we have in flight. ISO 13400-2 allows the echo to be
/// truncated (or empty), so prefix equality is the strongest check possible.
pub(crate) fn ack_matches_request(previous: &[u8], request: &[u8]) -> bool {
    previous.len() <= request.len() && request.starts_with(previous)
}
