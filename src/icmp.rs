//! ICMPv4 echo handling.
//!
//! Header parsing and echo-reply construction. Only the echo message pair
//! is materialized; other ICMP types pass through to raw sockets untouched.
//!
//! # References
//! - RFC 792: Internet Control Message Protocol

use alloc::vec::Vec;

use crate::ipv4::compute_checksum;

/// ICMP header length (type + code + checksum)
pub const ICMP_HEADER_LEN: usize = 4;

/// Echo request/reply header length (header + identifier + sequence number)
pub const ICMP_ECHO_HEADER_LEN: usize = 8;

/// ICMP type: Echo Reply
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;

/// ICMP type: Echo Request
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

// ============================================================================
// ICMP Header
// ============================================================================

/// Parsed ICMP header (common prefix of every ICMP message)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    /// ICMP message type
    pub icmp_type: u8,
    /// Message code
    pub code: u8,
    /// Checksum over the whole ICMP message
    pub checksum: u16,
}

/// Parsed echo request/reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpEcho {
    /// Common header
    pub header: IcmpHeader,
    /// Echo identifier
    pub identifier: u16,
    /// Echo sequence number
    pub sequence_number: u16,
}

/// Errors that can occur during ICMP parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Message is too short
    Truncated,
    /// Message is not an echo request/reply
    NotEcho,
}

/// Parse an ICMP message into its header and body.
///
/// # Returns
/// On success: (header, body_slice). The body borrows from `packet`.
pub fn parse_icmp(packet: &[u8]) -> Result<(IcmpHeader, &[u8]), IcmpError> {
    if packet.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }

    let hdr = IcmpHeader {
        icmp_type: packet[0],
        code: packet[1],
        checksum: u16::from_be_bytes([packet[2], packet[3]]),
    };

    Ok((hdr, &packet[ICMP_HEADER_LEN..]))
}

/// Parse an ICMP echo request/reply.
///
/// # Returns
/// On success: (echo, payload_slice). The payload borrows from `packet`.
pub fn parse_icmp_echo(packet: &[u8]) -> Result<(IcmpEcho, &[u8]), IcmpError> {
    let (header, _) = parse_icmp(packet)?;

    if header.icmp_type != ICMP_TYPE_ECHO_REQUEST && header.icmp_type != ICMP_TYPE_ECHO_REPLY {
        return Err(IcmpError::NotEcho);
    }
    if packet.len() < ICMP_ECHO_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }

    let echo = IcmpEcho {
        header,
        identifier: u16::from_be_bytes([packet[4], packet[5]]),
        sequence_number: u16::from_be_bytes([packet[6], packet[7]]),
    };

    Ok((echo, &packet[ICMP_ECHO_HEADER_LEN..]))
}

/// Build an echo reply from a received echo request.
///
/// Identifier, sequence number and payload are copied verbatim, the type is
/// flipped to EchoReply, the code zeroed and the checksum recomputed.
pub fn build_echo_reply(request: &[u8]) -> Result<Vec<u8>, IcmpError> {
    let (echo, payload) = parse_icmp_echo(request)?;
    if echo.header.icmp_type != ICMP_TYPE_ECHO_REQUEST {
        return Err(IcmpError::NotEcho);
    }

    let mut reply = Vec::with_capacity(ICMP_ECHO_HEADER_LEN + payload.len());
    reply.push(ICMP_TYPE_ECHO_REPLY);
    reply.push(0); // code
    reply.extend_from_slice(&[0, 0]); // checksum placeholder
    reply.extend_from_slice(&echo.identifier.to_be_bytes());
    reply.extend_from_slice(&echo.sequence_number.to_be_bytes());
    reply.extend_from_slice(payload);

    let checksum = compute_checksum(&reply, reply.len());
    reply[2..4].copy_from_slice(&checksum.to_be_bytes());

    Ok(reply)
}

/// Build an echo request (used by ping-style callers and tests).
pub fn build_echo_request(identifier: u16, sequence_number: u16, payload: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(ICMP_ECHO_HEADER_LEN + payload.len());
    request.push(ICMP_TYPE_ECHO_REQUEST);
    request.push(0); // code
    request.extend_from_slice(&[0, 0]); // checksum placeholder
    request.extend_from_slice(&identifier.to_be_bytes());
    request.extend_from_slice(&sequence_number.to_be_bytes());
    request.extend_from_slice(payload);

    let checksum = compute_checksum(&request, request.len());
    request[2..4].copy_from_slice(&checksum.to_be_bytes());

    request
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_reply_mirrors_request() {
        let request = build_echo_request(0x1234, 7, b"hello");
        let reply = build_echo_reply(&request).unwrap();

        let (echo, payload) = parse_icmp_echo(&reply).unwrap();
        assert_eq!(echo.header.icmp_type, ICMP_TYPE_ECHO_REPLY);
        assert_eq!(echo.header.code, 0);
        assert_eq!(echo.identifier, 0x1234);
        assert_eq!(echo.sequence_number, 7);
        assert_eq!(payload, b"hello");

        // Reply checksum verifies (sums to zero over the whole message).
        assert_eq!(compute_checksum(&reply, reply.len()), 0);
    }

    #[test]
    fn test_reply_only_from_request() {
        let reply = build_echo_request(1, 1, &[]);
        let mut not_request = reply;
        not_request[0] = ICMP_TYPE_ECHO_REPLY;
        assert_eq!(build_echo_reply(&not_request), Err(IcmpError::NotEcho));
    }

    #[test]
    fn test_truncated() {
        assert_eq!(parse_icmp(&[8, 0]), Err(IcmpError::Truncated));
        assert_eq!(
            parse_icmp_echo(&[8, 0, 0, 0, 0, 0]),
            Err(IcmpError::Truncated)
        );
    }

    #[test]
    fn test_empty_payload_echo() {
        let request = build_echo_request(9, 0, &[]);
        let reply = build_echo_reply(&request).unwrap();
        assert_eq!(reply.len(), ICMP_ECHO_HEADER_LEN);
        assert_eq!(compute_checksum(&reply, reply.len()), 0);
    }
}
