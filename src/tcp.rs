//! TCP (Transmission Control Protocol).
//!
//! Segment parsing/construction with the IPv4 pseudo-header checksum, and
//! the connection state machine expressed as a pure transition function so
//! the socket layer can apply its effects under the socket lock.
//!
//! # TCP Header Format (RFC 793)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Source Port           |       Destination Port        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                        Sequence Number                        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                     Acknowledgment Number                     |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Data  |       |U|A|P|R|S|F|                                   |
//! | Offs  | Resv  |R|C|S|S|Y|I|            Window                 |
//! |       |       |G|K|H|T|N|N|                                   |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |           Checksum            |         Urgent Pointer        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! Only the 20-byte fixed header is emitted (`data_offset == 5`, no
//! options). Received options are skipped over, not interpreted.
//!
//! # References
//! - RFC 793: Transmission Control Protocol

use alloc::vec::Vec;

use crate::ipv4::{compute_checksum, Ipv4Addr};

/// TCP header minimum length in bytes (without options)
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// TCP header maximum length in bytes (with max options)
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// TCP protocol number (for IPv4)
pub const TCP_PROTO: u8 = 6;

/// Receive window advertised on every emitted segment.
pub const TCP_WINDOW_SIZE: u16 = 1024;

// ============================================================================
// TCP Flags
// ============================================================================

/// FIN flag - sender has finished sending
pub const TCP_FLAG_FIN: u8 = 0x01;
/// SYN flag - synchronize sequence numbers
pub const TCP_FLAG_SYN: u8 = 0x02;
/// RST flag - reset the connection
pub const TCP_FLAG_RST: u8 = 0x04;
/// PSH flag - push function
pub const TCP_FLAG_PSH: u8 = 0x08;
/// ACK flag - acknowledgment field is significant
pub const TCP_FLAG_ACK: u8 = 0x10;
/// URG flag - urgent pointer field is significant
pub const TCP_FLAG_URG: u8 = 0x20;

// ============================================================================
// TCP State Machine
// ============================================================================

/// TCP connection state per RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// No connection state at all
    Closed,
    /// Waiting for a connection request from any remote TCP
    Listen,
    /// Waiting for a matching connection request after having sent one
    SynSent,
    /// Waiting for confirming connection request acknowledgment
    SynReceived,
    /// Open connection, data can be exchanged
    Established,
    /// Waiting for a connection termination request from remote TCP
    /// (after local close)
    FinWait1,
    /// Waiting for a connection termination request from remote TCP
    FinWait2,
    /// Waiting for a connection termination request from local user
    CloseWait,
    /// Waiting for connection termination request acknowledgment from remote TCP
    Closing,
    /// Waiting for acknowledgment of connection termination request
    LastAck,
    /// Waiting out the quiet period after both sides have finished
    TimeWait,
}

impl TcpState {
    /// Check whether the connection reports as disconnected to callers.
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            TcpState::Closed
                | TcpState::CloseWait
                | TcpState::LastAck
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::TimeWait
        )
    }
}

// ============================================================================
// TCP Header
// ============================================================================

/// Parsed TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq_num: u32,
    /// Acknowledgment number (valid if ACK flag set)
    pub ack_num: u32,
    /// Data offset in 32-bit words (5-15)
    pub data_offset: u8,
    /// Control flags (FIN, SYN, RST, PSH, ACK, URG)
    pub flags: u8,
    /// Receive window size
    pub window: u16,
    /// Checksum
    pub checksum: u16,
    /// Urgent pointer (valid if URG flag set)
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Create a new header with no options (`data_offset == 5`).
    pub fn new(
        src_port: u16,
        dst_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u8,
        window: u16,
    ) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            data_offset: 5,
            flags,
            window,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Get the header length in bytes
    #[inline]
    pub fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    /// Check if SYN flag is set
    #[inline]
    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    /// Check if ACK flag is set
    #[inline]
    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    /// Check if FIN flag is set
    #[inline]
    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    /// Check if RST flag is set
    #[inline]
    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    /// Serialize the header to its 20-byte fixed wire form.
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_MIN_LEN] {
        let mut bytes = [0u8; TCP_HEADER_MIN_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        bytes[12] = self.data_offset << 4;
        bytes[13] = self.flags;
        bytes[14..16].copy_from_slice(&self.window.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }
}

// ============================================================================
// TCP Errors
// ============================================================================

/// Errors that can occur during TCP parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    /// Segment is too short for its header
    Truncated,
    /// Data offset below the 20-byte minimum
    InvalidHeaderLen,
    /// Checksum over pseudo-header + segment did not verify
    BadChecksum,
}

/// Parse a TCP header from the start of a segment.
pub fn parse_tcp_header(data: &[u8]) -> Result<TcpHeader, TcpError> {
    if data.len() < TCP_HEADER_MIN_LEN {
        return Err(TcpError::Truncated);
    }

    let data_offset = (data[12] >> 4) & 0x0f;
    if data_offset < 5 {
        return Err(TcpError::InvalidHeaderLen);
    }
    let header_len = (data_offset as usize) * 4;
    if data.len() < header_len {
        return Err(TcpError::Truncated);
    }

    Ok(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

// ============================================================================
// Checksum (RFC 793 pseudo-header)
// ============================================================================

/// Compute the TCP checksum over the IPv4 pseudo-header and segment.
///
/// The pseudo-header is: source address, destination address, a zero byte,
/// the protocol number (6), and the big-endian TCP length (header+payload).
pub fn compute_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.0);
    pseudo[4..8].copy_from_slice(&dst_ip.0);
    pseudo[8] = 0;
    pseudo[9] = TCP_PROTO;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    // Combine the two partial one's-complement sums.
    let mut sum = (!compute_checksum(&pseudo, pseudo.len()) as u32)
        .wrapping_add(!compute_checksum(segment, segment.len()) as u32);
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Verify a received segment's checksum (zero result means valid).
pub fn verify_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> bool {
    compute_tcp_checksum(src_ip, dst_ip, segment) == 0
}

/// Build a complete TCP segment (fixed header + payload) with its checksum.
pub fn build_tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let header = TcpHeader::new(src_port, dst_port, seq_num, ack_num, flags, window);
    let mut segment = Vec::with_capacity(TCP_HEADER_MIN_LEN + payload.len());
    segment.extend_from_slice(&header.to_bytes());
    segment.extend_from_slice(payload);

    let checksum = compute_tcp_checksum(src_ip, dst_ip, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());

    segment
}

// ============================================================================
// State Transition Function
// ============================================================================

/// The parts of a received segment the state machine looks at.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSummary {
    /// Control flags
    pub flags: u8,
    /// Sequence number
    pub seq_num: u32,
    /// Payload length in bytes
    pub payload_len: u32,
}

impl SegmentSummary {
    /// Check if FIN flag is set
    #[inline]
    pub fn has_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }
}

/// An effect the socket layer must apply, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpAction {
    /// Set the socket's acknowledgment number
    SetAck(u32),
    /// Emit a segment carrying these flags
    Reply(u8),
    /// Deliver the segment payload to the receive queue
    Deliver,
    /// Update the connected flag (waking connect blockers)
    SetConnected(bool),
}

/// Result of running the state machine on one received segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTransition {
    /// State the socket moves to
    pub next_state: TcpState,
    /// Effects to apply, in order
    pub actions: Vec<TcpAction>,
}

impl TcpTransition {
    fn stay(state: TcpState) -> Self {
        TcpTransition {
            next_state: state,
            actions: Vec::new(),
        }
    }

    fn reset() -> Self {
        TcpTransition {
            next_state: TcpState::Closed,
            actions: alloc::vec![TcpAction::Reply(TCP_FLAG_RST)],
        }
    }
}

/// Compute the transition for a segment that already passed the ack guard.
///
/// Flags are compared for exact equality except in Established, where only
/// the FIN bit is examined. `SetAck` values follow the received sequence
/// number plus payload length, plus one where the segment consumes a
/// sequence number (SYN or FIN handling); the Established data path
/// acknowledges without the extra one.
pub fn segment_transition(state: TcpState, seg: &SegmentSummary) -> TcpTransition {
    use TcpAction::*;
    use TcpState::*;

    // Sequence number following the received payload.
    let n = seg.seq_num.wrapping_add(seg.payload_len);
    let n1 = n.wrapping_add(1);

    match state {
        Closed | TimeWait => TcpTransition::reset(),

        Listen => {
            // Incoming connections are not accepted; every segment is
            // dropped without a reply.
            TcpTransition::stay(Listen)
        }

        SynSent => match seg.flags {
            TCP_FLAG_SYN => TcpTransition {
                next_state: SynReceived,
                actions: alloc::vec![SetAck(n1), Reply(TCP_FLAG_ACK)],
            },
            f if f == TCP_FLAG_SYN | TCP_FLAG_ACK => TcpTransition {
                next_state: Established,
                actions: alloc::vec![SetAck(n1), Reply(TCP_FLAG_ACK), SetConnected(true)],
            },
            _ => TcpTransition::reset(),
        },

        SynReceived => match seg.flags {
            TCP_FLAG_ACK => TcpTransition {
                next_state: Established,
                actions: alloc::vec![SetAck(n1), SetConnected(true)],
            },
            _ => TcpTransition::reset(),
        },

        Established => {
            if seg.has_fin() {
                let mut actions = Vec::new();
                if seg.payload_len != 0 {
                    actions.push(Deliver);
                }
                actions.push(SetAck(n1));
                actions.push(Reply(TCP_FLAG_ACK));
                actions.push(SetConnected(false));
                TcpTransition {
                    next_state: CloseWait,
                    actions,
                }
            } else {
                let mut actions = alloc::vec![SetAck(n), Reply(TCP_FLAG_ACK)];
                if seg.payload_len != 0 {
                    actions.push(Deliver);
                }
                TcpTransition {
                    next_state: Established,
                    actions,
                }
            }
        }

        FinWait1 => match seg.flags {
            TCP_FLAG_ACK => TcpTransition {
                next_state: FinWait2,
                actions: alloc::vec![SetAck(n1)],
            },
            TCP_FLAG_FIN => TcpTransition {
                next_state: Closing,
                actions: alloc::vec![SetAck(n1)],
            },
            _ => TcpTransition::reset(),
        },

        FinWait2 => match seg.flags {
            TCP_FLAG_FIN => TcpTransition {
                next_state: TimeWait,
                actions: alloc::vec![SetAck(n1)],
            },
            _ => TcpTransition::reset(),
        },

        Closing => match seg.flags {
            TCP_FLAG_ACK => TcpTransition {
                next_state: TimeWait,
                actions: alloc::vec![SetAck(n1)],
            },
            _ => TcpTransition::reset(),
        },

        CloseWait => TcpTransition::reset(),

        LastAck => match seg.flags {
            TCP_FLAG_ACK => TcpTransition {
                next_state: Closed,
                actions: alloc::vec![SetAck(n1)],
            },
            _ => TcpTransition::reset(),
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
