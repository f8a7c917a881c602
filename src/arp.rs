//! ARP (Address Resolution Protocol).
//!
//! Ethernet/IPv4 ARP packet parsing and construction, and the process-wide
//! IPv4-to-MAC table populated from received replies.
//!
//! # Packet Format (RFC 826)
//!
//! ```text
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |         Hardware Type         |         Protocol Type         |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |  HLen |  PLen |            Operation (1=Req, 2=Reply)         |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! |                    Sender Hardware Address (6 bytes)          |
//! |                    Sender Protocol Address (4 bytes)          |
//! |                    Target Hardware Address (6 bytes)          |
//! |                    Target Protocol Address (4 bytes)          |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! # References
//! - RFC 826: Ethernet Address Resolution Protocol

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;

use crate::ethernet::EthAddr;
use crate::ipv4::Ipv4Addr;

/// Hardware type: Ethernet
pub const HTYPE_ETHERNET: u16 = 1;

/// Protocol type: IPv4
pub const PTYPE_IPV4: u16 = 0x0800;

/// Hardware address length: Ethernet MAC (6 bytes)
pub const HLEN_ETHERNET: u8 = 6;

/// Protocol address length: IPv4 (4 bytes)
pub const PLEN_IPV4: u8 = 4;

/// ARP packet size for Ethernet/IPv4
pub const ARP_PACKET_LEN: usize = 28;

// ============================================================================
// ARP Operation Code
// ============================================================================

/// ARP operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    /// ARP Request (who-has)
    Request,
    /// ARP Reply (is-at)
    Reply,
}

impl ArpOp {
    /// Convert from raw opcode
    pub fn from_raw(op: u16) -> Option<Self> {
        match op {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }

    /// Convert to raw opcode
    pub fn to_raw(self) -> u16 {
        match self {
            ArpOp::Request => 1,
            ArpOp::Reply => 2,
        }
    }
}

// ============================================================================
// ARP Packet
// ============================================================================

/// Parsed ARP packet for Ethernet/IPv4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    /// ARP operation
    pub op: ArpOp,
    /// Sender hardware (MAC) address
    pub sender_hw: EthAddr,
    /// Sender protocol (IP) address
    pub sender_ip: Ipv4Addr,
    /// Target hardware (MAC) address
    pub target_hw: EthAddr,
    /// Target protocol (IP) address
    pub target_ip: Ipv4Addr,
}

/// Errors that can occur during ARP parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short
    Truncated,
    /// Hardware type is not Ethernet or address length is not 6
    InvalidHardwareType,
    /// Protocol type is not IPv4 or address length is not 4
    InvalidProtocolType,
    /// Operation code is neither request nor reply
    InvalidOpcode,
}

/// Parse and validate an Ethernet/IPv4 ARP packet.
pub fn parse_arp(packet: &[u8]) -> Result<ArpPacket, ArpError> {
    if packet.len() < ARP_PACKET_LEN {
        return Err(ArpError::Truncated);
    }

    let htype = u16::from_be_bytes([packet[0], packet[1]]);
    let ptype = u16::from_be_bytes([packet[2], packet[3]]);
    let hlen = packet[4];
    let plen = packet[5];
    let opcode = u16::from_be_bytes([packet[6], packet[7]]);

    if htype != HTYPE_ETHERNET || hlen != HLEN_ETHERNET {
        return Err(ArpError::InvalidHardwareType);
    }
    if ptype != PTYPE_IPV4 || plen != PLEN_IPV4 {
        return Err(ArpError::InvalidProtocolType);
    }

    let op = ArpOp::from_raw(opcode).ok_or(ArpError::InvalidOpcode)?;

    let mut sender_hw = [0u8; 6];
    let mut target_hw = [0u8; 6];
    sender_hw.copy_from_slice(&packet[8..14]);
    target_hw.copy_from_slice(&packet[18..24]);

    Ok(ArpPacket {
        op,
        sender_hw: EthAddr(sender_hw),
        sender_ip: Ipv4Addr([packet[14], packet[15], packet[16], packet[17]]),
        target_hw: EthAddr(target_hw),
        target_ip: Ipv4Addr([packet[24], packet[25], packet[26], packet[27]]),
    })
}

/// Serialize an ARP packet to its 28-byte wire form.
pub fn serialize_arp(packet: &ArpPacket) -> [u8; ARP_PACKET_LEN] {
    let mut bytes = [0u8; ARP_PACKET_LEN];
    bytes[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
    bytes[2..4].copy_from_slice(&PTYPE_IPV4.to_be_bytes());
    bytes[4] = HLEN_ETHERNET;
    bytes[5] = PLEN_IPV4;
    bytes[6..8].copy_from_slice(&packet.op.to_raw().to_be_bytes());
    bytes[8..14].copy_from_slice(&packet.sender_hw.0);
    bytes[14..18].copy_from_slice(&packet.sender_ip.0);
    bytes[18..24].copy_from_slice(&packet.target_hw.0);
    bytes[24..28].copy_from_slice(&packet.target_ip.0);
    bytes
}

/// Build a reply to a received request, with the sender/target roles swapped.
///
/// The sender fields carry our adapter's identity; the target fields carry
/// the requester's.
pub fn build_arp_reply(request: &ArpPacket, our_mac: EthAddr, our_ip: Ipv4Addr) -> ArpPacket {
    ArpPacket {
        op: ArpOp::Reply,
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: request.sender_hw,
        target_ip: request.sender_ip,
    }
}

/// Build a who-has request for `target_ip`.
pub fn build_arp_request(our_mac: EthAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> ArpPacket {
    ArpPacket {
        op: ArpOp::Request,
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: EthAddr::UNSPECIFIED,
        target_ip,
    }
}

// ============================================================================
// ARP Table
// ============================================================================

/// Process-wide IPv4 to MAC mapping, populated from received ARP replies.
///
/// Entries never expire and later replies overwrite earlier ones. All
/// operations go through the table's lock.
pub struct ArpTable {
    entries: Mutex<BTreeMap<Ipv4Addr, EthAddr>>,
}

impl ArpTable {
    /// Create an empty table.
    pub const fn new() -> Self {
        ArpTable {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Look up the MAC address for an IPv4 address.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<EthAddr> {
        self.entries.lock().get(&ip).copied()
    }

    /// Insert or overwrite a mapping.
    pub fn set(&self, ip: Ipv4Addr, mac: EthAddr) {
        self.entries.lock().insert(ip, mac);
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy out all entries (for inspection/diagnostics).
    pub fn snapshot(&self) -> Vec<(Ipv4Addr, EthAddr)> {
        self.entries
            .lock()
            .iter()
            .map(|(ip, mac)| (*ip, *mac))
            .collect()
    }
}

impl Default for ArpTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const REQUESTER_MAC: EthAddr = EthAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const REQUESTER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 1);
    const OUR_MAC: EthAddr = EthAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 2);

    #[test]
    fn test_serialize_parse_round_trip() {
        let request = build_arp_request(REQUESTER_MAC, REQUESTER_IP, OUR_IP);
        let bytes = serialize_arp(&request);
        let parsed = parse_arp(&bytes).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_reply_swaps_roles() {
        let request = build_arp_request(REQUESTER_MAC, REQUESTER_IP, OUR_IP);
        let reply = build_arp_reply(&request, OUR_MAC, OUR_IP);

        assert_eq!(reply.op, ArpOp::Reply);
        assert_eq!(reply.sender_hw, OUR_MAC);
        assert_eq!(reply.sender_ip, OUR_IP);
        assert_eq!(reply.target_hw, REQUESTER_MAC);
        assert_eq!(reply.target_ip, REQUESTER_IP);
    }

    #[test]
    fn test_parse_validation() {
        let request = build_arp_request(REQUESTER_MAC, REQUESTER_IP, OUR_IP);
        let good = serialize_arp(&request);

        assert_eq!(parse_arp(&good[..20]), Err(ArpError::Truncated));

        let mut bad_htype = good;
        bad_htype[1] = 9;
        assert_eq!(parse_arp(&bad_htype), Err(ArpError::InvalidHardwareType));

        let mut bad_ptype = good;
        bad_ptype[2] = 0x86;
        bad_ptype[3] = 0xdd;
        assert_eq!(parse_arp(&bad_ptype), Err(ArpError::InvalidProtocolType));

        let mut bad_op = good;
        bad_op[7] = 3;
        assert_eq!(parse_arp(&bad_op), Err(ArpError::InvalidOpcode));
    }

    #[test]
    fn test_table_insert_overwrite() {
        let table = ArpTable::new();
        assert!(table.is_empty());
        assert_eq!(table.lookup(REQUESTER_IP), None);

        table.set(REQUESTER_IP, REQUESTER_MAC);
        assert_eq!(table.lookup(REQUESTER_IP), Some(REQUESTER_MAC));
        assert_eq!(table.len(), 1);

        // A later reply for the same IP overwrites the mapping.
        table.set(REQUESTER_IP, OUR_MAC);
        assert_eq!(table.lookup(REQUESTER_IP), Some(OUR_MAC));
        assert_eq!(table.len(), 1);
    }
}
