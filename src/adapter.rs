//! Network adapter abstraction.
//!
//! The `Adapter` trait is the boundary between the protocol stack and the
//! device drivers. A driver supplies its link identity, a non-blocking RX
//! queue, and a raw frame transmit; the trait's provided methods do the
//! Ethernet and IPv4 framing so every driver transmits the same wire format.
//!
//! The loopback pseudo-adapter is the one in-crate implementation; hardware
//! drivers (e1000-class, virtio-class) live with the rest of the device
//! code and implement the same trait.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

use crate::arp::{serialize_arp, ArpPacket};
use crate::buffer::PacketBuffer;
use crate::ethernet::{build_ethernet_frame, EthAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::ipv4::{build_ipv4_packet, Ipv4Addr, Ipv4Proto};
use crate::socket::WaitQueue;

// ============================================================================
// Adapter Trait
// ============================================================================

/// Contract between the network task/socket layer and a device driver.
///
/// # RX path
///
/// The driver enqueues complete received frames; `dequeue_packet` hands them
/// to the network task one at a time and never blocks. After enqueuing, the
/// driver wakes the stack's RX wait queue so the task leaves its idle wait.
///
/// # TX path
///
/// `transmit` sends one complete Ethernet frame. The provided `send` and
/// `send_ipv4` methods build the framing; `send_ipv4` resolves the next-hop
/// MAC itself when the caller passes the unspecified address, via
/// `resolve_mac` (drivers typically consult the ARP table they were
/// constructed with; the default falls back to broadcast).
pub trait Adapter: Send + Sync {
    /// Device name (e.g. "lo", "eth0").
    fn name(&self) -> &str;

    /// The adapter's MAC address.
    fn mac_address(&self) -> EthAddr;

    /// The adapter's IPv4 address (unspecified if not yet assigned).
    fn ipv4_address(&self) -> Ipv4Addr;

    /// Assign the adapter's IPv4 address.
    fn set_ipv4_address(&self, ip: Ipv4Addr);

    /// Check whether received frames are waiting.
    fn has_queued_packets(&self) -> bool;

    /// Take one received frame, if any. Never blocks.
    fn dequeue_packet(&self) -> Option<PacketBuffer>;

    /// Transmit one complete Ethernet frame.
    fn transmit(&self, frame: &[u8]);

    /// Resolve a destination IPv4 address to a next-hop MAC.
    fn resolve_mac(&self, _dst_ip: Ipv4Addr) -> EthAddr {
        EthAddr::BROADCAST
    }

    /// Send an ARP packet directly to `dst_mac`, bypassing IPv4.
    fn send(&self, dst_mac: EthAddr, packet: &ArpPacket) {
        let payload = serialize_arp(packet);
        let frame = build_ethernet_frame(dst_mac, self.mac_address(), ETHERTYPE_ARP, &payload);
        self.transmit(&frame);
    }

    /// Send an IPv4 packet; `payload` starts at the L4 header.
    ///
    /// Passing `EthAddr::UNSPECIFIED` as `dst_mac` asks the adapter to
    /// resolve the next hop itself.
    fn send_ipv4(&self, dst_mac: EthAddr, dst_ip: Ipv4Addr, proto: Ipv4Proto, payload: &[u8]) {
        let dst_mac = if dst_mac.is_unspecified() {
            self.resolve_mac(dst_ip)
        } else {
            dst_mac
        };
        let packet = build_ipv4_packet(self.ipv4_address(), dst_ip, proto, payload);
        let frame = build_ethernet_frame(dst_mac, self.mac_address(), ETHERTYPE_IPV4, &packet);
        self.transmit(&frame);
    }
}

// ============================================================================
// Loopback Adapter
// ============================================================================

/// The loopback pseudo-adapter (127.0.0.1).
///
/// Everything transmitted is requeued as received, so locally addressed
/// traffic flows through the same demux path as wire traffic.
pub struct LoopbackAdapter {
    ip: Mutex<Ipv4Addr>,
    rx_queue: Mutex<VecDeque<PacketBuffer>>,
    rx_signal: Arc<WaitQueue>,
}

impl LoopbackAdapter {
    /// Create a loopback adapter that wakes `rx_signal` on enqueue.
    pub fn new(rx_signal: Arc<WaitQueue>) -> Self {
        LoopbackAdapter {
            ip: Mutex::new(Ipv4Addr::LOCALHOST),
            rx_queue: Mutex::new(VecDeque::new()),
            rx_signal,
        }
    }
}

impl Adapter for LoopbackAdapter {
    fn name(&self) -> &str {
        "lo"
    }

    fn mac_address(&self) -> EthAddr {
        EthAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
    }

    fn ipv4_address(&self) -> Ipv4Addr {
        *self.ip.lock()
    }

    fn set_ipv4_address(&self, ip: Ipv4Addr) {
        *self.ip.lock() = ip;
    }

    fn has_queued_packets(&self) -> bool {
        !self.rx_queue.lock().is_empty()
    }

    fn dequeue_packet(&self) -> Option<PacketBuffer> {
        self.rx_queue.lock().pop_front()
    }

    fn transmit(&self, frame: &[u8]) {
        self.rx_queue
            .lock()
            .push_back(PacketBuffer::copy_from_slice(frame));
        self.rx_signal.wake_all();
    }

    fn resolve_mac(&self, _dst_ip: Ipv4Addr) -> EthAddr {
        self.mac_address()
    }
}

// ============================================================================
// Test Adapter
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::parse_ethernet;
    use crate::ipv4::parse_ipv4;

    #[test]
    fn test_loopback_requeues_tx_as_rx() {
        let signal = Arc::new(WaitQueue::new());
        let lo = LoopbackAdapter::new(signal);
        assert!(!lo.has_queued_packets());

        lo.send_ipv4(
            EthAddr::UNSPECIFIED,
            Ipv4Addr::LOCALHOST,
            Ipv4Proto::Udp,
            b"ping",
        );

        assert!(lo.has_queued_packets());
        let frame = lo.dequeue_packet().unwrap();
        assert!(!lo.has_queued_packets());

        let (eth, ip_bytes) = parse_ethernet(frame.data()).unwrap();
        assert_eq!(eth.ethertype, ETHERTYPE_IPV4);
        assert_eq!(eth.dst, lo.mac_address());

        let (ip_hdr, payload) = parse_ipv4(ip_bytes).unwrap();
        assert_eq!(ip_hdr.src, Ipv4Addr::LOCALHOST);
        assert_eq!(ip_hdr.dst, Ipv4Addr::LOCALHOST);
        assert_eq!(payload, b"ping");
    }

    #[test]
    fn test_send_ipv4_resolves_unspecified_mac() {
        use super::testing::TestAdapter;

        let adapter = TestAdapter::new(
            "eth0",
            EthAddr([0x52, 0x54, 0, 0x12, 0x34, 0x56]),
            Ipv4Addr::new(192, 168, 5, 2),
        );
        adapter.send_ipv4(
            EthAddr::UNSPECIFIED,
            Ipv4Addr::new(192, 168, 5, 1),
            Ipv4Proto::Tcp,
            &[],
        );

        let frame = adapter.last_transmitted().unwrap();
        let (eth, _) = parse_ethernet(&frame).unwrap();
        // Default resolution falls back to broadcast.
        assert_eq!(eth.dst, EthAddr::BROADCAST);
        assert_eq!(eth.src, adapter.mac_address());
    }
}
