//! Network stack context.
//!
//! One `NetStack` instance is created at boot and threaded through the
//! network task and the socket layer. It owns the adapter list, the ARP
//! table, the socket registry, the RX wakeup queue the task parks on, and
//! the stack-wide statistics.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

use crate::adapter::{Adapter, LoopbackAdapter};
use crate::arp::ArpTable;
use crate::buffer::PacketBuffer;
use crate::ipv4::Ipv4Addr;
use crate::socket::{SocketRegistry, WaitQueue};

/// IPv4 address assigned to the first hardware adapter at boot.
pub const DEFAULT_HARDWARE_IPV4: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 2);

// ============================================================================
// Statistics
// ============================================================================

/// Stack-wide statistics
#[derive(Debug, Default)]
pub struct NetStats {
    /// Frames dequeued by the network task
    pub rx_frames: AtomicU64,
    /// Frames dropped before protocol dispatch (too short, unknown type)
    pub rx_dropped: AtomicU64,
    /// ARP packets received
    pub arp_rx: AtomicU64,
    /// ARP replies transmitted
    pub arp_replies_tx: AtomicU64,
    /// IPv4 packets received
    pub ipv4_rx: AtomicU64,
    /// ICMP messages received
    pub icmp_rx: AtomicU64,
    /// ICMP echo replies transmitted
    pub icmp_echo_tx: AtomicU64,
    /// UDP datagrams delivered to a socket
    pub udp_delivered: AtomicU64,
    /// TCP segments received
    pub tcp_rx: AtomicU64,
    /// TCP segments dropped on checksum mismatch
    pub tcp_bad_checksum: AtomicU64,
    /// TCP segments dropped by the ack guard
    pub tcp_ack_mismatch: AtomicU64,
}

impl NetStats {
    /// Create zeroed counters.
    pub const fn new() -> Self {
        NetStats {
            rx_frames: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            arp_rx: AtomicU64::new(0),
            arp_replies_tx: AtomicU64::new(0),
            ipv4_rx: AtomicU64::new(0),
            icmp_rx: AtomicU64::new(0),
            icmp_echo_tx: AtomicU64::new(0),
            udp_delivered: AtomicU64::new(0),
            tcp_rx: AtomicU64::new(0),
            tcp_bad_checksum: AtomicU64::new(0),
            tcp_ack_mismatch: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc_rx_frames(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_arp_rx(&self) {
        self.arp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_arp_replies_tx(&self) {
        self.arp_replies_tx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_ipv4_rx(&self) {
        self.ipv4_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_icmp_rx(&self) {
        self.icmp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_icmp_echo_tx(&self) {
        self.icmp_echo_tx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_udp_delivered(&self) {
        self.udp_delivered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tcp_rx(&self) {
        self.tcp_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tcp_bad_checksum(&self) {
        self.tcp_bad_checksum.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_tcp_ack_mismatch(&self) {
        self.tcp_ack_mismatch.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Network Stack
// ============================================================================

/// The process-lifetime network stack context.
pub struct NetStack {
    loopback: Arc<LoopbackAdapter>,
    adapters: RwLock<Vec<Arc<dyn Adapter>>>,
    arp_table: ArpTable,
    sockets: Arc<SocketRegistry>,
    rx_wait: Arc<WaitQueue>,
    stats: NetStats,
}

impl NetStack {
    /// Create a stack with a loopback adapter and empty tables.
    pub fn new() -> Arc<NetStack> {
        let rx_wait = Arc::new(WaitQueue::new());
        let loopback = Arc::new(LoopbackAdapter::new(rx_wait.clone()));
        Arc::new(NetStack {
            loopback,
            adapters: RwLock::new(Vec::new()),
            arp_table: ArpTable::new(),
            sockets: SocketRegistry::new(),
            rx_wait,
            stats: NetStats::new(),
        })
    }

    /// Register a hardware adapter.
    ///
    /// The first adapter without an address receives the boot-time
    /// assignment (192.168.5.2).
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        let mut adapters = self.adapters.write();
        if adapters.is_empty() && adapter.ipv4_address().is_unspecified() {
            adapter.set_ipv4_address(DEFAULT_HARDWARE_IPV4);
        }
        adapters.push(adapter);
    }

    /// The loopback adapter.
    pub fn loopback(&self) -> &Arc<LoopbackAdapter> {
        &self.loopback
    }

    /// Snapshot of the registered hardware adapters.
    pub fn adapters(&self) -> Vec<Arc<dyn Adapter>> {
        self.adapters.read().clone()
    }

    /// The stack's ARP table.
    pub fn arp_table(&self) -> &ArpTable {
        &self.arp_table
    }

    /// The stack's socket registry.
    pub fn sockets(&self) -> &Arc<SocketRegistry> {
        &self.sockets
    }

    /// Wait queue signalled whenever an adapter enqueues a frame.
    pub fn rx_signal(&self) -> &Arc<WaitQueue> {
        &self.rx_wait
    }

    /// Stack statistics.
    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    /// Find the adapter that owns `addr` (loopback included).
    pub fn adapter_for_ipv4(&self, addr: Ipv4Addr) -> Option<Arc<dyn Adapter>> {
        if self.loopback.ipv4_address() == addr || addr.is_loopback() {
            return Some(self.loopback.clone() as Arc<dyn Adapter>);
        }
        self.adapters
            .read()
            .iter()
            .find(|adapter| adapter.ipv4_address() == addr)
            .cloned()
    }

    /// Choose the adapter to reach `peer` through.
    ///
    /// Loopback destinations stay on the loopback; everything else goes out
    /// the first hardware adapter.
    pub fn route_to(&self, peer: Ipv4Addr) -> Option<Arc<dyn Adapter>> {
        if peer.is_loopback() || peer == self.loopback.ipv4_address() {
            return Some(self.loopback.clone() as Arc<dyn Adapter>);
        }
        if let Some(adapter) = self.adapter_for_ipv4(peer) {
            return Some(adapter);
        }
        self.adapters.read().first().cloned()
    }

    /// Check whether any adapter has frames waiting.
    pub fn has_queued_packets(&self) -> bool {
        if self.loopback.has_queued_packets() {
            return true;
        }
        self.adapters
            .read()
            .iter()
            .any(|adapter| adapter.has_queued_packets())
    }

    /// Dequeue one frame, preferring the loopback adapter.
    pub fn dequeue_packet(&self) -> Option<PacketBuffer> {
        if let Some(packet) = self.loopback.dequeue_packet() {
            return Some(packet);
        }
        self.adapters
            .read()
            .iter()
            .find(|adapter| adapter.has_queued_packets())
            .and_then(|adapter| adapter.dequeue_packet())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::TestAdapter;
    use crate::ethernet::EthAddr;

    #[test]
    fn test_boot_address_assignment() {
        let stack = NetStack::new();
        let adapter = Arc::new(TestAdapter::new(
            "eth0",
            EthAddr([2, 0, 0, 0, 0, 2]),
            Ipv4Addr::UNSPECIFIED,
        ));
        stack.register_adapter(adapter.clone());
        assert_eq!(adapter.ipv4_address(), DEFAULT_HARDWARE_IPV4);

        // A second unconfigured adapter is left alone.
        let second = Arc::new(TestAdapter::new(
            "eth1",
            EthAddr([2, 0, 0, 0, 0, 3]),
            Ipv4Addr::UNSPECIFIED,
        ));
        stack.register_adapter(second.clone());
        assert!(second.ipv4_address().is_unspecified());
    }

    #[test]
    fn test_adapter_lookup_and_routing() {
        let stack = NetStack::new();
        let adapter = Arc::new(TestAdapter::new(
            "eth0",
            EthAddr([2, 0, 0, 0, 0, 2]),
            DEFAULT_HARDWARE_IPV4,
        ));
        stack.register_adapter(adapter);

        assert!(stack.adapter_for_ipv4(DEFAULT_HARDWARE_IPV4).is_some());
        assert!(stack.adapter_for_ipv4(Ipv4Addr::LOCALHOST).is_some());
        assert!(stack.adapter_for_ipv4(Ipv4Addr::new(10, 9, 9, 9)).is_none());

        let via = stack.route_to(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert_eq!(via.name(), "eth0");
        let via = stack.route_to(Ipv4Addr::LOCALHOST).unwrap();
        assert_eq!(via.name(), "lo");
    }

    #[test]
    fn test_dequeue_prefers_loopback() {
        let stack = NetStack::new();
        let adapter = Arc::new(TestAdapter::new(
            "eth0",
            EthAddr([2, 0, 0, 0, 0, 2]),
            DEFAULT_HARDWARE_IPV4,
        ));
        stack.register_adapter(adapter.clone());

        adapter.inject_frame(b"hardware frame");
        stack.loopback().transmit(b"loopback frame");

        assert!(stack.has_queued_packets());
        let first = stack.dequeue_packet().unwrap();
        assert_eq!(first.data(), b"loopback frame");
        let second = stack.dequeue_packet().unwrap();
        assert_eq!(second.data(), b"hardware frame");
        assert!(stack.dequeue_packet().is_none());
        assert!(!stack.has_queued_packets());
    }
}
