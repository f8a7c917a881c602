//! In-kernel IPv4 network stack.
//!
//! This crate provides the networking core of a small kernel:
//! - Zero-copy parsing of Ethernet, ARP, IPv4, ICMP, UDP and TCP headers
//!   over untrusted frame buffers
//! - A single-threaded network task that drains adapter RX queues and
//!   demultiplexes frames into the protocol handlers
//! - An ARP table populated from received replies and answered requests
//! - A socket layer with ICMP fan-out, UDP delivery by port, and a minimal
//!   TCP state machine for actively opened connections
//!
//! # Architecture
//!
//! ```text
//!                  +-------------------+
//!                  |  Adapter (trait)  |  loopback / NIC drivers
//!                  +---------+---------+
//!                            |
//!                  +---------v---------+
//!                  |   network task    |  task::run / task::poll
//!                  | (single consumer) |
//!                  +---------+---------+
//!                            |
//!          +--------+--------+--------+--------+
//!          |        |                 |        |
//!      +---v--+ +---v--+          +---v--+ +---v--+
//!      | ARP  | | ICMP |          | UDP  | | TCP  |
//!      +---+--+ +---+--+          +---+--+ +---+--+
//!          |        |                 |        |
//!      ARP table    +------ sockets --+--------+
//! ```
//!
//! Device drivers implement [`adapter::Adapter`] and feed frames in; the
//! syscall layer owns [`socket::Socket`] handles and drives them from the
//! other side. One [`stack::NetStack`] instance ties everything together
//! for the lifetime of the process.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod adapter;
pub mod arp;
pub mod buffer;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod socket;
pub mod stack;
pub mod task;
pub mod tcp;
pub mod udp;

pub use adapter::{Adapter, LoopbackAdapter};
pub use arp::{
    build_arp_reply, build_arp_request, parse_arp, serialize_arp, ArpError, ArpOp, ArpPacket,
    ArpTable, ARP_PACKET_LEN,
};
pub use buffer::PacketBuffer;
pub use ethernet::{
    build_ethernet_frame, parse_ethernet, EthAddr, EthError, EthHeader, ETHERTYPE_ARP,
    ETHERTYPE_IPV4, ETH_HEADER_LEN,
};
pub use icmp::{
    build_echo_reply, build_echo_request, parse_icmp, parse_icmp_echo, IcmpEcho, IcmpError,
    IcmpHeader, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST,
};
pub use ipv4::{
    build_ipv4_header, build_ipv4_packet, compute_checksum, parse_ipv4, Ipv4Addr, Ipv4Error,
    Ipv4Header, Ipv4Proto, IPV4_HEADER_MIN_LEN,
};
pub use socket::{
    register_kernel_hooks, KernelHooks, ShouldBlock, Socket, SocketError, SocketProtocol,
    SocketRegistry, SocketTuple, SocketType, WaitOutcome, WaitQueue, FIRST_EPHEMERAL_PORT,
    LAST_EPHEMERAL_PORT,
};
pub use stack::{NetStack, NetStats, DEFAULT_HARDWARE_IPV4};
pub use tcp::{
    build_tcp_segment, compute_tcp_checksum, parse_tcp_header, segment_transition,
    verify_tcp_checksum, SegmentSummary, TcpAction, TcpError, TcpHeader, TcpState, TcpTransition,
    TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_FLAG_URG,
    TCP_HEADER_MIN_LEN, TCP_PROTO, TCP_WINDOW_SIZE,
};
pub use udp::{build_udp_datagram, parse_udp, UdpError, UdpHeader, UDP_HEADER_LEN};

/// Default Maximum Transmission Unit for Ethernet payloads.
pub const DEFAULT_MTU: usize = 1500;
