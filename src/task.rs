//! The network task.
//!
//! A single consumer loop drains every adapter's RX queue (loopback first),
//! parks on the stack's RX wait queue when idle, and demultiplexes each
//! frame into the ARP, ICMP, UDP and TCP handlers. Handlers run inline and
//! never block; per-packet errors are logged and dropped, and the task
//! carries on.

use log::{debug, info, warn};

use alloc::sync::Arc;

use crate::arp::{build_arp_reply, parse_arp, ArpOp};
use crate::buffer::PacketBuffer;
use crate::ethernet::{parse_ethernet, EthHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::icmp::{build_echo_reply, parse_icmp, parse_icmp_echo, ICMP_TYPE_ECHO_REQUEST};
use crate::ipv4::{parse_ipv4, Ipv4Header, Ipv4Proto};
use crate::socket::{SocketProtocol, SocketTuple, WaitOutcome};
use crate::stack::NetStack;
use crate::tcp::{parse_tcp_header, verify_tcp_checksum};
use crate::udp::parse_udp;

/// Run the network task forever.
///
/// Processes queued frames, then blocks on the stack's RX signal until an
/// adapter enqueues more. Without registered kernel hooks the idle wait
/// degrades to a busy poll.
pub fn run(stack: &Arc<NetStack>) -> ! {
    info!("network task: entering main loop");
    loop {
        if poll(stack) == 0 {
            // Idle: wait for an adapter to enqueue, re-checking the
            // predicate on every wake.
            while !stack.has_queued_packets() {
                match stack.rx_signal().wait() {
                    WaitOutcome::Woken => continue,
                    _ => break,
                }
            }
        }
    }
}

/// Drain and dispatch every queued frame. Returns the number processed.
pub fn poll(stack: &NetStack) -> usize {
    let mut processed = 0;
    while let Some(packet) = stack.dequeue_packet() {
        processed += 1;
        stack.stats().inc_rx_frames();
        dispatch_frame(stack, packet.data());
    }
    processed
}

/// Dispatch one frame by its ether_type.
fn dispatch_frame(stack: &NetStack, frame: &[u8]) {
    let (eth, payload) = match parse_ethernet(frame) {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                "network task: frame too small to be an ethernet frame ({} bytes)",
                frame.len()
            );
            stack.stats().inc_rx_dropped();
            return;
        }
    };

    match eth.ethertype {
        ETHERTYPE_ARP => handle_arp(stack, &eth, payload),
        ETHERTYPE_IPV4 => handle_ipv4(stack, &eth, payload),
        _ => {
            // Unknown ether_type: drop silently.
            stack.stats().inc_rx_dropped();
        }
    }
}

/// Handle an ARP packet: answer requests for addresses we own, learn from
/// replies.
fn handle_arp(stack: &NetStack, _eth: &EthHeader, payload: &[u8]) {
    stack.stats().inc_arp_rx();

    let packet = match parse_arp(payload) {
        Ok(packet) => packet,
        Err(err) => {
            warn!("handle_arp: dropping packet: {:?}", err);
            return;
        }
    };

    match packet.op {
        ArpOp::Request => {
            // Who has this IP address?
            if let Some(adapter) = stack.adapter_for_ipv4(packet.target_ip) {
                // We do.
                debug!(
                    "handle_arp: responding to request for {} from {}",
                    packet.target_ip, packet.sender_ip
                );
                let reply =
                    build_arp_reply(&packet, adapter.mac_address(), adapter.ipv4_address());
                adapter.send(packet.sender_hw, &reply);
                stack.stats().inc_arp_replies_tx();
            }
        }
        ArpOp::Reply => {
            // Someone has this IPv4 address; remember the mapping.
            stack.arp_table().set(packet.sender_ip, packet.sender_hw);
            debug!(
                "handle_arp: learned {} is at {} ({} entries)",
                packet.sender_ip,
                packet.sender_hw,
                stack.arp_table().len()
            );
        }
    }
}

/// Validate an IPv4 packet and demux by protocol.
fn handle_ipv4(stack: &NetStack, eth: &EthHeader, payload: &[u8]) {
    let (ip_hdr, l4) = match parse_ipv4(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("handle_ipv4: dropping packet: {:?}", err);
            stack.stats().inc_rx_dropped();
            return;
        }
    };
    stack.stats().inc_ipv4_rx();

    // The exact packet bytes (header + payload, trailing padding stripped).
    let ip_packet = &payload[..ip_hdr.total_len as usize];

    match ip_hdr.proto() {
        Some(Ipv4Proto::Icmp) => handle_icmp(stack, eth, &ip_hdr, ip_packet, l4),
        Some(Ipv4Proto::Udp) => handle_udp(stack, &ip_hdr, ip_packet, l4),
        Some(Ipv4Proto::Tcp) => handle_tcp(stack, &ip_hdr, ip_packet, l4),
        None => {
            warn!("handle_ipv4: unhandled protocol {}", ip_hdr.protocol);
        }
    }
}

/// Fan ICMP out to raw sockets, and answer echo requests addressed to us.
fn handle_icmp(
    stack: &NetStack,
    eth: &EthHeader,
    ip_hdr: &Ipv4Header,
    ip_packet: &[u8],
    l4: &[u8],
) {
    stack.stats().inc_icmp_rx();

    // Every ICMP socket sees every ICMP packet, regardless of addressing.
    for socket in stack.sockets().sockets_snapshot() {
        if socket.protocol() == SocketProtocol::Icmp {
            socket.did_receive(ip_hdr.src, 0, PacketBuffer::copy_from_slice(ip_packet));
        }
    }

    let adapter = match stack.adapter_for_ipv4(ip_hdr.dst) {
        Some(adapter) => adapter,
        None => return,
    };

    let (icmp_hdr, _) = match parse_icmp(l4) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("handle_icmp: dropping packet: {:?}", err);
            return;
        }
    };

    if icmp_hdr.icmp_type == ICMP_TYPE_ECHO_REQUEST {
        if let Ok((echo, _)) = parse_icmp_echo(l4) {
            debug!(
                "handle_icmp: echo request from {}: id={}, seq={}",
                ip_hdr.src, echo.identifier, echo.sequence_number
            );
        }
        match build_echo_reply(l4) {
            Ok(reply) => {
                // Reply straight to the requester, next hop taken from the
                // frame's source MAC.
                adapter.send_ipv4(eth.src, ip_hdr.src, Ipv4Proto::Icmp, &reply);
                stack.stats().inc_icmp_echo_tx();
            }
            Err(err) => warn!("handle_icmp: cannot build echo reply: {:?}", err),
        }
    }
}

/// Deliver a UDP datagram to the socket bound to its destination port.
fn handle_udp(stack: &NetStack, ip_hdr: &Ipv4Header, ip_packet: &[u8], l4: &[u8]) {
    if stack.adapter_for_ipv4(ip_hdr.dst).is_none() {
        debug!("handle_udp: packet is not for us, it's for {}", ip_hdr.dst);
        return;
    }

    let (udp_hdr, _data) = match parse_udp(l4) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("handle_udp: dropping datagram: {:?}", err);
            return;
        }
    };

    let socket = match stack.sockets().udp_socket_for_port(udp_hdr.dst_port) {
        Some(socket) => socket,
        None => {
            debug!("handle_udp: no socket for port {}", udp_hdr.dst_port);
            return;
        }
    };

    socket.did_receive(
        ip_hdr.src,
        udp_hdr.src_port,
        PacketBuffer::copy_from_slice(ip_packet),
    );
    stack.stats().inc_udp_delivered();
}

/// Resolve a TCP segment to its socket and run the state machine.
fn handle_tcp(stack: &NetStack, ip_hdr: &Ipv4Header, ip_packet: &[u8], l4: &[u8]) {
    stack.stats().inc_tcp_rx();

    if stack.adapter_for_ipv4(ip_hdr.dst).is_none() {
        debug!("handle_tcp: packet is not for us, it's for {}", ip_hdr.dst);
        return;
    }

    let tcp_hdr = match parse_tcp_header(l4) {
        Ok(header) => header,
        Err(err) => {
            warn!("handle_tcp: dropping segment: {:?}", err);
            return;
        }
    };

    if !verify_tcp_checksum(ip_hdr.src, ip_hdr.dst, l4) {
        warn!(
            "handle_tcp: checksum mismatch from {}:{}",
            ip_hdr.src, tcp_hdr.src_port
        );
        stack.stats().inc_tcp_bad_checksum();
        return;
    }

    let payload_len = (l4.len() - tcp_hdr.header_len()) as u32;

    let tuple = SocketTuple::new(ip_hdr.dst, tcp_hdr.dst_port, ip_hdr.src, tcp_hdr.src_port);
    let socket = match stack.sockets().tcp_socket_for_tuple(&tuple) {
        Some(socket) => socket,
        None => {
            debug!("handle_tcp: no socket for tuple {}", tuple);
            return;
        }
    };

    if !socket.segment_arrived(&tcp_hdr, payload_len, ip_packet, ip_hdr.src) {
        stack.stats().inc_tcp_ack_mismatch();
    }
}

// ============================================================================
// Tests
// ============================================================================
