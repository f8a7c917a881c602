//! IPv4 socket layer.
//!
//! Sockets, the process-wide socket registry, the ephemeral port allocator
//! and the blocking primitives syscall threads park on. The network task
//! resolves incoming packets to sockets through the registry and applies
//! the TCP state machine under the socket lock; syscall threads drive the
//! same socket from the other side (connect/send/receive/close).
//!
//! # Locking
//!
//! Each socket guards its address/state fields with one `spin::Mutex`; the
//! receive queue has its own. Registry maps are individually locked, and
//! the ephemeral port allocator does its scan-and-insert under a single
//! acquisition of the tuple map so two concurrent connects cannot pick the
//! same port.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use log::{debug, warn};
use spin::{Mutex, Once};

use crate::adapter::Adapter;
use crate::buffer::PacketBuffer;
use crate::ethernet::EthAddr;
use crate::ipv4::{parse_ipv4, Ipv4Addr, Ipv4Proto};
use crate::tcp::{
    build_tcp_segment, segment_transition, SegmentSummary, TcpAction, TcpHeader, TcpState,
    TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_SYN, TCP_WINDOW_SIZE,
};
use crate::udp::parse_udp;

/// First ephemeral port (inclusive).
pub const FIRST_EPHEMERAL_PORT: u16 = 32768;

/// Last ephemeral port (inclusive).
pub const LAST_EPHEMERAL_PORT: u16 = 60999;

/// Maximum packets queued on one socket before new arrivals are dropped.
const MAX_RX_QUEUE: usize = 64;

// ============================================================================
// Kernel Hooks (Scheduler / RNG Integration)
// ============================================================================

/// Wait operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Waiter was explicitly woken
    Woken,
    /// Wait was interrupted by a signal
    Interrupted,
    /// No blocking support available (or a timeout elapsed)
    TimedOut,
    /// Queue was closed while waiting
    Closed,
}

/// Services the surrounding kernel provides to the socket layer.
///
/// The crate performs true blocking waits and random port selection without
/// depending on a particular scheduler or RNG: the kernel registers an
/// implementation once at boot. Without hooks, waits degrade to
/// non-blocking polls and port selection falls back to a mixed counter,
/// which keeps the crate usable in host tests.
pub trait KernelHooks: Send + Sync {
    /// Block the current thread until the queue is woken, a signal arrives,
    /// or the queue closes.
    fn wait(&self, queue: &WaitQueue) -> WaitOutcome;

    /// Wake every thread blocked on the queue.
    fn wake_all(&self, queue: &WaitQueue);

    /// Produce a random value for ephemeral port selection.
    fn random_u32(&self) -> u32;
}

static KERNEL_HOOKS: Once<&'static dyn KernelHooks> = Once::new();

/// Register kernel hooks. Only the first registration takes effect.
pub fn register_kernel_hooks(hooks: &'static dyn KernelHooks) {
    KERNEL_HOOKS.call_once(|| hooks);
}

#[inline]
fn kernel_hooks() -> Option<&'static dyn KernelHooks> {
    KERNEL_HOOKS.get().copied()
}

/// Weak fallback entropy for hosts without registered hooks.
static PORT_SEED: AtomicU32 = AtomicU32::new(0x9e37_79b9);

/// Get a random value from the hooks, or a mixed counter fallback.
fn random_u32() -> u32 {
    if let Some(hooks) = kernel_hooks() {
        return hooks.random_u32();
    }
    let n = PORT_SEED.fetch_add(0x9e37_79b9, Ordering::Relaxed);
    n.wrapping_mul(0x85eb_ca6b).rotate_left(13)
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Blocking point for socket waits (receive queue, connect completion, and
/// the network task's idle wait).
///
/// The queue itself only tracks a closed flag and a pending-wakeup counter;
/// actual thread parking is delegated to the registered `KernelHooks`. A
/// wakeup that arrives before the waiter parks is consumed on the next
/// `wait()` so signals are never lost.
pub struct WaitQueue {
    closed: AtomicBool,
    wakeup_count: AtomicU64,
}

impl WaitQueue {
    /// Create a new wait queue.
    pub const fn new() -> Self {
        WaitQueue {
            closed: AtomicBool::new(false),
            wakeup_count: AtomicU64::new(0),
        }
    }

    /// Wait until woken. Returns immediately without hooks registered.
    pub fn wait(&self) -> WaitOutcome {
        if self.closed.load(Ordering::Acquire) {
            return WaitOutcome::Closed;
        }

        // Consume a wakeup that arrived before we parked.
        if self
            .wakeup_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            })
            .is_ok()
        {
            return WaitOutcome::Woken;
        }

        match kernel_hooks() {
            Some(hooks) => hooks.wait(self),
            None => WaitOutcome::TimedOut,
        }
    }

    /// Signal all waiters (or bank the wakeup if none are parked yet).
    pub fn wake_all(&self) {
        self.wakeup_count.fetch_add(1, Ordering::Release);
        if let Some(hooks) = kernel_hooks() {
            hooks.wake_all(self);
        }
    }

    /// Close the queue and prevent further waits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(hooks) = kernel_hooks() {
            hooks.wake_all(self);
        }
    }

    /// Check if closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Socket Identity
// ============================================================================

/// The 4-tuple identifying a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketTuple {
    /// Local IP address
    pub local_addr: Ipv4Addr,
    /// Local port
    pub local_port: u16,
    /// Peer IP address
    pub peer_addr: Ipv4Addr,
    /// Peer port
    pub peer_port: u16,
}

impl SocketTuple {
    /// Create a new tuple.
    pub fn new(local_addr: Ipv4Addr, local_port: u16, peer_addr: Ipv4Addr, peer_port: u16) -> Self {
        SocketTuple {
            local_addr,
            local_port,
            peer_addr,
            peer_port,
        }
    }
}

impl fmt::Display for SocketTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.local_addr, self.local_port, self.peer_addr, self.peer_port
        )
    }
}

/// Socket type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Datagram (UDP)
    Dgram,
    /// Stream (TCP)
    Stream,
    /// Raw (ICMP)
    Raw,
}

/// Socket protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    /// ICMP raw socket
    Icmp,
    /// UDP datagram socket
    Udp,
    /// TCP stream socket
    Tcp,
}

impl SocketProtocol {
    fn socket_type(self) -> SocketType {
        match self {
            SocketProtocol::Icmp => SocketType::Raw,
            SocketProtocol::Udp => SocketType::Dgram,
            SocketProtocol::Tcp => SocketType::Stream,
        }
    }
}

/// Whether a socket operation may suspend the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldBlock {
    /// Return immediately with a pending/again indication
    No,
    /// Park the calling thread until the operation completes
    Yes,
}

// ============================================================================
// Socket Errors
// ============================================================================

/// Socket operation errors, mirroring the POSIX codes the syscall layer
/// hands back to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// No adapter owns the requested local address (EADDRNOTAVAIL)
    AddressNotAvailable,
    /// Port or tuple already taken (EADDRINUSE)
    AddressInUse,
    /// No route to the peer (EHOSTUNREACH)
    HostUnreachable,
    /// Non-blocking connect under way (EINPROGRESS)
    InProgress,
    /// Blocking operation interrupted by a signal (EINTR)
    Interrupted,
    /// Nothing to receive on a non-blocking socket (EAGAIN)
    WouldBlock,
    /// Operation requires an established connection (ENOTCONN)
    NotConnected,
    /// Caller buffer cannot hold the payload (EMSGSIZE)
    BufferTooSmall,
    /// A queued packet failed to re-parse (EBADMSG)
    MalformedPacket,
    /// Operation not valid for this socket type/state (EINVAL)
    InvalidState,
}

impl SocketError {
    /// Negative errno for the syscall boundary.
    pub fn to_errno(self) -> i32 {
        match self {
            SocketError::AddressNotAvailable => -99,
            SocketError::AddressInUse => -98,
            SocketError::HostUnreachable => -113,
            SocketError::InProgress => -115,
            SocketError::Interrupted => -4,
            SocketError::WouldBlock => -11,
            SocketError::NotConnected => -107,
            SocketError::BufferTooSmall => -90,
            SocketError::MalformedPacket => -74,
            SocketError::InvalidState => -22,
        }
    }
}

// ============================================================================
// Socket
// ============================================================================

/// A packet delivered to a socket, held until a reader copies it out.
///
/// The buffer carries the complete IPv4 packet (header + payload); the
/// receive path re-derives the L4 payload from it.
pub struct RxPacket {
    /// Source IPv4 address
    pub source_addr: Ipv4Addr,
    /// Source port (0 for ICMP)
    pub source_port: u16,
    /// The stored IPv4 packet
    pub packet: PacketBuffer,
}

/// Address and connection state guarded by the socket lock.
struct SocketInner {
    local_addr: Ipv4Addr,
    local_port: u16,
    peer_addr: Ipv4Addr,
    peer_port: u16,
    adapter: Option<Arc<dyn Adapter>>,
    state: TcpState,
    sequence_number: u32,
    ack_number: u32,
    connected: bool,
    /// Registry entry currently held under this socket's tuple.
    registered_tuple: Option<SocketTuple>,
    /// UDP port binding currently held by this socket.
    bound_udp_port: Option<u16>,
}

/// An IPv4 socket (ICMP raw, UDP datagram or TCP stream).
///
/// Owning references live with the file-description layer; the registry
/// only keeps weak back references, removed when the socket drops.
pub struct Socket {
    id: u64,
    ty: SocketType,
    proto: SocketProtocol,
    registry: Arc<SocketRegistry>,
    inner: Mutex<SocketInner>,
    rx_queue: Mutex<VecDeque<RxPacket>>,
    rx_wait: WaitQueue,
    connect_wait: WaitQueue,
}

impl Socket {
    /// Create a socket and enter it into the registry.
    pub fn new(registry: &Arc<SocketRegistry>, proto: SocketProtocol) -> Arc<Socket> {
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::new(Socket {
            id,
            ty: proto.socket_type(),
            proto,
            registry: registry.clone(),
            inner: Mutex::new(SocketInner {
                local_addr: Ipv4Addr::UNSPECIFIED,
                local_port: 0,
                peer_addr: Ipv4Addr::UNSPECIFIED,
                peer_port: 0,
                adapter: None,
                state: TcpState::Closed,
                sequence_number: 0,
                ack_number: 0,
                connected: false,
                registered_tuple: None,
                bound_udp_port: None,
            }),
            rx_queue: Mutex::new(VecDeque::new()),
            rx_wait: WaitQueue::new(),
            connect_wait: WaitQueue::new(),
        });
        registry
            .all
            .lock()
            .insert(id, Arc::downgrade(&socket));
        socket
    }

    /// Socket id (diagnostics).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Socket type.
    pub fn socket_type(&self) -> SocketType {
        self.ty
    }

    /// Socket protocol.
    pub fn protocol(&self) -> SocketProtocol {
        self.proto
    }

    /// Local port (0 if unbound).
    pub fn local_port(&self) -> u16 {
        self.inner.lock().local_port
    }

    /// Local address.
    pub fn local_addr(&self) -> Ipv4Addr {
        self.inner.lock().local_addr
    }

    /// Peer address and port.
    pub fn peer(&self) -> (Ipv4Addr, u16) {
        let inner = self.inner.lock();
        (inner.peer_addr, inner.peer_port)
    }

    /// Current TCP state.
    pub fn state(&self) -> TcpState {
        self.inner.lock().state
    }

    /// Current send sequence number.
    pub fn sequence_number(&self) -> u32 {
        self.inner.lock().sequence_number
    }

    /// Current acknowledgment number.
    pub fn ack_number(&self) -> u32 {
        self.inner.lock().ack_number
    }

    /// Check whether the connection handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Check whether the connection reports as disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.inner.lock().state.is_disconnected()
    }

    // ========================================================================
    // Binding / Listening / Connecting
    // ========================================================================

    /// Bind the socket to a local address and port.
    ///
    /// For TCP and ICMP this resolves the owning adapter; for UDP it also
    /// claims the port in the registry (port 0 selects an ephemeral one).
    pub fn bind(
        self: &Arc<Self>,
        stack: &crate::stack::NetStack,
        addr: Ipv4Addr,
        port: u16,
    ) -> Result<(), SocketError> {
        let mut inner = self.inner.lock();

        if self.proto == SocketProtocol::Udp {
            let bound = self
                .registry
                .bind_udp_port(port, Arc::downgrade(self))?;
            inner.bound_udp_port = Some(bound);
            inner.local_port = bound;
            inner.local_addr = addr;
            return Ok(());
        }

        let adapter = stack
            .adapter_for_ipv4(addr)
            .ok_or(SocketError::AddressNotAvailable)?;
        inner.local_addr = addr;
        inner.local_port = port;
        inner.adapter = Some(adapter);
        Ok(())
    }

    /// Move a TCP socket into the Listen state.
    ///
    /// The socket's own tuple (peer 0.0.0.0:0) is claimed in the registry;
    /// an existing claim fails with `AddressInUse`. Incoming connection
    /// requests are still refused by the state machine.
    pub fn listen(self: &Arc<Self>) -> Result<(), SocketError> {
        if self.proto != SocketProtocol::Tcp {
            return Err(SocketError::InvalidState);
        }
        let mut inner = self.inner.lock();
        let tuple = SocketTuple::new(
            inner.local_addr,
            inner.local_port,
            inner.peer_addr,
            inner.peer_port,
        );
        self.registry.register_tuple(tuple, Arc::downgrade(self))?;
        inner.registered_tuple = Some(tuple);
        inner.state = TcpState::Listen;
        Ok(())
    }

    /// Actively open a TCP connection.
    ///
    /// Resolves an adapter through routing if the socket is unbound, takes
    /// the local address from it, allocates an ephemeral port when none is
    /// set, then emits SYN and enters SynSent. With `ShouldBlock::Yes` the
    /// calling thread parks until the handshake completes or a signal
    /// arrives; otherwise `InProgress` is returned immediately.
    pub fn connect(
        self: &Arc<Self>,
        stack: &crate::stack::NetStack,
        peer_addr: Ipv4Addr,
        peer_port: u16,
        block: ShouldBlock,
    ) -> Result<(), SocketError> {
        if self.proto != SocketProtocol::Tcp {
            return Err(SocketError::InvalidState);
        }

        {
            let mut inner = self.inner.lock();

            if inner.adapter.is_none() {
                let adapter = stack
                    .route_to(peer_addr)
                    .ok_or(SocketError::HostUnreachable)?;
                inner.local_addr = adapter.ipv4_address();
                inner.adapter = Some(adapter);
            }

            inner.peer_addr = peer_addr;
            inner.peer_port = peer_port;

            if inner.local_port == 0 {
                let port = self
                    .registry
                    .allocate_local_port(&mut inner, Arc::downgrade(self))?;
                debug!("tcp: allocated ephemeral port {}", port);
            } else if inner.registered_tuple.is_none() {
                let tuple = SocketTuple::new(
                    inner.local_addr,
                    inner.local_port,
                    inner.peer_addr,
                    inner.peer_port,
                );
                self.registry.register_tuple(tuple, Arc::downgrade(self))?;
                inner.registered_tuple = Some(tuple);
            }

            inner.sequence_number = 0;
            inner.ack_number = 0;

            self.emit_segment(&mut inner, TCP_FLAG_SYN, &[])?;
            inner.state = TcpState::SynSent;
        }

        match block {
            ShouldBlock::No => Err(SocketError::InProgress),
            ShouldBlock::Yes => loop {
                if self.inner.lock().connected {
                    return Ok(());
                }
                match self.connect_wait.wait() {
                    WaitOutcome::Woken => continue,
                    WaitOutcome::Interrupted => return Err(SocketError::Interrupted),
                    WaitOutcome::TimedOut | WaitOutcome::Closed => {
                        // No blocking support: report the connect as pending.
                        return Err(SocketError::InProgress);
                    }
                }
            },
        }
    }

    // ========================================================================
    // Data Transfer
    // ========================================================================

    /// Send stream data on an established connection.
    pub fn send(&self, data: &[u8]) -> Result<usize, SocketError> {
        if self.proto != SocketProtocol::Tcp {
            return Err(SocketError::InvalidState);
        }
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(SocketError::NotConnected);
        }
        self.emit_segment(&mut inner, TCP_FLAG_PSH | TCP_FLAG_ACK, data)?;
        Ok(data.len())
    }

    /// Receive one queued packet's payload into `buffer`.
    ///
    /// For TCP the unit is the payload of one delivered segment; for UDP
    /// the datagram payload; for ICMP the complete IPv4 packet. Returns the
    /// copied length and the sender's address/port.
    pub fn receive(
        &self,
        buffer: &mut [u8],
        block: ShouldBlock,
    ) -> Result<(usize, Ipv4Addr, u16), SocketError> {
        loop {
            if let Some(rx) = self.rx_queue.lock().pop_front() {
                let copied = self.copy_payload(&rx, buffer)?;
                return Ok((copied, rx.source_addr, rx.source_port));
            }

            match block {
                ShouldBlock::No => return Err(SocketError::WouldBlock),
                ShouldBlock::Yes => match self.rx_wait.wait() {
                    WaitOutcome::Woken => continue,
                    WaitOutcome::Interrupted => return Err(SocketError::Interrupted),
                    WaitOutcome::TimedOut | WaitOutcome::Closed => {
                        return Err(SocketError::WouldBlock)
                    }
                },
            }
        }
    }

    /// Copy the protocol payload of a stored packet into a caller buffer.
    fn copy_payload(&self, rx: &RxPacket, buffer: &mut [u8]) -> Result<usize, SocketError> {
        let bytes = rx.packet.data();
        match self.proto {
            SocketProtocol::Icmp => {
                if buffer.len() < bytes.len() {
                    return Err(SocketError::BufferTooSmall);
                }
                buffer[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
            SocketProtocol::Udp => {
                let (_, ip_payload) =
                    parse_ipv4(bytes).map_err(|_| SocketError::MalformedPacket)?;
                let (_, data) = parse_udp(ip_payload).map_err(|_| SocketError::MalformedPacket)?;
                if buffer.len() < data.len() {
                    return Err(SocketError::BufferTooSmall);
                }
                buffer[..data.len()].copy_from_slice(data);
                Ok(data.len())
            }
            SocketProtocol::Tcp => {
                let (_, ip_payload) =
                    parse_ipv4(bytes).map_err(|_| SocketError::MalformedPacket)?;
                let header = crate::tcp::parse_tcp_header(ip_payload)
                    .map_err(|_| SocketError::MalformedPacket)?;
                let data = &ip_payload[header.header_len()..];
                if buffer.len() < data.len() {
                    return Err(SocketError::BufferTooSmall);
                }
                buffer[..data.len()].copy_from_slice(data);
                Ok(data.len())
            }
        }
    }

    /// Begin an orderly close.
    ///
    /// From Established this emits FIN and waits out the peer's half; from
    /// CloseWait it emits the final FIN. The emitted FIN consumes one
    /// sequence number so the peer's acknowledgment matches.
    pub fn close(&self) -> Result<(), SocketError> {
        if self.proto != SocketProtocol::Tcp {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        match inner.state {
            TcpState::Established => {
                self.emit_segment(&mut inner, TCP_FLAG_FIN | TCP_FLAG_ACK, &[])?;
                inner.sequence_number = inner.sequence_number.wrapping_add(1);
                inner.state = TcpState::FinWait1;
                inner.connected = false;
            }
            TcpState::CloseWait => {
                self.emit_segment(&mut inner, TCP_FLAG_FIN | TCP_FLAG_ACK, &[])?;
                inner.sequence_number = inner.sequence_number.wrapping_add(1);
                inner.state = TcpState::LastAck;
            }
            _ => {
                inner.state = TcpState::Closed;
                inner.connected = false;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Network Task Interface
    // ========================================================================

    /// Queue a received packet for this socket and wake readers.
    ///
    /// The queue is bounded; when full, the packet is dropped the same way
    /// a saturated device queue drops frames.
    pub fn did_receive(&self, source_addr: Ipv4Addr, source_port: u16, packet: PacketBuffer) {
        let mut queue = self.rx_queue.lock();
        if queue.len() >= MAX_RX_QUEUE {
            warn!(
                "socket {}: receive queue full, dropping packet from {}:{}",
                self.id, source_addr, source_port
            );
            return;
        }
        queue.push_back(RxPacket {
            source_addr,
            source_port,
            packet,
        });
        drop(queue);
        self.rx_wait.wake_all();
    }

    /// Run the TCP state machine on a received segment.
    ///
    /// The segment must already have passed checksum verification. Returns
    /// false when the ack guard rejects the segment (no state change).
    pub fn segment_arrived(
        &self,
        tcp_header: &TcpHeader,
        payload_len: u32,
        ipv4_packet: &[u8],
        source_addr: Ipv4Addr,
    ) -> bool {
        let mut inner = self.inner.lock();

        // A segment is processed only when it acknowledges exactly what we
        // have sent so far.
        if tcp_header.ack_num != inner.sequence_number {
            debug!(
                "tcp: ack/seq mismatch: got {}, wanted {}",
                tcp_header.ack_num, inner.sequence_number
            );
            return false;
        }

        let summary = SegmentSummary {
            flags: tcp_header.flags,
            seq_num: tcp_header.seq_num,
            payload_len,
        };
        let transition = segment_transition(inner.state, &summary);

        for action in &transition.actions {
            match *action {
                TcpAction::SetAck(ack) => inner.ack_number = ack,
                TcpAction::Reply(flags) => {
                    if let Err(err) = self.emit_segment(&mut inner, flags, &[]) {
                        warn!("tcp: reply emission failed: {:?}", err);
                    }
                }
                TcpAction::Deliver => {
                    self.did_receive(
                        source_addr,
                        tcp_header.src_port,
                        PacketBuffer::copy_from_slice(ipv4_packet),
                    );
                }
                TcpAction::SetConnected(connected) => {
                    inner.connected = connected;
                    self.connect_wait.wake_all();
                }
            }
        }

        if transition.next_state != inner.state {
            debug!("tcp: {:?} -> {:?}", inner.state, transition.next_state);
            inner.state = transition.next_state;
        }
        true
    }

    /// Build and transmit one segment, advancing the sequence number.
    ///
    /// A pure SYN consumes one sequence number; anything else advances by
    /// the payload length. The acknowledgment field is filled only when the
    /// ACK flag is set.
    fn emit_segment(
        &self,
        inner: &mut SocketInner,
        flags: u8,
        payload: &[u8],
    ) -> Result<(), SocketError> {
        let adapter = inner.adapter.clone().ok_or(SocketError::NotConnected)?;
        debug_assert!(inner.local_port != 0);

        let ack_num = if flags & TCP_FLAG_ACK != 0 {
            inner.ack_number
        } else {
            0
        };

        let segment = build_tcp_segment(
            inner.local_addr,
            inner.peer_addr,
            inner.local_port,
            inner.peer_port,
            inner.sequence_number,
            ack_num,
            flags,
            TCP_WINDOW_SIZE,
            payload,
        );

        if flags == TCP_FLAG_SYN {
            inner.sequence_number = inner.sequence_number.wrapping_add(1);
        } else {
            inner.sequence_number = inner.sequence_number.wrapping_add(payload.len() as u32);
        }

        adapter.send_ipv4(
            EthAddr::UNSPECIFIED,
            inner.peer_addr,
            Ipv4Proto::Tcp,
            &segment,
        );
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let (tuple, udp_port) = {
            let inner = self.inner.lock();
            (inner.registered_tuple, inner.bound_udp_port)
        };
        self.registry.unregister(self.id, tuple, udp_port);
        self.rx_wait.close();
        self.connect_wait.close();
    }
}

// ============================================================================
// Socket Registry
// ============================================================================

/// Process-wide socket registry.
///
/// Holds weak references only: owning references live with the
/// file-description layer, and dropping a socket removes its entries.
pub struct SocketRegistry {
    next_id: AtomicU64,
    /// Every live socket, for ICMP fan-out.
    all: Mutex<BTreeMap<u64, Weak<Socket>>>,
    /// UDP sockets by local port.
    udp_ports: Mutex<BTreeMap<u16, Weak<Socket>>>,
    /// TCP sockets by 4-tuple.
    tcp_tuples: Mutex<BTreeMap<SocketTuple, Weak<Socket>>>,
}

impl SocketRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(SocketRegistry {
            next_id: AtomicU64::new(1),
            all: Mutex::new(BTreeMap::new()),
            udp_ports: Mutex::new(BTreeMap::new()),
            tcp_tuples: Mutex::new(BTreeMap::new()),
        })
    }

    /// Upgrade and return every live socket (ICMP fan-out path).
    pub fn sockets_snapshot(&self) -> Vec<Arc<Socket>> {
        self.all
            .lock()
            .values()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    /// Look up the UDP socket bound to `port`.
    pub fn udp_socket_for_port(&self, port: u16) -> Option<Arc<Socket>> {
        self.udp_ports.lock().get(&port).and_then(|w| w.upgrade())
    }

    /// Look up the TCP socket registered under `tuple`.
    pub fn tcp_socket_for_tuple(&self, tuple: &SocketTuple) -> Option<Arc<Socket>> {
        self.tcp_tuples.lock().get(tuple).and_then(|w| w.upgrade())
    }

    /// Number of registered TCP tuples (diagnostics).
    pub fn tcp_tuple_count(&self) -> usize {
        self.tcp_tuples.lock().len()
    }

    /// Claim a tuple, failing if it is already present.
    fn register_tuple(&self, tuple: SocketTuple, socket: Weak<Socket>) -> Result<(), SocketError> {
        let mut tuples = self.tcp_tuples.lock();
        if tuples.contains_key(&tuple) {
            return Err(SocketError::AddressInUse);
        }
        tuples.insert(tuple, socket);
        Ok(())
    }

    /// Claim a UDP port (0 selects an ephemeral one).
    fn bind_udp_port(&self, port: u16, socket: Weak<Socket>) -> Result<u16, SocketError> {
        let mut ports = self.udp_ports.lock();
        if port != 0 {
            if ports.contains_key(&port) {
                return Err(SocketError::AddressInUse);
            }
            ports.insert(port, socket);
            return Ok(port);
        }

        let range = (LAST_EPHEMERAL_PORT - FIRST_EPHEMERAL_PORT) as u32;
        let first_scan = FIRST_EPHEMERAL_PORT + (random_u32() % range) as u16;
        let mut candidate = first_scan;
        loop {
            if !ports.contains_key(&candidate) {
                ports.insert(candidate, socket);
                return Ok(candidate);
            }
            candidate += 1;
            if candidate > LAST_EPHEMERAL_PORT {
                candidate = FIRST_EPHEMERAL_PORT;
            }
            if candidate == first_scan {
                return Err(SocketError::AddressInUse);
            }
        }
    }

    /// Allocate an ephemeral TCP port for the socket's tuple.
    ///
    /// Scans linearly from a random start, wrapping at the top of the
    /// range; the uniqueness check and the insert happen under one
    /// acquisition of the tuple map.
    fn allocate_local_port(
        &self,
        inner: &mut SocketInner,
        socket: Weak<Socket>,
    ) -> Result<u16, SocketError> {
        let range = (LAST_EPHEMERAL_PORT - FIRST_EPHEMERAL_PORT) as u32;
        let first_scan = FIRST_EPHEMERAL_PORT + (random_u32() % range) as u16;

        let mut tuples = self.tcp_tuples.lock();
        let mut port = first_scan;
        loop {
            let proposed = SocketTuple::new(
                inner.local_addr,
                port,
                inner.peer_addr,
                inner.peer_port,
            );
            if !tuples.contains_key(&proposed) {
                inner.local_port = port;
                inner.registered_tuple = Some(proposed);
                tuples.insert(proposed, socket);
                return Ok(port);
            }
            port += 1;
            if port > LAST_EPHEMERAL_PORT {
                port = FIRST_EPHEMERAL_PORT;
            }
            if port == first_scan {
                return Err(SocketError::AddressInUse);
            }
        }
    }

    /// Remove a dropped socket's entries.
    fn unregister(&self, id: u64, tuple: Option<SocketTuple>, udp_port: Option<u16>) {
        self.all.lock().remove(&id);
        if let Some(tuple) = tuple {
            self.tcp_tuples.lock().remove(&tuple);
        }
        if let Some(port) = udp_port {
            self.udp_ports.lock().remove(&port);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::TestAdapter;
    use crate::ipv4::build_ipv4_packet;
    use crate::stack::NetStack;
    use crate::tcp::parse_tcp_header;
    use crate::udp::build_udp_datagram;

    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 2);
    const OUR_MAC: EthAddr = EthAddr([0x52, 0x54, 0, 0x12, 0x34, 0x56]);

    fn stack_with_adapter() -> (Arc<NetStack>, Arc<TestAdapter>) {
        let stack = NetStack::new();
        let adapter = Arc::new(TestAdapter::new("eth0", OUR_MAC, OUR_IP));
        stack.register_adapter(adapter.clone());
        (stack, adapter)
    }

    fn tcp_payload_of(frame: &[u8]) -> (TcpHeader, Vec<u8>) {
        let (_, ip_bytes) = crate::ethernet::parse_ethernet(frame).unwrap();
        let (_, l4) = parse_ipv4(ip_bytes).unwrap();
        let header = parse_tcp_header(l4).unwrap();
        (header, l4[header.header_len()..].to_vec())
    }

    #[test]
    fn test_connect_emits_syn_and_allocates_port() {
        let (stack, adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Tcp);

        let err = socket
            .connect(&stack, PEER, 80, ShouldBlock::No)
            .unwrap_err();
        assert_eq!(err, SocketError::InProgress);

        assert_eq!(socket.state(), TcpState::SynSent);
        // SYN consumed one sequence number.
        assert_eq!(socket.sequence_number(), 1);

        let port = socket.local_port();
        assert!((FIRST_EPHEMERAL_PORT..=LAST_EPHEMERAL_PORT).contains(&port));
        assert_eq!(stack.sockets().tcp_tuple_count(), 1);

        let frame = adapter.last_transmitted().unwrap();
        let (header, payload) = tcp_payload_of(&frame);
        assert_eq!(header.flags, TCP_FLAG_SYN);
        assert_eq!(header.seq_num, 0);
        assert_eq!(header.src_port, port);
        assert_eq!(header.dst_port, 80);
        assert!(payload.is_empty());
        assert!(crate::tcp::verify_tcp_checksum(OUR_IP, PEER, {
            let (_, ip_bytes) = crate::ethernet::parse_ethernet(&frame).unwrap();
            let (_, l4) = parse_ipv4(ip_bytes).unwrap();
            l4
        }));
    }

    #[test]
    fn test_connect_without_route_is_unreachable() {
        let stack = NetStack::new();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        // Only the loopback exists; a non-loopback peer has no route.
        let err = socket
            .connect(&stack, PEER, 80, ShouldBlock::No)
            .unwrap_err();
        assert_eq!(err, SocketError::HostUnreachable);
    }

    #[test]
    fn test_handshake_completes_on_syn_ack() {
        let (stack, adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        let _ = socket.connect(&stack, PEER, 80, ShouldBlock::No);
        let port = socket.local_port();

        // Peer's SYN|ACK: acks our SYN (ack=1), own ISN 5000.
        let syn_ack = TcpHeader::new(80, port, 5000, 1, TCP_FLAG_SYN | TCP_FLAG_ACK, 1024);
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Tcp, &syn_ack.to_bytes());
        assert!(socket.segment_arrived(&syn_ack, 0, &ip_packet, PEER));

        assert_eq!(socket.state(), TcpState::Established);
        assert!(socket.is_connected());
        assert_eq!(socket.ack_number(), 5001);

        // The final ACK of the handshake went out with seq=1, ack=5001.
        let frame = adapter.last_transmitted().unwrap();
        let (header, _) = tcp_payload_of(&frame);
        assert_eq!(header.flags, TCP_FLAG_ACK);
        assert_eq!(header.seq_num, 1);
        assert_eq!(header.ack_num, 5001);
    }

    #[test]
    fn test_ack_guard_drops_mismatch() {
        let (stack, _adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        let _ = socket.connect(&stack, PEER, 80, ShouldBlock::No);
        let port = socket.local_port();

        // ack=7 but our sequence number is 1.
        let bogus = TcpHeader::new(80, port, 5000, 7, TCP_FLAG_SYN | TCP_FLAG_ACK, 1024);
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Tcp, &bogus.to_bytes());
        assert!(!socket.segment_arrived(&bogus, 0, &ip_packet, PEER));
        assert_eq!(socket.state(), TcpState::SynSent);
        assert_eq!(socket.ack_number(), 0);
    }

    #[test]
    fn test_established_receive_delivers_and_acks() {
        let (stack, adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        let _ = socket.connect(&stack, PEER, 80, ShouldBlock::No);
        let port = socket.local_port();

        let syn_ack = TcpHeader::new(80, port, 5000, 1, TCP_FLAG_SYN | TCP_FLAG_ACK, 1024);
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Tcp, &syn_ack.to_bytes());
        socket.segment_arrived(&syn_ack, 0, &ip_packet, PEER);

        // Peer sends "ABC" at seq 5001.
        let data_segment = build_tcp_segment(
            PEER,
            OUR_IP,
            80,
            port,
            5001,
            1,
            TCP_FLAG_PSH | TCP_FLAG_ACK,
            1024,
            b"ABC",
        );
        let header = parse_tcp_header(&data_segment).unwrap();
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Tcp, &data_segment);
        assert!(socket.segment_arrived(&header, 3, &ip_packet, PEER));

        // Data does not consume an extra sequence number.
        assert_eq!(socket.ack_number(), 5004);

        let frame = adapter.last_transmitted().unwrap();
        let (ack, _) = tcp_payload_of(&frame);
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.seq_num, 1);
        assert_eq!(ack.ack_num, 5004);

        // The payload is waiting on the receive queue.
        let mut buffer = [0u8; 16];
        let (len, from, from_port) = socket.receive(&mut buffer, ShouldBlock::No).unwrap();
        assert_eq!(&buffer[..len], b"ABC");
        assert_eq!(from, PEER);
        assert_eq!(from_port, 80);

        // Queue drained.
        assert_eq!(
            socket.receive(&mut buffer, ShouldBlock::No).unwrap_err(),
            SocketError::WouldBlock
        );
    }

    #[test]
    fn test_peer_fin_enters_close_wait() {
        let (stack, adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        let _ = socket.connect(&stack, PEER, 80, ShouldBlock::No);
        let port = socket.local_port();

        let syn_ack = TcpHeader::new(80, port, 5000, 1, TCP_FLAG_SYN | TCP_FLAG_ACK, 1024);
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Tcp, &syn_ack.to_bytes());
        socket.segment_arrived(&syn_ack, 0, &ip_packet, PEER);

        let fin = TcpHeader::new(80, port, 5001, 1, TCP_FLAG_FIN | TCP_FLAG_ACK, 1024);
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Tcp, &fin.to_bytes());
        assert!(socket.segment_arrived(&fin, 0, &ip_packet, PEER));

        assert_eq!(socket.state(), TcpState::CloseWait);
        assert!(!socket.is_connected());
        assert!(socket.is_disconnected());
        assert_eq!(socket.ack_number(), 5002);

        let frame = adapter.last_transmitted().unwrap();
        let (ack, _) = tcp_payload_of(&frame);
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.ack_num, 5002);
    }

    #[test]
    fn test_close_from_established_sends_fin() {
        let (stack, adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        let _ = socket.connect(&stack, PEER, 80, ShouldBlock::No);
        let port = socket.local_port();

        let syn_ack = TcpHeader::new(80, port, 5000, 1, TCP_FLAG_SYN | TCP_FLAG_ACK, 1024);
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Tcp, &syn_ack.to_bytes());
        socket.segment_arrived(&syn_ack, 0, &ip_packet, PEER);

        socket.close().unwrap();
        assert_eq!(socket.state(), TcpState::FinWait1);
        // FIN consumed a sequence number.
        assert_eq!(socket.sequence_number(), 2);

        let frame = adapter.last_transmitted().unwrap();
        let (fin, _) = tcp_payload_of(&frame);
        assert_eq!(fin.flags, TCP_FLAG_FIN | TCP_FLAG_ACK);
        assert_eq!(fin.seq_num, 1);

        // Peer acks our FIN: ack = 2 passes the guard, state advances.
        let ack = TcpHeader::new(80, port, 5001, 2, TCP_FLAG_ACK, 1024);
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Tcp, &ack.to_bytes());
        assert!(socket.segment_arrived(&ack, 0, &ip_packet, PEER));
        assert_eq!(socket.state(), TcpState::FinWait2);
    }

    #[test]
    fn test_listen_claims_tuple_once() {
        let (stack, _adapter) = stack_with_adapter();
        let first = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        first.bind(&stack, OUR_IP, 8080).unwrap();
        first.listen().unwrap();
        assert_eq!(first.state(), TcpState::Listen);

        let second = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        second.bind(&stack, OUR_IP, 8080).unwrap();
        assert_eq!(second.listen().unwrap_err(), SocketError::AddressInUse);
    }

    #[test]
    fn test_registry_unregisters_on_drop() {
        let (stack, _adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Tcp);
        let _ = socket.connect(&stack, PEER, 80, ShouldBlock::No);
        let tuple = SocketTuple::new(OUR_IP, socket.local_port(), PEER, 80);
        assert!(stack.sockets().tcp_socket_for_tuple(&tuple).is_some());

        drop(socket);
        assert!(stack.sockets().tcp_socket_for_tuple(&tuple).is_none());
        assert_eq!(stack.sockets().tcp_tuple_count(), 0);
    }

    #[test]
    fn test_ephemeral_port_exhaustion() {
        let (stack, _adapter) = stack_with_adapter();
        let registry = stack.sockets();

        // Occupy every port in the range but one for this local/peer pair.
        let free_port = 44444u16;
        {
            let mut tuples = registry.tcp_tuples.lock();
            for port in FIRST_EPHEMERAL_PORT..=LAST_EPHEMERAL_PORT {
                if port != free_port {
                    tuples.insert(SocketTuple::new(OUR_IP, port, PEER, 80), Weak::new());
                }
            }
        }

        let first = Socket::new(registry, SocketProtocol::Tcp);
        let err = first.connect(&stack, PEER, 80, ShouldBlock::No).unwrap_err();
        assert_eq!(err, SocketError::InProgress);
        assert_eq!(first.local_port(), free_port);

        let second = Socket::new(registry, SocketProtocol::Tcp);
        let err = second.connect(&stack, PEER, 80, ShouldBlock::No).unwrap_err();
        assert_eq!(err, SocketError::AddressInUse);
    }

    #[test]
    fn test_udp_bind_and_receive() {
        let (stack, _adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Udp);
        socket.bind(&stack, OUR_IP, 9000).unwrap();

        assert!(stack.sockets().udp_socket_for_port(9000).is_some());

        let datagram = build_udp_datagram(PEER, OUR_IP, 5353, 9000, b"datagram");
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Udp, &datagram);
        socket.did_receive(PEER, 5353, PacketBuffer::copy_from_slice(&ip_packet));

        let mut buffer = [0u8; 32];
        let (len, from, from_port) = socket.receive(&mut buffer, ShouldBlock::No).unwrap();
        assert_eq!(&buffer[..len], b"datagram");
        assert_eq!(from, PEER);
        assert_eq!(from_port, 5353);
    }

    #[test]
    fn test_udp_port_conflict() {
        let (stack, _adapter) = stack_with_adapter();
        let first = Socket::new(stack.sockets(), SocketProtocol::Udp);
        first.bind(&stack, OUR_IP, 9000).unwrap();

        let second = Socket::new(stack.sockets(), SocketProtocol::Udp);
        assert_eq!(
            second.bind(&stack, OUR_IP, 9000).unwrap_err(),
            SocketError::AddressInUse
        );
    }

    #[test]
    fn test_receive_buffer_too_small() {
        let (stack, _adapter) = stack_with_adapter();
        let socket = Socket::new(stack.sockets(), SocketProtocol::Udp);
        socket.bind(&stack, OUR_IP, 9001).unwrap();

        let datagram = build_udp_datagram(PEER, OUR_IP, 1, 9001, b"0123456789");
        let ip_packet = build_ipv4_packet(PEER, OUR_IP, Ipv4Proto::Udp, &datagram);
        socket.did_receive(PEER, 1, PacketBuffer::copy_from_slice(&ip_packet));

        let mut tiny = [0u8; 4];
        assert_eq!(
            socket.receive(&mut tiny, ShouldBlock::No).unwrap_err(),
            SocketError::BufferTooSmall
        );
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(SocketError::AddressInUse.to_errno(), -98);
        assert_eq!(SocketError::AddressNotAvailable.to_errno(), -99);
        assert_eq!(SocketError::HostUnreachable.to_errno(), -113);
        assert_eq!(SocketError::InProgress.to_errno(), -115);
        assert_eq!(SocketError::Interrupted.to_errno(), -4);
    }
}
