//! Stack construction and the poll loop driving it.
//!
//! A [`Stack`] owns a smoltcp interface with a single NIC bound to an
//! in-memory frame channel. One background task drives `iface.poll`,
//! staging frames injected through the packet channel adapter and
//! intercepting new TCP/UDP flows for the installed forwarder handlers.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Waker};
use std::time::Duration;

use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp, Socket};
use smoltcp::time::Instant;
use smoltcp::wire::{
    HardwareAddress, IpCidr, IpListenEndpoint, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket,
    UdpPacket,
};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::addr::to_smol;
use crate::adapter::PacketChannel;
use crate::device::{ChannelDevice, InboundFrame, NetProtocol, NIC_QUEUE_DEPTH};
use crate::error::{Result, StackError};
use crate::route::{NicId, Route, RouteTable};
use crate::tcp::{TcpForwardRequest, TcpStream};
use crate::udp::{UdpForwardRequest, UdpSocket};

/// Reserved address used as the protocol address and next-hop gateway when
/// the caller does not configure one. It carries no external meaning.
pub const SYNTHETIC_GATEWAY: Ipv4Addr = Ipv4Addr::new(100, 127, 255, 255);

/// Default MTU of the NIC channel.
pub const DEFAULT_MTU: usize = 1500;

const TCP_BUFFER_SIZE: usize = 64 * 1024;
/// Abort a connection whose peer stops acknowledging in-flight data.
const TCP_TIMEOUT: smoltcp::time::Duration = smoltcp::time::Duration::from_secs(60);
const UDP_BUFFER_SIZE: usize = 64 * 1024;
const UDP_PACKET_SLOTS: usize = 32;
/// Queued datagrams per intercepted UDP flow; overflow drops.
const UDP_FLOW_QUEUE: usize = 64;

const EPHEMERAL_FIRST: u16 = 49152;

/// Handler invoked for each inbound TCP flow not terminated by an existing
/// endpoint. The equivalent of a transport protocol handler: install one to
/// turn the stack into a forwarding exit.
pub trait TcpForwardHandler: Send + Sync + 'static {
    fn handle(&self, request: TcpForwardRequest);
}

/// Handler invoked for each inbound UDP flow (identified by 4-tuple) not
/// bound to an existing endpoint.
pub trait UdpForwardHandler: Send + Sync + 'static {
    fn handle(&self, request: UdpForwardRequest);
}

/// 4-tuple identifying a forwarded flow. `local` is the destination the
/// originator dialed (as seen by this stack); `remote` is the originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

/// Configuration for [`Stack::new`].
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Protocol address bound to the NIC. Defaults to [`SYNTHETIC_GATEWAY`].
    pub address: IpAddr,
    /// Maximum transmission unit. Defaults to [`DEFAULT_MTU`].
    pub mtu: usize,
    /// NIC identifier recorded in routes.
    pub nic: NicId,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(SYNTHETIC_GATEWAY),
            mtu: DEFAULT_MTU,
            nic: 1,
        }
    }
}

/// Handle to a userspace stack. Cheap to clone; the stack lives until
/// [`Stack::close`] is called and all endpoints are gone.
#[derive(Clone)]
pub struct Stack {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) inner: Mutex<Inner>,
    /// Wakes the poll task after socket state changes.
    pub(crate) wake: Arc<Notify>,
    pub(crate) routes: RouteTable,
    /// Outbound queue handle used for raw (spoofed) UDP flow replies.
    pub(crate) raw_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) addr: IpAddr,
    pub(crate) mtu: usize,
    pub(crate) nic: NicId,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("stack lock")
    }
}

pub(crate) struct Inner {
    pub(crate) iface: Interface,
    pub(crate) sockets: SocketSet<'static>,
    pub(crate) device: ChannelDevice,
    pub(crate) closed: bool,
    tcp_handler: Option<Arc<dyn TcpForwardHandler>>,
    udp_handler: Option<Arc<dyn UdpForwardHandler>>,
    /// Intercepted TCP flows currently backed by a socket.
    tcp_flows: HashMap<FlowId, SocketHandle>,
    /// Intercepted UDP flows and their datagram queues.
    pub(crate) udp_flows: HashMap<FlowId, mpsc::Sender<Vec<u8>>>,
    /// TCP sockets whose endpoint was dropped, awaiting graceful close.
    retired: Vec<Retired>,
    used_ports: HashSet<u16>,
    next_port: u16,
    /// Wakers of endpoint operations parked since the last poll. Every
    /// poll wakes and drains them; still-pending operations re-park. This
    /// keeps the set small and guarantees nothing stays parked across a
    /// close.
    io_wakers: Vec<Waker>,
}

struct Retired {
    handle: SocketHandle,
    flow: Option<FlowId>,
    local_port: Option<u16>,
}

impl Inner {
    /// Records an endpoint waker so `close()` can wake every parked op.
    pub(crate) fn park(&mut self, cx: &Context<'_>) {
        let waker = cx.waker();
        if !self.io_wakers.iter().any(|w| w.will_wake(waker)) {
            self.io_wakers.push(waker.clone());
        }
    }

    pub(crate) fn retire_tcp(
        &mut self,
        handle: SocketHandle,
        flow: Option<FlowId>,
        local_port: Option<u16>,
    ) {
        self.retired.push(Retired {
            handle,
            flow,
            local_port,
        });
    }

    pub(crate) fn release_udp(&mut self, handle: SocketHandle, local_port: u16) {
        if !self.closed {
            self.sockets.remove(handle);
        }
        self.used_ports.remove(&local_port);
    }

    fn alloc_port(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let port = self.next_port;
            self.next_port = if self.next_port == u16::MAX {
                EPHEMERAL_FIRST
            } else {
                self.next_port + 1
            };
            if self.used_ports.insert(port) {
                return Ok(port);
            }
        }
        Err(StackError::PortExhausted)
    }

    /// Reaps retired TCP sockets once fully closed.
    fn collect_retired(&mut self) {
        let mut index = 0;
        while index < self.retired.len() {
            let state = self
                .sockets
                .get::<tcp::Socket>(self.retired[index].handle)
                .state();
            if state == tcp::State::Closed {
                let retired = self.retired.swap_remove(index);
                self.sockets.remove(retired.handle);
                if let Some(flow) = retired.flow {
                    self.tcp_flows.remove(&flow);
                }
                if let Some(port) = retired.local_port {
                    self.used_ports.remove(&port);
                }
            } else {
                index += 1;
            }
        }
    }

    /// Aborts everything and wakes all parked endpoint operations.
    fn shut_down(&mut self) {
        for (_, socket) in self.sockets.iter_mut() {
            match socket {
                Socket::Tcp(s) => s.abort(),
                Socket::Udp(s) => s.close(),
                _ => {}
            }
        }
        self.udp_flows.clear();
        for waker in self.io_wakers.drain(..) {
            waker.wake();
        }
    }
}

/// Work to hand to a forwarder handler, dispatched outside the stack lock.
enum Dispatch {
    Tcp(Arc<dyn TcpForwardHandler>, TcpForwardRequest),
    Udp(Arc<dyn UdpForwardHandler>, UdpForwardRequest),
}

impl Dispatch {
    fn run(self) {
        match self {
            Dispatch::Tcp(handler, request) => handler.handle(request),
            Dispatch::Udp(handler, request) => handler.handle(request),
        }
    }
}

impl Stack {
    /// Creates a stack with a single NIC and returns it together with the
    /// packet channel adapter for its link layer. Must be called from
    /// within a tokio runtime; the poll task is spawned immediately.
    pub fn new(config: StackConfig) -> Result<(Self, PacketChannel)> {
        let (out_tx, out_rx) = mpsc::channel(NIC_QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());

        let mut device = ChannelDevice::new(config.mtu, out_tx.clone());
        let mut iface = Interface::new(
            IfaceConfig::new(HardwareAddress::Ip),
            &mut device,
            Instant::now(),
        );
        let prefix_len = match config.address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        iface.update_ip_addrs(|addrs| {
            if addrs
                .push(IpCidr::new(to_smol(config.address), prefix_len))
                .is_err()
            {
                warn!("nic address table full");
            }
        });
        // smoltcp needs a route for every reply it emits; policy lives in
        // the published route table, so a blanket default is installed here.
        match config.address {
            IpAddr::V4(v4) => {
                iface
                    .routes_mut()
                    .add_default_ipv4_route(v4)
                    .map_err(|e| StackError::socket("add default route", e))?;
            }
            IpAddr::V6(v6) => {
                iface
                    .routes_mut()
                    .add_default_ipv6_route(v6)
                    .map_err(|e| StackError::socket("add default route", e))?;
            }
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                iface,
                sockets: SocketSet::new(Vec::new()),
                device,
                closed: false,
                tcp_handler: None,
                udp_handler: None,
                tcp_flows: HashMap::new(),
                udp_flows: HashMap::new(),
                retired: Vec::new(),
                used_ports: HashSet::new(),
                next_port: EPHEMERAL_FIRST,
                io_wakers: Vec::new(),
            }),
            wake: wake.clone(),
            routes: RouteTable::default(),
            raw_tx: out_tx,
            addr: config.address,
            mtu: config.mtu,
            nic: config.nic,
        });

        tokio::spawn(poll_loop(shared.clone(), in_rx));

        let adapter = PacketChannel::new(out_rx, in_tx, wake);
        Ok((Self { shared }, adapter))
    }

    /// Protocol address bound to the NIC.
    pub fn addr(&self) -> IpAddr {
        self.shared.addr
    }

    /// NIC identifier used in routes.
    pub fn nic(&self) -> NicId {
        self.shared.nic
    }

    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    /// Installs the handler for inbound TCP flows.
    pub fn set_tcp_forward_handler(&self, handler: Arc<dyn TcpForwardHandler>) {
        self.shared.lock().tcp_handler = Some(handler);
    }

    /// Installs the handler for inbound UDP flows.
    pub fn set_udp_forward_handler(&self, handler: Arc<dyn UdpForwardHandler>) {
        self.shared.lock().udp_handler = Some(handler);
    }

    /// Accept frames for any destination address and originate replies from
    /// them. Covers both promiscuous mode and spoofing; exits need it, the
    /// forwarders answer for addresses the NIC does not own.
    pub fn set_promiscuous_mode(&self, enabled: bool) {
        self.shared.lock().iface.set_any_ip(enabled);
    }

    /// Appends a route and republishes the table.
    pub fn add_route(&self, route: Route) {
        let mut routes = self.shared.routes.snapshot().as_ref().clone();
        routes.push(route);
        self.shared.routes.replace(routes);
    }

    /// Replaces the whole route table.
    pub fn set_route_table(&self, routes: Vec<Route>) {
        self.shared.routes.replace(routes);
    }

    /// Current route table snapshot.
    pub fn routes(&self) -> Arc<Vec<Route>> {
        self.shared.routes.snapshot()
    }

    /// Opens a TCP connection through this stack and waits for the
    /// handshake to complete.
    pub async fn dial_tcp(&self, remote: SocketAddr) -> Result<TcpStream> {
        if !self.shared.routes.covers(remote.ip()) {
            return Err(StackError::Unroutable(remote.ip()));
        }
        let (handle, local_port) = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(StackError::Closed);
            }
            let local_port = inner.alloc_port()?;
            let mut socket = tcp::Socket::new(
                tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]),
                tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]),
            );
            socket.set_timeout(Some(TCP_TIMEOUT));
            let handle = inner.sockets.add(socket);
            let connected = {
                let Inner { iface, sockets, .. } = &mut *inner;
                sockets.get_mut::<tcp::Socket>(handle).connect(
                    iface.context(),
                    crate::addr::to_endpoint(remote),
                    local_port,
                )
            };
            if let Err(err) = connected {
                inner.sockets.remove(handle);
                inner.used_ports.remove(&local_port);
                return Err(StackError::socket("tcp connect", err));
            }
            (handle, local_port)
        };
        self.shared.wake.notify_one();

        let stream = TcpStream::new(self.shared.clone(), handle, None, Some(local_port));
        stream.established(remote).await?;
        Ok(stream)
    }

    /// Binds a UDP endpoint on the stack address. With `port == None` an
    /// ephemeral port is allocated.
    pub fn bind_udp(&self, port: Option<u16>) -> Result<UdpSocket> {
        let mut inner = self.shared.lock();
        if inner.closed {
            return Err(StackError::Closed);
        }
        let local_port = match port {
            Some(p) => {
                if !inner.used_ports.insert(p) {
                    return Err(StackError::PortExhausted);
                }
                p
            }
            None => inner.alloc_port()?,
        };
        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0; UDP_BUFFER_SIZE],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0; UDP_BUFFER_SIZE],
        );
        let mut socket = udp::Socket::new(rx, tx);
        let endpoint = IpListenEndpoint {
            addr: Some(to_smol(self.shared.addr)),
            port: local_port,
        };
        if let Err(err) = socket.bind(endpoint) {
            inner.used_ports.remove(&local_port);
            return Err(StackError::socket("udp bind", err));
        }
        let handle = inner.sockets.add(socket);
        drop(inner);
        self.shared.wake.notify_one();
        Ok(UdpSocket::new(self.shared.clone(), handle, local_port))
    }

    /// Shuts the stack down: aborts every socket, tears down intercepted
    /// flows, wakes parked endpoint operations and stops the poll task.
    pub fn close(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.shut_down();
        }
        self.shared.wake.notify_one();
    }
}

/// Drives the interface: stages injected frames (intercepting new flows),
/// polls smoltcp, reaps finished sockets and sleeps until the next timer,
/// wake-up or injected frame.
async fn poll_loop(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<InboundFrame>) {
    let mut inbound_open = true;
    let mut carried: Option<InboundFrame> = None;
    loop {
        let mut dispatches = Vec::new();
        let delay = {
            let mut inner = shared.lock();
            if inner.closed {
                inner.shut_down();
                return;
            }
            if let Some(frame) = carried.take() {
                intercept_and_stage(&shared, &mut inner, frame, &mut dispatches);
            }
            while let Ok(frame) = inbound.try_recv() {
                intercept_and_stage(&shared, &mut inner, frame, &mut dispatches);
            }
            let now = Instant::now();
            {
                let Inner {
                    iface,
                    sockets,
                    device,
                    ..
                } = &mut *inner;
                let _ = iface.poll(now, device, sockets);
            }
            inner.collect_retired();
            for waker in inner.io_wakers.drain(..) {
                waker.wake();
            }
            let Inner {
                iface, sockets, ..
            } = &mut *inner;
            iface.poll_delay(now, sockets)
        };
        for dispatch in dispatches {
            dispatch.run();
        }

        let delay = delay.map(|d| Duration::from_micros(d.total_micros()));
        if delay == Some(Duration::ZERO) {
            continue;
        }
        tokio::select! {
            _ = shared.wake.notified() => {}
            frame = inbound.recv(), if inbound_open => {
                match frame {
                    Some(frame) => carried = Some(frame),
                    None => inbound_open = false,
                }
            }
            _ = tokio::time::sleep(delay.unwrap_or(Duration::from_secs(3600))), if delay.is_some() => {}
        }
    }
}

/// Decides what to do with one injected frame: hand it to an intercepted
/// UDP flow, start a new forwarded flow, or stage it for smoltcp.
fn intercept_and_stage(
    shared: &Arc<Shared>,
    inner: &mut Inner,
    frame: InboundFrame,
    dispatches: &mut Vec<Dispatch>,
) {
    let parsed = match frame.proto {
        NetProtocol::Ipv4 => parse_ipv4(&frame.bytes),
        NetProtocol::Ipv6 => parse_ipv6(&frame.bytes),
    };
    let Some(parsed) = parsed else {
        trace!("dropping unparseable frame");
        return;
    };

    match parsed.proto {
        IpProtocol::Udp if inner.udp_handler.is_some() => {
            if intercept_udp(shared, inner, &frame.bytes, &parsed, dispatches) {
                return;
            }
        }
        IpProtocol::Tcp if inner.tcp_handler.is_some() => {
            intercept_tcp(shared, inner, &parsed, dispatches);
        }
        _ => {}
    }
    inner.device.stage(frame);
}

struct ParsedFlow {
    proto: IpProtocol,
    flow: FlowId,
    /// Offset of the transport payload within the frame (UDP only).
    payload_offset: usize,
    /// Whether the segment opens a connection (TCP SYN without ACK).
    syn_only: bool,
}

const IPV6_HEADER: usize = 40;

fn parse_ipv4(bytes: &[u8]) -> Option<ParsedFlow> {
    let packet = Ipv4Packet::new_checked(bytes).ok()?;
    let proto = packet.next_header();
    let src = IpAddr::V4(packet.src_addr());
    let dst = IpAddr::V4(packet.dst_addr());
    flow_of(bytes, usize::from(packet.header_len()), proto, src, dst)
}

fn parse_ipv6(bytes: &[u8]) -> Option<ParsedFlow> {
    let packet = Ipv6Packet::new_checked(bytes).ok()?;
    // Extension headers are not walked; flows behind them go to smoltcp.
    let proto = packet.next_header();
    let src = IpAddr::V6(packet.src_addr());
    let dst = IpAddr::V6(packet.dst_addr());
    flow_of(bytes, IPV6_HEADER, proto, src, dst)
}

fn flow_of(
    bytes: &[u8],
    header_len: usize,
    proto: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
) -> Option<ParsedFlow> {
    let payload = bytes.get(header_len..)?;
    let (src_port, dst_port, payload_offset, syn_only) = match proto {
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(payload).ok()?;
            (udp.src_port(), udp.dst_port(), header_len + 8, false)
        }
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(payload).ok()?;
            let syn_only = tcp.syn() && !tcp.ack();
            (tcp.src_port(), tcp.dst_port(), header_len, syn_only)
        }
        _ => return None,
    };
    Some(ParsedFlow {
        proto,
        flow: FlowId {
            local: SocketAddr::new(dst, dst_port),
            remote: SocketAddr::new(src, src_port),
        },
        payload_offset,
        syn_only,
    })
}

/// Returns true when the datagram was consumed by the flow layer.
fn intercept_udp(
    shared: &Arc<Shared>,
    inner: &mut Inner,
    bytes: &[u8],
    parsed: &ParsedFlow,
    dispatches: &mut Vec<Dispatch>,
) -> bool {
    let flow = parsed.flow;
    let payload = &bytes[parsed.payload_offset..];

    if let Some(queue) = inner.udp_flows.get(&flow) {
        match queue.try_send(payload.to_vec()) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(%flow, "udp flow queue full, datagram dropped");
                return true;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.udp_flows.remove(&flow);
            }
        }
    }

    // New flow: only admit it if a route covers the originator, since
    // replies have to travel back that way.
    if !shared.routes.covers(flow.remote.ip()) {
        trace!(%flow, "no route back to udp originator, datagram dropped");
        return true;
    }
    let handler = inner
        .udp_handler
        .clone()
        .expect("udp handler checked by caller");
    let (tx, rx) = mpsc::channel(UDP_FLOW_QUEUE);
    if tx.try_send(payload.to_vec()).is_err() {
        return true;
    }
    inner.udp_flows.insert(flow, tx);
    debug!(%flow, "new udp flow");
    dispatches.push(Dispatch::Udp(
        handler,
        UdpForwardRequest::new(shared.clone(), flow, rx),
    ));
    true
}

fn intercept_tcp(
    shared: &Arc<Shared>,
    inner: &mut Inner,
    parsed: &ParsedFlow,
    dispatches: &mut Vec<Dispatch>,
) {
    let flow = parsed.flow;
    if inner.tcp_flows.contains_key(&flow) {
        return;
    }
    // Only connection-opening segments start a flow; anything else is
    // stale and smoltcp will answer it with a reset.
    if !parsed.syn_only {
        return;
    }
    // Without a route back to the originator the handshake cannot be
    // answered; leave the segment to smoltcp, which sends a reset.
    if !shared.routes.covers(flow.remote.ip()) {
        debug!(%flow, "no route back to tcp originator, flow refused");
        return;
    }
    let handler = inner
        .tcp_handler
        .clone()
        .expect("tcp handler checked by caller");
    let mut socket = tcp::Socket::new(
        tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]),
        tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]),
    );
    socket.set_timeout(Some(TCP_TIMEOUT));
    let endpoint = IpListenEndpoint {
        addr: Some(to_smol(flow.local.ip())),
        port: flow.local.port(),
    };
    if let Err(err) = socket.listen(endpoint) {
        warn!(%flow, ?err, "listen for intercepted flow failed");
        return;
    }
    let handle = inner.sockets.add(socket);
    inner.tcp_flows.insert(flow, handle);
    debug!(%flow, "new tcp flow");
    dispatches.push(Dispatch::Tcp(
        handler,
        TcpForwardRequest::new(shared.clone(), flow, handle),
    ));
}
