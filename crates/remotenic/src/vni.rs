//! Virtual network interfaces.
//!
//! A VNI is a userspace stack whose NIC terminates on a link-layer byte
//! channel. Entrance interfaces originate traffic dialed by the
//! application; exit interfaces receive it from the carrier and forward it
//! onto the host OS network. Traffic always flows entrance -> exit.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use remotenic_stack::{
    Cidr, PacketChannel, Route, Stack, StackConfig, StackError, DEFAULT_MTU, SYNTHETIC_GATEWAY,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info_span, Instrument};

use crate::forward::{TcpForwarder, UdpForwarder, DEFAULT_UDP_TIMEOUT};
use crate::splice;

/// A reliable, ordered, bidirectional byte transport carrying serialized
/// IP frames between two interfaces. Any such stream qualifies: an
/// in-memory pipe, a TCP connection, a tunnel stream.
pub trait LinkLayer: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkLayer for T {}

/// Operating role of an interface. Entrance interfaces route everything
/// into the carrier; exit interfaces admit what their exposed routes
/// cover and forward it to the host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Entrance,
    Exit,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Entrance => f.write_str("entrance"),
            Mode::Exit => f.write_str("exit"),
        }
    }
}

#[derive(Debug, Error)]
pub enum VniError {
    #[error("link layer is required")]
    MissingLinkLayer,

    #[error("cannot expose routes on an entrance interface")]
    EntranceExposeRoutes,

    #[error(transparent)]
    Stack(#[from] StackError),
}

/// Configuration for [`Vni::new`].
pub struct VniConfig {
    pub mode: Mode,
    /// Carrier the interface reads and writes IP frames over. Required.
    pub link_layer: Option<Box<dyn LinkLayer>>,
    /// Protocol address of the NIC; doubles as the synthetic gateway of
    /// every installed route.
    pub address: IpAddr,
    pub mtu: usize,
    /// Idle timeout of forwarded UDP flows (exit only).
    pub udp_timeout: Duration,
}

impl Default for VniConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Entrance,
            link_layer: None,
            address: IpAddr::V4(SYNTHETIC_GATEWAY),
            mtu: DEFAULT_MTU,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
        }
    }
}

impl VniConfig {
    pub fn new(mode: Mode, link_layer: impl LinkLayer + 'static) -> Self {
        Self {
            mode,
            link_layer: Some(Box::new(link_layer)),
            ..Self::default()
        }
    }
}

/// A virtual network interface bound to one link-layer channel for its
/// whole lifetime. Dropping the interface (or calling [`Vni::stop`])
/// stops the link worker and tears the stack down.
pub struct Vni {
    stack: Stack,
    mode: Mode,
    stop: watch::Sender<bool>,
    udp_forwarder: Option<Arc<UdpForwarder>>,
}

impl std::fmt::Debug for Vni {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vni").field("mode", &self.mode).finish()
    }
}

impl Vni {
    pub fn new(config: VniConfig) -> Result<Self, VniError> {
        let link_layer = config.link_layer.ok_or(VniError::MissingLinkLayer)?;
        let span = info_span!("vni", mode = %config.mode);

        let (stack, packet_channel) = Stack::new(StackConfig {
            address: config.address,
            mtu: config.mtu,
            nic: 1,
        })?;
        let gateway = stack.addr();

        let mut udp_forwarder = None;
        match config.mode {
            Mode::Entrance => {
                // Everything the application dials leaves through the NIC.
                stack.set_route_table(vec![Route {
                    dest: default_route(gateway),
                    gateway,
                    nic: stack.nic(),
                }]);
            }
            Mode::Exit => {
                stack.set_tcp_forward_handler(Arc::new(TcpForwarder::new()));
                let udp = Arc::new(UdpForwarder::new(config.udp_timeout, config.mtu));
                stack.set_udp_forward_handler(udp.clone());
                udp_forwarder = Some(udp);
                // The forwarders accept flows for addresses the NIC does
                // not own and answer from them.
                stack.set_promiscuous_mode(true);
                // Replies toward the remote gateway itself are always
                // admitted; everything else comes from exposed routes.
                stack.set_route_table(vec![Route {
                    dest: Cidr::host(gateway),
                    gateway,
                    nic: stack.nic(),
                }]);
            }
        }

        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(
            link_worker(stack.clone(), packet_channel, link_layer, stop_rx).instrument(span),
        );

        Ok(Self {
            stack,
            mode: config.mode,
            stop,
            udp_forwarder,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Handle to the underlying stack, for dialer construction.
    pub fn stack(&self) -> Stack {
        self.stack.clone()
    }

    /// Installs routes for the given prefixes, admitting flows from them
    /// through this exit interface. Entrance interfaces reject the call;
    /// their default route already covers everything. Any parse failure
    /// aborts the whole call with no routes installed.
    pub fn expose_routes<S: AsRef<str>>(&self, prefixes: &[S]) -> Result<(), VniError> {
        if self.mode == Mode::Entrance {
            return Err(VniError::EntranceExposeRoutes);
        }
        let parsed = prefixes
            .iter()
            .map(|p| p.as_ref().parse::<Cidr>())
            .collect::<Result<Vec<_>, _>>()?;

        let gateway = self.stack.addr();
        let nic = self.stack.nic();
        let mut routes = self.stack.routes().as_ref().clone();
        for dest in parsed {
            let route = Route { dest, gateway, nic };
            debug!(%route, "exposing route");
            routes.push(route);
        }
        self.stack.set_route_table(routes);
        Ok(())
    }

    /// Number of UDP flows currently alive on an exit interface.
    pub fn active_udp_flows(&self) -> usize {
        self.udp_forwarder
            .as_ref()
            .map(|f| f.active_flows())
            .unwrap_or(0)
    }

    /// Stops the interface: the link worker exits, the stack is torn down
    /// and no further packets flow. Consumes the interface, so stopping
    /// twice is unrepresentable.
    pub fn stop(self) {}
}

impl Drop for Vni {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        self.stack.close();
    }
}

fn default_route(gateway: IpAddr) -> Cidr {
    let unspecified: IpAddr = match gateway {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    };
    Cidr::new(unspecified, 0).expect("zero prefix is always valid")
}

/// Bridges the NIC's packet channel to the carrier for the lifetime of
/// the interface, driving the splice's two copy directions directly.
/// Either direction ending means the link is dead, and stop is driven
/// through the endpoints: in both cases the stack is closed, so every
/// in-flight flow observes EOF instead of waiting on a dead link.
async fn link_worker(
    stack: Stack,
    packet_channel: PacketChannel,
    link_layer: Box<dyn LinkLayer>,
    mut stop: watch::Receiver<bool>,
) {
    let (mut nic_read, mut nic_write) = tokio::io::split(packet_channel);
    let (mut link_read, mut link_write) = tokio::io::split(link_layer);
    let outbound = splice::pipe(&mut nic_read, &mut link_write);
    let inbound = splice::pipe(&mut link_read, &mut nic_write);
    tokio::pin!(outbound, inbound);
    tokio::select! {
        transferred = &mut outbound => {
            debug!(transferred, "link layer closed");
        }
        transferred = &mut inbound => {
            debug!(transferred, "link layer closed");
        }
        _ = stop.changed() => {
            debug!("stop requested");
        }
    }
    stack.close();
}
