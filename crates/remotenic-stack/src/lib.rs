//! Userspace IP stack surface for remotenic.
//!
//! Wraps smoltcp behind the handful of primitives the virtual network
//! interface needs: a NIC bound to an in-memory frame channel, a byte-level
//! [`PacketChannel`] adapter over that channel, dialers for originating
//! TCP/UDP traffic, and per-flow forward requests for terminating traffic
//! destined to arbitrary addresses.

#![forbid(unsafe_code)]

mod addr;
mod adapter;
mod device;
mod error;
mod route;
mod stack;
mod tcp;
mod udp;

pub use adapter::PacketChannel;
pub use device::NetProtocol;
pub use error::{Result, StackError};
pub use route::{Cidr, NicId, Route, RouteTable};
pub use stack::{
    FlowId, Stack, StackConfig, TcpForwardHandler, UdpForwardHandler, DEFAULT_MTU,
    SYNTHETIC_GATEWAY,
};
pub use tcp::{TcpForwardRequest, TcpStream};
pub use udp::{UdpFlowEndpoint, UdpForwardRequest, UdpSocket};
