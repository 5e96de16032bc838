//! Exit-side flow forwarders bridging userspace endpoints to the host OS.

mod http;
mod tcp;
mod udp;

pub use http::HttpTcpForwarder;
pub use tcp::TcpForwarder;
pub use udp::{UdpForwarder, DEFAULT_UDP_TIMEOUT};
