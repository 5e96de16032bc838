//! UDP endpoints: the datagram socket wrapper and the pseudo-flow endpoint
//! handed to forward handlers.
//!
//! Forwarded UDP flows never touch a stack socket. Inbound datagrams are
//! intercepted per 4-tuple into a queue, and replies are emitted as raw IP
//! frames carrying the flow's original destination as source address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;

use smoltcp::iface::SocketHandle;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::socket::udp;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, UdpPacket, UdpRepr,
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::addr::{from_endpoint, to_endpoint};
use crate::error::{Result, StackError};
use crate::stack::{FlowId, Shared};

const IPV4_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const UDP_HEADER: usize = 8;

/// A datagram endpoint bound on the stack address.
pub struct UdpSocket {
    shared: Arc<Shared>,
    handle: SocketHandle,
    local_port: u16,
}

impl UdpSocket {
    pub(crate) fn new(shared: Arc<Shared>, handle: SocketHandle, local_port: u16) -> Self {
        Self {
            shared,
            handle,
            local_port,
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Sends one datagram to `target`, waiting for buffer space.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<()> {
        std::future::poll_fn(|cx| {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Poll::Ready(Err(StackError::Closed));
            }
            let socket = inner.sockets.get_mut::<udp::Socket>(self.handle);
            match socket.send_slice(payload, to_endpoint(target)) {
                Ok(()) => {
                    drop(inner);
                    self.shared.wake.notify_one();
                    Poll::Ready(Ok(()))
                }
                Err(udp::SendError::BufferFull) => {
                    socket.register_send_waker(cx.waker());
                    inner.park(cx);
                    Poll::Pending
                }
                Err(udp::SendError::Unaddressable) => {
                    Poll::Ready(Err(StackError::Unroutable(target.ip())))
                }
            }
        })
        .await
    }

    /// Receives one datagram, returning its length and originator.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        std::future::poll_fn(|cx| {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Poll::Ready(Err(StackError::Closed));
            }
            let socket = inner.sockets.get_mut::<udp::Socket>(self.handle);
            if socket.can_recv() {
                match socket.recv_slice(buf) {
                    Ok((n, meta)) => Poll::Ready(Ok((n, from_endpoint(meta.endpoint)))),
                    Err(err) => Poll::Ready(Err(StackError::socket("udp recv", err))),
                }
            } else {
                socket.register_recv_waker(cx.waker());
                inner.park(cx);
                Poll::Pending
            }
        })
        .await
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.release_udp(self.handle, self.local_port);
        drop(inner);
        self.shared.wake.notify_one();
    }
}

/// A new inbound UDP flow offered to the forward handler.
pub struct UdpForwardRequest {
    shared: Arc<Shared>,
    flow: FlowId,
    queue: Option<mpsc::Receiver<Vec<u8>>>,
}

impl UdpForwardRequest {
    pub(crate) fn new(shared: Arc<Shared>, flow: FlowId, queue: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            shared,
            flow,
            queue: Some(queue),
        }
    }

    /// The flow's 4-tuple.
    pub fn id(&self) -> FlowId {
        self.flow
    }

    /// The destination the originator sent to.
    pub fn local_addr(&self) -> SocketAddr {
        self.flow.local
    }

    /// The originator of the flow.
    pub fn remote_addr(&self) -> SocketAddr {
        self.flow.remote
    }

    /// Takes ownership of the flow as a datagram endpoint.
    pub fn create_endpoint(&mut self) -> Result<UdpFlowEndpoint> {
        let queue = self
            .queue
            .take()
            .ok_or_else(|| StackError::socket("create endpoint", "endpoint already created"))?;
        if self.shared.lock().closed {
            return Err(StackError::Closed);
        }
        Ok(UdpFlowEndpoint {
            shared: self.shared.clone(),
            flow: self.flow,
            queue: tokio::sync::Mutex::new(queue),
        })
    }
}

impl Drop for UdpForwardRequest {
    fn drop(&mut self) {
        // Unclaimed flows are forgotten so that later datagrams start a
        // fresh request.
        if self.queue.is_some() {
            self.shared.lock().udp_flows.remove(&self.flow);
        }
    }
}

/// Datagram endpoint of one forwarded UDP flow. Receive and send halves
/// are independent, so one endpoint can serve a copy task per direction.
pub struct UdpFlowEndpoint {
    shared: Arc<Shared>,
    flow: FlowId,
    queue: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl UdpFlowEndpoint {
    pub fn flow(&self) -> FlowId {
        self.flow
    }

    /// Receives the next datagram payload of this flow.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        match self.queue.lock().await.recv().await {
            Some(payload) => {
                if payload.len() > buf.len() {
                    return Err(StackError::socket(
                        "udp flow recv",
                        "datagram larger than buffer",
                    ));
                }
                buf[..payload.len()].copy_from_slice(&payload);
                Ok(payload.len())
            }
            None => Err(StackError::Closed),
        }
    }

    /// Sends a reply to the flow's originator, sourced from the flow's
    /// original destination.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let Some(frame) = build_reply(self.flow, payload, self.shared.mtu) else {
            return Ok(());
        };
        self.shared
            .raw_tx
            .send(frame)
            .await
            .map_err(|_| StackError::Closed)
    }
}

impl Drop for UdpFlowEndpoint {
    fn drop(&mut self) {
        self.shared.lock().udp_flows.remove(&self.flow);
    }
}

/// Builds the reply frame `flow.local -> flow.remote`. Oversized or
/// mixed-family replies are dropped with a warning.
fn build_reply(flow: FlowId, payload: &[u8], mtu: usize) -> Option<Vec<u8>> {
    let caps = ChecksumCapabilities::default();
    match (flow.local, flow.remote) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            let total = IPV4_HEADER + UDP_HEADER + payload.len();
            if total > mtu {
                warn!(%flow, total, mtu, "udp reply exceeds mtu, dropped");
                return None;
            }
            let mut frame = vec![0u8; total];
            let ip_repr = Ipv4Repr {
                src_addr: *src.ip(),
                dst_addr: *dst.ip(),
                next_header: IpProtocol::Udp,
                payload_len: UDP_HEADER + payload.len(),
                hop_limit: 64,
            };
            let mut ip = Ipv4Packet::new_unchecked(&mut frame[..]);
            ip_repr.emit(&mut ip, &caps);
            emit_udp(
                &mut frame[IPV4_HEADER..],
                src.port(),
                dst.port(),
                IpAddress::Ipv4(*src.ip()),
                IpAddress::Ipv4(*dst.ip()),
                payload,
                &caps,
            );
            Some(frame)
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
            let total = IPV6_HEADER + UDP_HEADER + payload.len();
            if total > mtu {
                warn!(%flow, total, mtu, "udp reply exceeds mtu, dropped");
                return None;
            }
            let mut frame = vec![0u8; total];
            let ip_repr = Ipv6Repr {
                src_addr: *src.ip(),
                dst_addr: *dst.ip(),
                next_header: IpProtocol::Udp,
                payload_len: UDP_HEADER + payload.len(),
                hop_limit: 64,
            };
            let mut ip = Ipv6Packet::new_unchecked(&mut frame[..]);
            ip_repr.emit(&mut ip);
            emit_udp(
                &mut frame[IPV6_HEADER..],
                src.port(),
                dst.port(),
                IpAddress::Ipv6(*src.ip()),
                IpAddress::Ipv6(*dst.ip()),
                payload,
                &caps,
            );
            Some(frame)
        }
        _ => {
            warn!(%flow, "udp reply across address families, dropped");
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_udp(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    src_addr: IpAddress,
    dst_addr: IpAddress,
    payload: &[u8],
    caps: &ChecksumCapabilities,
) {
    let repr = UdpRepr { src_port, dst_port };
    let mut packet = UdpPacket::new_unchecked(buf);
    repr.emit(
        &mut packet,
        &src_addr,
        &dst_addr,
        payload.len(),
        |b| b.copy_from_slice(payload),
        caps,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_frame_carries_flow_destination_as_source() {
        let flow = FlowId {
            local: "192.168.1.1:53".parse().unwrap(),
            remote: "10.0.0.7:40000".parse().unwrap(),
        };
        let frame = build_reply(flow, b"pong", 1500).unwrap();

        let ip = Ipv4Packet::new_checked(&frame[..]).unwrap();
        assert_eq!(ip.src_addr().to_string(), "192.168.1.1");
        assert_eq!(ip.dst_addr().to_string(), "10.0.0.7");
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 40000);
        assert_eq!(udp.payload(), b"pong");
    }

    #[test]
    fn oversized_reply_is_dropped() {
        let flow = FlowId {
            local: "192.168.1.1:53".parse().unwrap(),
            remote: "10.0.0.7:40000".parse().unwrap(),
        };
        let payload = vec![0u8; 1500];
        assert!(build_reply(flow, &payload, 1500).is_none());
    }

    #[test]
    fn mixed_family_reply_is_dropped() {
        let flow = FlowId {
            local: "192.168.1.1:53".parse().unwrap(),
            remote: "[fd00::7]:40000".parse().unwrap(),
        };
        assert!(build_reply(flow, b"pong", 1500).is_none());
    }
}
