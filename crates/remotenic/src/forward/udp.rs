//! UDP forwarding with an idle-timeout lifecycle per pseudo-flow.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use remotenic_stack::{FlowId, UdpFlowEndpoint, UdpForwardHandler, UdpForwardRequest};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::pool;

/// Default time after which a quiet flow is torn down.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards UDP pseudo-flows to the host network.
///
/// Each flow gets a fresh OS socket for replies and two copy tasks; a
/// supervisor tears the flow down after `idle_timeout` without traffic or
/// on the first copy error.
pub struct UdpForwarder {
    idle_timeout: Duration,
    mtu: usize,
    active: Arc<AtomicUsize>,
}

impl UdpForwarder {
    pub fn new(idle_timeout: Duration, mtu: usize) -> Self {
        Self {
            idle_timeout,
            mtu,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of flows currently alive; observable for teardown checks.
    pub fn active_flows(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct FlowGuard(Arc<AtomicUsize>);

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UdpForwardHandler for UdpForwarder {
    fn handle(&self, mut request: UdpForwardRequest) {
        let idle_timeout = self.idle_timeout;
        let mtu = self.mtu;
        let active = self.active.clone();
        tokio::spawn(async move {
            let flow = request.id();
            let endpoint = match request.create_endpoint() {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!(%flow, %err, "creating udp endpoint failed");
                    return;
                }
            };
            // Replies from the target arrive on a fresh wildcard socket.
            let bind_addr: SocketAddr = if flow.local.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let host = match UdpSocket::bind(bind_addr).await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(%flow, %err, "binding host socket failed");
                    return;
                }
            };

            active.fetch_add(1, Ordering::SeqCst);
            let _guard = FlowGuard(active);
            debug!(%flow, "forwarding udp");
            run_flow(flow, Arc::new(endpoint), Arc::new(host), idle_timeout, mtu).await;
            debug!(%flow, "udp flow stopped");
        });
    }
}

async fn run_flow(
    flow: FlowId,
    endpoint: Arc<UdpFlowEndpoint>,
    host: Arc<UdpSocket>,
    idle_timeout: Duration,
    mtu: usize,
) {
    // Copy tasks report a status per iteration: Ok is activity (resets the
    // idle timer), Err tears the flow down. The channel holds two slots and
    // statuses are dropped when it is full, so the tasks never block on the
    // supervisor.
    let (status_tx, mut status_rx) = mpsc::channel::<io::Result<()>>(2);

    let to_host = {
        let endpoint = endpoint.clone();
        let host = host.clone();
        let status = status_tx.clone();
        tokio::spawn(async move {
            let mut buf = pool::get(mtu);
            loop {
                let result: io::Result<()> = async {
                    let n = endpoint.recv(&mut buf).await.map_err(io::Error::from)?;
                    host.send_to(&buf[..n], flow.local).await?;
                    Ok(())
                }
                .await;
                let failed = result.is_err();
                let _ = status.try_send(result);
                if failed {
                    break;
                }
            }
        })
    };

    let to_guest = {
        let endpoint = endpoint.clone();
        let host = host.clone();
        let status = status_tx.clone();
        tokio::spawn(async move {
            let mut buf = pool::get(mtu);
            loop {
                let result: io::Result<()> = async {
                    let (n, _from) = host.recv_from(&mut buf).await?;
                    endpoint.send(&buf[..n]).await.map_err(io::Error::from)?;
                    Ok(())
                }
                .await;
                let failed = result.is_err();
                let _ = status.try_send(result);
                if failed {
                    break;
                }
            }
        })
    };
    drop(status_tx);

    loop {
        match timeout(idle_timeout, status_rx.recv()).await {
            // Activity: restart the idle timer.
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(err))) => {
                debug!(%flow, %err, "udp copy failed");
                break;
            }
            // Both copy tasks are gone.
            Ok(None) => break,
            Err(_) => {
                debug!(%flow, "udp flow timed out");
                break;
            }
        }
    }

    to_host.abort();
    to_guest.abort();
    // Dropping the endpoint unregisters the flow; the next datagram of
    // this 4-tuple starts a fresh one.
}
