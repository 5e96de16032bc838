//! TCP forwarding from the userspace stack onto the host network.

use std::time::Duration;

use remotenic_stack::{TcpForwardHandler, TcpForwardRequest};
use tracing::debug;

use crate::splice;

// Probes must come more often than the stack's retransmission timeout so
// a healthy idle flow is never mistaken for a dead one.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Forwards each inbound TCP flow by dialing the flow's original
/// destination on the host network and splicing the two byte streams.
///
/// Dialing happens from the host's own identity; the destination does not
/// see the originator's source address. A failed host dial closes the
/// userspace endpoint, which the originator observes as a reset or
/// half-open close.
#[derive(Debug, Default)]
pub struct TcpForwarder;

impl TcpForwarder {
    pub fn new() -> Self {
        Self
    }
}

impl TcpForwardHandler for TcpForwarder {
    fn handle(&self, mut request: TcpForwardRequest) {
        tokio::spawn(async move {
            let flow = request.id();
            debug!(%flow, "forwarding tcp");
            let endpoint = match request.create_endpoint() {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    debug!(%flow, %err, "creating endpoint failed");
                    request.complete(true);
                    return;
                }
            };
            request.complete(false);
            endpoint.set_keepalive(Some(KEEPALIVE_INTERVAL));
            endpoint.set_nagle_enabled(false);

            let host = match tokio::net::TcpStream::connect(flow.local).await {
                Ok(host) => host,
                Err(err) => {
                    debug!(%flow, %err, "host dial failed");
                    return;
                }
            };
            let _ = host.set_nodelay(true);

            let transferred = splice::join(endpoint, host).await;
            debug!(%flow, transferred, "tcp flow finished");
        });
    }
}
