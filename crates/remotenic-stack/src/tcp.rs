//! TCP endpoints: the async stream wrapper over a stack socket and the
//! per-flow request handed to forward handlers.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::addr::from_endpoint;
use crate::error::{Result, StackError};
use crate::stack::{FlowId, Shared};

/// A byte-stream connection terminated inside the userspace stack.
///
/// Reads and writes go through the stack's socket buffers; dropping the
/// stream closes the connection gracefully and the socket is reaped once
/// fully closed.
pub struct TcpStream {
    shared: Arc<Shared>,
    handle: SocketHandle,
    flow: Option<FlowId>,
    local_port: Option<u16>,
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream")
            .field("handle", &self.handle)
            .field("flow", &self.flow)
            .field("local_port", &self.local_port)
            .finish()
    }
}

impl TcpStream {
    pub(crate) fn new(
        shared: Arc<Shared>,
        handle: SocketHandle,
        flow: Option<FlowId>,
        local_port: Option<u16>,
    ) -> Self {
        Self {
            shared,
            handle,
            flow,
            local_port,
        }
    }

    /// Resolves once the handshake finished, with an error if the peer
    /// refused or the stack went away.
    pub(crate) async fn established(&self, remote: SocketAddr) -> Result<()> {
        std::future::poll_fn(|cx| {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Poll::Ready(Err(StackError::Closed));
            }
            let socket = inner.sockets.get_mut::<tcp::Socket>(self.handle);
            match socket.state() {
                tcp::State::SynSent | tcp::State::SynReceived => {
                    socket.register_recv_waker(cx.waker());
                    socket.register_send_waker(cx.waker());
                    inner.park(cx);
                    Poll::Pending
                }
                tcp::State::Closed | tcp::State::TimeWait => {
                    Poll::Ready(Err(StackError::ConnectionRefused(remote)))
                }
                _ => Poll::Ready(Ok(())),
            }
        })
        .await
    }

    /// Enables TCP keepalive probes at the given interval.
    pub fn set_keepalive(&self, interval: Option<Duration>) {
        let mut inner = self.shared.lock();
        if inner.closed {
            return;
        }
        let socket = inner.sockets.get_mut::<tcp::Socket>(self.handle);
        socket.set_keep_alive(
            interval.map(|d| smoltcp::time::Duration::from_millis(d.as_millis() as u64)),
        );
        drop(inner);
        self.shared.wake.notify_one();
    }

    /// Disables or enables Nagle's algorithm.
    pub fn set_nagle_enabled(&self, enabled: bool) {
        let mut inner = self.shared.lock();
        if inner.closed {
            return;
        }
        inner
            .sockets
            .get_mut::<tcp::Socket>(self.handle)
            .set_nagle_enabled(enabled);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let mut inner = self.shared.lock();
        if inner.closed {
            return None;
        }
        inner
            .sockets
            .get_mut::<tcp::Socket>(self.handle)
            .local_endpoint()
            .map(from_endpoint)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let mut inner = self.shared.lock();
        if inner.closed {
            return None;
        }
        inner
            .sockets
            .get_mut::<tcp::Socket>(self.handle)
            .remote_endpoint()
            .map(from_endpoint)
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.lock();
        if inner.closed {
            return Poll::Ready(Ok(()));
        }
        let socket = inner.sockets.get_mut::<tcp::Socket>(this.handle);
        match socket.state() {
            // Handshake still in progress.
            tcp::State::Listen | tcp::State::SynSent | tcp::State::SynReceived => {
                socket.register_recv_waker(cx.waker());
                inner.park(cx);
                Poll::Pending
            }
            _ if socket.can_recv() => {
                let n = match socket.recv_slice(buf.initialize_unfilled()) {
                    Ok(n) => n,
                    Err(_) => return Poll::Ready(Ok(())),
                };
                buf.advance(n);
                drop(inner);
                this.shared.wake.notify_one();
                Poll::Ready(Ok(()))
            }
            // Receive half finished: remote closed or connection reset.
            _ if !socket.may_recv() => Poll::Ready(Ok(())),
            _ => {
                socket.register_recv_waker(cx.waker());
                inner.park(cx);
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut inner = this.shared.lock();
        if inner.closed {
            return Poll::Ready(Err(StackError::Closed.into()));
        }
        let socket = inner.sockets.get_mut::<tcp::Socket>(this.handle);
        match socket.state() {
            tcp::State::Listen | tcp::State::SynSent | tcp::State::SynReceived => {
                socket.register_send_waker(cx.waker());
                inner.park(cx);
                Poll::Pending
            }
            _ if !socket.may_send() => {
                Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
            }
            _ if socket.can_send() => match socket.send_slice(buf) {
                Ok(0) => {
                    socket.register_send_waker(cx.waker());
                    inner.park(cx);
                    Poll::Pending
                }
                Ok(n) => {
                    drop(inner);
                    this.shared.wake.notify_one();
                    Poll::Ready(Ok(n))
                }
                Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            },
            _ => {
                socket.register_send_waker(cx.waker());
                inner.park(cx);
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.lock();
        if inner.closed {
            return Poll::Ready(Ok(()));
        }
        let socket = inner.sockets.get_mut::<tcp::Socket>(this.handle);
        if socket.send_queue() > 0 && socket.may_send() {
            // Draining is the poll task's job; it was prodded when the
            // bytes were queued.
            socket.register_send_waker(cx.waker());
            inner.park(cx);
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.shared.lock();
        if inner.closed {
            return Poll::Ready(Ok(()));
        }
        let socket = inner.sockets.get_mut::<tcp::Socket>(this.handle);
        if socket.send_queue() > 0 && socket.may_send() {
            socket.register_send_waker(cx.waker());
            inner.park(cx);
            return Poll::Pending;
        }
        socket.close();
        drop(inner);
        this.shared.wake.notify_one();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if !inner.closed {
            inner.sockets.get_mut::<tcp::Socket>(self.handle).close();
        }
        inner.retire_tcp(self.handle, self.flow, self.local_port);
        drop(inner);
        self.shared.wake.notify_one();
    }
}

/// A new inbound TCP flow offered to the forward handler.
///
/// The handler either takes the flow's endpoint with [`create_endpoint`]
/// and acknowledges it with `complete(false)`, or rejects it with
/// `complete(true)`, which aborts the connection. Dropping the request
/// without taking the endpoint also aborts it.
///
/// [`create_endpoint`]: TcpForwardRequest::create_endpoint
pub struct TcpForwardRequest {
    shared: Arc<Shared>,
    flow: FlowId,
    handle: SocketHandle,
    endpoint_taken: bool,
    finished: bool,
}

impl TcpForwardRequest {
    pub(crate) fn new(shared: Arc<Shared>, flow: FlowId, handle: SocketHandle) -> Self {
        Self {
            shared,
            flow,
            handle,
            endpoint_taken: false,
            finished: false,
        }
    }

    /// The flow's 4-tuple.
    pub fn id(&self) -> FlowId {
        self.flow
    }

    /// The destination the originator dialed.
    pub fn local_addr(&self) -> SocketAddr {
        self.flow.local
    }

    /// The originator of the flow.
    pub fn remote_addr(&self) -> SocketAddr {
        self.flow.remote
    }

    /// Takes ownership of the flow as a byte stream.
    pub fn create_endpoint(&mut self) -> Result<TcpStream> {
        if self.endpoint_taken {
            return Err(StackError::socket("create endpoint", "endpoint already created"));
        }
        if self.shared.lock().closed {
            return Err(StackError::Closed);
        }
        self.endpoint_taken = true;
        Ok(TcpStream::new(
            self.shared.clone(),
            self.handle,
            Some(self.flow),
            None,
        ))
    }

    /// Finishes flow setup. `reject = true` aborts the connection; the
    /// originator sees a reset.
    pub fn complete(&mut self, reject: bool) {
        if reject {
            self.abort_flow();
        } else {
            self.finished = true;
        }
    }

    fn abort_flow(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut inner = self.shared.lock();
        if !inner.closed {
            inner.sockets.get_mut::<tcp::Socket>(self.handle).abort();
        }
        if !self.endpoint_taken {
            inner.retire_tcp(self.handle, Some(self.flow), None);
        }
        drop(inner);
        self.shared.wake.notify_one();
    }
}

impl Drop for TcpForwardRequest {
    fn drop(&mut self) {
        if !self.endpoint_taken {
            self.abort_flow();
        }
    }
}
