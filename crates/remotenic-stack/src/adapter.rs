//! The packet channel adapter: a byte read/write view of the NIC channel.
//!
//! Reading yields the raw bytes of the next outbound IP frame. Writing
//! injects inbound frames; because the carrier is a byte stream that may
//! split or coalesce writes, frame boundaries are recovered from the
//! IPv4/IPv6 total-length fields, buffering partial frames across calls.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Notify};

use crate::device::{InboundFrame, NetProtocol};

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// Upper bound on buffered partial-frame bytes before the adapter declares
/// the byte stream corrupt and resynchronizes by discarding.
const MAX_PENDING: usize = 64 * 1024;

/// Byte-stream surface over a stack's NIC channel.
///
/// Holds read/inject handles only; the stack owns the channel itself.
/// Dropping the adapter (or shutting down its write half) closes the
/// inject side, and the read side returns EOF once the stack is gone.
pub struct PacketChannel {
    outbound: mpsc::Receiver<Vec<u8>>,
    inbound: Option<mpsc::UnboundedSender<InboundFrame>>,
    wake: Arc<Notify>,
    pending: Vec<u8>,
}

impl PacketChannel {
    pub(crate) fn new(
        outbound: mpsc::Receiver<Vec<u8>>,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            outbound,
            inbound: Some(inbound),
            wake,
            pending: Vec::new(),
        }
    }

    /// Splits complete frames out of `pending` and injects them.
    /// Returns false when the inject side is gone.
    fn drain_pending(&mut self) -> bool {
        loop {
            let Some(&first) = self.pending.first() else {
                return true;
            };
            let proto = match first >> 4 {
                4 => NetProtocol::Ipv4,
                6 => NetProtocol::Ipv6,
                version => {
                    // Garbage tolerated per the link contract, but in a byte
                    // stream it also means framing is lost; discard what we
                    // have and wait for the carrier to go quiet.
                    tracing::trace!(version, "dropping bytes with unknown ip version");
                    self.pending.clear();
                    return true;
                }
            };
            let frame_len = match proto {
                NetProtocol::Ipv4 => {
                    if self.pending.len() < 4 {
                        break;
                    }
                    let total = usize::from(u16::from_be_bytes([self.pending[2], self.pending[3]]));
                    if total < IPV4_MIN_HEADER {
                        tracing::trace!(total, "dropping bytes with bogus ipv4 length");
                        self.pending.clear();
                        return true;
                    }
                    total
                }
                NetProtocol::Ipv6 => {
                    if self.pending.len() < 6 {
                        break;
                    }
                    IPV6_HEADER
                        + usize::from(u16::from_be_bytes([self.pending[4], self.pending[5]]))
                }
            };
            if self.pending.len() < frame_len {
                break;
            }
            let bytes: Vec<u8> = self.pending.drain(..frame_len).collect();
            let Some(inbound) = self.inbound.as_ref() else {
                return false;
            };
            if inbound.send(InboundFrame { proto, bytes }).is_err() {
                return false;
            }
            self.wake.notify_one();
        }
        if self.pending.len() > MAX_PENDING {
            tracing::warn!(
                buffered = self.pending.len(),
                "partial frame exceeds limit, resynchronizing"
            );
            self.pending.clear();
        }
        true
    }
}

impl AsyncRead for PacketChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.outbound.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                if buf.remaining() < frame.len() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "read buffer of {} bytes cannot hold a {}-byte frame",
                            buf.remaining(),
                            frame.len()
                        ),
                    )));
                }
                buf.put_slice(&frame);
                Poll::Ready(Ok(()))
            }
            // Stack gone: EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for PacketChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        if this.inbound.is_none() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        this.pending.extend_from_slice(buf);
        if !this.drain_pending() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inbound = None;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn adapter() -> (
        PacketChannel,
        mpsc::Sender<Vec<u8>>,
        mpsc::UnboundedReceiver<InboundFrame>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(crate::device::NIC_QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let chan = PacketChannel::new(out_rx, in_tx, Arc::new(Notify::new()));
        (chan, out_tx, in_rx)
    }

    fn ipv4_frame(payload_len: usize) -> Vec<u8> {
        let total = IPV4_MIN_HEADER + payload_len;
        let mut frame = vec![0u8; total];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        frame
    }

    fn ipv6_frame(payload_len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; IPV6_HEADER + payload_len];
        frame[0] = 0x60;
        frame[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
        frame
    }

    #[tokio::test]
    async fn write_tags_frames_with_network_protocol() {
        let (mut chan, _out, mut inbound) = adapter();

        chan.write_all(&ipv4_frame(8)).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().proto, NetProtocol::Ipv4);

        chan.write_all(&ipv6_frame(8)).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().proto, NetProtocol::Ipv6);
    }

    #[tokio::test]
    async fn zero_length_write_is_a_no_op() {
        let (mut chan, _out, mut inbound) = adapter();
        let n = chan.write(&[]).await.unwrap();
        assert_eq!(n, 0);
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_ip_version_is_dropped_silently() {
        let (mut chan, _out, mut inbound) = adapter();
        let junk = [0x1fu8; 32];
        let n = chan.write(&junk).await.unwrap();
        assert_eq!(n, junk.len());
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn coalesced_writes_are_split_into_frames() {
        let (mut chan, _out, mut inbound) = adapter();
        let mut bytes = ipv4_frame(4);
        bytes.extend_from_slice(&ipv4_frame(12));
        chan.write_all(&bytes).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap().bytes.len(), IPV4_MIN_HEADER + 4);
        assert_eq!(inbound.recv().await.unwrap().bytes.len(), IPV4_MIN_HEADER + 12);
    }

    #[tokio::test]
    async fn split_writes_are_reassembled() {
        let (mut chan, _out, mut inbound) = adapter();
        let frame = ipv4_frame(100);
        chan.write_all(&frame[..7]).await.unwrap();
        assert!(inbound.try_recv().is_err());
        chan.write_all(&frame[7..]).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().bytes, frame);
    }

    #[tokio::test]
    async fn read_copies_out_one_frame() {
        let (mut chan, out, _inbound) = adapter();
        let frame = ipv4_frame(16);
        out.send(frame.clone()).await.unwrap();

        let mut buf = [0u8; 2048];
        let n = chan.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &frame[..]);
    }

    #[tokio::test]
    async fn short_read_buffer_fails_loudly() {
        let (mut chan, out, _inbound) = adapter();
        out.send(ipv4_frame(300)).await.unwrap();

        let mut buf = [0u8; 64];
        let err = chan.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn read_returns_eof_when_stack_side_closes() {
        let (mut chan, out, _inbound) = adapter();
        drop(out);
        let mut buf = [0u8; 64];
        assert_eq!(chan.read(&mut buf).await.unwrap(), 0);
    }
}
