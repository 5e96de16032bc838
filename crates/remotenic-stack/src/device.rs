//! The NIC channel: a frame-oriented link layer backed by in-memory queues.
//!
//! smoltcp transmits into a bounded outbound queue that the packet channel
//! adapter drains; inbound frames are staged by the stack's poll task after
//! interception and handed to smoltcp through receive tokens.

use std::collections::VecDeque;

use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use tokio::sync::mpsc;

/// Depth of the outbound frame queue.
pub(crate) const NIC_QUEUE_DEPTH: usize = 128;

/// Network protocol tag attached to injected frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetProtocol {
    Ipv4,
    Ipv6,
}

/// A frame injected from the link layer, tagged with its network protocol.
#[derive(Debug)]
pub(crate) struct InboundFrame {
    pub proto: NetProtocol,
    pub bytes: Vec<u8>,
}

pub(crate) struct ChannelDevice {
    mtu: usize,
    /// Frames staged for smoltcp.
    rx: VecDeque<InboundFrame>,
    /// Frames emitted by smoltcp toward the link layer.
    tx: mpsc::Sender<Vec<u8>>,
}

impl ChannelDevice {
    pub(crate) fn new(mtu: usize, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            mtu,
            rx: VecDeque::new(),
            tx,
        }
    }

    pub(crate) fn stage(&mut self, frame: InboundFrame) {
        self.rx.push_back(frame);
    }

}

impl Device for ChannelDevice {
    type RxToken<'a> = RxFrame where Self: 'a;
    type TxToken<'a> = TxFrame<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((RxFrame(frame.bytes), TxFrame { tx: &self.tx }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxFrame { tx: &self.tx })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

pub(crate) struct RxFrame(Vec<u8>);

impl phy::RxToken for RxFrame {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub(crate) struct TxFrame<'a> {
    tx: &'a mpsc::Sender<Vec<u8>>,
}

impl phy::TxToken for TxFrame<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        if self.tx.try_send(buffer).is_err() {
            tracing::trace!("nic outbound queue full, frame dropped");
        }
        result
    }
}
