//! # Datagram Links
//!
//! The transport core only needs "send a datagram" and "receive a datagram".
//! Two implementations:
//!
//! - [`UdpLink`]: a plain UDP socket.
//! - [`MemoryLink`]: a bounded in-process channel with seeded loss,
//!   duplication and reordering, for loopback runs and tests.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{Result, StreamError};

// ─── Traits ─────────────────────────────────────────────────────────────────

pub trait DatagramSink: Send + 'static {
    fn send(&mut self, datagram: Bytes) -> Result<()>;

    /// Push out anything held back. Called at end of stream.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait DatagramSource: Send + 'static {
    /// Receive one datagram into `buf`. `Ok(None)` on timeout,
    /// `Err(StreamError::Closed)` once the peer is gone for good.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>>;
}

// ─── UDP ────────────────────────────────────────────────────────────────────

pub struct UdpLink {
    socket: UdpSocket,
    timeout: Option<Duration>,
}

impl UdpLink {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        Ok(UdpLink {
            socket: UdpSocket::bind(addr)?,
            timeout: None,
        })
    }

    /// Bind `local` and send everything to `peer`.
    pub fn connect(local: impl ToSocketAddrs, peer: impl ToSocketAddrs) -> Result<Self> {
        let link = Self::bind(local)?;
        link.socket.connect(peer)?;
        Ok(link)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl DatagramSink for UdpLink {
    fn send(&mut self, datagram: Bytes) -> Result<()> {
        self.socket.send(&datagram)?;
        Ok(())
    }
}

impl DatagramSource for UdpLink {
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        // A zero timeout means "block forever" to the socket.
        let timeout = timeout.max(Duration::from_millis(1));
        if self.timeout != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            self.timeout = Some(timeout);
        }
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            // ICMP unreachable from an earlier send on a connected socket.
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── In-Memory Link ─────────────────────────────────────────────────────────

/// Network impairment applied by [`MemorySink`]. Probabilities are per
/// datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impairment {
    pub loss: f64,
    pub duplicate: f64,
    /// Chance a datagram is held back and sent after the next one.
    pub reorder: f64,
    pub seed: u64,
}

impl Default for Impairment {
    fn default() -> Self {
        Impairment {
            loss: 0.0,
            duplicate: 0.0,
            reorder: 0.0,
            seed: 0x5eed,
        }
    }
}

impl Impairment {
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct LinkCounters {
    sent: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    reordered: AtomicU64,
    overflowed: AtomicU64,
}

/// Snapshot of what a [`MemorySink`] did to the traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    /// Datagrams lost because the channel was full.
    pub overflowed: u64,
}

pub struct MemoryLink;

impl MemoryLink {
    /// Connected sink/source pair holding at most `capacity` datagrams in
    /// flight.
    pub fn pair(capacity: usize, impairment: Impairment) -> (MemorySink, MemorySource) {
        let (tx, rx) = bounded(capacity);
        let counters = Arc::new(LinkCounters::default());
        let sink = MemorySink {
            tx,
            rng: StdRng::seed_from_u64(impairment.seed),
            impairment,
            held: None,
            counters,
        };
        (sink, MemorySource { rx })
    }
}

pub struct MemorySink {
    tx: Sender<Bytes>,
    rng: StdRng,
    impairment: Impairment,
    held: Option<Bytes>,
    counters: Arc<LinkCounters>,
}

impl MemorySink {
    /// Counter handle that outlives the sink.
    pub fn stats_handle(&self) -> LinkStatsHandle {
        LinkStatsHandle(self.counters.clone())
    }

    fn deliver(&mut self, datagram: Bytes) -> Result<()> {
        match self.tx.try_send(datagram) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                debug!("memory link full, datagram dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(StreamError::Closed),
        }
    }
}

impl DatagramSink for MemorySink {
    fn send(&mut self, datagram: Bytes) -> Result<()> {
        let imp = self.impairment;
        if self.rng.random::<f64>() < imp.loss {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if self.held.is_none() && self.rng.random::<f64>() < imp.reorder {
            self.counters.reordered.fetch_add(1, Ordering::Relaxed);
            self.held = Some(datagram);
            return Ok(());
        }
        let duplicate = self.rng.random::<f64>() < imp.duplicate;

        self.deliver(datagram.clone())?;
        if duplicate {
            self.counters.duplicated.fetch_add(1, Ordering::Relaxed);
            self.deliver(datagram)?;
        }
        if let Some(held) = self.held.take() {
            self.deliver(held)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        match self.held.take() {
            Some(held) => self.deliver(held),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkStatsHandle(Arc<LinkCounters>);

impl LinkStatsHandle {
    pub fn snapshot(&self) -> LinkStats {
        let c = &self.0;
        LinkStats {
            sent: c.sent.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            duplicated: c.duplicated.load(Ordering::Relaxed),
            reordered: c.reordered.load(Ordering::Relaxed),
            overflowed: c.overflowed.load(Ordering::Relaxed),
        }
    }
}

pub struct MemorySource {
    rx: Receiver<Bytes>,
}

impl DatagramSource for MemorySource {
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        match self.rx.recv_timeout(timeout) {
            Ok(datagram) => {
                // Like UDP, an oversized datagram is truncated.
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(Some(n))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut MemorySource) -> Vec<u8> {
        let mut buf = [0u8; 8];
        let mut out = Vec::new();
        while let Ok(Some(n)) = source.recv(&mut buf, Duration::from_millis(1)) {
            assert_eq!(n, 1);
            out.push(buf[0]);
        }
        out
    }

    #[test]
    fn clean_link_preserves_order() {
        let (mut sink, mut source) = MemoryLink::pair(16, Impairment::none());
        for i in 0..10u8 {
            sink.send(Bytes::from(vec![i])).unwrap();
        }
        assert_eq!(drain(&mut source), (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn total_loss_delivers_nothing() {
        let impairment = Impairment {
            loss: 1.0,
            ..Impairment::none()
        };
        let (mut sink, mut source) = MemoryLink::pair(16, impairment);
        let stats = sink.stats_handle();
        for i in 0..5u8 {
            sink.send(Bytes::from(vec![i])).unwrap();
        }
        assert!(drain(&mut source).is_empty());
        assert_eq!(stats.snapshot().dropped, 5);
    }

    #[test]
    fn reordering_swaps_neighbours_and_flush_releases_held() {
        let impairment = Impairment {
            reorder: 1.0,
            ..Impairment::none()
        };
        let (mut sink, mut source) = MemoryLink::pair(16, impairment);
        for i in 0..3u8 {
            sink.send(Bytes::from(vec![i])).unwrap();
        }
        sink.flush().unwrap();
        assert_eq!(drain(&mut source), vec![1, 0, 2]);
    }

    #[test]
    fn duplication_sends_twice() {
        let impairment = Impairment {
            duplicate: 1.0,
            ..Impairment::none()
        };
        let (mut sink, mut source) = MemoryLink::pair(16, impairment);
        sink.send(Bytes::from_static(&[7])).unwrap();
        assert_eq!(drain(&mut source), vec![7, 7]);
    }

    #[test]
    fn full_channel_drops_and_counts() {
        let (mut sink, _source) = MemoryLink::pair(2, Impairment::none());
        let stats = sink.stats_handle();
        for i in 0..4u8 {
            sink.send(Bytes::from(vec![i])).unwrap();
        }
        assert_eq!(stats.snapshot().overflowed, 2);
    }

    #[test]
    fn dropped_sink_closes_source() {
        let (sink, mut source) = MemoryLink::pair(2, Impairment::none());
        drop(sink);
        let mut buf = [0u8; 4];
        assert!(matches!(
            source.recv(&mut buf, Duration::from_millis(1)),
            Err(StreamError::Closed)
        ));
    }

    #[test]
    fn udp_loopback() {
        let mut rx = UdpLink::bind("127.0.0.1:0").unwrap();
        let mut tx = UdpLink::connect("127.0.0.1:0", rx.local_addr().unwrap()).unwrap();
        tx.send(Bytes::from_static(b"cadence")).unwrap();

        let mut buf = [0u8; 64];
        let n = rx.recv(&mut buf, Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&buf[..n], b"cadence");
        assert_eq!(rx.recv(&mut buf, Duration::from_millis(5)).unwrap(), None);
    }
}
