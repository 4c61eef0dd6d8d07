//! Transmission Control
//!
//! A duplex, ordered byte stream built from two one-directional transports:
//!
//! ```text
//!            write()                                  read()
//!               │                                       ▲
//!   split into ≤ max_upstream chunks          reassembly queue (FIFO)
//!   wait for in-transit room                            ▲
//!               ▼                                       │
//!        uplink (AsyncWrite)                  pump ◀── downlink (AsyncRead)
//! ```
//!
//! The uplink and downlink are ordinary tokio I/O halves, so the DNS carrier can be
//! replaced by an in-memory pipe in tests. Acknowledgements come from whoever owns the
//! carrier via [`TransmissionControl::acknowledge`].
//!
//! The reassembly queue holds at most [`MAX_INBOUND`] bytes. A reader that falls behind stops
//! the pump, the downlink pipe fills, and the carrier stops fetching downstream segments.

use crate::codec::{Direction, DownstreamMode, SegmentCodec};
use crate::frame::{DOWNSTREAM_HEADER_LEN, UPSTREAM_HEADER_LEN};
use crate::{DnswayError, Result};
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default ceiling on bytes written but not yet acknowledged
pub const DEFAULT_MAX_IN_TRANSIT: usize = 4096;

/// Read size of the downlink pump
const PUMP_BUFFER_SIZE: usize = 4096;

/// Queued downstream bytes at which the pump stops reading the downlink
pub const MAX_INBOUND: usize = 16 * 1024;

/// Size limits of one Transmission Control instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLimits {
    /// Largest chunk written to the uplink at once
    pub max_upstream: usize,
    /// Largest payload the peer may send per downstream segment
    pub max_downstream: usize,
    /// Ceiling on unacknowledged upstream bytes
    pub max_in_transit: usize,
}

impl SegmentLimits {
    pub fn new(max_upstream: usize, max_downstream: usize) -> Self {
        Self {
            max_upstream,
            max_downstream,
            max_in_transit: DEFAULT_MAX_IN_TRANSIT.max(max_upstream),
        }
    }

    /// Largest payloads that fit a codec's segments once frame headers are taken out
    pub fn for_codec(codec: &SegmentCodec, mode: DownstreamMode) -> Self {
        Self::new(
            codec.capacity(Direction::Upstream) - UPSTREAM_HEADER_LEN,
            codec.capacity(Direction::Downstream(mode)) - DOWNSTREAM_HEADER_LEN,
        )
    }

    pub fn with_max_in_transit(mut self, max_in_transit: usize) -> Self {
        self.max_in_transit = max_in_transit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_upstream == 0 || self.max_downstream == 0 {
            return Err(DnswayError::InvalidConfig(
                "Segment lengths must be non-zero".into(),
            ));
        }
        if self.max_in_transit < self.max_upstream {
            return Err(DnswayError::InvalidConfig(format!(
                "In-transit ceiling {} is smaller than the upstream segment length {}",
                self.max_in_transit, self.max_upstream
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    /// Downlink hit EOF; queued bytes are still readable
    DownlinkClosed,
    Closed,
}

struct Inner {
    inbound: VecDeque<u8>,
    in_transit: usize,
    lifecycle: Lifecycle,
}

/// Reliable ordered stream over an uplink/downlink transport pair
pub struct TransmissionControl<W, R> {
    limits: SegmentLimits,
    inner: Mutex<Inner>,
    /// Woken when inbound data arrives or the lifecycle changes
    readable: Notify,
    /// Woken when in-transit room frees up or the lifecycle changes
    writable: Notify,
    /// Woken when `read` takes bytes off the inbound queue
    drained: Notify,
    shutdown: CancellationToken,
    uplink: tokio::sync::Mutex<W>,
    downlink: Mutex<Option<R>>,
}

impl<W, R> TransmissionControl<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(limits: SegmentLimits, uplink: W, downlink: R) -> Result<Self> {
        limits.validate()?;

        Ok(Self {
            limits,
            inner: Mutex::new(Inner {
                inbound: VecDeque::new(),
                in_transit: 0,
                lifecycle: Lifecycle::Running,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
            uplink: tokio::sync::Mutex::new(uplink),
            downlink: Mutex::new(Some(downlink)),
        })
    }

    pub fn limits(&self) -> SegmentLimits {
        self.limits
    }

    /// Launch the downlink pump
    ///
    /// Cancelling `cancel` closes the instance. Fails if the pump was already started.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let downlink = lock(&self.downlink)
            .take()
            .ok_or(DnswayError::TransportClosed)?;

        let tc = Arc::clone(self);
        Ok(tokio::spawn(async move {
            tc.pump(downlink, cancel).await;
        }))
    }

    async fn pump(&self, mut downlink: R, cancel: CancellationToken) {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];

        loop {
            // Leave the downlink unread while the queue is full so the carrier backs off
            let room = loop {
                let drained = self.drained.notified();
                tokio::pin!(drained);
                drained.as_mut().enable();

                let buffered = lock(&self.inner).inbound.len();
                if buffered < MAX_INBOUND {
                    break MAX_INBOUND - buffered;
                }

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Transmission control cancelled");
                        self.close();
                        return;
                    }
                    _ = self.shutdown.cancelled() => return,
                    _ = drained => {}
                }
            };
            let limit = room.min(buf.len());

            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Transmission control cancelled");
                    self.close();
                    return;
                }
                _ = self.shutdown.cancelled() => return,
                read = downlink.read(&mut buf[..limit]) => read,
            };

            match read {
                Ok(0) => {
                    debug!("Downlink closed");
                    let mut inner = lock(&self.inner);
                    if inner.lifecycle == Lifecycle::Running {
                        inner.lifecycle = Lifecycle::DownlinkClosed;
                    }
                    drop(inner);
                    self.readable.notify_waiters();
                    return;
                }
                Ok(n) => {
                    let mut inner = lock(&self.inner);
                    if inner.lifecycle == Lifecycle::Closed {
                        return;
                    }
                    inner.inbound.extend(&buf[..n]);
                    drop(inner);
                    self.readable.notify_waiters();
                }
                Err(e) => {
                    warn!("Downlink read failed: {}", e);
                    self.close();
                    return;
                }
            }
        }
    }

    /// Write all of `data`, in chunks of at most `max_upstream` bytes
    ///
    /// Each chunk waits for in-transit room and is fully written before the next starts.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        for chunk in data.chunks(self.limits.max_upstream) {
            self.reserve(chunk.len()).await?;

            let mut uplink = self.uplink.lock().await;
            let sent = tokio::select! {
                sent = async {
                    uplink.write_all(chunk).await?;
                    uplink.flush().await
                } => sent,
                _ = self.shutdown.cancelled() => return Err(DnswayError::TransportClosed),
            };

            if let Err(e) = sent {
                drop(uplink);
                self.close();
                return Err(e.into());
            }
        }

        Ok(data.len())
    }

    /// Block until `len` more bytes fit under the in-transit ceiling, then account for them
    async fn reserve(&self, len: usize) -> Result<()> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = lock(&self.inner);
                if inner.lifecycle == Lifecycle::Closed {
                    return Err(DnswayError::TransportClosed);
                }
                if inner.in_transit + len <= self.limits.max_in_transit {
                    inner.in_transit += len;
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Read queued bytes, blocking while the queue is empty
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = lock(&self.inner);
                if inner.lifecycle == Lifecycle::Closed {
                    return Err(DnswayError::TransportClosed);
                }
                if !inner.inbound.is_empty() {
                    let n = buf.len().min(inner.inbound.len());
                    for (dst, src) in buf.iter_mut().zip(inner.inbound.drain(..n)) {
                        *dst = src;
                    }
                    drop(inner);
                    self.drained.notify_waiters();
                    return Ok(n);
                }
                if inner.lifecycle == Lifecycle::DownlinkClosed {
                    return Err(DnswayError::TransportClosed);
                }
            }

            notified.await;
        }
    }

    /// Release `bytes` of in-transit budget once the peer has accepted them
    pub fn acknowledge(&self, bytes: usize) -> Result<()> {
        let mut inner = lock(&self.inner);
        let result = if bytes > inner.in_transit {
            let err = DnswayError::FlowControlExceeded {
                acknowledged: bytes,
                in_transit: inner.in_transit,
            };
            inner.in_transit = 0;
            Err(err)
        } else {
            inner.in_transit -= bytes;
            Ok(())
        };
        drop(inner);

        self.writable.notify_waiters();
        result
    }

    pub fn in_transit(&self) -> usize {
        lock(&self.inner).in_transit
    }

    /// Bytes queued for `read`
    pub fn buffered(&self) -> usize {
        lock(&self.inner).inbound.len()
    }

    /// Close the stream; blocked and later calls fail with `TransportClosed`
    pub fn close(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.lifecycle == Lifecycle::Closed {
                return;
            }
            inner.lifecycle = Lifecycle::Closed;
            inner.inbound.clear();
        }

        self.shutdown.cancel();
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).lifecycle == Lifecycle::Closed
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
