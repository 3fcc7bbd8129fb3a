//! The virtual channel: a backpressured, bidirectional byte stream
//! multiplexed over a shared physical link.
//!
//! `VirtualChannel` implements `AsyncRead + AsyncWrite` directly rather than
//! exposing explicit `read`/`write` methods, so front-end and egress
//! collaborators can treat it exactly like any other Tokio byte stream
//! (`tokio::io::copy_bidirectional`, `AsyncWriteExt::write_all`, ...).

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use sertun_proto::{Frame, MTU};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::PollSender;

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn closed_error(cid: i64) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, crate::error::CoreError::Closed { cid })
}

struct InboundState {
    rx: mpsc::Receiver<Bytes>,
    /// Bytes from the most recent inbound delivery not yet handed to a
    /// `poll_read` caller, when the caller's buffer was smaller than the
    /// delivery.
    partial: Bytes,
}

/// Shared state behind a [`VirtualChannel`]. Held by the owning
/// [`crate::multiplexer::Multiplexer`] (by cid, for inbound delivery) and by
/// the local consumer (for reads/writes); the channel is torn down once both
/// release it and a close has been observed.
pub(crate) struct VirtualChannelInner {
    cid: i64,
    alive: AtomicBool,
    close_signaled: AtomicBool,
    outbound: Mutex<PollSender<Frame>>,
    inbound: Mutex<InboundState>,
    /// Sender half matching `inbound.rx`, given to the multiplexer so it can
    /// push delivered payloads without holding a reference to the whole
    /// inner struct's private fields.
    inbound_tx: mpsc::Sender<Bytes>,
    close_tx: mpsc::UnboundedSender<i64>,
}

impl VirtualChannelInner {
    fn new(
        cid: i64,
        outbound: mpsc::Sender<Frame>,
        inbound_capacity: usize,
        close_tx: mpsc::UnboundedSender<i64>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        Arc::new(Self {
            cid,
            alive: AtomicBool::new(true),
            close_signaled: AtomicBool::new(false),
            outbound: Mutex::new(PollSender::new(outbound)),
            inbound: Mutex::new(InboundState { rx: inbound_rx, partial: Bytes::new() }),
            inbound_tx,
            close_tx,
        })
    }

    /// Pushes a payload delivered from the wire into this channel's read
    /// side. An empty payload is the peer's close signal.
    pub(crate) async fn deliver(&self, payload: Bytes) {
        // The receiver only disappears once the local consumer has dropped
        // the channel entirely, in which case there is nothing left to
        // deliver to.
        let _ = self.inbound_tx.send(payload).await;
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Forces the channel closed from the multiplexer side (a peer `Dispose`,
    /// or table cleanup after a local close already drained the outbound
    /// frame). Signals EOF to any pending or future reader.
    pub(crate) async fn force_close(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.inbound_tx.send(Bytes::new()).await;
    }
}

/// A duplex byte stream for one multiplexed logical connection.
///
/// Cloning shares the same underlying channel (reads and writes from either
/// clone observe the same stream), which is rarely what a caller wants;
/// ordinary use is to hold exactly one `VirtualChannel` per logical
/// connection and pass it by value or `&mut` to copy helpers.
pub struct VirtualChannel {
    inner: Arc<VirtualChannelInner>,
}

impl VirtualChannel {
    pub(crate) fn new(
        cid: i64,
        outbound: mpsc::Sender<Frame>,
        inbound_capacity: usize,
        close_tx: mpsc::UnboundedSender<i64>,
    ) -> (Self, Arc<VirtualChannelInner>) {
        let inner = VirtualChannelInner::new(cid, outbound, inbound_capacity, close_tx);
        (Self { inner: Arc::clone(&inner) }, inner)
    }

    /// Wraps an existing shared inner state, for the multiplexer to hand a
    /// fresh local handle to a channel it already holds in its table (e.g.
    /// when dispatching a `Connect` RPC to a connect handler).
    pub(crate) fn from_inner(inner: Arc<VirtualChannelInner>) -> Self {
        Self { inner }
    }

    /// This channel's id.
    #[must_use]
    pub fn cid(&self) -> i64 {
        self.inner.cid
    }

    /// Whether this channel has not yet observed a close in either
    /// direction.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    fn poll_send_frame(
        inner: &VirtualChannelInner,
        cx: &mut Context<'_>,
        frame: Frame,
    ) -> Poll<io::Result<()>> {
        let mut sender = lock_ignore_poison(&inner.outbound);
        match sender.poll_reserve(cx) {
            Poll::Ready(Ok(())) => match sender.send_item(frame) {
                Ok(()) => Poll::Ready(Ok(())),
                Err(_) => {
                    inner.alive.store(false, Ordering::Release);
                    Poll::Ready(Err(closed_error(inner.cid)))
                },
            },
            Poll::Ready(Err(_)) => {
                inner.alive.store(false, Ordering::Release);
                Poll::Ready(Err(closed_error(inner.cid)))
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRead for VirtualChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let inner = Arc::clone(&self.inner);
        let mut state = lock_ignore_poison(&inner.inbound);

        if !state.partial.is_empty() {
            let n = state.partial.len().min(buf.remaining());
            buf.put_slice(&state.partial[..n]);
            state.partial = state.partial.slice(n..);
            return Poll::Ready(Ok(()));
        }

        if !inner.is_alive() {
            // Already closed and drained: report EOF again rather than
            // parking on a receiver whose sender will never be dropped.
            return Poll::Ready(Ok(()));
        }

        match state.rx.poll_recv(cx) {
            Poll::Ready(Some(payload)) if payload.is_empty() => {
                inner.alive.store(false, Ordering::Release);
                Poll::Ready(Ok(()))
            },
            Poll::Ready(Some(payload)) => {
                let n = payload.len().min(buf.remaining());
                buf.put_slice(&payload[..n]);
                if n < payload.len() {
                    state.partial = payload.slice(n..);
                }
                Poll::Ready(Ok(()))
            },
            Poll::Ready(None) => {
                inner.alive.store(false, Ordering::Release);
                Poll::Ready(Ok(()))
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for VirtualChannel {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let inner = Arc::clone(&self.inner);
        if !inner.is_alive() {
            return Poll::Ready(Err(closed_error(inner.cid)));
        }

        let take = buf.len().min(MTU);
        let frame = Frame { channel_id: inner.cid, payload: Bytes::copy_from_slice(&buf[..take]) };
        match Self::poll_send_frame(&inner, cx, frame) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(take)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let inner = Arc::clone(&self.inner);
        if inner.close_signaled.swap(true, Ordering::AcqRel) {
            return Poll::Ready(Ok(()));
        }

        let frame = Frame { channel_id: inner.cid, payload: Bytes::new() };
        match Self::poll_send_frame(&inner, cx, frame) {
            Poll::Ready(Ok(())) => {
                inner.alive.store(false, Ordering::Release);
                let _ = inner.close_tx.send(inner.cid);
                Poll::Ready(Ok(()))
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                // Allow a retry on the next poll: only the successful path
                // latches `close_signaled`.
                inner.close_signaled.store(false, Ordering::Release);
                Poll::Pending
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn new_test_channel(data_capacity: usize) -> (VirtualChannel, Arc<VirtualChannelInner>, mpsc::Receiver<Frame>) {
        let (data_tx, data_rx) = mpsc::channel(data_capacity);
        let (close_tx, _close_rx) = mpsc::unbounded_channel();
        let (channel, inner) = VirtualChannel::new(1, data_tx, 16, close_tx);
        (channel, inner, data_rx)
    }

    #[tokio::test]
    async fn write_slices_to_mtu_chunks() {
        let (mut channel, _inner, mut data_rx) = new_test_channel(8);
        let payload = vec![7u8; 3000];
        channel.write_all(&payload).await.expect("write");

        let f1 = data_rx.recv().await.expect("frame 1");
        let f2 = data_rx.recv().await.expect("frame 2");
        let f3 = data_rx.recv().await.expect("frame 3");
        assert_eq!(f1.payload.len(), MTU);
        assert_eq!(f2.payload.len(), MTU);
        assert_eq!(f3.payload.len(), 200);
        assert_eq!(f1.channel_id, 1);
    }

    #[tokio::test]
    async fn read_blocks_until_delivery_then_returns_bytes() {
        let (mut channel, inner, _data_rx) = new_test_channel(8);
        inner.deliver(Bytes::from_static(b"hello")).await;

        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn empty_delivery_signals_clean_eof() {
        let (mut channel, inner, _data_rx) = new_test_channel(8);
        inner.deliver(Bytes::new()).await;

        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf).await.expect("read");
        assert_eq!(n, 0);
        assert!(!channel.is_alive());
    }

    #[tokio::test]
    async fn shutdown_sends_empty_frame_and_notifies_close() {
        let (mut channel, _inner, mut data_rx) = new_test_channel(8);
        channel.shutdown().await.expect("shutdown");

        let frame = data_rx.recv().await.expect("close frame");
        assert!(frame.is_close_signal());
        assert_eq!(frame.channel_id, 1);
        assert!(!channel.is_alive());
    }

    #[tokio::test]
    async fn write_on_closed_channel_fails() {
        let (data_tx, data_rx) = mpsc::channel::<Frame>(1);
        drop(data_rx);
        let (close_tx, _close_rx) = mpsc::unbounded_channel();
        let (mut channel, _inner) = VirtualChannel::new(2, data_tx, 16, close_tx);

        let err = channel.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn partial_read_buffer_retains_remainder() {
        let (mut channel, inner, _data_rx) = new_test_channel(8);
        inner.deliver(Bytes::from_static(b"abcdef")).await;

        let mut buf = [0u8; 3];
        let n1 = channel.read(&mut buf).await.expect("read 1");
        assert_eq!(&buf[..n1], b"abc");
        let n2 = channel.read(&mut buf).await.expect("read 2");
        assert_eq!(&buf[..n2], b"def");
    }
}
