//! The per-physical-link worker: ingress reading, frame reassembly,
//! dispatch to the multiplexer, and prioritized outbound sending.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use sertun_proto::{stuffing::FrameScanner, Frame};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::PortEngineConfig,
    error::{CoreError, Result},
};

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owns one physical serial device and the four concurrent tasks that move
/// frames between it and the rest of the system.
///
/// Generic over any `AsyncRead + AsyncWrite + Unpin + Send + 'static` byte
/// stream, so it is equally at home wrapping a `tokio-serial` port or a
/// `tokio::io::duplex` pair in tests.
pub struct PortEngine<D> {
    id: usize,
    config: PortEngineConfig,
    cancellation: CancellationToken,
    device: Mutex<Option<D>>,
    data_tx: mpsc::Sender<Frame>,
    data_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    control_tx: mpsc::UnboundedSender<Frame>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    dispatch_tx: mpsc::UnboundedSender<(usize, Frame)>,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    traffic_in: AtomicU64,
    traffic_out: AtomicU64,
}

impl<D> PortEngine<D>
where
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Builds a new, not-yet-started engine. `dispatch_tx` is the
    /// multiplexer's inbound frame channel; `id` identifies this engine for
    /// dispatch bookkeeping and logging.
    #[must_use]
    pub fn new(
        id: usize,
        device: D,
        config: PortEngineConfig,
        dispatch_tx: mpsc::UnboundedSender<(usize, Frame)>,
    ) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc::channel(config.data_queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            config,
            cancellation: CancellationToken::new(),
            device: Mutex::new(Some(device)),
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            dispatch_tx,
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            traffic_in: AtomicU64::new(0),
            traffic_out: AtomicU64::new(0),
        })
    }

    /// This engine's id, as given to [`PortEngine::new`].
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Starts the four background tasks. Idempotent: a second call is a
    /// no-op because the device and queue receivers are only available once.
    pub fn start(self: &Arc<Self>) {
        let Some(device) = lock_ignore_poison(&self.device).take() else {
            return;
        };
        let Some(data_rx) = lock_ignore_poison(&self.data_rx).take() else {
            return;
        };
        let Some(control_rx) = lock_ignore_poison(&self.control_rx).take() else {
            return;
        };

        let (mut reader, mut writer) = tokio::io::split(device);
        let (ingress_tx, mut ingress_rx) = mpsc::channel::<Bytes>(64);
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();

        // Task 1: ingress reader.
        {
            let engine = Arc::clone(self);
            let cancellation = self.cancellation.clone();
            tokio::spawn(async move {
                let mut scratch = vec![0u8; engine.config.scratch_size];
                loop {
                    let read = tokio::select! {
                        () = cancellation.cancelled() => break,
                        result = reader.read(&mut scratch) => result,
                    };
                    match read {
                        Ok(0) => sleep(engine.config.ingress_idle_wait).await,
                        Ok(n) => {
                            if ingress_tx.send(Bytes::copy_from_slice(&scratch[..n])).await.is_err() {
                                break;
                            }
                        },
                        Err(e) if is_transient(&e) => {
                            sleep(engine.config.transient_retry_wait).await;
                        },
                        Err(e) => {
                            warn!(port = engine.id, error = %e, "ingress reader terminating");
                            break;
                        },
                    }
                }
                cancellation.cancel();
            });
        }

        // Task 2: frame reassembler.
        {
            let engine = Arc::clone(self);
            let cancellation = self.cancellation.clone();
            tokio::spawn(async move {
                let mut scanner = FrameScanner::new();
                loop {
                    let chunk = tokio::select! {
                        () = cancellation.cancelled() => break,
                        chunk = ingress_rx.recv() => chunk,
                    };
                    let Some(chunk) = chunk else { break };
                    engine.traffic_in.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    for body in scanner.push(&chunk) {
                        match Frame::unpack(&body) {
                            Ok(frame) => {
                                engine.frames_in.fetch_add(1, Ordering::Relaxed);
                                if frame_tx.send(frame).is_err() {
                                    return;
                                }
                            },
                            Err(e) => {
                                debug!(port = engine.id, error = %e, "dropping malformed frame");
                            },
                        }
                    }
                }
            });
        }

        // Task 3: dispatcher.
        {
            let id = self.id;
            let dispatch_tx = self.dispatch_tx.clone();
            let cancellation = self.cancellation.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        () = cancellation.cancelled() => break,
                        frame = frame_rx.recv() => frame,
                    };
                    let Some(frame) = frame else { break };
                    if dispatch_tx.send((id, frame)).is_err() {
                        break;
                    }
                }
            });
        }

        // Task 4: sender, control-priority then data.
        {
            let engine = Arc::clone(self);
            let cancellation = self.cancellation.clone();
            let mut data_rx = data_rx;
            let mut control_rx = control_rx;
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        biased;
                        () = cancellation.cancelled() => break,
                        Some(frame) = control_rx.recv() => frame,
                        Some(frame) = data_rx.recv() => frame,
                        else => break,
                    };

                    let packed = match frame.pack() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            debug!(port = engine.id, error = %e, "dropping oversized outbound frame");
                            continue;
                        },
                    };

                    if let Err(e) = writer.write_all(&packed).await {
                        warn!(port = engine.id, error = %e, "sender terminating");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        warn!(port = engine.id, error = %e, "sender terminating");
                        break;
                    }

                    engine.frames_out.fetch_add(1, Ordering::Relaxed);
                    engine.traffic_out.fetch_add(packed.len() as u64, Ordering::Relaxed);
                    trace!(port = engine.id, cid = frame.channel_id, "frame sent");
                }
                cancellation.cancel();
            });
        }
    }

    /// Enqueues a data frame for transmission, awaiting space if the data
    /// queue is full (this is the system's backpressure point).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] if the sender task has shut down.
    pub async fn enqueue_out(&self, frame: Frame) -> Result<()> {
        let cid = frame.channel_id;
        self.data_tx.send(frame).await.map_err(|_| CoreError::Closed { cid })
    }

    /// Enqueues a control frame for transmission ahead of any pending data
    /// frames. Never blocks: the control queue is unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] if the sender task has shut down.
    pub fn enqueue_out_control(&self, frame: Frame) -> Result<()> {
        let cid = frame.channel_id;
        self.control_tx.send(frame).map_err(|_| CoreError::Closed { cid })
    }

    /// A clone of the data-queue sender, handed to a [`crate::channel::VirtualChannel`]
    /// so it can enqueue outbound frames directly without going through this
    /// engine on every write.
    #[must_use]
    pub fn data_sender(&self) -> mpsc::Sender<Frame> {
        self.data_tx.clone()
    }

    /// Current depth of the outbound data queue, used by the multiplexer to
    /// pick the least-loaded engine for a new channel.
    #[must_use]
    pub fn back_pressure(&self) -> usize {
        self.config.data_queue_capacity.saturating_sub(self.data_tx.capacity())
    }

    /// Total frames received from the device since construction.
    #[must_use]
    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    /// Total frames written to the device since construction.
    #[must_use]
    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    /// Total raw bytes read from the device since construction.
    #[must_use]
    pub fn traffic_in(&self) -> u64 {
        self.traffic_in.load(Ordering::Relaxed)
    }

    /// Total raw (stuffed, bracketed) bytes written to the device since
    /// construction.
    #[must_use]
    pub fn traffic_out(&self) -> u64 {
        self.traffic_out.load(Ordering::Relaxed)
    }

    /// Cancels the four background tasks. Idempotent.
    pub fn dispose(&self) {
        self.cancellation.cancel();
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn control_frame_jumps_ahead_of_queued_data_frames() {
        let (engine_side, mut test_side) = duplex(16 * 1024);
        let (dispatch_tx, _dispatch_rx) = mpsc::unbounded_channel();
        let config = PortEngineConfig { data_queue_capacity: 16, ..PortEngineConfig::default() };
        let engine = PortEngine::new(1, engine_side, config, dispatch_tx);
        engine.start();

        for n in 0..5i64 {
            engine.enqueue_out(Frame { channel_id: n + 10, payload: Bytes::new() }).await.expect("enqueue data");
        }
        engine
            .enqueue_out_control(Frame { channel_id: 0, payload: Bytes::from_static(b"ctrl") })
            .expect("enqueue control");

        // Drain the wire and confirm the control frame (cid 0) arrives before
        // the data frames that were queued ahead of it.
        let mut scanner = FrameScanner::new();
        let mut first_cid = None;
        let mut buf = [0u8; 256];
        while first_cid.is_none() {
            let n = tokio::time::timeout(Duration::from_secs(1), test_side.read(&mut buf))
                .await
                .expect("no timeout")
                .expect("read");
            for body in scanner.push(&buf[..n]) {
                let frame = Frame::unpack(&body).expect("unpack");
                first_cid = Some(frame.channel_id);
                break;
            }
        }
        assert_eq!(first_cid, Some(0));
    }

    #[tokio::test]
    async fn reassembles_frames_written_by_the_peer_and_counts_them() {
        let (engine_side, mut test_side) = duplex(16 * 1024);
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
        let engine = PortEngine::new(7, engine_side, PortEngineConfig::default(), dispatch_tx);
        engine.start();

        let frame = Frame { channel_id: 3, payload: Bytes::from_static(b"payload") };
        test_side.write_all(&frame.pack().expect("pack")).await.expect("write");
        test_side.flush().await.expect("flush");

        let (port_id, received) = tokio::time::timeout(Duration::from_secs(1), dispatch_rx.recv())
            .await
            .expect("no timeout")
            .expect("frame dispatched");
        assert_eq!(port_id, 7);
        assert_eq!(received, frame);
        assert_eq!(engine.frames_in(), 1);
    }

    #[tokio::test]
    async fn back_pressure_reflects_outstanding_data_frames() {
        let (engine_side, _test_side) = duplex(16 * 1024);
        let (dispatch_tx, _dispatch_rx) = mpsc::unbounded_channel();
        // No start(): the sender never drains, so enqueued frames sit in the
        // queue and back_pressure() reflects them deterministically.
        let config = PortEngineConfig { data_queue_capacity: 4, ..PortEngineConfig::default() };
        let engine = PortEngine::new(1, engine_side, config, dispatch_tx);

        assert_eq!(engine.back_pressure(), 0);
        engine.enqueue_out(Frame { channel_id: 1, payload: Bytes::new() }).await.expect("enqueue");
        engine.enqueue_out(Frame { channel_id: 1, payload: Bytes::new() }).await.expect("enqueue");
        assert_eq!(engine.back_pressure(), 2);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (engine_side, _test_side) = duplex(1024);
        let (dispatch_tx, _dispatch_rx) = mpsc::unbounded_channel();
        let engine = PortEngine::new(1, engine_side, PortEngineConfig::default(), dispatch_tx);
        engine.start();
        engine.start();
        engine.dispose();
    }
}
