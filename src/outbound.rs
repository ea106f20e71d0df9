//! Outbound frame queue and the writer task that drains it.
//!
//! Senders never touch the socket. They append encoded frames to an
//! [`OutboundQueue`]; a dedicated writer task takes coalesced batches off the
//! front and writes each batch with one vectored write.
//!
//! # Architecture
//!
//! ```text
//! request()      ─┐
//! notification() ─┼─► OutboundQueue (FIFO) ─► Writer Task ─► stream
//! success()      ─┘
//! ```
//!
//! The queue outlives the writer: while no stream is attached (a client
//! between reconnects) frames simply accumulate and are flushed by the next
//! writer. Backpressure is advisory: [`OutboundQueue::is_saturated`] and
//! [`OutboundQueue::drained`] let producers throttle themselves, sends never
//! block.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, RpcError};

/// Default coalescing limit for one write (16 KB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Bytes>,
    queued_bytes: usize,
    /// A batch has been taken and not yet reported written.
    writing: bool,
    closed: bool,
}

/// What the writer should do next.
#[derive(Debug)]
pub enum Batch {
    /// Frames to write, in order.
    Frames(Vec<Bytes>),
    /// Nothing queued; wait for a push.
    Empty,
    /// Queue closed and fully flushed.
    Closed,
}

/// FIFO of encoded frames awaiting the writer.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    /// Wakes the writer.
    wakeup: Notify,
    /// Wakes `drained()` waiters.
    idle: Notify,
    high_water_mark: usize,
}

impl OutboundQueue {
    /// Create a queue that coalesces up to `high_water_mark` bytes per write.
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            idle: Notify::new(),
            high_water_mark: high_water_mark.max(1),
        }
    }

    /// Append a frame.
    ///
    /// Fails with `ConnectionClosed` once the queue is closed.
    pub fn push(&self, frame: Bytes) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(RpcError::ConnectionClosed);
            }
            state.queued_bytes += frame.len();
            state.frames.push_back(frame);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Put a frame ahead of everything already queued.
    ///
    /// Used for the handshake frame, which must be the first on a new stream.
    pub fn push_front(&self, frame: Bytes) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(RpcError::ConnectionClosed);
            }
            state.queued_bytes += frame.len();
            state.frames.push_front(frame);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Take the next coalesced batch.
    ///
    /// A batch holds consecutive frames whose total stays within the high-water
    /// mark; a single frame larger than the mark is sent alone.
    pub fn next_batch(&self) -> Batch {
        let mut state = self.state.lock();
        if state.frames.is_empty() {
            return if state.closed {
                Batch::Closed
            } else {
                Batch::Empty
            };
        }

        let mut batch = Vec::new();
        let mut size = 0;
        while let Some(front) = state.frames.front() {
            if !batch.is_empty() && size + front.len() > self.high_water_mark {
                break;
            }
            size += front.len();
            if let Some(frame) = state.frames.pop_front() {
                batch.push(frame);
            }
        }
        state.queued_bytes -= size;
        state.writing = true;
        Batch::Frames(batch)
    }

    /// Mark the taken batch as finished. Returns true if the queue is now idle.
    pub fn finish_batch(&self) -> bool {
        let idle = {
            let mut state = self.state.lock();
            state.writing = false;
            state.frames.is_empty()
        };
        if idle {
            self.idle.notify_waiters();
        }
        idle
    }

    /// Wait until a push or close happens.
    pub async fn wait(&self) {
        self.wakeup.notified().await;
    }

    /// Wait until everything queued so far has been written (or the queue
    /// is closed).
    pub async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.closed || (state.frames.is_empty() && !state.writing) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting frames. Already queued frames are still handed out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.wakeup.notify_one();
        self.idle.notify_waiters();
    }

    /// True once `close()` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of frames waiting.
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// True if no frames are waiting.
    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    /// Bytes waiting.
    pub fn queued_bytes(&self) -> usize {
        self.state.lock().queued_bytes
    }

    /// True while more than one write's worth of data is waiting.
    pub fn is_saturated(&self) -> bool {
        self.queued_bytes() >= self.high_water_mark
    }

    /// Coalescing limit in bytes.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Return an unwritten batch to the front of the queue.
    fn requeue(&self, batch: Vec<Bytes>) {
        let mut state = self.state.lock();
        for frame in batch.into_iter().rev() {
            state.queued_bytes += frame.len();
            state.frames.push_front(frame);
        }
        state.writing = false;
    }

    /// Clear the in-flight marker after a writer went away mid-batch.
    fn detach(&self) {
        self.state.lock().writing = false;
        self.idle.notify_waiters();
    }
}

/// Why the writer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The queue was closed and flushed; the stream was shut down.
    Flushed,
    /// The writer was cancelled; unsent frames stay queued.
    Detached,
}

/// Drain `queue` into `writer` until the queue closes or `cancel` fires.
///
/// `on_drain` runs every time the queue becomes empty after a write.
pub async fn writer_loop<W, F>(
    queue: &OutboundQueue,
    mut writer: W,
    cancel: CancellationToken,
    on_drain: F,
) -> Result<WriterExit>
where
    W: AsyncWrite + Unpin,
    F: Fn(),
{
    loop {
        if cancel.is_cancelled() {
            return Ok(WriterExit::Detached);
        }
        let batch = match queue.next_batch() {
            Batch::Frames(batch) if cancel.is_cancelled() => {
                queue.requeue(batch);
                return Ok(WriterExit::Detached);
            }
            Batch::Frames(batch) => batch,
            Batch::Empty => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(WriterExit::Detached),
                    _ = queue.wait() => continue,
                }
            }
            Batch::Closed => {
                let _ = writer.shutdown().await;
                debug!("writer flushed and shut down");
                return Ok(WriterExit::Flushed);
            }
        };

        trace!(frames = batch.len(), "writing batch");
        // A batch cut off mid-write is not retried.
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                queue.detach();
                return Ok(WriterExit::Detached);
            }
            res = write_frames(&mut writer, &batch) => res,
        };
        if let Err(e) = written {
            queue.detach();
            return Err(e);
        }

        if queue.finish_batch() {
            on_drain();
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
pub(crate) async fn write_frames<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_batch_coalescing_respects_high_water_mark() {
        let queue = OutboundQueue::new(10);
        for chunk in [&b"aaaa"[..], b"bbbb", b"cccc", b"dddddddddddddd", b"e"] {
            queue.push(Bytes::copy_from_slice(chunk)).unwrap();
        }
        assert_eq!(queue.queued_bytes(), 27);
        assert!(queue.is_saturated());

        let sizes = |batch: Batch| match batch {
            Batch::Frames(frames) => frames.iter().map(Bytes::len).collect::<Vec<_>>(),
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(sizes(queue.next_batch()), vec![4, 4]);
        assert_eq!(sizes(queue.next_batch()), vec![4]);
        // Oversized frame goes alone.
        assert_eq!(sizes(queue.next_batch()), vec![14]);
        assert_eq!(sizes(queue.next_batch()), vec![1]);
        assert!(matches!(queue.next_batch(), Batch::Empty));
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_push_front_and_close() {
        let queue = OutboundQueue::new(DEFAULT_HIGH_WATER_MARK);
        queue.push(Bytes::from_static(b"second")).unwrap();
        queue.push_front(Bytes::from_static(b"first")).unwrap();

        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.push(Bytes::from_static(b"late")),
            Err(RpcError::ConnectionClosed)
        ));

        match queue.next_batch() {
            Batch::Frames(frames) => {
                assert_eq!(&frames[0][..], b"first");
                assert_eq!(&frames[1][..], b"second");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(queue.next_batch(), Batch::Closed));
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(&slices[0][..], b"lo");

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 1);
        assert_eq!(&slices[0][..], b"world");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| Bytes::from_static(b"abc")).collect();

        write_frames(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner(), b"abcabcabcabcabc".to_vec());
    }

    #[tokio::test]
    async fn test_writer_preserves_order_and_signals_drain() {
        let (client, mut server) = duplex(64 * 1024);
        let queue = Arc::new(OutboundQueue::new(8));
        let drains = Arc::new(AtomicUsize::new(0));

        for i in 0..10u8 {
            queue.push(Bytes::from(vec![b'0' + i; 3])).unwrap();
        }

        let task = {
            let queue = queue.clone();
            let drains = drains.clone();
            tokio::spawn(async move {
                writer_loop(&queue, client, CancellationToken::new(), || {
                    drains.fetch_add(1, Ordering::SeqCst);
                })
                .await
            })
        };

        queue.drained().await;
        assert!(queue.is_empty());

        queue.close();
        assert_eq!(task.await.unwrap().unwrap(), WriterExit::Flushed);
        assert!(drains.load(Ordering::SeqCst) >= 1);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        let expected: Vec<u8> = (0..10u8).flat_map(|i| vec![b'0' + i; 3]).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_cancelled_writer_keeps_queue() {
        let (client, _server) = duplex(1024);
        let queue = Arc::new(OutboundQueue::new(DEFAULT_HIGH_WATER_MARK));
        let cancel = CancellationToken::new();

        let task = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { writer_loop(&queue, client, cancel, || {}).await })
        };

        cancel.cancel();
        assert_eq!(task.await.unwrap().unwrap(), WriterExit::Detached);

        // Frames pushed while detached wait for the next writer.
        queue.push(Bytes::from_static(b"later")).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_closed());
    }
}
