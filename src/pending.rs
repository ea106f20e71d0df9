//! Correlation of outbound requests with their responses.
//!
//! Every request gets a string id of the form `{epoch}:{counter}`:
//! - `epoch` - milliseconds since the top of the hour the process started in, base36
//! - `counter` - per-table counter, base36, zero-padded so ids sort lexically
//!
//! Each entry is terminated exactly once: by a response, by its timeout, or
//! by [`PendingTable::fail_all`] when the connection goes away. Removal from
//! the table under its mutex is the completion guard; whoever removes the
//! entry owns the one-shot sender.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::message::{Id, Message};

/// Default request timeout (2 minutes).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest counter value before wrapping back to 1 (2^53 - 1).
pub const MAX_COUNTER: u64 = (1 << 53) - 1;

/// Width of the base36 counter: `MAX_COUNTER` in base36 is 11 digits.
const COUNTER_WIDTH: usize = 11;

static EPOCH: OnceLock<String> = OnceLock::new();

/// Process-wide id prefix.
pub fn epoch() -> &'static str {
    EPOCH.get_or_init(|| {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        to_base36(now_ms % 3_600_000)
    })
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(COUNTER_WIDTH);
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

type Completion = oneshot::Sender<Result<Value>>;

struct Entry {
    method: String,
    frame: Bytes,
    tx: Completion,
    timer: Option<JoinHandle<()>>,
}

/// Table of in-flight requests, keyed by correlation id.
pub struct PendingTable {
    entries: Mutex<HashMap<String, Entry>>,
    counter: AtomicU64,
    timeout: Duration,
}

impl PendingTable {
    /// Create a table whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            timeout,
        })
    }

    /// Allocate the next correlation id.
    pub fn next_id(&self) -> String {
        let prev = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(if n >= MAX_COUNTER { 1 } else { n + 1 })
            })
            .unwrap_or(0);
        let n = if prev >= MAX_COUNTER { 1 } else { prev + 1 };
        format!("{}:{:0>width$}", epoch(), to_base36(n), width = COUNTER_WIDTH)
    }

    /// Register a new request.
    ///
    /// `encode` turns the request message into a wire frame; the frame is
    /// cached on the entry so it can be replayed or reported on timeout.
    /// The timeout timer starts immediately.
    pub fn create<F>(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        encode: F,
    ) -> Result<PendingRequest>
    where
        F: FnOnce(&Message) -> Result<Bytes>,
    {
        let id = self.next_id();
        let message = Message::request(Id::Str(id.clone()), method, params);
        let frame = encode(&message)?;
        let (tx, rx) = oneshot::channel();

        let table: Weak<Self> = Arc::downgrade(self);
        let timeout = self.timeout;
        let timer_id = id.clone();

        let mut entries = self.entries.lock();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(&timer_id);
            }
        });
        entries.insert(
            id.clone(),
            Entry {
                method: method.to_string(),
                frame: frame.clone(),
                tx,
                timer: Some(timer),
            },
        );
        drop(entries);

        Ok(PendingRequest { id, frame, rx })
    }

    /// Complete the entry for `id` with `result`.
    ///
    /// Returns false if no such entry is live (already answered, timed out,
    /// failed, or never issued).
    pub fn complete(&self, id: &str, result: Result<Value>) -> bool {
        let Some(entry) = self.entries.lock().remove(id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        let _ = entry.tx.send(result);
        true
    }

    /// Forget `id` without completing it. Its waiter sees `ConnectionReset`.
    pub fn cancel(&self, id: &str) -> bool {
        match self.entries.lock().remove(id) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    fn expire(&self, id: &str) {
        let Some(entry) = self.entries.lock().remove(id) else {
            return;
        };
        debug!(id = %id, method = %entry.method, "request timed out");
        let _ = entry.tx.send(Err(RpcError::Timeout {
            id: id.to_string(),
            frame: entry.frame,
        }));
    }

    /// Fail every live entry with `ConnectionReset`.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            let _ = entry.tx.send(Err(RpcError::ConnectionReset));
        }
        if count > 0 {
            debug!(count, "failed pending requests");
        }
        count
    }

    /// True if `id` is still awaiting completion.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cached frames of every live entry, ordered by id.
    pub fn frames(&self) -> Vec<(String, Bytes)> {
        let mut frames: Vec<(String, Bytes)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), e.frame.clone()))
            .collect();
        frames.sort_by(|a, b| a.0.cmp(&b.0));
        frames
    }

    /// Request timeout used for new entries.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for PendingTable {
    fn drop(&mut self) {
        for (_, entry) in self.entries.get_mut().drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}

/// Handle to one in-flight request.
///
/// Awaiting it yields the peer's `result`, or the error that terminated it.
pub struct PendingRequest {
    id: String,
    frame: Bytes,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingRequest {
    /// Correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Encoded request frame.
    pub fn frame(&self) -> &Bytes {
        &self.frame
    }
}

impl Future for PendingRequest {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectionReset),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorObject;
    use serde_json::json;

    fn encode(msg: &Message) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&msg.to_value())?))
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(MAX_COUNTER), "2gosa7pa2gv");
    }

    #[test]
    fn test_ids_are_sortable() {
        let table = PendingTable::new(DEFAULT_REQUEST_TIMEOUT);
        let ids: Vec<String> = (0..100).map(|_| table.next_id()).collect();

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert!(ids[0].starts_with(epoch()));
        assert!(ids[0].ends_with(":00000000001"));
    }

    #[test]
    fn test_counter_wraps() {
        let table = PendingTable::new(DEFAULT_REQUEST_TIMEOUT);
        table.counter.store(MAX_COUNTER - 1, Ordering::SeqCst);

        assert!(table.next_id().ends_with(":2gosa7pa2gv"));
        assert!(table.next_id().ends_with(":00000000001"));
    }

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let table = PendingTable::new(DEFAULT_REQUEST_TIMEOUT);
        let req = table.create("echo", Some(json!({"a": 4})), encode).unwrap();
        let id = req.id().to_string();

        let frame: Value = serde_json::from_slice(req.frame()).unwrap();
        assert_eq!(frame["method"], "echo");
        assert_eq!(frame["id"], json!(id));

        assert!(table.contains(&id));
        assert!(table.complete(&id, Ok(json!({"a": 4}))));
        assert!(!table.complete(&id, Ok(json!("late"))));
        assert!(table.is_empty());

        assert_eq!(req.await.unwrap(), json!({"a": 4}));
    }

    #[tokio::test]
    async fn test_remote_error() {
        let table = PendingTable::new(DEFAULT_REQUEST_TIMEOUT);
        let req = table.create("boom", None, encode).unwrap();
        let id = req.id().to_string();

        table.complete(
            &id,
            Err(RpcError::Remote(ErrorObject::method_not_found(None))),
        );

        let err = req.await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorObject::METHOD_NOT_FOUND));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response() {
        let table = PendingTable::new(Duration::from_millis(100));
        let req = table.create("slow", None, encode).unwrap();
        let id = req.id().to_string();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!table.contains(&id));
        assert!(!table.complete(&id, Ok(json!("late"))));

        match req.await {
            Err(RpcError::Timeout { id: timed_out, frame }) => {
                assert_eq!(timed_out, id);
                assert!(!frame.is_empty());
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_beats_timeout() {
        let table = PendingTable::new(Duration::from_millis(100));
        let req = table.create("fast", None, encode).unwrap();
        let id = req.id().to_string();

        assert!(table.complete(&id, Ok(json!(1))));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(req.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_fail_all_and_cancel() {
        let table = PendingTable::new(DEFAULT_REQUEST_TIMEOUT);
        let a = table.create("a", None, encode).unwrap();
        let b = table.create("b", None, encode).unwrap();
        let c = table.create("c", None, encode).unwrap();

        let frames = table.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].0, a.id());
        assert_eq!(frames[2].0, c.id());

        assert!(table.cancel(c.id()));
        assert_eq!(table.fail_all(), 2);
        assert!(table.is_empty());

        assert!(a.await.unwrap_err().is_reset());
        assert!(b.await.unwrap_err().is_reset());
        assert!(c.await.unwrap_err().is_reset());
    }
}
