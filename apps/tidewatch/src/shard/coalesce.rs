//! Debounced per-subject broadcast queue. Bursts of events for the same
//! (subject, kind) pair inside a quiet window collapse into one delivery
//! carrying the newest payload; earlier payloads in the window are dropped,
//! never delivered.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

use crate::metrics;

/// Where flushed payloads go. The relay implements this by scanning its
/// live connections for subscribers.
pub trait BroadcastSink: Send + Sync + 'static {
    fn deliver(&self, subject_id: &str, kind: &str, payload: Value);
}

type QueueKey = (String, String);

struct QueueEntry {
    pending: VecDeque<(Instant, Value)>,
    /// `None` until the first flush; a fresh key delivers immediately.
    last_flush: Option<Instant>,
    flush_scheduled: bool,
}

pub struct Coalescer {
    quiet: Duration,
    idle_evict: Duration,
    entries: Mutex<HashMap<QueueKey, QueueEntry>>,
    sink: Arc<dyn BroadcastSink>,
}

impl Coalescer {
    pub fn new(quiet: Duration, idle_evict: Duration, sink: Arc<dyn BroadcastSink>) -> Self {
        Self {
            quiet,
            idle_evict,
            entries: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Queue a payload for delivery. Flushes immediately when the key's last
    /// flush is older than the quiet window; otherwise one flush is scheduled
    /// for the end of the current window. Later arrivals never push an
    /// already-scheduled flush further out.
    pub fn emit(self: &Arc<Self>, subject_id: &str, kind: &str, payload: Value) {
        let key = (subject_id.to_string(), kind.to_string());
        let now = Instant::now();

        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| QueueEntry {
            pending: VecDeque::new(),
            last_flush: None,
            flush_scheduled: false,
        });
        entry.pending.push_back((now, payload));

        if entry.flush_scheduled {
            return;
        }
        match entry.last_flush {
            Some(flushed_at) if now.duration_since(flushed_at) < self.quiet => {
                entry.flush_scheduled = true;
                let deadline = flushed_at + self.quiet;
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    sleep_until(deadline).await;
                    this.flush(&key);
                });
            }
            _ => Self::flush_entry(entry, &key, &self.sink),
        }
    }

    fn flush(&self, key: &QueueKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.flush_scheduled = false;
            Self::flush_entry(entry, key, &self.sink);
        }
    }

    /// Deliver the newest pending payload and drop the rest.
    fn flush_entry(entry: &mut QueueEntry, key: &QueueKey, sink: &Arc<dyn BroadcastSink>) {
        let Some((_, payload)) = entry.pending.pop_back() else {
            return;
        };
        let superseded = entry.pending.len();
        entry.pending.clear();
        entry.last_flush = Some(Instant::now());
        if superseded > 0 {
            metrics::COALESCED_SUPERSEDED.inc_by(superseded as u64);
            debug!(
                subject_id = %key.0,
                kind = %key.1,
                superseded,
                "coalesced payloads superseded in quiet window"
            );
        }
        sink.deliver(&key.0, &key.1, payload);
    }

    /// Periodically drop queue entries with no activity since their last
    /// flush, bounding memory across churning subjects.
    pub fn start_sweeper(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.idle_evict);
            interval.tick().await;
            loop {
                interval.tick().await;
                let now = Instant::now();
                this.entries.lock().retain(|_, entry| {
                    entry.flush_scheduled
                        || !entry.pending.is_empty()
                        || entry
                            .last_flush
                            .is_some_and(|at| now.duration_since(at) < this.idle_evict)
                });
            }
        });
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct TestSink {
        delivered: Mutex<Vec<(String, String, Value)>>,
    }

    impl BroadcastSink for TestSink {
        fn deliver(&self, subject_id: &str, kind: &str, payload: Value) {
            self.delivered
                .lock()
                .push((subject_id.to_string(), kind.to_string(), payload));
        }
    }

    fn coalescer(sink: &Arc<TestSink>) -> Arc<Coalescer> {
        Arc::new(Coalescer::new(
            Duration::from_secs(5),
            Duration::from_secs(60),
            sink.clone(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_delivers_first_immediately_then_only_the_last() {
        let sink = Arc::new(TestSink::default());
        let queue = coalescer(&sink);

        queue.emit("42", "PRESENCE_UPDATE", json!({ "n": 1 }));
        for n in 2..=5 {
            queue.emit("42", "PRESENCE_UPDATE", json!({ "n": n }));
        }
        tokio::time::sleep(Duration::from_secs(6)).await;

        let delivered = sink.delivered.lock().clone();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].2, json!({ "n": 1 }));
        assert_eq!(delivered[1].2, json!({ "n": 5 }));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_flush_is_not_pushed_out_by_later_arrivals() {
        let sink = Arc::new(TestSink::default());
        let queue = coalescer(&sink);

        queue.emit("7", "PRESENCE_UPDATE", json!({ "n": 1 })); // flushes, window opens
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.emit("7", "PRESENCE_UPDATE", json!({ "n": 2 })); // scheduled for t=5s
        tokio::time::sleep(Duration::from_millis(3900)).await;
        queue.emit("7", "PRESENCE_UPDATE", json!({ "n": 3 })); // same deadline

        // Just past the original deadline: the flush fired and carried n=3.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let delivered = sink.delivered.lock().clone();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].2, json!({ "n": 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_coalesce_together() {
        let sink = Arc::new(TestSink::default());
        let queue = coalescer(&sink);

        queue.emit("1", "PRESENCE_UPDATE", json!({ "who": "a" }));
        queue.emit("2", "PRESENCE_UPDATE", json!({ "who": "b" }));
        queue.emit("1", "MEMBER_CHUNK", json!({ "who": "c" }));
        tokio::task::yield_now().await;

        assert_eq!(sink.delivered.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_evicted() {
        let sink = Arc::new(TestSink::default());
        let queue = coalescer(&sink);
        queue.start_sweeper();

        queue.emit("42", "PRESENCE_UPDATE", json!({}));
        assert_eq!(queue.entry_count(), 1);

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(queue.entry_count(), 0);
    }
}
