//! Per-controller work queue.
//!
//! Deduplicating: a key is either ready, delayed, or in flight, never twice.
//! At most one reconcile is dispatched per key at a time; an `add` for an
//! in-flight key is coalesced and re-dispatched when the current pass ends.
//! Failed passes re-enqueue with exponential backoff and jitter; a per-key
//! minimum interval keeps hot keys from spinning the workers.

use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Token-bucket floor between two dispatches of the same key.
    pub per_key_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(300),
            per_key_interval: Duration::from_millis(50),
        }
    }
}

/// Receipt for an in-flight item; hand it back via `done` or `retry`.
#[derive(Debug)]
pub struct WorkToken {
    id: u64,
    pub key: String,
}

#[derive(Default)]
struct State {
    ready: VecDeque<String>,
    /// Keys in `ready` or `delayed`.
    queued: HashSet<String>,
    delayed: Vec<(Instant, String)>,
    in_flight: HashMap<u64, String>,
    in_flight_keys: HashSet<String>,
    /// Keys re-added while in flight; re-dispatched on completion.
    dirty: HashSet<String>,
    attempts: HashMap<String, u32>,
    last_dispatch: HashMap<String, Instant>,
    next_token: u64,
    retries_total: u64,
    shut_down: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    cfg: QueueConfig,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl WorkQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            cfg,
        }
    }

    /// Enqueue a key. No-op when the key is already queued; coalesced when
    /// it is in flight.
    pub fn add(&self, key: &str) {
        let mut s = self.state.lock().expect("queue lock");
        if s.shut_down {
            return;
        }
        if s.in_flight_keys.contains(key) {
            s.dirty.insert(key.to_string());
            return;
        }
        if s.queued.insert(key.to_string()) {
            s.ready.push_back(key.to_string());
            drop(s);
            self.notify.notify_waiters();
        }
    }

    /// Enqueue after a delay (timed re-queues for long-running operations).
    pub fn add_after(&self, key: &str, delay: Duration) {
        let mut s = self.state.lock().expect("queue lock");
        if s.shut_down {
            return;
        }
        if s.in_flight_keys.contains(key) {
            s.dirty.insert(key.to_string());
            return;
        }
        if s.queued.insert(key.to_string()) {
            s.delayed.push((Instant::now() + delay, key.to_string()));
            drop(s);
            self.notify.notify_waiters();
        }
    }

    /// Block until an item is ready, mark it in flight, and return its
    /// receipt. Returns None once the queue is shut down.
    pub async fn get(&self) -> Option<WorkToken> {
        loop {
            let wait_until = {
                let mut s = self.state.lock().expect("queue lock");
                if s.shut_down {
                    return None;
                }
                let now = Instant::now();

                // Promote due delayed items.
                let mut i = 0;
                while i < s.delayed.len() {
                    if s.delayed[i].0 <= now {
                        let (_, key) = s.delayed.swap_remove(i);
                        s.ready.push_back(key);
                    } else {
                        i += 1;
                    }
                }

                let mut picked = None;
                while let Some(key) = s.ready.pop_front() {
                    // Per-key rate limit: push back to delayed when dispatched
                    // too recently.
                    let due = s
                        .last_dispatch
                        .get(&key)
                        .map(|last| *last + self.cfg.per_key_interval);
                    match due {
                        Some(due) if due > now => s.delayed.push((due, key)),
                        _ => {
                            picked = Some(key);
                            break;
                        }
                    }
                }

                if let Some(key) = picked {
                    s.queued.remove(&key);
                    s.next_token += 1;
                    let id = s.next_token;
                    s.in_flight.insert(id, key.clone());
                    s.in_flight_keys.insert(key.clone());
                    s.last_dispatch.insert(key.clone(), now);
                    return Some(WorkToken { id, key });
                }

                s.delayed.iter().map(|(due, _)| *due).min()
            };

            // The wait is bounded either way: a notify between releasing the
            // lock and parking would otherwise be lost.
            let timeout = match wait_until {
                Some(due) => due.saturating_duration_since(Instant::now()),
                None => Duration::from_millis(200),
            }
            .min(Duration::from_millis(200));
            let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        }
    }

    fn finish(&self, token: WorkToken) -> Option<String> {
        let mut s = self.state.lock().expect("queue lock");
        s.in_flight.remove(&token.id);
        s.in_flight_keys.remove(&token.key);
        if s.dirty.remove(&token.key) {
            Some(token.key)
        } else {
            None
        }
    }

    /// Successful (or terminal) completion: drop the item and reset its
    /// attempt counter; coalesced adds are re-dispatched immediately.
    pub fn done(&self, token: WorkToken) {
        let key = token.key.clone();
        let readd = self.finish(token);
        {
            let mut s = self.state.lock().expect("queue lock");
            s.attempts.remove(&key);
            if let Some(key) = readd {
                if s.queued.insert(key.clone()) {
                    s.ready.push_back(key);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Transient failure: re-enqueue after `backoff(attempts)`.
    pub fn retry(&self, token: WorkToken) {
        let key = token.key.clone();
        self.finish(token);
        let delay = {
            let mut s = self.state.lock().expect("queue lock");
            let attempts = s.attempts.entry(key.clone()).or_insert(0);
            *attempts += 1;
            let attempts = *attempts;
            s.retries_total += 1;
            s.dirty.remove(&key);
            self.backoff(attempts)
        };
        {
            let mut s = self.state.lock().expect("queue lock");
            if s.queued.insert(key.clone()) {
                s.delayed.push((Instant::now() + delay, key));
            }
        }
        self.notify.notify_waiters();
    }

    /// Reset the attempt counter after observed progress.
    pub fn forget(&self, key: &str) {
        let mut s = self.state.lock().expect("queue lock");
        s.attempts.remove(key);
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exp = self
            .cfg
            .base_backoff
            .saturating_mul(1u32 << attempts.min(20).saturating_sub(1));
        let capped = exp.min(self.cfg.max_backoff);
        // ±20% jitter so retries from many objects do not align.
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        capped.mul_f64(jitter)
    }

    pub fn depth(&self) -> usize {
        let s = self.state.lock().expect("queue lock");
        s.ready.len() + s.delayed.len()
    }

    pub fn in_flight(&self) -> usize {
        let s = self.state.lock().expect("queue lock");
        s.in_flight.len()
    }

    pub fn retries_total(&self) -> u64 {
        let s = self.state.lock().expect("queue lock");
        s.retries_total
    }

    /// Stop dispatching; blocked `get` calls return None.
    pub fn shut_down(&self) {
        let mut s = self.state.lock().expect("queue lock");
        s.shut_down = true;
        drop(s);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_queue() -> WorkQueue {
        WorkQueue::new(QueueConfig {
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            per_key_interval: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn test_add_dedups() {
        let q = fast_queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.depth(), 2);

        let t1 = q.get().await.unwrap();
        let t2 = q.get().await.unwrap();
        assert_ne!(t1.key, t2.key);
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_coalesces() {
        let q = fast_queue();
        q.add("a");
        let t = q.get().await.unwrap();

        // Re-add while in flight: not dispatched again until done.
        q.add("a");
        assert_eq!(q.depth(), 0);

        q.done(t);
        let t = q.get().await.unwrap();
        assert_eq!(t.key, "a");
        q.done(t);
    }

    #[tokio::test]
    async fn test_retry_backs_off() {
        let q = fast_queue();
        q.add("a");
        let t = q.get().await.unwrap();
        q.retry(t);
        assert_eq!(q.retries_total(), 1);

        // The item comes back after its backoff.
        let t = tokio::time::timeout(Duration::from_secs(1), q.get())
            .await
            .expect("item should reappear")
            .unwrap();
        assert_eq!(t.key, "a");
        q.done(t);
    }

    #[tokio::test]
    async fn test_forget_resets_attempts() {
        let q = fast_queue();
        q.add("a");
        let t = q.get().await.unwrap();
        q.retry(t);
        q.forget("a");
        let s = q.state.lock().unwrap();
        assert!(!s.attempts.contains_key("a"));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_get() {
        let q = Arc::new(fast_queue());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.get().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_add() {
        let q = fast_queue();
        q.add_after("a", Duration::from_millis(30));
        let start = Instant::now();
        let t = q.get().await.unwrap();
        assert_eq!(t.key, "a");
        assert!(start.elapsed() >= Duration::from_millis(25));
        q.done(t);
    }
}
