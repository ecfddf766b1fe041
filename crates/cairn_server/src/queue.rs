//! Thread-safe scheduled priority queue that feeds the worker pool.
//!
//! Commands are ordered by a two-level map (priority, then execute
//! timestamp, ties FIFO by push order) with an auxiliary index ordered by
//! timeout timestamp so expired work is surfaced without scanning buckets.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::clock::{ms_to_us, now_us};
use crate::command::{Command, Phase};

/// Raised by `get` when the wait expires with nothing workable. Internal to
/// the worker loop; never turned into a client response.
#[derive(Debug, Error)]
#[error("no workable command within the wait")]
pub struct QueueTimeout;

#[derive(Default)]
struct QueueInner {
    /// priority -> (executeTimestamp, seq) -> command. Higher priority wins;
    /// `seq` keeps pushes with identical timestamps FIFO.
    by_priority: BTreeMap<u16, BTreeMap<(u64, u64), Command>>,
    /// (timeoutTimestamp, seq) -> (priority, executeTimestamp). Exactly one
    /// entry per queued command, sharing its `seq`.
    by_timeout: BTreeMap<(u64, u64), (u16, u64)>,
    next_seq: u64,
}

pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            available: Condvar::new(),
        }
    }

    /// Take ownership of a command and wake one waiter. Commands already
    /// past their timeout are accepted; the next dequeue surfaces them.
    pub fn push(&self, mut cmd: Command) {
        cmd.start_timing(Phase::QueueWorker);
        {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner
                .by_timeout
                .insert((cmd.timeout_timestamp_us, seq), (cmd.priority, cmd.execute_timestamp_us));
            inner
                .by_priority
                .entry(cmd.priority)
                .or_default()
                .insert((cmd.execute_timestamp_us, seq), cmd);
        }
        self.available.notify_one();
    }

    /// `get` without in-flight accounting; see [`CommandQueue::get_counted`].
    pub fn get(&self, timeout_us: u64) -> Result<Command, QueueTimeout> {
        let unused = AtomicI64::new(0);
        self.get_counted(timeout_us, &unused)
    }

    /// Return the next workable command, waiting up to `timeout_us`
    /// microseconds (0 = wait indefinitely).
    ///
    /// `in_flight` is incremented under the queue lock before the command is
    /// removed, so `size() + in_flight` never undercounts across the
    /// dequeue transition.
    ///
    /// The condition wait is clamped to the next scheduled execute or
    /// timeout timestamp, so future-scheduled work is picked up close to its
    /// due time even when no push arrives to wake a waiter.
    pub fn get_counted(
        &self,
        timeout_us: u64,
        in_flight: &AtomicI64,
    ) -> Result<Command, QueueTimeout> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cmd) = Self::dequeue(&mut inner, in_flight) {
            return Ok(cmd);
        }

        let deadline = if timeout_us > 0 {
            Some(Instant::now() + Duration::from_micros(timeout_us))
        } else {
            None
        };

        loop {
            let until_deadline = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let until_next_event = Self::next_event_us(&inner).map(|event_us| {
                Duration::from_micros(event_us.saturating_sub(now_us()).max(1))
            });
            let wait = match (until_deadline, until_next_event) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            match wait {
                Some(duration) => {
                    let (guard, _) = self.available.wait_timeout(inner, duration).unwrap();
                    inner = guard;
                }
                None => {
                    inner = self.available.wait(inner).unwrap();
                }
            }

            if let Some(cmd) = Self::dequeue(&mut inner, in_flight) {
                return Ok(cmd);
            }
            if let Some(d) = deadline {
                // Past the caller's deadline with nothing workable; anything
                // earlier was a scheduled-event wake-up or a spurious one.
                if Instant::now() >= d {
                    return Err(QueueTimeout);
                }
            }
        }
    }

    pub fn empty(&self) -> bool {
        self.inner.lock().unwrap().by_priority.is_empty()
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.by_priority.values().map(BTreeMap::len).sum()
    }

    /// Drop all queued commands. Their response channels close with them, so
    /// waiting clients observe an empty response.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_priority.clear();
        inner.by_timeout.clear();
    }

    /// Method lines of everything currently queued, for the `Status` body.
    pub fn snapshot_method_lines(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_priority
            .values()
            .flat_map(|bucket| bucket.values().map(|cmd| cmd.request.method_line.clone()))
            .collect()
    }

    /// Find and drop the command with the given id. Linear scan; this is a
    /// rarely exercised maintenance path, not the hot path.
    pub fn remove_by_id(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let QueueInner {
            by_priority,
            by_timeout,
            ..
        } = &mut *inner;
        let mut found = None;
        for (&priority, bucket) in by_priority.iter() {
            if let Some((&key, cmd)) = bucket.iter().find(|(_, cmd)| cmd.id == id) {
                found = Some((priority, key, cmd.timeout_timestamp_us));
                break;
            }
        }
        let Some((priority, (execute_us, seq), timeout_us)) = found else {
            return false;
        };
        let mut emptied = false;
        if let Some(bucket) = by_priority.get_mut(&priority) {
            bucket.remove(&(execute_us, seq));
            emptied = bucket.is_empty();
        }
        if emptied {
            by_priority.remove(&priority);
        }
        by_timeout.remove(&(timeout_us, seq));
        true
    }

    /// Drop every command scheduled more than `ms_ahead` milliseconds past
    /// now, keeping the timeout index consistent and erasing buckets that
    /// become empty. Waiters are not notified; this only removes work.
    pub fn prune_future(&self, ms_ahead: u64) {
        let time_limit = now_us().saturating_add(ms_to_us(ms_ahead));
        let mut inner = self.inner.lock().unwrap();
        let QueueInner {
            by_priority,
            by_timeout,
            ..
        } = &mut *inner;
        for (&priority, bucket) in by_priority.iter_mut() {
            let removed = bucket.split_off(&(time_limit.saturating_add(1), 0));
            if removed.is_empty() {
                continue;
            }
            for ((_, seq), cmd) in &removed {
                by_timeout.remove(&(cmd.timeout_timestamp_us, *seq));
            }
            tracing::info!(
                priority,
                removed = removed.len(),
                ms_ahead,
                "pruned commands scheduled too far in the future"
            );
        }
        by_priority.retain(|_, bucket| !bucket.is_empty());
    }

    /// Earliest instant at which a currently queued command could become
    /// workable: the nearest timeout or the nearest scheduled execute time.
    fn next_event_us(inner: &QueueInner) -> Option<u64> {
        let next_timeout = inner.by_timeout.keys().next().map(|&(timeout_us, _)| timeout_us);
        let next_execute = inner
            .by_priority
            .values()
            .filter_map(|bucket| bucket.keys().next().map(|&(execute_us, _)| execute_us))
            .min();
        match (next_timeout, next_execute) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Remove and return the first workable command, if any.
    ///
    /// Workable means: past its timeout (those win outright, so they are
    /// observed and turned into timeout errors instead of silently aging),
    /// or due to execute in the highest-priority bucket that has a due
    /// command. A higher-priority bucket whose earliest entry is still in
    /// the future does not block due work in lower buckets.
    fn dequeue(inner: &mut QueueInner, in_flight: &AtomicI64) -> Option<Command> {
        let now = now_us();

        // Expired timeouts first.
        let expired = inner
            .by_timeout
            .iter()
            .next()
            .map(|(&key, &value)| (key, value));
        if let Some(((timeout_us, seq), (priority, execute_us))) = expired {
            if timeout_us < now {
                in_flight.fetch_add(1, Ordering::SeqCst);
                inner.by_timeout.remove(&(timeout_us, seq));
                let mut emptied = false;
                let cmd = inner.by_priority.get_mut(&priority).and_then(|bucket| {
                    let cmd = bucket.remove(&(execute_us, seq));
                    emptied = bucket.is_empty();
                    cmd
                });
                if emptied {
                    inner.by_priority.remove(&priority);
                }
                if let Some(mut cmd) = cmd {
                    cmd.stop_timing(Phase::QueueWorker);
                    return Some(cmd);
                }
                // The two maps share a seq per command, so this is
                // unreachable unless the invariant broke.
                in_flight.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(timeout_us, "expired timeout entry had no matching command");
            }
        }

        // Highest priority whose earliest entry is due.
        let chosen = inner
            .by_priority
            .iter()
            .rev()
            .find_map(|(&priority, bucket)| {
                bucket
                    .keys()
                    .next()
                    .filter(|&&(execute_us, _)| execute_us <= now)
                    .map(|&key| (priority, key))
            });
        if let Some((priority, (execute_us, seq))) = chosen {
            in_flight.fetch_add(1, Ordering::SeqCst);
            let mut emptied = false;
            let cmd = inner.by_priority.get_mut(&priority).and_then(|bucket| {
                let cmd = bucket.remove(&(execute_us, seq));
                emptied = bucket.is_empty();
                cmd
            });
            if emptied {
                inner.by_priority.remove(&priority);
            }
            if let Some(mut cmd) = cmd {
                inner.by_timeout.remove(&(cmd.timeout_timestamp_us, seq));
                cmd.stop_timing(Phase::QueueWorker);
                return Some(cmd);
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        None
    }
}
