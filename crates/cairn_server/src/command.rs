//! The unit of work flowing through the node: an immutable request, the
//! response being built for it, and the scheduling attributes the queue
//! orders by.

use tokio::sync::oneshot;

use crate::clock::{ms_to_us, now_us};
use crate::message::Message;

pub const PRIORITY_MIN: u16 = 0;
pub const PRIORITY_NORM: u16 = 500;
pub const PRIORITY_MAX: u16 = 1000;

/// Applied when a request carries no `timeout` header.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Named lifecycle phases recorded on every command for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    QueueWorker = 0,
    Peek = 1,
    Process = 2,
    Commit = 3,
}

const PHASE_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
struct PhaseTiming {
    started_us: u64,
    total_us: u64,
}

/// A command owns its request for its whole lifetime and lives in exactly
/// one place at a time: the queue, a worker, or the response writer.
pub struct Command {
    pub id: String,
    pub request: Message,
    pub response: Message,
    pub priority: u16,
    /// Absolute epoch microseconds at which the command becomes workable.
    pub execute_timestamp_us: u64,
    /// Absolute epoch microseconds after which the command is surfaced as a
    /// timeout regardless of eligibility.
    pub timeout_timestamp_us: u64,
    /// Blacklist fingerprint component, copied out of the request headers.
    pub user_id: String,
    response_tx: Option<oneshot::Sender<Message>>,
    timing: [PhaseTiming; PHASE_COUNT],
}

impl Command {
    /// Build a command from a parsed request, applying the scheduling
    /// headers: `priority` (clamped to 0..=1000, default 500),
    /// `commandExecuteTime` (absolute epoch µs, default now) and `timeout`
    /// (relative milliseconds from receipt, default
    /// [`DEFAULT_TIMEOUT_MS`]).
    pub fn from_request(id: String, request: Message, default_timeout_ms: u64) -> Self {
        let now = now_us();
        let priority = match request.get("priority") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(|p| p.clamp(i64::from(PRIORITY_MIN), i64::from(PRIORITY_MAX)) as u16)
                .unwrap_or(PRIORITY_NORM),
            None => PRIORITY_NORM,
        };
        let execute_timestamp_us = match request.get("commandExecuteTime") {
            Some(raw) => raw.trim().parse::<u64>().unwrap_or(now),
            None => now,
        };
        let timeout_ms = match request.get("timeout") {
            Some(raw) => raw.trim().parse::<u64>().unwrap_or(default_timeout_ms),
            None => default_timeout_ms,
        };
        // A timeout is relative to receipt, not to the scheduled time. Keep
        // the timeout >= execute invariant by raising it when a command is
        // scheduled past its own deadline.
        let timeout_timestamp_us = now
            .saturating_add(ms_to_us(timeout_ms))
            .max(execute_timestamp_us);
        let user_id = request.get("userID").unwrap_or_default().to_string();

        Self {
            id,
            request,
            response: Message::default(),
            priority,
            execute_timestamp_us,
            timeout_timestamp_us,
            user_id,
            response_tx: None,
            timing: [PhaseTiming::default(); PHASE_COUNT],
        }
    }

    /// Attach the one-shot channel the response is delivered on.
    pub fn with_responder(mut self, tx: oneshot::Sender<Message>) -> Self {
        self.response_tx = Some(tx);
        self
    }

    pub fn method(&self) -> &str {
        &self.request.method_line
    }

    pub fn timed_out(&self, now: u64) -> bool {
        self.timeout_timestamp_us < now
    }

    pub fn start_timing(&mut self, phase: Phase) {
        let slot = &mut self.timing[phase as usize];
        if slot.started_us == 0 {
            slot.started_us = now_us();
        }
    }

    pub fn stop_timing(&mut self, phase: Phase) {
        let slot = &mut self.timing[phase as usize];
        if slot.started_us != 0 {
            slot.total_us += now_us().saturating_sub(slot.started_us);
            slot.started_us = 0;
        }
    }

    pub fn phase_total_us(&self, phase: Phase) -> u64 {
        self.timing[phase as usize].total_us
    }

    /// Deliver the response to the waiting connection and log the lifecycle
    /// timings. Consumes the command; a command is responded to exactly once.
    pub fn finish(mut self) {
        for phase in [Phase::QueueWorker, Phase::Peek, Phase::Process, Phase::Commit] {
            self.stop_timing(phase);
        }
        tracing::debug!(
            id = %self.id,
            method = %self.request.method_line,
            status = %self.response.method_line,
            queue_us = self.phase_total_us(Phase::QueueWorker),
            peek_us = self.phase_total_us(Phase::Peek),
            process_us = self.phase_total_us(Phase::Process),
            commit_us = self.phase_total_us(Phase::Commit),
            "command finished"
        );
        if let Some(tx) = self.response_tx.take() {
            // The connection may have gone away while we worked.
            let _ = tx.send(self.response);
        }
    }
}
