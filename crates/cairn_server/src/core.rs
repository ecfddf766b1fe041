//! The command executor: `peek` / `process` and everything they share.
//!
//! `peek` pre-processes a command and may run on any node, multiple times;
//! it must not modify the database. `process` runs only on the primary,
//! inside a transaction the worker opened, and reports whether the worker
//! should commit. Both consult the blacklist first, and both arm the crash
//! guard so a handler that kills the process gets reported to peers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::blacklist::CommandBlacklist;
use crate::cluster::{PeerStatus, RoleState};
use crate::command::{Command, Phase};
use crate::crash;
use crate::message::{
    Message, STATUS_BLACKLISTED, STATUS_INTERNAL_ERROR, STATUS_NOT_FOUND, STATUS_OK,
    STATUS_UNRECOGNIZED,
};
use crate::queue::CommandQueue;
use crate::storage::{Datastore, Transaction};

/// A caught, well-typed handler failure. The status line becomes the
/// response; the worker rolls back any open transaction.
#[derive(Debug, Error)]
#[error("{status_line}")]
pub struct HandlerError {
    pub status_line: String,
}

impl HandlerError {
    fn new(status_line: impl Into<String>) -> Self {
        Self {
            status_line: status_line.into(),
        }
    }

    fn unrecognized() -> Self {
        Self::new(STATUS_UNRECOGNIZED)
    }
}

/// Body of the `Status` response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    state: &'static str,
    node_id: u64,
    queued_commands: Vec<String>,
    queued_count: usize,
    in_flight_commands: i64,
    blacklisted_commands: usize,
    peers: Vec<PeerStatus>,
}

pub struct CommandCore {
    node_id: u64,
    store: Arc<dyn Datastore>,
    blacklist: Arc<CommandBlacklist>,
    queue: Arc<CommandQueue>,
    role: Arc<RoleState>,
    in_flight: Arc<AtomicI64>,
    /// Whether the `dieinpeek`/`dieinprocess` fault-injection commands are
    /// live. Off unless explicitly enabled.
    test_commands: bool,
}

impl CommandCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: u64,
        store: Arc<dyn Datastore>,
        blacklist: Arc<CommandBlacklist>,
        queue: Arc<CommandQueue>,
        role: Arc<RoleState>,
        in_flight: Arc<AtomicI64>,
        test_commands: bool,
    ) -> Self {
        Self {
            node_id,
            store,
            blacklist,
            queue,
            role,
            in_flight,
            test_commands,
        }
    }

    /// Pre-process a command. Returns `true` when the command is fully
    /// resolved and its response can be returned, `false` when `process` is
    /// still required. Database reads only; writes from here are a bug.
    pub fn peek_command(&self, cmd: &mut Command) -> bool {
        cmd.start_timing(Phase::Peek);
        let complete = if self.blacklist.is_blacklisted(cmd) {
            tracing::warn!(
                id = %cmd.id,
                method = %cmd.method(),
                user_id = %cmd.user_id,
                "refusing blacklisted command in peek"
            );
            cmd.response = Message::response(STATUS_BLACKLISTED);
            true
        } else {
            crash::arm(cmd.method(), &cmd.user_id);
            let result = {
                let cmd = &mut *cmd;
                catch_unwind(AssertUnwindSafe(move || self.peek_inner(cmd)))
            };
            crash::disarm();
            match result {
                Ok(Ok(complete)) => complete,
                Ok(Err(err)) => {
                    self.handle_command_failure(cmd, &err, false);
                    true
                }
                Err(_) => {
                    tracing::error!(id = %cmd.id, method = %cmd.method(), "peek handler panicked");
                    cmd.response = Message::response(STATUS_INTERNAL_ERROR);
                    true
                }
            }
        };
        cmd.stop_timing(Phase::Peek);
        complete
    }

    /// Complete a command on the primary, inside `txn` (already opened by
    /// the worker). Returns `true` when the transaction holds changes the
    /// worker should commit and replicate, `false` when it is empty and
    /// should be rolled back. Never commits or rolls back itself; the worker
    /// may call this again if the commit conflicts.
    pub fn process_command(&self, cmd: &mut Command, txn: &mut dyn Transaction) -> bool {
        cmd.start_timing(Phase::Process);
        let wants_commit = if self.blacklist.is_blacklisted(cmd) {
            tracing::warn!(
                id = %cmd.id,
                method = %cmd.method(),
                user_id = %cmd.user_id,
                "refusing blacklisted command in process"
            );
            cmd.response = Message::response(STATUS_BLACKLISTED);
            false
        } else {
            crash::arm(cmd.method(), &cmd.user_id);
            let result = {
                let cmd = &mut *cmd;
                let txn = &mut *txn;
                catch_unwind(AssertUnwindSafe(move || self.process_inner(cmd, txn)))
            };
            crash::disarm();
            match result {
                Ok(Ok(wants_commit)) => wants_commit,
                Ok(Err(err)) => {
                    self.handle_command_failure(cmd, &err, true);
                    false
                }
                Err(_) => {
                    tracing::error!(id = %cmd.id, method = %cmd.method(), "process handler panicked");
                    cmd.response = Message::response(STATUS_INTERNAL_ERROR);
                    false
                }
            }
        };
        cmd.stop_timing(Phase::Process);
        wants_commit
    }

    /// Apply schema migrations. Runs once, while this node stands up as
    /// primary.
    pub fn upgrade_database(&self) -> anyhow::Result<()> {
        tracing::info!(node_id = self.node_id, "upgrading database schema");
        self.store.upgrade_schema()
    }

    fn peek_inner(&self, cmd: &mut Command) -> Result<bool, HandlerError> {
        match cmd.method() {
            "Status" => {
                let report = StatusReport {
                    state: self.role.role().as_str(),
                    node_id: self.node_id,
                    queued_commands: self.queue.snapshot_method_lines(),
                    queued_count: self.queue.size(),
                    in_flight_commands: self.in_flight.load(Ordering::SeqCst),
                    blacklisted_commands: self.blacklist.len(),
                    peers: self.role.peer_report(),
                };
                let body = serde_json::to_vec(&report).map_err(|err| {
                    tracing::error!(error = ?err, "status serialization failed");
                    HandlerError::new(STATUS_INTERNAL_ERROR)
                })?;
                cmd.response = Message::response(STATUS_OK);
                cmd.response.set("Content-Type", "application/json");
                cmd.response.set_body(body);
                Ok(true)
            }
            "Ping" => {
                cmd.response = Message::response(STATUS_OK);
                Ok(true)
            }
            "Get" => {
                let key = cmd
                    .request
                    .get("key")
                    .ok_or_else(|| HandlerError::new("400 Missing key"))?
                    .to_string();
                let value = self.store.get(&key).map_err(|err| {
                    tracing::error!(error = ?err, key = %key, "datastore read failed");
                    HandlerError::new(STATUS_INTERNAL_ERROR)
                })?;
                match value {
                    Some(value) => {
                        cmd.response = Message::response(STATUS_OK);
                        cmd.response.set_body(value);
                        Ok(true)
                    }
                    None => Err(HandlerError::new(STATUS_NOT_FOUND)),
                }
            }
            // Writers resolve in process, on the primary.
            "Set" | "Noop" => Ok(false),
            "dieinpeek" => {
                if self.test_commands {
                    tracing::error!(id = %cmd.id, "dieinpeek invoked; taking the process down");
                    std::process::abort();
                }
                Err(HandlerError::unrecognized())
            }
            "dieinprocess" => {
                if self.test_commands {
                    return Ok(false);
                }
                Err(HandlerError::unrecognized())
            }
            _ => Err(HandlerError::unrecognized()),
        }
    }

    fn process_inner(
        &self,
        cmd: &mut Command,
        txn: &mut dyn Transaction,
    ) -> Result<bool, HandlerError> {
        match cmd.method() {
            "Set" => {
                let key = cmd
                    .request
                    .get("key")
                    .ok_or_else(|| HandlerError::new("400 Missing key"))?
                    .to_string();
                let value = match cmd.request.get("value") {
                    Some(value) => value.to_string(),
                    None => cmd.request.body_str(),
                };
                txn.put(&key, &value);
                cmd.response = Message::response(STATUS_OK);
                Ok(true)
            }
            "Noop" => {
                // Deliberately leaves the transaction empty; the worker rolls
                // it back and nothing is replicated.
                cmd.response = Message::response(STATUS_OK);
                Ok(false)
            }
            "dieinprocess" => {
                if self.test_commands {
                    tracing::error!(id = %cmd.id, "dieinprocess invoked; taking the process down");
                    std::process::abort();
                }
                Err(HandlerError::unrecognized())
            }
            other => {
                tracing::error!(method = %other, "command reached process without a handler");
                Err(HandlerError::new(STATUS_INTERNAL_ERROR))
            }
        }
    }

    /// Convert a caught handler failure into the command's response.
    fn handle_command_failure(&self, cmd: &mut Command, err: &HandlerError, was_processing: bool) {
        tracing::warn!(
            id = %cmd.id,
            method = %cmd.method(),
            status = %err.status_line,
            was_processing,
            "command handler failed"
        );
        cmd.response = Message::response(err.status_line.clone());
    }
}
