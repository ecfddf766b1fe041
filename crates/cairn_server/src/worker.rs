//! Worker threads: pull commands from the queue and drive the executor.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;

use crate::blacklist::CommandBlacklist;
use crate::clock::now_us;
use crate::cluster::RoleState;
use crate::command::{Command, Phase};
use crate::core::CommandCore;
use crate::message::{
    Message, STATUS_BLACKLISTED, STATUS_COMMIT_CONFLICT, STATUS_ESCALATION_FAILED,
    STATUS_INTERNAL_ERROR, STATUS_TIMEOUT,
};
use crate::queue::{CommandQueue, QueueTimeout};
use crate::storage::{CommitOutcome, Datastore};

/// Bounded queue wait so workers notice the terminating flag.
const GET_WAIT_US: u64 = 1_000_000;
/// Total `process` attempts when commits keep conflicting.
const MAX_COMMIT_ATTEMPTS: u32 = 3;
/// Upper bound on how long an escalation waits for the primary.
const ESCALATE_MAX_WAIT: Duration = Duration::from_secs(70);

/// Everything a worker thread needs, shared across the pool.
pub struct WorkerContext {
    pub node_id: u64,
    pub queue: Arc<CommandQueue>,
    pub core: Arc<CommandCore>,
    pub role: Arc<RoleState>,
    pub store: Arc<dyn Datastore>,
    pub blacklist: Arc<CommandBlacklist>,
    pub in_flight: Arc<AtomicI64>,
    pub terminating: Arc<AtomicBool>,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    pub fn start(count: usize, ctx: Arc<WorkerContext>) -> anyhow::Result<Self> {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count.max(1) {
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_main(&ctx))
                .context("spawn worker thread")?;
            handles.push(handle);
        }
        Ok(Self { handles, ctx })
    }

    /// Stop the pool: raise the terminating flag, drop remaining queued
    /// work, and join the threads.
    pub fn shutdown(self) {
        self.ctx.terminating.store(true, Ordering::SeqCst);
        self.ctx.queue.clear();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_main(ctx: &WorkerContext) {
    while !ctx.terminating.load(Ordering::SeqCst) {
        let cmd = match ctx.queue.get_counted(GET_WAIT_US, &ctx.in_flight) {
            Ok(cmd) => cmd,
            // Nothing workable; loop back around to the terminating check.
            Err(QueueTimeout) => continue,
        };
        handle_command(ctx, cmd);
        ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn handle_command(ctx: &WorkerContext, mut cmd: Command) {
    // The queue surfaces expired commands first so they become timeout
    // errors instead of silently aging.
    if cmd.timed_out(now_us()) {
        tracing::warn!(id = %cmd.id, method = %cmd.method(), "command timed out in queue");
        cmd.response = Message::response(STATUS_TIMEOUT);
        cmd.finish();
        return;
    }

    if ctx.core.peek_command(&mut cmd) {
        cmd.finish();
        return;
    }

    if ctx.role.is_primary() {
        process_on_primary(ctx, &mut cmd);
    } else {
        escalate_to_primary(ctx, &mut cmd);
    }
    cmd.finish();
}

fn process_on_primary(ctx: &WorkerContext, cmd: &mut Command) {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut txn = ctx.store.begin();
        let wants_commit = ctx.core.process_command(cmd, txn.as_mut());
        if !wants_commit {
            txn.rollback();
            return;
        }

        cmd.start_timing(Phase::Commit);
        let outcome = txn.commit();
        cmd.stop_timing(Phase::Commit);
        match outcome {
            Ok(CommitOutcome::Committed) => return,
            Ok(CommitOutcome::Conflict) if attempts < MAX_COMMIT_ATTEMPTS => {
                tracing::warn!(id = %cmd.id, attempts, "commit conflict; processing again");
                cmd.response = Message::default();
            }
            Ok(CommitOutcome::Conflict) => {
                tracing::warn!(id = %cmd.id, attempts, "commit conflict; giving up");
                cmd.response = Message::response(STATUS_COMMIT_CONFLICT);
                return;
            }
            Err(err) => {
                tracing::error!(id = %cmd.id, error = ?err, "commit failed");
                cmd.response = Message::response(STATUS_INTERNAL_ERROR);
                return;
            }
        }
    }
}

fn escalate_to_primary(ctx: &WorkerContext, cmd: &mut Command) {
    let remaining = Duration::from_micros(
        cmd.timeout_timestamp_us
            .saturating_sub(now_us())
            .max(10_000),
    )
    .min(ESCALATE_MAX_WAIT);
    let mut request = cmd.request.clone();
    request.set("escalatedFrom", ctx.node_id.to_string());

    match ctx.role.escalate(&request, remaining) {
        Ok(Some(response)) => {
            cmd.response = response;
        }
        Ok(None) => {
            // The primary died handling this command: no response line came
            // back. Blacklist the key locally so a later promotion refuses it.
            tracing::warn!(
                id = %cmd.id,
                method = %cmd.method(),
                user_id = %cmd.user_id,
                "primary died during escalation; blacklisting command"
            );
            ctx.blacklist.record(cmd.method(), &cmd.user_id);
            cmd.response = Message::response(STATUS_BLACKLISTED);
        }
        Err(err) => {
            tracing::warn!(id = %cmd.id, error = ?err, "escalation failed");
            cmd.response = Message::response(STATUS_ESCALATION_FAILED);
        }
    }
}
