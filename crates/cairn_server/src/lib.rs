//! Core of a replicated, SQL-capable command processor node.
//!
//! The pieces fit together like this: the [`server`] listener parses wire
//! messages and pushes [`command::Command`]s onto the [`queue`]; the
//! [`worker`] pool pulls them in priority/time order and drives the
//! [`core`] executor (`peek` on any node, `process` inside a transaction on
//! the primary); the [`cluster`] monitor keeps the node's role current and
//! escalates replica writes to the primary; the [`blacklist`] and [`crash`]
//! modules keep poison commands from taking the cluster down twice.

pub mod blacklist;
pub mod clock;
pub mod cluster;
pub mod command;
pub mod core;
pub mod crash;
pub mod message;
pub mod queue;
pub mod server;
pub mod storage;
pub mod worker;
