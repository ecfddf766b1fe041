//! Cluster membership, node roles, and escalation to the primary.
//!
//! Real consensus is out of scope; the monitor implements the minimum role
//! oracle the executor needs: probe peers with `Ping`, let the lowest
//! reachable node id lead, promote when the leader goes quiet, and stand
//! down when a better leader answers again.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::clock::now_us;
use crate::core::CommandCore;
use crate::message::Message;
use crate::queue::CommandQueue;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const ESCALATE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Future-scheduled work is abandoned when a primary stands down; the new
/// primary will see those commands again via client retry or escalation.
const STANDDOWN_PRUNE_MS: u64 = 5_000;

const DEFAULT_PROBE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_PROMOTE_AFTER_MISSES: u32 = 3;

/// Cluster role, serialized with exactly these names in `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Searching,
    Synchronizing,
    Waiting,
    StandingUp,
    Mastering,
    StandingDown,
    Slaving,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Searching => "SEARCHING",
            NodeRole::Synchronizing => "SYNCHRONIZING",
            NodeRole::Waiting => "WAITING",
            NodeRole::StandingUp => "STANDINGUP",
            NodeRole::Mastering => "MASTERING",
            NodeRole::StandingDown => "STANDINGDOWN",
            NodeRole::Slaving => "SLAVING",
        }
    }
}

/// Cluster member descriptor.
#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: u64,
    pub addr: SocketAddr,
}

/// Parse a comma-separated `id@addr` member list, e.g.
/// `1@127.0.0.1:9501,2@127.0.0.1:9502`.
pub fn parse_members(raw: &str) -> anyhow::Result<Vec<Peer>> {
    let mut members = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, addr) = part
            .split_once('@')
            .with_context(|| format!("member {part:?} is not id@addr"))?;
        let node_id = id
            .parse::<u64>()
            .with_context(|| format!("member {part:?} has a non-numeric id"))?;
        anyhow::ensure!(node_id != 0, "member ids start at 1");
        let addr = SocketAddr::from_str(addr)
            .with_context(|| format!("member {part:?} has an invalid address"))?;
        members.push(Peer { node_id, addr });
    }
    Ok(members)
}

#[derive(Debug, Clone, Copy, Default)]
struct PeerHealth {
    consecutive_misses: u32,
    last_seen_us: u64,
}

/// Peer summary included in the `Status` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub node_id: u64,
    pub address: String,
    pub consecutive_misses: u32,
    pub last_seen_us: u64,
}

/// Shared role/leader/peer-health state. The monitor thread writes it; the
/// executor and workers read it.
pub struct RoleState {
    node_id: u64,
    peers: Vec<Peer>,
    role: RwLock<NodeRole>,
    /// 0 while no leader has been chosen yet.
    leader_id: AtomicU64,
    health: Mutex<HashMap<u64, PeerHealth>>,
}

impl RoleState {
    /// `peers` excludes this node.
    pub fn new(node_id: u64, peers: Vec<Peer>) -> Self {
        Self {
            node_id,
            peers,
            role: RwLock::new(NodeRole::Searching),
            leader_id: AtomicU64::new(0),
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read().unwrap()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == NodeRole::Mastering
    }

    pub(crate) fn set_role(&self, role: NodeRole) {
        *self.role.write().unwrap() = role;
    }

    pub fn leader_id(&self) -> u64 {
        self.leader_id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_leader(&self, node_id: u64) {
        self.leader_id.store(node_id, Ordering::SeqCst);
    }

    /// Address of the current leader, when it is another node.
    pub fn leader_addr(&self) -> Option<SocketAddr> {
        let leader = self.leader_id();
        if leader == 0 || leader == self.node_id {
            return None;
        }
        self.peers
            .iter()
            .find(|p| p.node_id == leader)
            .map(|p| p.addr)
    }

    pub(crate) fn record_probe(&self, node_id: u64, reachable: bool) {
        let mut health = self.health.lock().unwrap();
        let entry = health.entry(node_id).or_default();
        if reachable {
            entry.consecutive_misses = 0;
            entry.last_seen_us = now_us();
        } else {
            entry.consecutive_misses = entry.consecutive_misses.saturating_add(1);
        }
    }

    /// A peer is considered alive until it has missed `threshold`
    /// consecutive probes. Unprobed peers count as alive so a fresh node
    /// does not promote itself past a leader it has never looked for.
    pub(crate) fn peer_alive(&self, node_id: u64, threshold: u32) -> bool {
        let health = self.health.lock().unwrap();
        health
            .get(&node_id)
            .map(|h| h.consecutive_misses < threshold)
            .unwrap_or(true)
    }

    /// Peer summary for the `Status` body.
    pub fn peer_report(&self) -> Vec<PeerStatus> {
        let health = self.health.lock().unwrap();
        self.peers
            .iter()
            .map(|peer| {
                let entry = health.get(&peer.node_id).copied().unwrap_or_default();
                PeerStatus {
                    node_id: peer.node_id,
                    address: peer.addr.to_string(),
                    consecutive_misses: entry.consecutive_misses,
                    last_seen_us: entry.last_seen_us,
                }
            })
            .collect()
    }

    /// Forward a request that needs `process` to the current primary and
    /// return its response. `Ok(None)` means the primary closed the
    /// connection without responding, i.e. it died handling the command.
    pub fn escalate(
        &self,
        request: &Message,
        read_timeout: Duration,
    ) -> anyhow::Result<Option<Message>> {
        let addr = self
            .leader_addr()
            .context("no known primary to escalate to")?;
        let stream = TcpStream::connect_timeout(&addr, ESCALATE_CONNECT_TIMEOUT)
            .with_context(|| format!("connect to primary {addr}"))?;
        stream
            .set_write_timeout(Some(ESCALATE_CONNECT_TIMEOUT))
            .context("set write timeout")?;
        stream
            .set_read_timeout(Some(read_timeout.max(Duration::from_millis(10))))
            .context("set read timeout")?;
        let mut writer = stream.try_clone().context("clone escalation stream")?;
        writer
            .write_all(&request.to_bytes())
            .context("send escalated command")?;
        let mut reader = BufReader::new(stream);
        Message::read_from(&mut reader)
    }
}

/// Background thread that keeps [`RoleState`] current.
pub struct ClusterMonitor {
    state: Arc<RoleState>,
    core: Arc<CommandCore>,
    queue: Arc<CommandQueue>,
    terminating: Arc<AtomicBool>,
    probe_interval: Duration,
    promote_after_misses: u32,
}

impl ClusterMonitor {
    pub fn new(
        state: Arc<RoleState>,
        core: Arc<CommandCore>,
        queue: Arc<CommandQueue>,
        terminating: Arc<AtomicBool>,
    ) -> Self {
        let probe_interval_ms =
            read_env_u64("CAIRN_HEALTH_INTERVAL_MS", DEFAULT_PROBE_INTERVAL_MS).max(10);
        let promote_after_misses = read_env_u64(
            "CAIRN_PROMOTE_AFTER_MISSES",
            u64::from(DEFAULT_PROMOTE_AFTER_MISSES),
        )
        .clamp(1, u64::from(u32::MAX)) as u32;
        Self::with_settings(
            state,
            core,
            queue,
            terminating,
            Duration::from_millis(probe_interval_ms),
            promote_after_misses,
        )
    }

    pub fn with_settings(
        state: Arc<RoleState>,
        core: Arc<CommandCore>,
        queue: Arc<CommandQueue>,
        terminating: Arc<AtomicBool>,
        probe_interval: Duration,
        promote_after_misses: u32,
    ) -> Self {
        Self {
            state,
            core,
            queue,
            terminating,
            probe_interval,
            promote_after_misses,
        }
    }

    pub fn spawn(self) -> anyhow::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("cluster-monitor".to_string())
            .spawn(move || {
                while !self.terminating.load(Ordering::SeqCst) {
                    self.tick();
                    thread::sleep(self.probe_interval);
                }
            })
            .context("spawn cluster monitor thread")
    }

    /// One probe sweep plus at most one role transition.
    fn tick(&self) {
        for peer in self.state.peers() {
            let reachable = probe(peer.addr);
            self.state.record_probe(peer.node_id, reachable);
        }

        let desired = self.desired_leader();
        self.state.set_leader(desired);

        let role = self.state.role();
        let leading = desired == self.state.node_id();
        let next = match role {
            NodeRole::Searching => NodeRole::Synchronizing,
            NodeRole::Synchronizing | NodeRole::Waiting => {
                if leading {
                    NodeRole::StandingUp
                } else {
                    NodeRole::Slaving
                }
            }
            NodeRole::StandingUp => match self.core.upgrade_database() {
                Ok(()) => NodeRole::Mastering,
                Err(err) => {
                    tracing::error!(error = ?err, "database upgrade failed; retrying");
                    NodeRole::StandingUp
                }
            },
            NodeRole::Mastering => {
                if leading {
                    NodeRole::Mastering
                } else {
                    NodeRole::StandingDown
                }
            }
            NodeRole::StandingDown => {
                self.queue.prune_future(STANDDOWN_PRUNE_MS);
                NodeRole::Waiting
            }
            NodeRole::Slaving => {
                if leading {
                    NodeRole::StandingUp
                } else {
                    NodeRole::Slaving
                }
            }
        };

        if next != role {
            tracing::info!(
                from = role.as_str(),
                to = next.as_str(),
                leader = desired,
                "node state transition"
            );
            self.state.set_role(next);
        }
    }

    /// The lowest node id that is still answering probes should lead. This
    /// node is always a candidate for its own leadership.
    fn desired_leader(&self) -> u64 {
        let mut leader = self.state.node_id();
        for peer in self.state.peers() {
            if peer.node_id < leader && self.state.peer_alive(peer.node_id, self.promote_after_misses)
            {
                leader = peer.node_id;
            }
        }
        leader
    }
}

/// Round-trip a `Ping` to a peer's command port.
fn probe(addr: SocketAddr) -> bool {
    let Ok(stream) = TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) else {
        return false;
    };
    if stream.set_read_timeout(Some(PROBE_TIMEOUT)).is_err()
        || stream.set_write_timeout(Some(PROBE_TIMEOUT)).is_err()
    {
        return false;
    }
    let Ok(mut writer) = stream.try_clone() else {
        return false;
    };
    if writer.write_all(&Message::new("Ping").to_bytes()).is_err() {
        return false;
    }
    let mut reader = BufReader::new(stream);
    matches!(Message::read_from(&mut reader), Ok(Some(resp)) if resp.is_success())
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::CommandBlacklist;
    use crate::storage::MemoryStore;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicI64;

    fn monitor_for(
        state: Arc<RoleState>,
        promote_after_misses: u32,
    ) -> (ClusterMonitor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(CommandQueue::new());
        let core = Arc::new(CommandCore::new(
            state.node_id(),
            store.clone(),
            Arc::new(CommandBlacklist::new()),
            queue.clone(),
            state.clone(),
            Arc::new(AtomicI64::new(0)),
            false,
        ));
        let monitor = ClusterMonitor::with_settings(
            state,
            core,
            queue,
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(10),
            promote_after_misses,
        );
        (monitor, store)
    }

    /// Listener that answers every message with `200 OK`, like a healthy peer.
    fn spawn_healthy_peer() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut stream = stream;
                while let Ok(Some(_)) = Message::read_from(&mut reader) {
                    let mut resp = Message::response(crate::message::STATUS_OK);
                    resp.set("state", "MASTERING");
                    if stream.write_all(&resp.to_bytes()).is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    fn closed_port_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        addr
    }

    #[test]
    fn member_list_parses() {
        let members = parse_members("1@127.0.0.1:9501, 2@127.0.0.1:9502").expect("parse");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].node_id, 1);
        assert_eq!(members[1].addr.port(), 9502);
        assert!(parse_members("").expect("empty").is_empty());
        assert!(parse_members("nope").is_err());
        assert!(parse_members("0@127.0.0.1:1").is_err());
    }

    #[test]
    fn role_names_match_the_status_contract() {
        assert_eq!(NodeRole::Mastering.as_str(), "MASTERING");
        assert_eq!(NodeRole::Slaving.as_str(), "SLAVING");
        assert_eq!(NodeRole::StandingUp.as_str(), "STANDINGUP");
        assert_eq!(NodeRole::StandingDown.as_str(), "STANDINGDOWN");
        assert_eq!(NodeRole::Searching.as_str(), "SEARCHING");
        assert_eq!(NodeRole::Synchronizing.as_str(), "SYNCHRONIZING");
        assert_eq!(NodeRole::Waiting.as_str(), "WAITING");
    }

    #[test]
    fn single_node_stands_up_and_upgrades() {
        let state = Arc::new(RoleState::new(1, Vec::new()));
        let (monitor, store) = monitor_for(state.clone(), 3);

        monitor.tick(); // SEARCHING -> SYNCHRONIZING
        monitor.tick(); // SYNCHRONIZING -> STANDINGUP
        monitor.tick(); // STANDINGUP -> MASTERING (after upgrade)

        assert_eq!(state.role(), NodeRole::Mastering);
        assert!(state.is_primary());
        assert_eq!(state.leader_id(), 1);
        assert!(store.schema_version() > 0);
    }

    #[test]
    fn replica_promotes_after_leader_misses() {
        let dead_leader = closed_port_addr();
        let state = Arc::new(RoleState::new(
            2,
            vec![Peer {
                node_id: 1,
                addr: dead_leader,
            }],
        ));
        let (monitor, _store) = monitor_for(state.clone(), 2);

        monitor.tick(); // miss 1: leader still presumed alive
        assert_ne!(state.role(), NodeRole::Mastering);
        monitor.tick(); // miss 2: leader declared dead, we should lead
        monitor.tick();
        monitor.tick();
        assert_eq!(state.role(), NodeRole::Mastering);
        assert_eq!(state.leader_id(), 2);
    }

    #[test]
    fn primary_stands_down_for_a_better_leader() {
        let healthy = spawn_healthy_peer();
        let state = Arc::new(RoleState::new(
            2,
            vec![Peer {
                node_id: 1,
                addr: healthy,
            }],
        ));
        state.set_role(NodeRole::Mastering);
        state.set_leader(2);
        let (monitor, _store) = monitor_for(state.clone(), 3);

        monitor.tick(); // MASTERING -> STANDINGDOWN
        assert_eq!(state.role(), NodeRole::StandingDown);
        monitor.tick(); // STANDINGDOWN -> WAITING
        monitor.tick(); // WAITING -> SLAVING
        assert_eq!(state.role(), NodeRole::Slaving);
        assert_eq!(state.leader_id(), 1);
        assert_eq!(state.leader_addr(), Some(healthy));
    }

    #[test]
    fn escalation_relays_the_primary_response() {
        let healthy = spawn_healthy_peer();
        let state = RoleState::new(2, vec![Peer {
            node_id: 1,
            addr: healthy,
        }]);
        state.set_leader(1);

        let response = state
            .escalate(&Message::new("Noop"), Duration::from_secs(2))
            .expect("escalate")
            .expect("response");
        assert!(response.is_success());
    }

    #[test]
    fn escalation_reports_an_empty_response_when_the_primary_dies() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            // Accept, read the request, close without responding.
            if let Ok((stream, _)) = listener.accept() {
                let mut reader = BufReader::new(stream);
                let _ = Message::read_from(&mut reader);
            }
        });

        let state = RoleState::new(2, vec![Peer {
            node_id: 1,
            addr,
        }]);
        state.set_leader(1);

        let response = state
            .escalate(&Message::new("dieinprocess"), Duration::from_secs(2))
            .expect("escalate io");
        assert!(response.is_none());
    }

    #[test]
    fn escalation_without_a_leader_fails() {
        let state = RoleState::new(1, Vec::new());
        assert!(state
            .escalate(&Message::new("Set"), Duration::from_secs(1))
            .is_err());
    }
}
