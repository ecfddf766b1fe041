//! Poison-command cluster test: a command that kills the primary gets
//! blacklisted by the surviving replica, survives a restart of the dead
//! node, rides through a failover, and stays keyed per user.

mod common;

use std::time::Duration;

use common::{
    cleanup_dir, local_addr, pick_free_port, request, send_once, spawn_node, test_dir,
    wait_for_ready, wait_for_state, IO_TIMEOUT,
};

const PROMOTE_TIMEOUT: Duration = Duration::from_secs(50);

const CLUSTER_ENVS: &[(&str, &str)] = &[
    ("CAIRN_TEST_COMMANDS", "true"),
    ("CAIRN_HEALTH_INTERVAL_MS", "250"),
    ("CAIRN_PROMOTE_AFTER_MISSES", "3"),
];

#[test]
fn poison_commands_are_blacklisted_across_crashes_and_failover() {
    let base_dir = test_dir("poison-failover");
    cleanup_dir(&base_dir);

    let addr1 = local_addr(pick_free_port());
    let addr2 = local_addr(pick_free_port());
    let members = format!("1@{addr1},2@{addr2}");

    let mut node1 = spawn_node(1, &base_dir.join("node1"), addr1, &members, CLUSTER_ENVS);
    let mut node2 = spawn_node(2, &base_dir.join("node2"), addr2, &members, CLUSTER_ENVS);

    assert!(wait_for_ready(addr1, IO_TIMEOUT), "node1 not ready");
    assert!(wait_for_ready(addr2, IO_TIMEOUT), "node2 not ready");
    assert!(
        wait_for_state(addr1, "MASTERING", IO_TIMEOUT),
        "node1 never led; stderr:\n{}",
        node1.read_stderr()
    );
    assert!(
        wait_for_state(addr2, "SLAVING", IO_TIMEOUT),
        "node2 never followed; stderr:\n{}",
        node2.read_stderr()
    );

    // Kill the primary in peek. The client observes an empty response.
    let response = send_once(addr1, &request("dieinpeek", &[("userID", "31")]));
    assert!(response.is_none(), "expected an empty response, got {response:?}");
    assert!(node1.wait_for_exit(IO_TIMEOUT), "node1 should have died");

    // Give the crash broadcast a moment to land on the replica.
    std::thread::sleep(Duration::from_secs(1));

    // The replica refuses the same command instead of dying too.
    let response =
        send_once(addr2, &request("dieinpeek", &[("userID", "31")])).expect("replica response");
    assert_eq!(response.method_line, "500 Blacklisted");
    node2.assert_running("after blacklisted dieinpeek");

    // Bring the dead node back; it reclaims leadership with a clean
    // blacklist, and the old replica steps back down.
    drop(node1);
    let mut node1 = spawn_node(1, &base_dir.join("node1"), addr1, &members, CLUSTER_ENVS);
    assert!(wait_for_ready(addr1, IO_TIMEOUT), "restarted node1 not ready");
    assert!(
        wait_for_state(addr1, "MASTERING", PROMOTE_TIMEOUT),
        "restarted node1 never led; stderr:\n{}",
        node1.read_stderr()
    );
    assert!(
        wait_for_state(addr2, "SLAVING", IO_TIMEOUT),
        "node2 never stood back down"
    );

    // Kill the restored primary in process this time.
    let response = send_once(addr1, &request("dieinprocess", &[("userID", "32")]));
    assert!(response.is_none(), "expected an empty response, got {response:?}");
    assert!(node1.wait_for_exit(IO_TIMEOUT), "node1 should have died again");

    // The replica promotes itself and refuses the poison command.
    assert!(
        wait_for_state(addr2, "MASTERING", PROMOTE_TIMEOUT),
        "node2 never promoted; stderr:\n{}",
        node2.read_stderr()
    );
    let response = send_once(addr2, &request("dieinprocess", &[("userID", "32")]))
        .expect("new primary response");
    assert_eq!(response.method_line, "500 Blacklisted");
    node2.assert_running("after blacklisted dieinprocess");

    // A different userID is a different blacklist key; it is allowed to
    // crash the new primary again.
    let response = send_once(addr2, &request("dieinprocess", &[("userID", "33")]));
    assert!(response.is_none(), "expected an empty response, got {response:?}");
    assert!(node2.wait_for_exit(IO_TIMEOUT), "node2 should have died");

    cleanup_dir(&base_dir);
}
