//! Single-node integration tests: command round-trips, scheduling, and
//! status reporting over the wire.

mod common;

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use common::{
    cleanup_dir, local_addr, pick_free_port, request, send_once, spawn_node, test_dir,
    wait_for_ready, wait_for_state, CommandConn, IO_TIMEOUT,
};

const FAST_CLUSTER_ENVS: &[(&str, &str)] = &[("CAIRN_HEALTH_INTERVAL_MS", "100")];

fn epoch_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[test]
fn commands_roundtrip_on_a_single_node() {
    let dir = test_dir("roundtrip");
    cleanup_dir(&dir);
    let addr = local_addr(pick_free_port());
    let mut node = spawn_node(1, &dir, addr, "", FAST_CLUSTER_ENVS);

    assert!(wait_for_ready(addr, IO_TIMEOUT), "node never became ready");
    assert!(
        wait_for_state(addr, "MASTERING", IO_TIMEOUT),
        "node never became primary; stderr:\n{}",
        node.read_stderr()
    );

    // Write path: process + commit on the primary.
    let response = send_once(addr, &request("Set", &[("key", "alpha"), ("value", "1")]))
        .expect("set response");
    assert_eq!(response.method_line, "200 OK");

    // Read path: resolved in peek.
    let response = send_once(addr, &request("Get", &[("key", "alpha")])).expect("get response");
    assert_eq!(response.method_line, "200 OK");
    assert_eq!(response.body_str(), "1");

    // Body-valued writes work too.
    let mut with_body = request("Set", &[("key", "beta")]);
    with_body.set_body("from the body");
    let response = send_once(addr, &with_body).expect("set response");
    assert!(response.is_success());
    let response = send_once(addr, &request("Get", &[("key", "beta")])).expect("get response");
    assert_eq!(response.body_str(), "from the body");

    // Error taxonomy over the wire.
    let response = send_once(addr, &request("Get", &[("key", "missing")])).expect("get response");
    assert_eq!(response.code(), 404);
    let response = send_once(addr, &request("Get", &[])).expect("get response");
    assert_eq!(response.code(), 400);
    let response = send_once(addr, &request("NoSuchCommand", &[])).expect("response");
    assert_eq!(response.method_line, "404 Unrecognized command");

    // Fault-injection commands are refused while not enabled.
    let response =
        send_once(addr, &request("dieinpeek", &[("userID", "1")])).expect("die response");
    assert_eq!(response.code(), 404);
    node.assert_running("after refused dieinpeek");

    cleanup_dir(&dir);
}

#[test]
fn status_reports_role_and_queued_commands() {
    let dir = test_dir("status");
    cleanup_dir(&dir);
    let addr = local_addr(pick_free_port());
    let _node = spawn_node(1, &dir, addr, "", FAST_CLUSTER_ENVS);

    assert!(wait_for_ready(addr, IO_TIMEOUT));
    assert!(wait_for_state(addr, "MASTERING", IO_TIMEOUT));

    // Park a far-future command in the queue, then look for it in Status.
    let mut parked = CommandConn::connect(addr);
    let mut future_set = request("Set", &[("key", "later"), ("value", "x")]);
    future_set.set("commandExecuteTime", (epoch_us() + 10_000_000).to_string());
    parked.send_only(&future_set).expect("park command");

    let mut seen = false;
    for _ in 0..50 {
        let response = send_once(addr, &request("Status", &[])).expect("status");
        assert!(response.is_success());
        let body: serde_json::Value = serde_json::from_slice(&response.body).expect("status json");
        assert_eq!(body["state"], "MASTERING");
        assert_eq!(body["nodeId"], 1);
        let queued = body["queuedCommands"].as_array().expect("array");
        if queued.iter().any(|line| line == "Set") {
            seen = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(seen, "scheduled command never showed up in Status");

    cleanup_dir(&dir);
}

#[test]
fn scheduled_commands_wait_until_due() {
    let dir = test_dir("scheduling");
    cleanup_dir(&dir);
    let addr = local_addr(pick_free_port());
    let _node = spawn_node(1, &dir, addr, "", FAST_CLUSTER_ENVS);

    assert!(wait_for_ready(addr, IO_TIMEOUT));
    assert!(wait_for_state(addr, "MASTERING", IO_TIMEOUT));

    let mut conn = CommandConn::connect(addr);
    let mut scheduled = request("Set", &[("key", "delayed"), ("value", "v")]);
    scheduled.set("commandExecuteTime", (epoch_us() + 700_000).to_string());

    let start = Instant::now();
    let response = conn.send(&scheduled).expect("scheduled response");
    let elapsed = start.elapsed();

    assert!(response.is_success());
    assert!(
        elapsed >= Duration::from_millis(500),
        "scheduled command ran early after {elapsed:?}"
    );
    let response = send_once(addr, &request("Get", &[("key", "delayed")])).expect("get");
    assert_eq!(response.body_str(), "v");

    cleanup_dir(&dir);
}

#[test]
fn commands_past_their_deadline_get_a_timeout_response() {
    let dir = test_dir("timeout");
    cleanup_dir(&dir);
    let addr = local_addr(pick_free_port());
    let _node = spawn_node(1, &dir, addr, "", FAST_CLUSTER_ENVS);

    assert!(wait_for_ready(addr, IO_TIMEOUT));
    assert!(wait_for_state(addr, "MASTERING", IO_TIMEOUT));

    // Scheduled past its own deadline: the deadline is raised to the execute
    // time, and the queue surfaces the command as a timeout instead of
    // running it.
    let mut conn = CommandConn::connect(addr);
    let mut doomed = request("Set", &[("key", "never"), ("value", "v")]);
    doomed.set("commandExecuteTime", (epoch_us() + 300_000).to_string());
    doomed.set("timeout", "100");

    let response = conn.send(&doomed).expect("timeout response");
    assert_eq!(response.method_line, "555 Timeout");

    let response = send_once(addr, &request("Get", &[("key", "never")])).expect("get");
    assert_eq!(response.code(), 404, "timed-out command must not execute");

    cleanup_dir(&dir);
}
