//! Shared helpers for integration tests.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cairn_server::message::Message;

/// Timeout for node startup and role convergence.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for a single command round-trip.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrapper around a spawned node process and its captured log files.
pub struct NodeProcess {
    pub child: Child,
    stderr_path: PathBuf,
    stdout_path: PathBuf,
}

impl NodeProcess {
    /// Best-effort read of the captured stderr log.
    pub fn read_stderr(&self) -> String {
        std::fs::read_to_string(&self.stderr_path).unwrap_or_default()
    }

    /// Best-effort read of the captured stdout log.
    pub fn read_stdout(&self) -> String {
        std::fs::read_to_string(&self.stdout_path).unwrap_or_default()
    }

    /// Panic if the process has already exited.
    pub fn assert_running(&mut self, context: &str) {
        if let Ok(Some(status)) = self.child.try_wait() {
            let stdout = self.read_stdout();
            let stderr = self.read_stderr();
            panic!(
                "cairn-server exited early ({context}) with status {status}\nstdout:\n{stdout}\nstderr:\n{stderr}"
            );
        }
    }

    /// Wait for the process to exit (e.g. after a fault-injection command).
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(_)) = self.child.try_wait() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Spawn a cairn-server node for testing, capturing stdout/stderr to files.
pub fn spawn_node(
    node_id: u64,
    data_dir: &Path,
    listen: SocketAddr,
    peers: &str,
    envs: &[(&str, &str)],
) -> NodeProcess {
    let log_dir = data_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let stdout_path = log_dir.join("cairn-server.out.log");
    let stderr_path = log_dir.join("cairn-server.err.log");
    let stdout_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stdout_path)
        .expect("open stdout log");
    let stderr_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&stderr_path)
        .expect("open stderr log");

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cairn-server"));
    cmd.arg("serve")
        .arg("--node-id")
        .arg(node_id.to_string())
        .arg("--listen")
        .arg(listen.to_string())
        .arg("--data-dir")
        .arg(data_dir.to_string_lossy().to_string())
        .env("RUST_LOG", "info")
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file));
    if !peers.is_empty() {
        cmd.arg("--peers").arg(peers);
    }
    for (name, value) in envs {
        cmd.env(name, value);
    }

    let child = cmd.spawn().expect("failed to spawn cairn-server");
    NodeProcess {
        child,
        stderr_path,
        stdout_path,
    }
}

/// Pick an available local port by binding to port 0.
pub fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    listener.local_addr().expect("local addr").port()
}

pub fn local_addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().expect("socket addr")
}

/// Build a per-test data directory.
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    std::env::temp_dir()
        .join("cairn-tests")
        .join(format!("{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// Connection wrapper that keeps buffered reads between pipelined commands.
pub struct CommandConn {
    reader: BufReader<TcpStream>,
}

impl CommandConn {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect_timeout(&addr, COMMAND_TIMEOUT).expect("connect");
        stream.set_read_timeout(Some(COMMAND_TIMEOUT)).ok();
        stream.set_write_timeout(Some(COMMAND_TIMEOUT)).ok();
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send a command and wait for the response. `None` means the node
    /// closed the connection without responding (it died).
    pub fn send(&mut self, request: &Message) -> Option<Message> {
        if self.send_only(request).is_err() {
            return None;
        }
        self.read_response()
    }

    /// Send without waiting; used to park a scheduled command on the node.
    pub fn send_only(&mut self, request: &Message) -> std::io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&request.to_bytes())?;
        stream.flush()
    }

    pub fn read_response(&mut self) -> Option<Message> {
        match Message::read_from(&mut self.reader) {
            Ok(response) => response,
            Err(err) => {
                if is_disconnect(&err) {
                    return None;
                }
                panic!("response read failed: {err:?}");
            }
        }
    }
}

fn is_disconnect(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::UnexpectedEof
                )
            })
            .unwrap_or(false)
    }) || err.to_string().contains("connection closed mid-message")
}

/// One command on a fresh connection. `None` means an empty response.
pub fn send_once(addr: SocketAddr, request: &Message) -> Option<Message> {
    CommandConn::connect(addr).send(request)
}

pub fn request(method: &str, headers: &[(&str, &str)]) -> Message {
    let mut msg = Message::new(method);
    for (name, value) in headers {
        msg.set(*name, *value);
    }
    msg
}

/// Wait until the node answers `Ping` on its command port.
pub fn wait_for_ready(addr: SocketAddr, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(250)).is_ok() {
            if let Some(resp) = send_once(addr, &Message::new("Ping")) {
                if resp.is_success() {
                    return true;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

/// Current `state` field from the node's `Status` body, if reachable.
pub fn node_state(addr: SocketAddr) -> Option<String> {
    let response = send_once(addr, &Message::new("Status"))?;
    if !response.is_success() {
        return None;
    }
    let body: serde_json::Value = serde_json::from_slice(&response.body).ok()?;
    body["state"].as_str().map(str::to_string)
}

/// Poll `Status` until the node reports the wanted state.
pub fn wait_for_state(addr: SocketAddr, want: &str, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if node_state(addr).as_deref() == Some(want) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    false
}
