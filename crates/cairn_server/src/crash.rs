//! Best-effort crash broadcast.
//!
//! A handler that takes the process down never writes a response, so peers
//! would have no way to refuse the same poison command. Before invoking a
//! handler, the executor arms a thread-local guard with the command's
//! blacklist key; fatal-signal handlers installed at startup report that
//! key to peers as a `CrashCommand` message, and the receiving nodes record
//! it into their local blacklists.
//!
//! The signal handler itself is restricted to async-signal-safe calls: it
//! copies the guard into a fixed-size record, pushes the record through a
//! self-pipe with one `write`, and blocks on an ack `read` (bounded by
//! `alarm`) before re-raising the signal. The actual TCP broadcast runs on
//! a dedicated notifier thread on the other end of the pipe, where
//! allocation and socket I/O are safe.

use std::cell::Cell;
use std::io::Write as _;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use crate::message::Message;

/// Method line of the internal peer notification message.
pub const CRASH_COMMAND: &str = "CrashCommand";

const MAX_METHOD_BYTES: usize = 128;
const MAX_USER_BYTES: usize = 64;
/// Two length bytes, then the method and user buffers. Well under PIPE_BUF,
/// so the handler's single `write` is atomic.
const RECORD_BYTES: usize = 2 + MAX_METHOD_BYTES + MAX_USER_BYTES;
const NOTIFY_TIMEOUT: Duration = Duration::from_millis(250);
/// Upper bound on how long a dying process waits for the broadcast ack.
const ACK_ALARM_SECS: u32 = 5;

struct GuardSlot {
    armed: Cell<bool>,
    method: Cell<[u8; MAX_METHOD_BYTES]>,
    method_len: Cell<usize>,
    user: Cell<[u8; MAX_USER_BYTES]>,
    user_len: Cell<usize>,
}

impl GuardSlot {
    const fn empty() -> Self {
        Self {
            armed: Cell::new(false),
            method: Cell::new([0; MAX_METHOD_BYTES]),
            method_len: Cell::new(0),
            user: Cell::new([0; MAX_USER_BYTES]),
            user_len: Cell::new(0),
        }
    }
}

thread_local! {
    // Per-thread: each worker arms the guard for the command it is
    // executing, and the signal handler runs on the crashing thread. The
    // const initializer and the absence of destructors keep accesses to
    // this slot plain TLS reads, with no lazy allocation on the signal
    // path.
    static GUARD: GuardSlot = const { GuardSlot::empty() };
}

static PEERS: OnceLock<Vec<SocketAddr>> = OnceLock::new();
/// Write end of the record pipe into the notifier thread; -1 until installed.
static NOTIFY_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
/// Read end of the ack pipe back from the notifier thread; -1 until installed.
static ACK_READ_FD: AtomicI32 = AtomicI32::new(-1);

/// Install fatal-signal handlers, remember where the peers live, and start
/// the notifier thread that performs the broadcast. Call once at node
/// startup, before any handler can run.
pub fn install(peers: Vec<SocketAddr>) {
    let have_peers = !peers.is_empty();
    let _ = PEERS.set(peers);

    if have_peers {
        let mut notify = [-1i32; 2];
        let mut ack = [-1i32; 2];
        let pipes_ok = unsafe {
            libc::pipe(notify.as_mut_ptr()) == 0 && libc::pipe(ack.as_mut_ptr()) == 0
        };
        if pipes_ok {
            let spawned = thread::Builder::new()
                .name("crash-notifier".to_string())
                .spawn(move || notifier_loop(notify[0], ack[1]));
            match spawned {
                Ok(_) => {
                    NOTIFY_WRITE_FD.store(notify[1], Ordering::SeqCst);
                    ACK_READ_FD.store(ack[0], Ordering::SeqCst);
                }
                Err(err) => {
                    tracing::error!(error = ?err, "crash notifier thread failed to start");
                }
            }
        } else {
            tracing::error!("crash notifier pipes failed to open");
        }
    }

    unsafe {
        for sig in [
            libc::SIGABRT,
            libc::SIGSEGV,
            libc::SIGBUS,
            libc::SIGFPE,
            libc::SIGILL,
        ] {
            libc::signal(sig, crash_signal_handler as usize);
        }
    }
}

/// Arm the guard with the blacklist key of the command about to execute.
/// Oversized fields are truncated at the buffer limits.
pub fn arm(method_line: &str, user_id: &str) {
    GUARD.with(|slot| {
        let mut method = [0u8; MAX_METHOD_BYTES];
        let method_len = copy_truncated(method_line, &mut method);
        let mut user = [0u8; MAX_USER_BYTES];
        let user_len = copy_truncated(user_id, &mut user);
        slot.method.set(method);
        slot.method_len.set(method_len);
        slot.user.set(user);
        slot.user_len.set(user_len);
        slot.armed.set(true);
    });
}

/// Disarm after the handler returned normally (or its failure was caught).
pub fn disarm() {
    GUARD.with(|slot| slot.armed.set(false));
}

fn copy_truncated(src: &str, dst: &mut [u8]) -> usize {
    // Truncate on a char boundary so the bytes stay valid UTF-8.
    let mut len = src.len().min(dst.len());
    while len > 0 && !src.is_char_boundary(len) {
        len -= 1;
    }
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
    len
}

/// Copy the armed guard into a pipe record. Runs on the signal path: stack
/// copies and plain TLS reads only, no allocation.
fn encode_armed_record() -> Option<[u8; RECORD_BYTES]> {
    GUARD.with(|slot| {
        if !slot.armed.get() {
            return None;
        }
        let method = slot.method.get();
        let method_len = slot.method_len.get().min(MAX_METHOD_BYTES);
        let user = slot.user.get();
        let user_len = slot.user_len.get().min(MAX_USER_BYTES);
        let mut record = [0u8; RECORD_BYTES];
        record[0] = method_len as u8;
        record[1] = user_len as u8;
        record[2..2 + method_len].copy_from_slice(&method[..method_len]);
        record[2 + MAX_METHOD_BYTES..2 + MAX_METHOD_BYTES + user_len]
            .copy_from_slice(&user[..user_len]);
        Some(record)
    })
}

fn decode_record(record: &[u8; RECORD_BYTES]) -> (String, String) {
    let method_len = (record[0] as usize).min(MAX_METHOD_BYTES);
    let user_len = (record[1] as usize).min(MAX_USER_BYTES);
    let method = String::from_utf8_lossy(&record[2..2 + method_len]).into_owned();
    let user =
        String::from_utf8_lossy(&record[2 + MAX_METHOD_BYTES..2 + MAX_METHOD_BYTES + user_len])
            .into_owned();
    (method, user)
}

extern "C" fn crash_signal_handler(sig: libc::c_int) {
    // Async-signal-safe only in here: write, read, alarm, signal, raise.
    // The notifier thread does the rest; the ack read keeps the process
    // alive until the broadcast went out, and the alarm keeps a wedged
    // notifier from hanging the death indefinitely.
    let notify_fd = NOTIFY_WRITE_FD.load(Ordering::SeqCst);
    if notify_fd >= 0 {
        if let Some(record) = encode_armed_record() {
            unsafe {
                libc::alarm(ACK_ALARM_SECS);
                let written =
                    libc::write(notify_fd, record.as_ptr().cast(), RECORD_BYTES);
                if written == RECORD_BYTES as isize {
                    let ack_fd = ACK_READ_FD.load(Ordering::SeqCst);
                    if ack_fd >= 0 {
                        let mut byte = 0u8;
                        libc::read(ack_fd, (&mut byte as *mut u8).cast(), 1);
                    }
                }
            }
        }
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Blocks on the record pipe; one broadcast plus one ack per record.
fn notifier_loop(record_fd: libc::c_int, ack_fd: libc::c_int) {
    loop {
        let mut record = [0u8; RECORD_BYTES];
        if !read_full(record_fd, &mut record) {
            return;
        }
        let (method, user) = decode_record(&record);
        if !method.is_empty() {
            broadcast(&method, &user);
        }
        let ack = [1u8];
        unsafe {
            libc::write(ack_fd, ack.as_ptr().cast(), 1);
        }
    }
}

fn read_full(fd: libc::c_int, buf: &mut [u8]) -> bool {
    let mut offset = 0usize;
    while offset < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[offset..].as_mut_ptr().cast(),
                buf.len() - offset,
            )
        };
        if n > 0 {
            offset += n as usize;
            continue;
        }
        if n < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        // EOF or a real error; the pipe is gone.
        return false;
    }
    true
}

/// Fire-and-forget `CrashCommand` at every peer. Runs on the notifier
/// thread, so normal allocation and socket I/O apply.
fn broadcast(method_line: &str, user_id: &str) {
    let Some(peers) = PEERS.get() else {
        return;
    };
    let mut notice = Message::new(CRASH_COMMAND);
    notice.set("methodLine", method_line).set("userID", user_id);
    let payload = notice.to_bytes();
    for addr in peers {
        if let Ok(mut stream) = TcpStream::connect_timeout(addr, NOTIFY_TIMEOUT) {
            let _ = stream.set_write_timeout(Some(NOTIFY_TIMEOUT));
            let _ = stream.write_all(&payload);
        }
    }
}
