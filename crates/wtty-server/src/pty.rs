//! PTY child process management.
//!
//! Forks a child attached to a freshly allocated pseudo-terminal and bridges
//! its master side into the tokio runtime. The master fd is set non-blocking
//! and driven by `AsyncFd`; a capture task forwards output chunks through an
//! mpsc channel until EOF. Child exit is detected via EOF/EIO on the master,
//! not SIGCHLD, which keeps reaping tied to fd state.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wtty_core::{WttyError, WttyResult};

/// Read buffer size for the capture task.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Capacity of the capture channel, in chunks.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Total time a PTY write may spin on EAGAIN before the input is dropped.
const WRITE_DEADLINE: Duration = Duration::from_secs(1);

/// Grace period between SIGHUP and SIGKILL during termination.
const REAP_GRACE: Duration = Duration::from_secs(1);
const REAP_POLL: Duration = Duration::from_millis(50);

/// What to exec in the child.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Command line to run instead of a shell (split on whitespace).
    pub command: Option<String>,
    /// Login shell used when no command is given (spawned as `<shell> -il`).
    pub shell: String,
    /// Value for `TERM` in the child environment.
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

/// A child process attached to a pseudo-terminal.
///
/// The master fd lives here for write/resize/terminate; the capture task
/// holds its own dup of the fd, so closing the master during termination
/// does not race with in-flight reads.
pub struct PtyProcess {
    master: Mutex<Option<OwnedFd>>,
    child: Pid,
    alive: AtomicBool,
    size: Mutex<(u16, u16)>,
    exit_status: Mutex<Option<i32>>,
    /// Serializes input writes so bytes from concurrent clients land in
    /// arrival order and never interleave mid-chunk.
    write_lock: tokio::sync::Mutex<()>,
}

impl PtyProcess {
    /// Allocate a PTY pair, fork, and exec.
    ///
    /// The initial window size is applied by `openpty` before the exec so the
    /// child's first output is laid out correctly. Returns the process handle
    /// and the receiver carrying output chunks; the channel closes on EOF.
    pub fn spawn(opts: &SpawnOptions) -> WttyResult<(Self, mpsc::Receiver<Vec<u8>>)> {
        let (program, argv) = resolve_argv(opts)?;
        let envp = build_env(opts, &program);

        let winsize = Winsize {
            ws_row: opts.rows,
            ws_col: opts.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None)
            .map_err(|e| WttyError::Spawn(format!("openpty: {e}")))?;

        // SAFETY: the child performs only async-signal-safe operations
        // (close/setsid/ioctl/dup2/exec) before execvpe, and every error
        // path _exits instead of returning into the parent's code.
        let fork_result =
            unsafe { nix::unistd::fork() }.map_err(|e| WttyError::Spawn(format!("fork: {e}")))?;

        match fork_result {
            ForkResult::Child => {
                let _ = nix::unistd::close(pty.master.as_raw_fd());

                if nix::unistd::setsid().is_err() {
                    unsafe { libc::_exit(1) };
                }

                let slave_fd = pty.slave.as_raw_fd();
                // Make the slave our controlling terminal.
                unsafe {
                    if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                        libc::_exit(1);
                    }
                    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
                        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
                        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
                    {
                        libc::_exit(1);
                    }
                }
                if slave_fd > libc::STDERR_FILENO {
                    let _ = nix::unistd::close(slave_fd);
                }

                // 127 = command not found convention; the parent observes it
                // as an immediate EOF plus exit status.
                let _ = nix::unistd::execvpe(&program, &argv, &envp);
                unsafe { libc::_exit(127) };
            }
            ForkResult::Parent { child } => {
                drop(pty.slave);

                let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
                spawn_capture_task(pty.master.as_raw_fd(), output_tx)?;

                info!(pid = child.as_raw(), cols = opts.cols, rows = opts.rows, "pty spawned");

                Ok((
                    Self {
                        master: Mutex::new(Some(pty.master)),
                        child,
                        alive: AtomicBool::new(true),
                        size: Mutex::new((opts.cols, opts.rows)),
                        exit_status: Mutex::new(None),
                        write_lock: tokio::sync::Mutex::new(()),
                    },
                    output_rx,
                ))
            }
        }
    }

    /// Write user input to the master side.
    ///
    /// Short writes are retried; EAGAIN is retried for up to the write
    /// deadline, after which the remainder is dropped. Writes to a dead
    /// child are dropped silently.
    pub async fn write(&self, data: &[u8]) {
        if !self.is_alive() || data.is_empty() {
            return;
        }
        let _serialized = self.write_lock.lock().await;
        let Some(fd) = self.dup_master() else { return };
        let data = data.to_vec();

        let result = tokio::task::spawn_blocking(move || write_all_bounded(&fd, &data)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
                warn!("pty write timed out, input dropped");
            }
            Ok(Err(e)) => {
                // Typically EIO after the child went away.
                debug!(error = %e, "pty write failed, input dropped");
            }
            Err(e) => warn!(error = %e, "pty write task failed"),
        }
    }

    /// Apply a new window size via TIOCSWINSZ. No-op after exit; ioctl
    /// failures are logged, never propagated.
    pub fn resize(&self, cols: u16, rows: u16) {
        if !self.is_alive() {
            return;
        }
        let guard = match self.master.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        let Some(fd) = guard.as_ref() else { return };

        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ with a valid Winsize on an open master fd.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        drop(guard);
        if rc < 0 {
            warn!(cols, rows, error = %io::Error::last_os_error(), "pty resize ioctl failed");
        } else {
            if let Ok(mut size) = self.size.lock() {
                *size = (cols, rows);
            }
            debug!(pid = self.child.as_raw(), cols, rows, "pty resized");
        }
    }

    /// Terminate the child and reap it. Idempotent.
    ///
    /// Mirrors what terminals do when their window closes: SIGHUP, then
    /// SIGCONT so a stopped child wakes to receive the hangup, then a
    /// bounded wait, then SIGKILL.
    pub async fn terminate(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        // Closing the master delivers EOF/hangup to the slave side.
        if let Ok(mut guard) = self.master.lock() {
            guard.take();
        }

        let _ = kill(self.child, Signal::SIGHUP);
        let _ = kill(self.child, Signal::SIGCONT);

        if self.reap(REAP_GRACE).await {
            return;
        }

        warn!(pid = self.child.as_raw(), "child survived SIGHUP grace period, sending SIGKILL");
        let _ = kill(self.child, Signal::SIGKILL);
        if !self.reap(REAP_GRACE).await {
            warn!(pid = self.child.as_raw(), "failed to reap child after SIGKILL");
        }
    }

    /// Poll waitpid with WNOHANG until the child is reaped or the grace
    /// period elapses. Records the exit status on success.
    async fn reap(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.record_exit(code);
                    return true;
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.record_exit(128 + sig as i32);
                    return true;
                }
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    // Already reaped elsewhere; nothing more to learn.
                    return true;
                }
                Err(e) => {
                    warn!(pid = self.child.as_raw(), error = %e, "waitpid failed");
                    return false;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(REAP_POLL).await;
        }
    }

    fn record_exit(&self, code: i32) {
        info!(pid = self.child.as_raw(), code, "child exited");
        if let Ok(mut status) = self.exit_status.lock() {
            *status = Some(code);
        }
    }

    /// Present only after the child has been reaped.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status.lock().ok().and_then(|s| *s)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> i32 {
        self.child.as_raw()
    }

    /// Current window size (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    /// Duplicate the master fd so a blocking task can own its copy without
    /// racing a concurrent terminate().
    fn dup_master(&self) -> Option<OwnedFd> {
        let guard = self.master.lock().ok()?;
        let fd = guard.as_ref()?;
        // SAFETY: fd is a valid open descriptor; dup gives us independent
        // close semantics.
        let dup = unsafe { libc::dup(fd.as_raw_fd()) };
        if dup < 0 {
            return None;
        }
        // SAFETY: dup is a freshly returned descriptor we now own.
        Some(unsafe { OwnedFd::from_raw_fd(dup) })
    }
}

/// Resolve what to exec: per-session command, else the login shell.
/// Returns the program plus the full argv (argv[0] included).
fn resolve_argv(opts: &SpawnOptions) -> WttyResult<(CString, Vec<CString>)> {
    let to_cstring = |s: &str| {
        CString::new(s).map_err(|_| WttyError::Spawn(format!("nul byte in argument: {s:?}")))
    };

    match opts.command.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(command) => {
            let parts: Vec<&str> = command.split_whitespace().collect();
            let program = to_cstring(parts[0])?;
            let argv = parts.iter().map(|p| to_cstring(p)).collect::<WttyResult<Vec<_>>>()?;
            Ok((program, argv))
        }
        None => {
            let program = to_cstring(&opts.shell)?;
            let argv = vec![program.clone(), to_cstring("-il")?];
            Ok((program, argv))
        }
    }
}

/// Child environment: the inherited environment with the terminal variables
/// overlaid. Built before fork; the child must not allocate.
fn build_env(opts: &SpawnOptions, program: &CString) -> Vec<CString> {
    let shell_value = match opts.command {
        Some(_) => program.to_string_lossy().into_owned(),
        None => opts.shell.clone(),
    };
    let overrides = [
        ("TERM", opts.term.as_str()),
        ("COLORTERM", "truecolor"),
        ("SHELL", shell_value.as_str()),
        ("WTTY", "1"),
    ];

    let mut env: Vec<CString> = std::env::vars()
        .filter(|(k, _)| !overrides.iter().any(|(ok, _)| ok == k))
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();
    for (k, v) in overrides {
        if let Ok(pair) = CString::new(format!("{k}={v}")) {
            env.push(pair);
        }
    }
    env
}

/// Bounded blocking write loop used from spawn_blocking.
fn write_all_bounded(fd: &OwnedFd, data: &[u8]) -> io::Result<()> {
    let start = std::time::Instant::now();
    let mut written = 0;
    while written < data.len() {
        // SAFETY: valid buffer slice, valid owned fd.
        let n = unsafe {
            libc::write(
                fd.as_raw_fd(),
                data[written..].as_ptr().cast::<libc::c_void>(),
                data.len() - written,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= WRITE_DEADLINE {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "pty write deadline"));
                    }
                    std::thread::yield_now();
                    continue;
                }
                _ => return Err(err),
            }
        }
        written += n as usize;
    }
    Ok(())
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> WttyResult<()> {
    let raw_fd = fd.as_raw_fd();
    let flags = fcntl(raw_fd, FcntlArg::F_GETFL)
        .map_err(|e| WttyError::PtyIo(format!("F_GETFL: {e}")))?;
    let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw_fd, FcntlArg::F_SETFL(new_flags))
        .map_err(|e| WttyError::PtyIo(format!("F_SETFL: {e}")))?;
    Ok(())
}

/// Spawn the capture task: an AsyncFd-driven read loop on a dup of the
/// master. EOF or EIO closes the channel, which is how the session learns
/// the child is gone.
fn spawn_capture_task(master_fd: i32, output_tx: mpsc::Sender<Vec<u8>>) -> WttyResult<()> {
    // SAFETY: master_fd is open; dup gives the task independent close
    // semantics so terminate() can close the original underneath us.
    let capture_fd = unsafe { libc::dup(master_fd) };
    if capture_fd < 0 {
        return Err(WttyError::Spawn(format!(
            "dup master fd: {}",
            io::Error::last_os_error()
        )));
    }
    // SAFETY: freshly dup'd descriptor, now owned here.
    let owned_fd = unsafe { OwnedFd::from_raw_fd(capture_fd) };
    set_nonblocking(owned_fd.as_fd())?;
    let async_fd = AsyncFd::new(owned_fd).map_err(|e| WttyError::Spawn(format!("AsyncFd: {e}")))?;

    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    debug!(error = %e, "pty readiness wait failed");
                    break;
                }
            };

            match guard.try_io(|inner| {
                // SAFETY: non-blocking read into a valid buffer.
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr().cast::<libc::c_void>(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    debug!("pty eof");
                    break;
                }
                Ok(Ok(n)) => {
                    if output_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    // EIO on the master means the slave side is gone, i.e.
                    // the child exited. Anything else is equally terminal.
                    if e.raw_os_error() != Some(libc::EIO) {
                        debug!(error = %e, "pty read error");
                    }
                    break;
                }
                Err(_would_block) => continue,
            }
        }
        // Dropping output_tx closes the channel: the EOF sentinel.
    });

    Ok(())
}
