use std::collections::{BTreeMap, VecDeque};
use std::io::{BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;

/// How often blocking loops re-check the cancel flag.
pub const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Progress reported by toolchain preparation and device builds.
/// Every event carries the id of the unit (coordinate or device) it belongs to.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    UnitStarted {
        id: String,
    },
    Log {
        id: String,
        line: String,
    },
    UnitFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Forwards events to `tracing` and keeps counters for the closing summary.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    units_started: usize,
    units_ok: usize,
    units_failed: usize,
    log_lines: usize,
    failed_units: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::UnitStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.units_started = s.units_started.saturating_add(1);
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                tracing::info!(scope = %id, "started");
            }
            ExecEvent::Log { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                }
                tracing::info!(scope = %id, "{line}");
            }
            ExecEvent::UnitFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.units_ok = s.units_ok.saturating_add(1);
                    } else {
                        s.units_failed = s.units_failed.saturating_add(1);
                        s.failed_units.push(id.clone());
                    }
                }
                let elapsed = format_elapsed_hms((elapsed_ms / 1000) as u64);
                if ok {
                    tracing::info!(scope = %id, %elapsed, "done");
                } else {
                    tracing::error!(
                        scope = %id,
                        %elapsed,
                        error = %error.unwrap_or_default(),
                        "failed"
                    );
                }
            }
            ExecEvent::RunDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let elapsed = format_elapsed_hms(wall.as_secs());
                if ok {
                    tracing::info!(
                        units = s.units_started,
                        ok = s.units_ok,
                        logs = s.log_lines,
                        %elapsed,
                        "run finished"
                    );
                } else {
                    let mut failed = s.failed_units.clone();
                    failed.sort();
                    failed.dedup();
                    tracing::warn!(
                        units = s.units_started,
                        ok = s.units_ok,
                        failed = s.units_failed,
                        failed_units = %failed.join(", "),
                        %elapsed,
                        error = %error.unwrap_or_default(),
                        "run finished with failures"
                    );
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Default)]
struct SharedExecState {
    // Process groups of running build tools, so a cancel can take down their children too.
    child_pgroups: Mutex<BTreeMap<u32, String>>,
}

/// Per-call context: log scope, cancellation flag and event sink.
/// Cloning is cheap; `scoped` derives a context for a narrower unit.
#[derive(Clone)]
pub struct ExecCtx {
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub scope: Option<String>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(sink: Arc<dyn ExecSink>) -> Self {
        Self::with_cancel(sink, Arc::new(AtomicBool::new(false)))
    }

    pub fn with_cancel(sink: Arc<dyn ExecSink>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            cancel,
            sink,
            scope: None,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    pub fn scoped(&self, id: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.scope = Some(id.into());
        ctx
    }

    pub fn scope_id(&self) -> &str {
        self.scope.as_deref().unwrap_or("run")
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::Log {
            id: self.scope_id().to_string(),
            line: msg.to_string(),
        });
    }

    /// Runs `f` as a named unit: emits start/finish events around it and
    /// hands it a context scoped to `id`.
    pub fn unit<T>(&self, id: &str, f: impl FnOnce(&ExecCtx) -> Result<T>) -> Result<T> {
        let ctx = self.scoped(id);
        self.sink.emit(ExecEvent::UnitStarted { id: id.to_string() });
        let start = Instant::now();
        let res = f(&ctx);
        let elapsed_ms = start.elapsed().as_millis();
        self.sink.emit(ExecEvent::UnitFinished {
            id: id.to_string(),
            ok: res.is_ok(),
            error: res.as_ref().err().map(|e| format!("[{}] {e}", e.kind())),
            elapsed_ms,
        });
        res
    }

    fn register_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.insert(pgid, self.scope_id().to_string());
        }
    }

    fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.remove(&pgid);
        }
    }

    pub fn kill_running_children_force(&self) {
        let pgids: Vec<u32> = self
            .shared
            .child_pgroups
            .lock()
            .ok()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default();
        for pgid in pgids {
            kill_pgroup(pgid, true);
        }
    }

    /// Spawns `cmd` with stdout/stderr streamed into the log line by line
    /// and returns its exit status. A cancel request kills the child's
    /// process group and yields a `Cancelled` error.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<ExitStatus> {
        self.check_cancelled()?;
        self.log(&format!("exec: {cmd:?}"));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::build(format!("spawn failed: {e}")))?;
        let pgid = child.id();
        self.register_child_pgroup(pgid);

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        // Polls so a quiet child is still killed promptly on cancel.
        let mut killed = false;
        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(line) => {
                    let line = sanitize_log_line(&line);
                    if !line.is_empty() {
                        self.log(&line);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if !killed && self.cancelled() {
                kill_pgroup(pgid, false);
                kill_pgroup(pgid, true);
                killed = true;
            }
        }

        let status = child.wait();
        self.unregister_child_pgroup(pgid);
        let status = status.map_err(|e| Error::build(format!("wait failed: {e}")))?;
        if killed || self.cancelled() {
            return Err(Error::cancelled());
        }
        Ok(status)
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

/// Applies `f` to every job on up to `max_parallel` worker threads and
/// returns the results in job order. With `max_parallel <= 1` the jobs run
/// on the calling thread.
pub fn run_pool<T, R, F>(jobs: Vec<T>, max_parallel: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = jobs.len();
    let workers = max_parallel.min(total);
    if workers <= 1 {
        return jobs.into_iter().map(f).collect();
    }

    let queue: Mutex<VecDeque<(usize, T)>> = Mutex::new(jobs.into_iter().enumerate().collect());
    let (tx, rx) = mpsc::channel::<(usize, R)>();
    std::thread::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let f = &f;
            s.spawn(move || {
                loop {
                    let next = match queue.lock() {
                        Ok(mut q) => q.pop_front(),
                        Err(_) => None,
                    };
                    let Some((idx, job)) = next else {
                        break;
                    };
                    let _ = tx.send((idx, f(job)));
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    for (idx, r) in rx {
        slots[idx] = Some(r);
    }
    slots.into_iter().flatten().collect()
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        let _ = tx.send(line);
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !pending.is_empty() {
                    flush(&mut pending);
                }
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING_BYTES {
                    flush(&mut pending);
                }
            }
        }
    }

    if !pending.is_empty() {
        flush(&mut pending);
    }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
