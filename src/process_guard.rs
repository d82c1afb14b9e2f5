//! Lifetime management for local frame processes.
//!
//! Every process started by the local backend runs as the leader of its own
//! process group and is recorded in a [`ChildRegistry`] under the job it
//! belongs to. On shutdown (guard drop or SIGINT/SIGTERM/SIGHUP) the whole
//! group receives SIGTERM, then SIGKILL once the grace period expires, so no
//! frame command outlives the engine that launched it.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period granted to process groups on guard drop.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Process groups of running frame jobs, keyed by leader pid.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: HashMap<u32, String>,
    shutting_down: bool,
}

impl ChildRegistry {
    /// The process-wide registry shared by every local backend.
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Records a process group started for `job`.
    pub fn register(&mut self, pid: u32, job: impl Into<String>) {
        let job = job.into();
        debug!(pid, job = %job, "registered frame process");
        self.children.insert(pid, job);
    }

    /// Forgets a process group once its leader has been reaped.
    pub fn unregister(&mut self, pid: u32) {
        if let Some(job) = self.children.remove(&pid) {
            debug!(pid, job = %job, "unregistered frame process");
        }
    }

    pub fn count(&self) -> usize {
        self.children.len()
    }

    /// Job names with a live process group.
    pub fn jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self.children.values().cloned().collect();
        jobs.sort();
        jobs
    }

    /// True once [`terminate_all`](Self::terminate_all) has run.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// SIGTERM every group, wait up to `grace_period`, then SIGKILL survivors.
    ///
    /// Only the first call does anything.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        if self.children.is_empty() {
            return;
        }
        info!(count = self.children.len(), "terminating frame processes");

        let pids: Vec<u32> = self.children.keys().copied().collect();
        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                info!("all frame processes exited");
                self.children.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        for &pid in pids.iter().filter(|&&pid| is_process_alive(pid)) {
            let job = self.children.get(&pid).map(String::as_str).unwrap_or("");
            warn!(pid, job, "frame process ignored SIGTERM, sending SIGKILL");
            signal_group_or_process(pid, Signal::SIGKILL);
        }
        self.children.clear();
    }
}

fn signal_group_or_process(pid: u32, sig: Signal) {
    // Negative pid addresses the whole group, so grandchildren are included
    if let Err(group_err) = signal::kill(Pid::from_raw(-(pid as i32)), sig) {
        if let Err(err) = signal::kill(Pid::from_raw(pid as i32), sig) {
            debug!(pid, %group_err, %err, signal = ?sig, "could not signal frame process");
        }
    }
}

/// True if `pid` exists and is neither a zombie nor dead.
pub(crate) fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // Third field is the state letter
        Ok(stat) => match stat.split_whitespace().nth(2) {
            Some(state) => !matches!(state, "Z" | "X"),
            None => true,
        },
        Err(_) => true,
    }
}

/// Terminates every registered frame process when dropped.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
    grace_period: Duration,
}

impl ProcessGuard {
    /// A guard over the global registry.
    pub fn new() -> Self {
        Self::with_registry(ChildRegistry::global())
    }

    pub fn with_registry(registry: Arc<Mutex<ChildRegistry>>) -> Self {
        Self {
            registry,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(self.grace_period);
        }
    }
}

/// Installs SIGINT/SIGTERM/SIGHUP handlers that tear down frame processes
/// and exit with `128 + signal`.
pub fn init_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "received shutdown signal");
                if let Ok(mut registry) = ChildRegistry::global().lock() {
                    registry.terminate_all(Duration::from_secs(3));
                }
                std::process::exit(128 + sig);
            }
        })?;
    Ok(())
}

/// Starts a [`std::process::Command`] as the leader of a new process group.
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                // Die with the engine even if it is SIGKILLed
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}
