use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncReadExt as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{self, RestartPolicy, TreeConfig};
use crate::events::pine_event;
use crate::logfile::RotatingLogFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeState {
    Stopped,
    Restarting,
    Running,
}

impl std::fmt::Display for TreeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeState::Stopped => write!(f, "stopped"),
            TreeState::Restarting => write!(f, "restarting"),
            TreeState::Running => write!(f, "running"),
        }
    }
}

/// Point-in-time view of a tree, safe to hand to the control plane.
#[derive(Debug, Clone)]
pub struct TreeStatus {
    pub name: String,
    pub state: TreeState,
    pub uptime: Duration,
    pub last_change: SystemTime,
}

#[derive(Debug)]
struct Volatile {
    state: TreeState,
    run_count: u32,
    full_stop: bool,
    started_at: Option<Instant>,
    last_change_at: SystemTime,
}

/// Config fields frozen for a single launch. The live config can be swapped
/// by reload at any time; each iteration works from its own snapshot.
struct LaunchSpec {
    name: String,
    command: String,
    user: String,
    environment_file: Option<PathBuf>,
    log_file: PathBuf,
    max_log_age_days: u32,
}

/// One managed service: its definition, volatile run state, the single-slot
/// stop signal, and the currently open log file. The run loop is spawned by
/// `start` and owns the child process for its lifetime.
pub struct Tree {
    config: RwLock<TreeConfig>,
    volatile: Mutex<Volatile>,
    logfile: Mutex<Option<Arc<RotatingLogFile>>>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: Mutex<Option<mpsc::Receiver<()>>>,
    loop_active: AtomicBool,
    destroyed: AtomicBool,
}

impl Tree {
    pub fn from_file(path: &Path) -> anyhow::Result<Arc<Self>> {
        Ok(Self::from_config(config::load_tree_config(path)?))
    }

    pub fn from_config(cfg: TreeConfig) -> Arc<Self> {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Arc::new(Self {
            config: RwLock::new(cfg),
            volatile: Mutex::new(Volatile {
                state: TreeState::Stopped,
                run_count: 0,
                full_stop: false,
                started_at: None,
                last_change_at: SystemTime::now(),
            }),
            logfile: Mutex::new(None),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
            loop_active: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> TreeConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn name(&self) -> String {
        self.config.read().unwrap_or_else(|p| p.into_inner()).name.clone()
    }

    pub fn origin_file(&self) -> PathBuf {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .origin_file
            .clone()
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.config.read().unwrap_or_else(|p| p.into_inner()).restart
    }

    pub fn run_count(&self) -> u32 {
        self.volatile.lock().unwrap_or_else(|p| p.into_inner()).run_count
    }

    /// Spawn the run loop on `tracker` unless one is already active.
    pub fn start(
        self: Arc<Self>,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.destroyed.load(Ordering::SeqCst),
            "tree has been destroyed"
        );
        if self
            .loop_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Loop already running; nothing to do.
            return Ok(());
        }
        let me = self;
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            let name = me.name();
            let result = me.run_loop(shutdown).await;
            me.loop_active.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => pine_event("supervise", Some(&name), "loop finished"),
                Err(e) => pine_event("supervise", Some(&name), format!("loop finished err={e:#}")),
            }
        });
        Ok(())
    }

    /// Request a full stop: the child is terminated and the loop exits to
    /// the stopped state instead of consulting the restart policy.
    pub fn stop(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.destroyed.load(Ordering::SeqCst),
            "tree has been destroyed"
        );
        {
            let mut v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
            v.full_stop = true;
        }
        self.signal_stop();
        Ok(())
    }

    /// Terminate the current child without leaving the loop; the restart
    /// decision runs as if the child had exited on its own.
    pub fn restart(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.destroyed.load(Ordering::SeqCst),
            "tree has been destroyed"
        );
        self.signal_stop();
        Ok(())
    }

    /// Re-read the definition file and swap the config in place, then bounce
    /// the child so the next launch uses the new configuration. The swap
    /// completes before the signal is delivered.
    pub fn reload(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.destroyed.load(Ordering::SeqCst),
            "tree has been destroyed"
        );
        let origin = self.origin_file();
        let new_cfg = config::load_tree_config(&origin)?;
        {
            let mut cfg = self.config.write().unwrap_or_else(|p| p.into_inner());
            *cfg = new_cfg;
        }
        self.signal_stop();
        Ok(())
    }

    /// Stop for good; all further operations are refused.
    pub fn destroy(&self) -> anyhow::Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        {
            let mut v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
            v.full_stop = true;
        }
        self.signal_stop();
        Ok(())
    }

    pub fn status(&self) -> TreeStatus {
        let name = self.name();
        let v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
        let uptime = match (v.state, v.started_at) {
            (TreeState::Running, Some(at)) => at.elapsed(),
            _ => Duration::ZERO,
        };
        TreeStatus {
            name,
            state: v.state,
            uptime,
            last_change: v.last_change_at,
        }
    }

    /// Rotate the currently open log file, if a child holds one.
    pub fn rotate_log(&self) -> anyhow::Result<()> {
        let current = self
            .logfile
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        match current {
            Some(f) => f.rotate(),
            None => Ok(()),
        }
    }

    /// Single-slot delivery: a signal already pending covers this request.
    fn signal_stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    fn set_state(&self, next: TreeState) {
        let mut v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
        v.state = next;
        v.last_change_at = SystemTime::now();
    }

    async fn run_loop(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut stop_rx = self
            .stop_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("stop channel already claimed"))?;
        let result = self.run_loop_inner(&mut stop_rx, &shutdown).await;
        *self.stop_rx.lock().unwrap_or_else(|p| p.into_inner()) = Some(stop_rx);
        result
    }

    async fn run_loop_inner(
        &self,
        stop_rx: &mut mpsc::Receiver<()>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        let (policy, attempts, delay) = {
            let cfg = self.config.read().unwrap_or_else(|p| p.into_inner());
            (cfg.restart, cfg.restart_attempts, cfg.restart_delay)
        };
        {
            let mut v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
            v.full_stop = false;
            v.run_count = 0;
        }
        // A signal delivered while no loop was running is stale; absorb it
        // so it cannot kill the first launch.
        let _ = stop_rx.try_recv();

        let mut last_err: anyhow::Result<()> = Ok(());
        loop {
            let run_count = {
                let mut v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
                if v.full_stop {
                    v.state = TreeState::Stopped;
                    v.last_change_at = SystemTime::now();
                    return last_err;
                }
                v.state = TreeState::Restarting;
                v.last_change_at = SystemTime::now();
                v.run_count
            };

            if run_count > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    // A stop or restart request cuts the wait short; the
                    // loop head re-checks full_stop either way.
                    _ = stop_rx.recv() => {}
                    _ = shutdown.cancelled() => {
                        self.set_state(TreeState::Stopped);
                        return Ok(());
                    }
                }
            }

            let spec = {
                let cfg = self.config.read().unwrap_or_else(|p| p.into_inner());
                LaunchSpec {
                    name: cfg.name.clone(),
                    command: cfg.command.clone(),
                    user: cfg.user.clone(),
                    environment_file: cfg.environment_file.clone(),
                    log_file: cfg.log_file.clone(),
                    max_log_age_days: cfg.max_log_age_days,
                }
            };
            pine_event(
                "supervise",
                Some(&spec.name),
                format!("starting attempt={}", run_count + 1),
            );

            last_err = self.launch_once(&spec, stop_rx, shutdown).await;
            if let Err(e) = &last_err {
                pine_event("supervise", Some(&spec.name), format!("run ended err={e:#}"));
            }
            *self.logfile.lock().unwrap_or_else(|p| p.into_inner()) = None;

            let stop_now = {
                let v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
                v.full_stop
                    || policy == RestartPolicy::Never
                    || (policy == RestartPolicy::Limited && v.run_count >= attempts)
            };
            if stop_now {
                self.set_state(TreeState::Stopped);
                return last_err;
            }
        }
    }

    /// One launch attempt: open the log file, build and spawn the child,
    /// pump its output, and wait for exit or a stop request. Every failure
    /// on the way to a running child counts as that attempt's exit error.
    async fn launch_once(
        &self,
        spec: &LaunchSpec,
        stop_rx: &mut mpsc::Receiver<()>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        {
            let mut v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
            v.run_count += 1;
        }

        let logfile = Arc::new(RotatingLogFile::open(&spec.log_file, spec.max_log_age_days)?);
        *self.logfile.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&logfile));

        let mut parts = spec.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty command"))?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts);
        apply_user(&mut cmd, &spec.user)
            .with_context(|| format!("resolve user '{}'", spec.user))?;
        if let Some(env_file) = &spec.environment_file {
            let vars = load_env_file(env_file)?;
            cmd.env_clear().envs(vars);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn '{}'", spec.command))?;
        {
            let mut v = self.volatile.lock().unwrap_or_else(|p| p.into_inner());
            v.started_at = Some(Instant::now());
            v.state = TreeState::Running;
            v.last_change_at = SystemTime::now();
        }

        let out_pump = child
            .stdout
            .take()
            .map(|p| spawn_output_pump(spec.name.clone(), "stdout", p, Arc::clone(&logfile)));
        let err_pump = child
            .stderr
            .take()
            .map(|p| spawn_output_pump(spec.name.clone(), "stderr", p, Arc::clone(&logfile)));

        let status = loop {
            tokio::select! {
                st = child.wait() => break st.context("wait for child")?,
                _ = stop_rx.recv() => {
                    // Kill and fall through; the wait arm observes the exit.
                    let _ = child.start_kill();
                }
                _ = shutdown.cancelled() => {
                    let _ = child.start_kill();
                    break child.wait().await.context("wait for child after shutdown")?;
                }
            }
        };

        if let Some(h) = out_pump {
            let _ = h.await;
        }
        if let Some(h) = err_pump {
            let _ = h.await;
        }

        anyhow::ensure!(status.success(), "'{}' exited with {status}", spec.name);
        Ok(())
    }
}

/// Set child credentials for `target` unless it already is the current
/// user; this keeps unprivileged daemons working without setuid.
fn apply_user(cmd: &mut tokio::process::Command, target: &str) -> anyhow::Result<()> {
    if let Some(current) = users::get_current_username() {
        if current.to_string_lossy() == target {
            return Ok(());
        }
    }
    let user =
        users::get_user_by_name(target).ok_or_else(|| anyhow::anyhow!("no such user {target:?}"))?;
    cmd.uid(user.uid()).gid(user.primary_group_id());
    Ok(())
}

/// Read a `KEY=VALUE`-per-line file. The child's environment is replaced
/// with exactly these entries.
fn load_env_file(path: &Path) -> anyhow::Result<Vec<(String, String)>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read environment file {}", path.display()))?;
    let mut vars = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let Some((key, value)) = line.split_once('=') else {
            anyhow::bail!(
                "invalid environment file {} on line {}: expected KEY=VALUE",
                path.display(),
                idx + 1
            );
        };
        vars.push((key.to_string(), value.to_string()));
    }
    Ok(vars)
}

fn spawn_output_pump<R>(
    name: String,
    stream: &'static str,
    mut pipe: R,
    logfile: Arc<RotatingLogFile>,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut off = 0;
                    while off < n {
                        match logfile.write(&buf[off..n]) {
                            Ok(written) => off += written,
                            Err(e) => {
                                pine_event(
                                    "logpump",
                                    Some(&name),
                                    format!("stream={stream} write failed err={e:#}"),
                                );
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    pine_event(
                        "logpump",
                        Some(&name),
                        format!("stream={stream} read failed err={e}"),
                    );
                    break;
                }
            }
        }
    })
}
