use chrono::{Days, Local, TimeZone as _};
use std::fs;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::events::pine_event;
use crate::registry::Registry;
use crate::rpc::{Request, Response, TreeStatusEntry};
use crate::tree::TreeStatus;
use crate::{build_info, config, watcher};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub tree_dir: PathBuf,
    pub endpoint: PathBuf,
    pub unprivileged: bool,
}

/// Run the daemon until `shutdown` fires: admit everything under the tree
/// directory, keep watching it, serve the control socket, and rotate logs
/// at local midnight. On the way out every tree is destroyed and every
/// spawned task is joined, so no child or handle outlives this call.
pub async fn run(cfg: DaemonConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    if cfg.unprivileged {
        let user = users::get_current_username()
            .ok_or_else(|| anyhow::anyhow!("cannot determine the current user for unprivileged mode"))?;
        config::set_default_user(user.to_string_lossy().into_owned());
        pine_event("boot", None, format!("unprivileged mode default_user={}", config::default_user()));
    }

    prepare_socket(&cfg.endpoint)?;
    let listener = UnixListener::bind(&cfg.endpoint)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", cfg.endpoint.display()))?;
    pine_event("rpc", None, format!("listening sock={}", cfg.endpoint.display()));

    let tracker = TaskTracker::new();
    let registry = Registry::new(tracker.clone(), shutdown.clone());

    {
        let registry = Arc::clone(&registry);
        let dir = cfg.tree_dir.clone();
        let token = shutdown.clone();
        tracker.spawn(async move {
            if let Err(e) = watcher::watch_trees(registry, dir, watcher::FLUSH_INTERVAL, token).await
            {
                pine_event("watcher", None, format!("watcher finished err={e:#}"));
            }
        });
    }
    {
        let registry = Arc::clone(&registry);
        let token = shutdown.clone();
        tracker.spawn(rotate_logs_at_midnight(registry, token));
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let registry = Arc::clone(&registry);
                    tracker.spawn(async move {
                        if let Err(e) = handle_connection(registry, stream).await {
                            pine_event("rpc", None, format!("connection error err={e:#}"));
                        }
                    });
                }
                Err(e) => {
                    pine_event("rpc", None, format!("accept error err={e}"));
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            },
        }
    }

    pine_event("shutdown", None, "stopping all trees");
    registry.destroy_all();
    tracker.close();
    tracker.wait().await;
    drop(listener);
    let _ = fs::remove_file(&cfg.endpoint);
    pine_event("shutdown", None, "daemon finished");
    Ok(())
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create socket directory {}: {e}", parent.display())
            })?;
        }
    }
    if sock.exists() {
        // If something is already listening, fail. Otherwise remove the
        // stale socket from a previous run.
        match StdUnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "pine daemon already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    registry: Arc<Registry>,
    stream: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(());
    }
    let resp = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(req) => dispatch(&registry, req),
        Err(e) => Response::error(format!("bad request: {e}")),
    };
    let mut stream = reader.into_inner();
    let resp_line = serde_json::to_string(&resp)? + "\n";
    stream.write_all(resp_line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn dispatch(registry: &Registry, req: Request) -> Response {
    let result = match req {
        Request::Start { name } => registry
            .start_tree(&name)
            .map(|_| Response::ok_message(format!("started {name}"))),
        Request::Stop { name } => registry
            .stop_tree(&name)
            .map(|_| Response::ok_message(format!("stopped {name}"))),
        Request::Restart { name } => registry
            .restart_tree(&name)
            .map(|_| Response::ok_message(format!("restarted {name}"))),
        Request::RotateLog { name } => registry
            .rotate_tree_log(&name)
            .map(|_| Response::ok_message(format!("rotated log for {name}"))),
        Request::Status { name } => registry
            .tree_status(&name)
            .map(|s| Response::ok_statuses(vec![status_entry(s)])),
        Request::List => Ok(Response::ok_statuses(
            registry.list().into_iter().map(status_entry).collect(),
        )),
        Request::ServerVersion => Ok(Response::ok_message(build_info::banner())),
    };
    result.unwrap_or_else(|e| Response::error(format!("{e:#}")))
}

fn status_entry(s: TreeStatus) -> TreeStatusEntry {
    TreeStatusEntry {
        name: s.name,
        state: s.state,
        last_change_unix_seconds: s
            .last_change
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        uptime_seconds: s.uptime.as_secs(),
    }
}

async fn rotate_logs_at_midnight(registry: Arc<Registry>, shutdown: CancellationToken) {
    loop {
        let wait = until_next_midnight();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                pine_event("logrotate", None, "rotating tree logs");
                registry.rotate_all();
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

fn until_next_midnight() -> Duration {
    let now = Local::now();
    let midnight = (now.date_naive() + Days::new(1))
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest());
    match midnight {
        Some(at) => (at - now).to_std().unwrap_or(Duration::from_secs(1)),
        // A skipped local midnight (DST edge): check back in an hour.
        None => Duration::from_secs(3_600),
    }
}
