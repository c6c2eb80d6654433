use anyhow::Context as _;
use notify::{RecursiveMode, Watcher as _};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::pine_event;
use crate::registry::Registry;

/// Write events are batched for this long before the pending set is
/// dispatched, so an editor save storm collapses into one reload.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Watch `dir` and keep `registry` in step with it: creations admit,
/// removals evict, writes are debounced into reloads. Returns when
/// `shutdown` fires; buffered updates are discarded at that point.
pub async fn watch_trees(
    registry: Arc<Registry>,
    dir: PathBuf,
    flush_interval: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    })
    .context("create directory watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", dir.display()))?;

    // Enumerate after the watch is established so nothing slips between
    // the scan and the first event.
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("read tree directory {}", dir.display()))?
    {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                pine_event("watcher", None, format!("skipping unreadable entry err={e}"));
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        registry.load(&path);
    }

    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut flush = tokio::time::interval(flush_interval);
    flush.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = flush.tick() => {
                for path in pending.drain() {
                    registry.update(&path);
                }
            }
            event = rx.recv() => match event {
                Some(Ok(event)) => handle_event(&registry, &mut pending, event),
                Some(Err(e)) => pine_event("watcher", None, format!("watch error err={e}")),
                None => return Ok(()),
            },
        }
    }
}

fn handle_event(registry: &Registry, pending: &mut HashSet<PathBuf>, event: notify::Event) {
    use notify::EventKind;
    match event.kind {
        EventKind::Create(_) => {
            for path in event.paths {
                if path.is_dir() {
                    continue;
                }
                registry.load(&path);
            }
        }
        EventKind::Modify(_) => {
            for path in event.paths {
                pending.insert(path);
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                registry.remove(&path);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeState;
    use tokio_util::task::TaskTracker;

    fn current_username() -> String {
        users::get_current_username()
            .expect("current username")
            .to_string_lossy()
            .into_owned()
    }

    fn definition(dir: &tempfile::TempDir, name: &str, command: &str) -> String {
        let me = current_username();
        let log = dir.path().join(format!("{name}.log"));
        format!(
            "Name {name}\nCommand {command}\nUser {me}\nLogFile {}\nRestart always\nRestartDelay 10ms\n",
            log.display()
        )
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tracks_create_write_and_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let registry = Registry::new(tracker.clone(), shutdown.clone());

        let watch = tokio::spawn(watch_trees(
            Arc::clone(&registry),
            dir.path().to_path_buf(),
            Duration::from_millis(100),
            shutdown.clone(),
        ));

        // Give the watch a moment to establish before touching the dir.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let path = dir.path().join("w.tree");
        std::fs::write(&path, definition(&dir, "W", "/bin/sleep 300")).expect("create definition");
        wait_for(
            || {
                registry
                    .tree_status("W")
                    .map(|s| s.state == TreeState::Running)
                    .unwrap_or(false)
            },
            "W admitted and running",
        )
        .await;
        let handle = registry.handle("W").expect("handle");
        let runs_before = handle.run_count();

        // A rewrite lands in the pending set and flushes into a reload.
        std::fs::write(&path, definition(&dir, "W", "/bin/sleep 299")).expect("rewrite definition");
        wait_for(|| handle.run_count() > runs_before, "reload relaunches W").await;
        wait_for(
            || handle.config().command == "/bin/sleep 299",
            "reload swaps the command",
        )
        .await;

        std::fs::remove_file(&path).expect("remove definition");
        wait_for(|| registry.tree_status("W").is_err(), "W evicted").await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), watch)
            .await
            .expect("watcher should exit")
            .expect("watcher task")
            .expect("watcher result");

        registry.destroy_all();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(10), tracker.wait())
            .await
            .expect("supervisors should finish");
    }
}
