use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{self, RestartPolicy};
use crate::events::pine_event;
use crate::tree::{Tree, TreeStatus};

/// Map of admitted trees, keyed by name. Admission is first-seen-wins; a
/// definition whose name collides with a live record is rejected. Records
/// leave when their origin file is removed or at daemon shutdown.
pub struct Registry {
    trees: RwLock<HashMap<String, Arc<Tree>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(tracker: TaskTracker, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            trees: RwLock::new(HashMap::new()),
            tracker,
            shutdown,
        })
    }

    /// Admit the definition at `path` and launch its supervisor loop.
    /// Parse failures and name conflicts are logged, never fatal.
    pub fn load(&self, path: &Path) {
        pine_event("registry", None, format!("adding tree file={}", path.display()));
        let tree = match Tree::from_file(path) {
            Ok(t) => t,
            Err(e) => {
                pine_event(
                    "registry",
                    None,
                    format!("rejecting tree file={} err={e:#}", path.display()),
                );
                return;
            }
        };
        let name = tree.name();
        {
            let mut trees = self.trees.write().unwrap_or_else(|p| p.into_inner());
            if let Some(existing) = trees.get(&name) {
                pine_event(
                    "registry",
                    Some(&name),
                    format!(
                        "name conflict file={} existing={}",
                        path.display(),
                        existing.origin_file().display()
                    ),
                );
                return;
            }
            trees.insert(name.clone(), Arc::clone(&tree));
        }
        if let Err(e) = tree.start(&self.tracker, &self.shutdown) {
            pine_event("registry", Some(&name), format!("start failed err={e:#}"));
        }
    }

    /// Re-read the definition at `path` and reload the matching record.
    pub fn update(&self, path: &Path) {
        pine_event("registry", None, format!("updating tree file={}", path.display()));
        let cfg = match config::load_tree_config(path) {
            Ok(c) => c,
            Err(e) => {
                pine_event(
                    "registry",
                    None,
                    format!("cannot update tree file={} err={e:#}", path.display()),
                );
                return;
            }
        };
        let tree = {
            let trees = self.trees.read().unwrap_or_else(|p| p.into_inner());
            trees.get(&cfg.name).cloned()
        };
        match tree {
            Some(t) => {
                if let Err(e) = t.reload() {
                    pine_event("registry", Some(&cfg.name), format!("reload failed err={e:#}"));
                }
            }
            None => pine_event(
                "registry",
                Some(&cfg.name),
                format!("no tree to update for file={}", path.display()),
            ),
        }
    }

    /// Drop the record admitted from `path`. The file itself is usually
    /// already gone, so the lookup goes by origin rather than by re-parsing.
    pub fn remove(&self, path: &Path) {
        pine_event("registry", None, format!("removing tree file={}", path.display()));
        let mut trees = self.trees.write().unwrap_or_else(|p| p.into_inner());
        let name = trees
            .iter()
            .find(|(_, t)| t.origin_file() == path)
            .map(|(n, _)| n.clone());
        match name {
            Some(name) => {
                if let Some(t) = trees.remove(&name) {
                    if let Err(e) = t.destroy() {
                        pine_event("registry", Some(&name), format!("destroy failed err={e:#}"));
                    }
                }
            }
            None => pine_event(
                "registry",
                None,
                format!("no tree admitted from file={}", path.display()),
            ),
        }
    }

    pub(crate) fn handle(&self, name: &str) -> Option<Arc<Tree>> {
        let trees = self.trees.read().unwrap_or_else(|p| p.into_inner());
        trees.get(name).cloned()
    }

    fn get(&self, name: &str) -> anyhow::Result<Arc<Tree>> {
        self.handle(name)
            .ok_or_else(|| anyhow::anyhow!("tree '{name}' not found"))
    }

    pub fn start_tree(&self, name: &str) -> anyhow::Result<()> {
        self.get(name)?.start(&self.tracker, &self.shutdown)
    }

    pub fn stop_tree(&self, name: &str) -> anyhow::Result<()> {
        self.get(name)?.stop()
    }

    pub fn restart_tree(&self, name: &str) -> anyhow::Result<()> {
        let tree = self.get(name)?;
        anyhow::ensure!(
            tree.restart_policy() != RestartPolicy::Never,
            "tree '{name}' has restart policy never"
        );
        tree.restart()
    }

    pub fn tree_status(&self, name: &str) -> anyhow::Result<TreeStatus> {
        Ok(self.get(name)?.status())
    }

    pub fn rotate_tree_log(&self, name: &str) -> anyhow::Result<()> {
        self.get(name)?.rotate_log()
    }

    /// Status of every admitted tree, sorted by name.
    pub fn list(&self) -> Vec<TreeStatus> {
        let trees = self.trees.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<TreeStatus> = trees.values().map(|t| t.status()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Rotate every tree's log; failures are logged and swallowed so one
    /// bad sink cannot block the midnight pass.
    pub fn rotate_all(&self) {
        let trees: Vec<Arc<Tree>> = {
            let trees = self.trees.read().unwrap_or_else(|p| p.into_inner());
            trees.values().cloned().collect()
        };
        for t in trees {
            if let Err(e) = t.rotate_log() {
                pine_event("logrotate", Some(&t.name()), format!("rotate failed err={e:#}"));
            }
        }
    }

    /// Destroy every record; used on daemon shutdown.
    pub fn destroy_all(&self) {
        let drained: Vec<(String, Arc<Tree>)> = {
            let mut trees = self.trees.write().unwrap_or_else(|p| p.into_inner());
            trees.drain().collect()
        };
        for (name, t) in drained {
            if let Err(e) = t.destroy() {
                pine_event("registry", Some(&name), format!("destroy failed err={e:#}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TreeState;
    use std::path::PathBuf;
    use std::time::Duration;

    fn current_username() -> String {
        users::get_current_username()
            .expect("current username")
            .to_string_lossy()
            .into_owned()
    }

    fn write_tree(dir: &tempfile::TempDir, file: &str, name: &str, extra: &str) -> PathBuf {
        let me = current_username();
        let log = dir.path().join(format!("{name}.log"));
        let path = dir.path().join(file);
        std::fs::write(
            &path,
            format!(
                "Name {name}\nCommand /bin/sleep 300\nUser {me}\nLogFile {}\n{extra}",
                log.display()
            ),
        )
        .expect("write tree definition");
        path
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn shut_down(registry: &Registry, tracker: TaskTracker) {
        registry.destroy_all();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(10), tracker.wait())
            .await
            .expect("supervisors should finish");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admits_and_runs_a_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = TaskTracker::new();
        let registry = Registry::new(tracker.clone(), CancellationToken::new());

        let path = write_tree(&dir, "a.tree", "A", "");
        registry.load(&path);

        wait_for(
            || {
                registry
                    .tree_status("A")
                    .map(|s| s.state == TreeState::Running)
                    .unwrap_or(false)
            },
            "A running",
        )
        .await;

        shut_down(&registry, tracker).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn name_conflict_keeps_the_first_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = TaskTracker::new();
        let registry = Registry::new(tracker.clone(), CancellationToken::new());

        let first = write_tree(&dir, "a.tree", "A", "");
        let second = write_tree(&dir, "b.tree", "A", "");
        registry.load(&first);
        registry.load(&second);

        let handle = registry.handle("A").expect("A admitted");
        assert_eq!(handle.origin_file(), first);
        assert_eq!(registry.list().len(), 1);

        // Removing the rejected file must not evict the surviving record.
        registry.remove(&second);
        assert!(registry.tree_status("A").is_ok());

        shut_down(&registry, tracker).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_evicts_by_origin_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = TaskTracker::new();
        let registry = Registry::new(tracker.clone(), CancellationToken::new());

        let path = write_tree(&dir, "a.tree", "A", "");
        registry.load(&path);
        wait_for(
            || {
                registry
                    .tree_status("A")
                    .map(|s| s.state == TreeState::Running)
                    .unwrap_or(false)
            },
            "A running",
        )
        .await;

        // The watcher sees the removal after the file is gone.
        std::fs::remove_file(&path).expect("remove definition");
        registry.remove(&path);

        assert!(registry.tree_status("A").is_err());
        shut_down(&registry, tracker).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_is_refused_for_never_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = TaskTracker::new();
        let registry = Registry::new(tracker.clone(), CancellationToken::new());

        let path = write_tree(&dir, "n.tree", "N", "Restart never\n");
        registry.load(&path);
        wait_for(|| registry.tree_status("N").is_ok(), "N admitted").await;

        let before = registry.handle("N").expect("handle").run_count();
        let err = registry.restart_tree("N").expect_err("restart must fail");
        assert!(format!("{err:#}").contains("never"));
        assert_eq!(registry.handle("N").expect("handle").run_count(), before);

        shut_down(&registry, tracker).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_unparseable_definitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tracker = TaskTracker::new();
        let registry = Registry::new(tracker.clone(), CancellationToken::new());

        let path = dir.path().join("bad.tree");
        std::fs::write(&path, "Name Bad\n").expect("write definition");
        registry.load(&path);

        assert!(registry.tree_status("Bad").is_err());
        assert!(registry.list().is_empty());
        shut_down(&registry, tracker).await;
    }
}
