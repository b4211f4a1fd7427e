//! Scenario hot-reload via filesystem watcher.
//!
//! Watches the scenario document and rebuilds the agent registry on change.
//! The swap only affects sessions opened afterwards; live sessions keep the
//! registry they started with.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use switchboard_agents::AgentRegistry;
use switchboard_core::scenario::ScenarioDoc;
use switchboard_orchestrator::SessionManager;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Editors fire several filesystem events per save; let them settle.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches the scenario document and swaps the manager's registry.
pub struct ScenarioWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl ScenarioWatcher {
    /// Start watching the scenario document at `path`.
    pub fn start(path: PathBuf, manager: Arc<SessionManager>) -> anyhow::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watched_file = path.file_name().map(|n| n.to_os_string());

        // The notify callback is sync; it only flags that something changed
        // and the reload itself runs on the async task below.
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let relevant = matches!(
                            event.kind,
                            EventKind::Modify(_) | EventKind::Create(_)
                        ) && event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == watched_file.as_deref());
                        if relevant {
                            let _ = tx.send(());
                        }
                    }
                    Err(e) => error!(%e, "Scenario file watch error"),
                }
            })?;

        // Watch the document's parent directory (to catch renames/recreates)
        let watch_path = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "Scenario file watcher started");

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}
                debug!(path = %path.display(), "Scenario file changed, reloading");
                match reload(&path) {
                    Ok(registry) => manager.replace_registry(registry).await,
                    Err(e) => {
                        error!(%e, "Scenario reload failed, keeping the active registry");
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

fn reload(path: &Path) -> switchboard_core::error::Result<AgentRegistry> {
    let doc = ScenarioDoc::load_from_file(path)?;
    AgentRegistry::from_scenario(&doc)
}
