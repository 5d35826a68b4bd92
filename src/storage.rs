// Storage module - atomic JSON snapshots of captures, rules, and search
// history
//
// One JSON document holds everything:
//   { "captures": [...], "color_rules": [...], "search_history": [...] }
// A bare [capture, ...] array is accepted on load for files written by
// older builds. Writes go to a sibling .tmp and rename into place so a
// crash mid-write never leaves a torn file. The in-memory state stays
// authoritative: every persistence error is logged and swallowed.

use crate::capture::Capture;
use crate::rules::ColorRule;
use crate::search::SearchHistoryItem;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything worth surviving a restart
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub captures: Vec<Capture>,
    #[serde(default)]
    pub color_rules: Vec<ColorRule>,
    #[serde(default)]
    pub search_history: Vec<SearchHistoryItem>,
}

/// Both on-disk shapes, discriminated structurally
#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Full(Snapshot),
    /// Legacy format: a bare array of captures
    CapturesOnly(Vec<Capture>),
}

/// Load a snapshot. A missing file is an empty snapshot, not an error;
/// a malformed file is an error so the caller can log it.
pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        return Ok(Snapshot::default());
    }
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    let parsed: SnapshotFile = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
    Ok(match parsed {
        SnapshotFile::Full(s) => s,
        SnapshotFile::CapturesOnly(captures) => Snapshot {
            captures,
            ..Default::default()
        },
    })
}

/// Write a snapshot atomically: serialize to `<path>.tmp`, then rename.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_vec_pretty(snapshot).context("Failed to serialize snapshot")?;
    let tmp = tmp_path(path);
    std::fs::write(&tmp, &json)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// The pieces of live state the saver snapshots from. list()/get_all()
/// are read independently; the snapshot is eventually consistent across
/// collections but never torn within one.
pub struct PersistenceHandles {
    pub store: Arc<crate::store::CaptureStore>,
    pub rules: Arc<crate::rules::ColorRuleStore>,
    pub searches: Arc<crate::search::SearchHistoryStore>,
}

impl PersistenceHandles {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            captures: self.store.list(),
            color_rules: self.rules.get_all(),
            search_history: self.searches.list(),
        }
    }

    /// One best-effort save; errors are logged, never propagated.
    pub fn save(&self, path: &Path) {
        match save_snapshot(path, &self.snapshot()) {
            Ok(()) => tracing::debug!("Snapshot written to {}", path.display()),
            Err(e) => tracing::error!("Failed to persist snapshot: {:#}", e),
        }
    }
}

/// Periodic autosave loop. Runs until the shutdown signal resolves, then
/// writes one final snapshot.
pub async fn run_autosave(
    path: PathBuf,
    handles: PersistenceHandles,
    interval: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    tracing::info!("Persistence enabled: {}", path.display());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => handles.save(&path),
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    // Final snapshot on the way out; exactly once per shutdown
    handles.save(&path);
    tracing::info!("Final snapshot written, persistence stopped");
}
