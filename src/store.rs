use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;

use crate::lanes::Lane;

/// Persisted lane start times, epoch milliseconds, 0 = never started.
/// The in-memory vec is authoritative; every mutation rewrites the whole
/// file under one lock so concurrent lane cycles cannot clobber each other.
pub(crate) struct StartTimeStore {
    path: PathBuf,
    times: Mutex<Vec<i64>>,
}

impl StartTimeStore {
    pub(crate) fn load(path: impl Into<PathBuf>, lane_count: usize) -> Result<Self> {
        let path = path.into();
        let mut times = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Vec<i64>>(&bytes).unwrap_or_else(|e| {
                eprintln!(
                    "[store] unreadable_start_times path={} error={e} action=reinitialize",
                    path.display()
                );
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).context(format!("read start-time file {}", path.display()));
            }
        };
        // Lane count can change across deploys; new lanes start unknown.
        times.resize(lane_count, 0);
        Ok(Self {
            path,
            times: Mutex::new(times),
        })
    }

    pub(crate) async fn get(&self, lane_index: u8) -> i64 {
        let times = self.times.lock().await;
        times.get(lane_index as usize).copied().unwrap_or(0)
    }

    pub(crate) async fn snapshot(&self) -> Vec<i64> {
        self.times.lock().await.clone()
    }

    /// Records a lane's new round start and persists the whole map. A failed
    /// write is logged and left stale; the ledger state is already correct
    /// and the next successful cycle rewrites the file.
    pub(crate) async fn set(&self, lane_index: u8, start_ms: i64) {
        let mut times = self.times.lock().await;
        if let Some(slot) = times.get_mut(lane_index as usize) {
            *slot = start_ms;
        }
        if let Err(e) = persist(&self.path, &times) {
            eprintln!(
                "[store] persist_failed lane={lane_index} path={} error={e}",
                self.path.display()
            );
        }
    }

    /// Stamps every lane at once (bootstrap), one write.
    pub(crate) async fn set_all(&self, start_ms: i64) {
        let mut times = self.times.lock().await;
        for slot in times.iter_mut() {
            *slot = start_ms;
        }
        if let Err(e) = persist(&self.path, &times) {
            eprintln!("[store] persist_failed lane=all path={} error={e}", self.path.display());
        }
    }

    /// Milliseconds until the lane's round is due; negative when overdue.
    /// A start of 0 reports the full span since the epoch as overdue, which
    /// callers treat as "end immediately if a round exists".
    pub(crate) async fn remaining_ms(&self, lane: &Lane, now_ms: i64) -> i64 {
        let start = self.get(lane.index).await;
        lane.period_ms() - (now_ms - start)
    }
}

fn persist(path: &Path, times: &[i64]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec(times)?;
    std::fs::write(&tmp, bytes).context("write temp start-time file")?;
    std::fs::rename(&tmp, path).context("replace start-time file")?;
    Ok(())
}
