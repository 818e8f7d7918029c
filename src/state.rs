use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::AppConfig;
use crate::lanes::Lane;
use crate::ledger::LedgerClient;
use crate::notify::Notifier;
use crate::store::StartTimeStore;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) lanes: Arc<Vec<Lane>>,
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) start_times: Arc<StartTimeStore>,
    pub(crate) notifier: Notifier,
    // One entry per lane while its cycle callback runs; a tick that finds
    // its lane present is skipped, never queued.
    pub(crate) cycle_running: Arc<DashMap<u8, ()>>,
    pub(crate) scheduler_ready: Arc<AtomicBool>,
    pub(crate) counters: Arc<CycleCounters>,
}

pub(crate) struct CycleCounters {
    pub(crate) cycles_run: AtomicU64,
    pub(crate) cycles_not_due: AtomicU64,
    pub(crate) cycles_idle: AtomicU64,
    pub(crate) cycles_failed: AtomicU64,
    pub(crate) ticks_skipped_overlap: AtomicU64,
    pub(crate) rounds_created: AtomicU64,
    pub(crate) payouts_sent: AtomicU64,
    pub(crate) payouts_stuck: AtomicU64,
    pub(crate) refunds_sent: AtomicU64,
    pub(crate) refunds_failed: AtomicU64,
    pub(crate) rounds_marked_empty: AtomicU64,
    pub(crate) rounds_already_ended: AtomicU64,
}

impl CycleCounters {
    pub(crate) fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            cycles_not_due: AtomicU64::new(0),
            cycles_idle: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            ticks_skipped_overlap: AtomicU64::new(0),
            rounds_created: AtomicU64::new(0),
            payouts_sent: AtomicU64::new(0),
            payouts_stuck: AtomicU64::new(0),
            refunds_sent: AtomicU64::new(0),
            refunds_failed: AtomicU64::new(0),
            rounds_marked_empty: AtomicU64::new(0),
            rounds_already_ended: AtomicU64::new(0),
        }
    }

    pub(crate) fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles": {
                "run": self.cycles_run.load(Ordering::Relaxed),
                "not_due": self.cycles_not_due.load(Ordering::Relaxed),
                "idle": self.cycles_idle.load(Ordering::Relaxed),
                "failed": self.cycles_failed.load(Ordering::Relaxed),
                "ticks_skipped_overlap": self.ticks_skipped_overlap.load(Ordering::Relaxed),
            },
            "settlement": {
                "payouts_sent": self.payouts_sent.load(Ordering::Relaxed),
                "payouts_stuck": self.payouts_stuck.load(Ordering::Relaxed),
                "refunds_sent": self.refunds_sent.load(Ordering::Relaxed),
                "refunds_failed": self.refunds_failed.load(Ordering::Relaxed),
                "rounds_marked_empty": self.rounds_marked_empty.load(Ordering::Relaxed),
                "rounds_already_ended": self.rounds_already_ended.load(Ordering::Relaxed),
            },
            "rounds_created": self.rounds_created.load(Ordering::Relaxed),
        })
    }
}
