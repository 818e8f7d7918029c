use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use crate::lanes::Lane;
use crate::lifecycle::{run_cycle, CycleOutcome};
use crate::state::AppState;

/// Spawns one long-lived polling task per lane. Tasks are fire-and-forget;
/// a panic inside one lane's cycle takes down that task only, and the
/// `cycle_running` guard in the shared state keeps any external trigger from
/// overlapping a tick that is still in flight.
pub(crate) fn start(state: &AppState) {
    for lane in state.lanes.iter().cloned() {
        let state = state.clone();
        tokio::spawn(async move {
            lane_loop(state, lane).await;
        });
    }
    eprintln!(
        "[scheduler] started lanes={} poll_secs={} stagger_secs={}",
        state.lanes.len(),
        state.cfg.scheduler.cycle_poll_seconds,
        state.cfg.scheduler.stagger_seconds
    );
}

async fn lane_loop(state: AppState, lane: Lane) {
    // Offset the lanes so their ledger queries do not land in one burst.
    let offset = Duration::from_secs(lane.index as u64 * state.cfg.scheduler.stagger_seconds);
    time::sleep(offset).await;

    let mut ticker = time::interval(Duration::from_secs(state.cfg.scheduler.cycle_poll_seconds));
    // A cycle of refunds can run past the poll period; catch-up ticks would
    // only pile onto the overlap guard.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        run_tick_supervised(&state, &lane).await;
    }
}

/// Runs one tick in its own task so a panicking cycle cannot take the lane
/// timer down with it. The overlap guard is cleared on the panic path; the
/// panicked task cannot release it itself.
async fn run_tick_supervised(state: &AppState, lane: &Lane) {
    let tick_state = state.clone();
    let tick_lane_cfg = lane.clone();
    let handle = tokio::spawn(async move {
        tick_lane(&tick_state, &tick_lane_cfg).await;
    });
    if let Err(e) = handle.await {
        if e.is_panic() {
            state.cycle_running.remove(&lane.index);
            eprintln!("[scheduler] tick_panicked lane={} action=continue", lane.index);
        }
    }
}

/// Runs at most one cycle for the lane right now. Returns None when a cycle
/// for the same lane is already in flight.
pub(crate) async fn tick_lane(state: &AppState, lane: &Lane) -> Option<CycleOutcome> {
    if state.cycle_running.insert(lane.index, ()).is_some() {
        state.counters.ticks_skipped_overlap.fetch_add(1, Ordering::Relaxed);
        eprintln!("[scheduler] tick_skipped lane={} reason=cycle_in_flight", lane.index);
        return None;
    }

    let outcome = run_cycle(state, lane, now_epoch_ms()).await;
    state.cycle_running.remove(&lane.index);

    if let CycleOutcome::Completed { round_id, settlement } = outcome {
        eprintln!(
            "[scheduler] cycle_done lane={} round={round_id} settlement={settlement:?}",
            lane.index
        );
    }
    Some(outcome)
}

pub(crate) fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ledger::testing::MockLedger;
    use crate::state::testing::mock_state;

    #[tokio::test]
    async fn concurrent_ticks_for_one_lane_collapse_to_one_cycle() {
        let mock = Arc::new(MockLedger::default());
        let (state, _dir) = mock_state(mock.clone(), vec![1]);
        let lane = state.lanes[0].clone();

        // Hold the guard as a stand-in for a cycle still in flight.
        state.cycle_running.insert(lane.index, ());
        assert_eq!(tick_lane(&state, &lane).await, None);
        assert!(mock.recorded_calls().is_empty());

        state.cycle_running.remove(&lane.index);
        assert!(tick_lane(&state, &lane).await.is_some());
        assert!(!mock.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn guard_is_released_after_a_failed_cycle() {
        let mock = Arc::new(MockLedger::with_round(crate::ledger::Round {
            id: 1,
            lane_index: 0,
            period_secs: 3600,
            participants: Vec::new(),
            winners: Vec::new(),
            state: crate::ledger::RoundState::Open,
        }));
        mock.script_end(Err(crate::ledger::LedgerError::Transient("down".into())));
        let (state, _dir) = mock_state(mock.clone(), vec![1]);
        let lane = state.lanes[0].clone();

        assert_eq!(tick_lane(&state, &lane).await, Some(CycleOutcome::Failed));
        assert!(!state.cycle_running.contains_key(&lane.index));
    }

    #[tokio::test]
    async fn panicking_tick_leaves_the_lane_schedulable() {
        let mock = Arc::new(MockLedger::default());
        *mock.panic_on_open_rounds.lock().unwrap() = true;
        let (state, _dir) = mock_state(mock.clone(), vec![1]);
        let lane = state.lanes[0].clone();

        run_tick_supervised(&state, &lane).await;
        assert!(!state.cycle_running.contains_key(&lane.index));

        // The next tick runs a normal cycle as if nothing happened.
        *mock.panic_on_open_rounds.lock().unwrap() = false;
        run_tick_supervised(&state, &lane).await;
        assert!(mock.recorded_calls().iter().any(|c| c.starts_with("create_round")));
    }
}
