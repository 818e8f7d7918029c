use std::sync::atomic::Ordering;

use anyhow::{Context, Result};

use crate::state::AppState;

/// Best-effort startup initialization. A ledger outage here is logged and
/// the process keeps serving: `initialize_global` is idempotent and the
/// lane cycles recreate missing rounds on their own cadence, so there is
/// nothing an early exit would protect.
pub(crate) async fn run(state: &AppState, now_ms: i64) {
    match initialize_global(state).await {
        Ok(true) => {
            if let Err(e) = seed_lanes(state, now_ms).await {
                eprintln!("[bootstrap] seed_failed error={e:#} action=continue");
            }
        }
        Ok(false) => {}
        Err(e) => eprintln!("[bootstrap] init_failed error={e:#} action=continue"),
    }
}

/// Ensures the global bookkeeping account exists. Returns true only when
/// this run performed the first-ever initialization.
pub(crate) async fn initialize_global(state: &AppState) -> Result<bool> {
    let global = state
        .ledger
        .query_global_state()
        .await
        .context("querying global state")?;
    if global.initialized {
        eprintln!("[bootstrap] global_state=present");
        return Ok(false);
    }
    state
        .ledger
        .create_global_bookkeeping()
        .await
        .context("creating global bookkeeping")?;
    eprintln!("[bootstrap] global_state=created");
    Ok(true)
}

/// Seeds one open round per lane. Only valid on a fresh deployment; on an
/// established ledger the per-lane cycles find and continue the open rounds
/// themselves.
pub(crate) async fn seed_lanes(state: &AppState, now_ms: i64) -> Result<()> {
    let counter = state
        .ledger
        .query_round_counter()
        .await
        .context("querying round counter")?;

    for (offset, lane) in state.lanes.iter().enumerate() {
        let id = counter + 1 + offset as u64;
        state
            .ledger
            .create_round(
                id,
                lane.index,
                lane.period_secs(),
                lane.ticket_price,
                lane.max_tickets,
                lane.dev_fee_bps,
                now_ms,
            )
            .await
            .with_context(|| format!("seeding lane {}", lane.index))?;
        state.counters.rounds_created.fetch_add(1, Ordering::Relaxed);
        eprintln!(
            "[bootstrap] round_seeded lane={} round={id} period_hours={}",
            lane.index, lane.period_hours
        );
    }

    // One shared start time; the scheduler's stagger desynchronizes the
    // lanes from here on.
    state.start_times.set_all(now_ms).await;
    for lane in state.lanes.iter() {
        state.notifier.publish(lane);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ledger::testing::MockLedger;
    use crate::state::testing::mock_state;

    const NOW: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn global_init_runs_once() {
        let mock = Arc::new(MockLedger::default());
        let (state, _dir) = mock_state(mock.clone(), vec![1, 2]);

        assert!(initialize_global(&state).await.unwrap());
        assert!(!initialize_global(&state).await.unwrap());

        let inits = mock
            .recorded_calls()
            .iter()
            .filter(|c| *c == "create_global_bookkeeping")
            .count();
        assert_eq!(inits, 1);
    }

    #[tokio::test]
    async fn seeding_opens_one_round_per_lane_with_sequential_ids() {
        let mock = Arc::new(MockLedger::default());
        *mock.counter.lock().unwrap() = 10;
        let (state, _dir) = mock_state(mock.clone(), vec![1, 2, 4]);

        seed_lanes(&state, NOW).await.unwrap();

        let calls = mock.recorded_calls();
        for id in 11..=13u64 {
            assert!(calls.iter().any(|c| *c == format!("create_round:{id}")));
        }
        assert_eq!(state.start_times.snapshot().await, vec![NOW; 3]);
        assert_eq!(mock.open_rounds.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ledger_outage_during_startup_is_contained() {
        let mock = Arc::new(MockLedger::default());
        *mock.global_state_fails.lock().unwrap() = true;
        let (state, _dir) = mock_state(mock.clone(), vec![1, 2]);

        // Completes without propagating; no rounds were seeded.
        run(&state, NOW).await;
        assert!(!mock.recorded_calls().iter().any(|c| c.starts_with("create_round")));

        // Once the ledger is reachable again the same call initializes.
        *mock.global_state_fails.lock().unwrap() = false;
        run(&state, NOW).await;
        assert!(*mock.initialized.lock().unwrap());
        assert_eq!(mock.open_rounds.lock().unwrap().len(), 2);
    }
}
