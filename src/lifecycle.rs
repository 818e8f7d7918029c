use std::sync::atomic::Ordering;

use crate::lanes::Lane;
use crate::ledger::{EndOutcome, LedgerError, Round, RoundState};
use crate::state::AppState;

/// Result of one lane cycle. Exhaustively matched by the scheduler; no
/// variant carries an error because errors never leave a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    /// The lane's current round has time left; nothing was done.
    NotDue,
    /// End, settle and create all resolved; a fresh round is open.
    Completed { round_id: u64, settlement: Settlement },
    /// A remote call failed; the lane is left as-is for the next tick.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    /// Three winners paid out.
    Paid,
    /// Payout could not be completed after the round closed. Needs an
    /// operator; the orchestrator does not retry closed-round payouts.
    PayoutStuck,
    /// Remote reported the round previously closed; settlement assumed done.
    AlreadySettled,
    /// Under-capacity round, each participant refunded individually.
    Refunded(usize),
    /// Zero participants; round closed without financial movement.
    MarkedEmpty,
    /// No open round existed for the lane; only creation ran.
    NoPriorRound,
}

/// One end -> settle -> create cycle for a lane. End-phase completion in a
/// classified outcome is required before creation starts; that ordering is
/// what keeps a lane from holding two open rounds.
pub(crate) async fn run_cycle(state: &AppState, lane: &Lane, now_ms: i64) -> CycleOutcome {
    state.counters.cycles_run.fetch_add(1, Ordering::Relaxed);

    // The poll cadence is independent of the round duration; most ticks
    // find the round still running. An unknown start time (0) always falls
    // through so a lane with a lost cache can still converge.
    let start = state.start_times.get(lane.index).await;
    if start > 0 && state.start_times.remaining_ms(lane, now_ms).await > 0 {
        state.counters.cycles_not_due.fetch_add(1, Ordering::Relaxed);
        return CycleOutcome::NotDue;
    }

    let settlement = match end_phase(state, lane).await {
        Ok(s) => s,
        Err(()) => {
            state.counters.cycles_failed.fetch_add(1, Ordering::Relaxed);
            return CycleOutcome::Failed;
        }
    };

    match create_phase(state, lane, now_ms).await {
        Ok(round_id) => CycleOutcome::Completed { round_id, settlement },
        Err(()) => {
            state.counters.cycles_failed.fetch_add(1, Ordering::Relaxed);
            CycleOutcome::Failed
        }
    }
}

async fn end_phase(state: &AppState, lane: &Lane) -> Result<Settlement, ()> {
    let rounds = match state.ledger.query_open_rounds().await {
        Ok(r) => r,
        Err(e) => {
            log_ledger_error(lane, "query_open_rounds", &e);
            return Err(());
        }
    };

    // Lane identity is the period, not a stored id; the current round is
    // the highest id among matches.
    let Some(round) = rounds
        .into_iter()
        .filter(|r| r.period_secs == lane.period_secs())
        .max_by_key(|r| r.id)
    else {
        state.counters.cycles_idle.fetch_add(1, Ordering::Relaxed);
        return Ok(Settlement::NoPriorRound);
    };

    match state.ledger.end_round(&round).await {
        Ok(EndOutcome::Ended { winners }) => Ok(settle_payout(state, lane, &round, winners).await),
        Ok(EndOutcome::AlreadyEnded) => {
            // A prior run or another actor closed this round; settlement is
            // assumed discharged and no payout/refund is re-issued.
            state.counters.rounds_already_ended.fetch_add(1, Ordering::Relaxed);
            eprintln!("[lifecycle] already_ended lane={} round={}", lane.index, round.id);
            Ok(Settlement::AlreadySettled)
        }
        Ok(EndOutcome::NotEnoughParticipants) => settle_short_round(state, lane, &round).await,
        Err(e) => {
            log_ledger_error(lane, "end_round", &e);
            Err(())
        }
    }
}

async fn settle_payout(state: &AppState, lane: &Lane, round: &Round, winners: Vec<String>) -> Settlement {
    if winners.len() < 3 {
        // The round is closed remotely but winners were never recorded in
        // full; nothing can be paid from here. Operator territory.
        state.counters.payouts_stuck.fetch_add(1, Ordering::Relaxed);
        eprintln!(
            "[lifecycle] payout_stuck lane={} round={} winners={} alert=stuck_settlement",
            lane.index,
            round.id,
            winners.len()
        );
        return Settlement::PayoutStuck;
    }

    let mut accounts = Vec::with_capacity(3);
    for winner in winners.iter().take(3) {
        match state.ledger.resolve_or_create_token_account(winner).await {
            Ok(addr) => accounts.push(addr),
            Err(e) => {
                state.counters.payouts_stuck.fetch_add(1, Ordering::Relaxed);
                eprintln!(
                    "[lifecycle] payout_stuck lane={} round={} winner={winner} error={e} alert=stuck_settlement",
                    lane.index, round.id
                );
                return Settlement::PayoutStuck;
            }
        }
    }

    match state
        .ledger
        .payout_prize(round, &accounts[0], &accounts[1], &accounts[2])
        .await
    {
        Ok(()) => {
            state.counters.payouts_sent.fetch_add(1, Ordering::Relaxed);
            eprintln!("[lifecycle] payout_sent lane={} round={}", lane.index, round.id);
            Settlement::Paid
        }
        Err(e) => {
            // The round is already ended; retrying the payout here would
            // race whatever the operator does about it.
            state.counters.payouts_stuck.fetch_add(1, Ordering::Relaxed);
            eprintln!(
                "[lifecycle] payout_failed lane={} round={} error={e} alert=stuck_settlement",
                lane.index, round.id
            );
            Settlement::PayoutStuck
        }
    }
}

async fn settle_short_round(state: &AppState, lane: &Lane, round: &Round) -> Result<Settlement, ()> {
    if round.participants.is_empty() {
        // Closing an empty round must stick, otherwise it would stay open
        // next to the round created below.
        if let Err(e) = state.ledger.set_round_state(round, RoundState::Ended).await {
            log_ledger_error(lane, "set_round_state", &e);
            return Err(());
        }
        state.counters.rounds_marked_empty.fetch_add(1, Ordering::Relaxed);
        eprintln!("[lifecycle] marked_empty lane={} round={}", lane.index, round.id);
        return Ok(Settlement::MarkedEmpty);
    }

    let mut refunded = 0usize;
    for participant in &round.participants {
        match state.ledger.refund(round, participant).await {
            Ok(()) => {
                refunded += 1;
                state.counters.refunds_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                state.counters.refunds_failed.fetch_add(1, Ordering::Relaxed);
                eprintln!(
                    "[lifecycle] refund_failed lane={} round={} participant={participant} error={e}",
                    lane.index, round.id
                );
            }
        }
    }
    eprintln!(
        "[lifecycle] refunded lane={} round={} refunded={refunded} of={}",
        lane.index,
        round.id,
        round.participants.len()
    );
    Ok(Settlement::Refunded(refunded))
}

async fn create_phase(state: &AppState, lane: &Lane, now_ms: i64) -> Result<u64, ()> {
    let counter = match state.ledger.query_round_counter().await {
        Ok(c) => c,
        Err(e) => {
            log_ledger_error(lane, "query_round_counter", &e);
            return Err(());
        }
    };
    let next_id = counter + 1;

    if let Err(e) = state
        .ledger
        .create_round(
            next_id,
            lane.index,
            lane.period_secs(),
            lane.ticket_price,
            lane.max_tickets,
            lane.dev_fee_bps,
            now_ms,
        )
        .await
    {
        log_ledger_error(lane, "create_round", &e);
        return Err(());
    }

    state.counters.rounds_created.fetch_add(1, Ordering::Relaxed);
    state.start_times.set(lane.index, now_ms).await;
    state.notifier.publish(lane);
    eprintln!(
        "[lifecycle] round_created lane={} round={next_id} period_hours={}",
        lane.index, lane.period_hours
    );
    Ok(next_id)
}

fn log_ledger_error(lane: &Lane, call: &str, e: &LedgerError) {
    let class = match e {
        LedgerError::Transient(_) => "transient",
        LedgerError::Unknown(_) => "unknown",
    };
    eprintln!("[lifecycle] cycle_failed lane={} call={call} class={class} error={e}", lane.index);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ledger::testing::MockLedger;
    use crate::state::testing::mock_state;

    const NOW: i64 = 1_700_000_000_000;

    fn open_round(id: u64, period_secs: i64) -> Round {
        Round {
            id,
            lane_index: 0,
            period_secs,
            participants: Vec::new(),
            winners: Vec::new(),
            state: RoundState::Open,
        }
    }

    #[tokio::test]
    async fn payout_path_resolves_three_accounts_then_creates() {
        let mut round = open_round(7, 3600);
        round.winners = vec!["W1".into(), "W2".into(), "W3".into()];
        let mock = Arc::new(MockLedger::with_round(round));
        let (state, _dir) = mock_state(mock.clone(), vec![1]);

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert_eq!(
            outcome,
            CycleOutcome::Completed { round_id: 1, settlement: Settlement::Paid }
        );

        let calls = mock.recorded_calls();
        let resolves = calls.iter().filter(|c| c.starts_with("resolve_token_account")).count();
        let payouts = calls.iter().filter(|c| c.starts_with("payout_prize")).count();
        let creates = calls.iter().filter(|c| c.starts_with("create_round")).count();
        assert_eq!((resolves, payouts, creates), (3, 1, 1));

        // End must complete before creation starts.
        let end_pos = calls.iter().position(|c| c.starts_with("end_round")).unwrap();
        let create_pos = calls.iter().position(|c| c.starts_with("create_round")).unwrap();
        assert!(end_pos < create_pos);

        // The store reflects the creation immediately.
        assert_eq!(state.start_times.get(0).await, NOW);
    }

    #[tokio::test]
    async fn already_ended_is_idempotent_with_no_settlement_calls() {
        let mock = Arc::new(MockLedger::with_round(open_round(3, 3600)));
        mock.script_end(Ok(EndOutcome::AlreadyEnded));
        mock.script_end(Ok(EndOutcome::AlreadyEnded));
        let (state, _dir) = mock_state(mock.clone(), vec![1]);
        let lane = state.lanes[0].clone();

        let first = run_cycle(&state, &lane, NOW).await;
        assert!(matches!(
            first,
            CycleOutcome::Completed { settlement: Settlement::AlreadySettled, .. }
        ));
        // Second cycle a full period later ends the newly created round.
        let second = run_cycle(&state, &lane, NOW + lane.period_ms()).await;
        assert!(matches!(
            second,
            CycleOutcome::Completed { settlement: Settlement::AlreadySettled, .. }
        ));

        let calls = mock.recorded_calls();
        assert!(!calls.iter().any(|c| c.starts_with("payout_prize")));
        assert!(!calls.iter().any(|c| c.starts_with("refund")));
        assert!(!calls.iter().any(|c| c.starts_with("set_round_state")));
        assert_eq!(calls.iter().filter(|c| c.starts_with("end_round")).count(), 2);
    }

    #[tokio::test]
    async fn short_round_refunds_each_participant_then_creates() {
        let mut round = open_round(5, 3600);
        round.participants = vec!["A".into(), "B".into()];
        let mock = Arc::new(MockLedger::with_round(round));
        mock.script_end(Ok(EndOutcome::NotEnoughParticipants));
        let (state, _dir) = mock_state(mock.clone(), vec![1]);

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Completed { settlement: Settlement::Refunded(2), .. }
        ));

        let calls = mock.recorded_calls();
        let refunds: Vec<_> = calls.iter().filter(|c| c.starts_with("refund:")).collect();
        assert_eq!(refunds, vec!["refund:5:A", "refund:5:B"]);
        assert_eq!(calls.iter().filter(|c| c.starts_with("create_round")).count(), 1);
    }

    #[tokio::test]
    async fn refund_failure_does_not_abort_remaining_refunds() {
        let mut round = open_round(5, 3600);
        round.participants = vec!["A".into(), "B".into(), "C".into()];
        let mock = Arc::new(MockLedger::with_round(round));
        mock.script_end(Ok(EndOutcome::NotEnoughParticipants));
        mock.refund_fail_for.lock().unwrap().push("B".to_string());
        let (state, _dir) = mock_state(mock.clone(), vec![1]);

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Completed { settlement: Settlement::Refunded(2), .. }
        ));
        let calls = mock.recorded_calls();
        assert_eq!(calls.iter().filter(|c| c.starts_with("refund:")).count(), 3);
        assert_eq!(calls.iter().filter(|c| c.starts_with("create_round")).count(), 1);
    }

    #[tokio::test]
    async fn empty_round_is_marked_ended_without_money_movement() {
        let mock = Arc::new(MockLedger::with_round(open_round(9, 3600)));
        mock.script_end(Ok(EndOutcome::NotEnoughParticipants));
        let (state, _dir) = mock_state(mock.clone(), vec![1]);

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Completed { settlement: Settlement::MarkedEmpty, .. }
        ));
        let calls = mock.recorded_calls();
        assert!(calls.iter().any(|c| c.starts_with("set_round_state:9")));
        assert!(!calls.iter().any(|c| c.starts_with("refund")));
    }

    #[tokio::test]
    async fn unclassified_error_skips_creation() {
        let mock = Arc::new(MockLedger::with_round(open_round(4, 3600)));
        mock.script_end(Err(LedgerError::Unknown("constraint violated".into())));
        let (state, _dir) = mock_state(mock.clone(), vec![1]);

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert_eq!(outcome, CycleOutcome::Failed);
        let calls = mock.recorded_calls();
        assert!(!calls.iter().any(|c| c.starts_with("create_round")));
        // Start time untouched; the lane retries on the next tick.
        assert_eq!(state.start_times.get(0).await, 0);
    }

    #[tokio::test]
    async fn payout_failure_still_proceeds_to_creation() {
        let mut round = open_round(2, 3600);
        round.winners = vec!["W1".into(), "W2".into(), "W3".into()];
        let mock = Arc::new(MockLedger::with_round(round));
        *mock.payout_fails.lock().unwrap() = true;
        let (state, _dir) = mock_state(mock.clone(), vec![1]);

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Completed { settlement: Settlement::PayoutStuck, .. }
        ));
        assert_eq!(
            mock.recorded_calls().iter().filter(|c| c.starts_with("create_round")).count(),
            1
        );
    }

    #[tokio::test]
    async fn running_round_is_not_due() {
        let mock = Arc::new(MockLedger::with_round(open_round(1, 3600)));
        let (state, _dir) = mock_state(mock.clone(), vec![1]);
        state.start_times.set(0, NOW).await;

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW + 1_000).await;
        assert_eq!(outcome, CycleOutcome::NotDue);
        assert!(mock.recorded_calls().is_empty());
    }

    #[tokio::test]
    async fn idle_lane_creates_its_next_round() {
        let mock = Arc::new(MockLedger::default());
        *mock.counter.lock().unwrap() = 41;
        let (state, _dir) = mock_state(mock.clone(), vec![1]);

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert_eq!(
            outcome,
            CycleOutcome::Completed { round_id: 42, settlement: Settlement::NoPriorRound }
        );
        assert!(mock.recorded_calls().iter().any(|c| c == "create_round:42"));
    }

    #[tokio::test]
    async fn other_lane_rounds_are_ignored() {
        // A 2h round must not be ended by the 1h lane.
        let mock = Arc::new(MockLedger::with_round(open_round(6, 7200)));
        let (state, _dir) = mock_state(mock.clone(), vec![1, 2]);

        let outcome = run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Completed { settlement: Settlement::NoPriorRound, .. }
        ));
        assert!(!mock.recorded_calls().iter().any(|c| c.starts_with("end_round")));
    }

    #[tokio::test]
    async fn highest_id_wins_when_several_rounds_match() {
        let mock = Arc::new(MockLedger::with_round(open_round(3, 3600)));
        mock.open_rounds.lock().unwrap().push(open_round(8, 3600));
        let (state, _dir) = mock_state(mock.clone(), vec![1]);

        run_cycle(&state, &state.lanes[0].clone(), NOW).await;
        assert!(mock.recorded_calls().iter().any(|c| c == "end_round:8"));
        assert!(!mock.recorded_calls().iter().any(|c| c == "end_round:3"));
    }
}
