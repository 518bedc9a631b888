//! Consensus proposer: the retrying prepare/accept/decide cycle run on a
//! detached task per `start()` call.

use std::sync::{Arc, Mutex};

use crate::paxos::{
    make_proposal_num, AcceptRound, PaxosMsg, PaxosSend, PaxosState,
    PrepareRound, SeqNum,
};
use crate::server::{Op, ReplicaId};
use crate::utils::Bitmap;

use rand::Rng;

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

/// Interval between polls of a phase's shared tally.
const PHASE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interval between Decide re-sends to unacknowledged peers.
const DECIDE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Initial backoff penalty between retry cycles, in millisecs. Grows 1.5x
/// per retry, capped at `BACKOFF_PENALTY_MAX_MS`.
const BACKOFF_PENALTY_INIT_MS: u64 = 10;
const BACKOFF_PENALTY_MAX_MS: u64 = 50;

/// Proposes value `v` for slot `seq`, retrying until the slot is decided
/// (by this proposal or any other). Runs detached; the outcome is observed
/// through `Paxos::status()`.
pub(crate) async fn propose(
    me: ReplicaId,
    population: u8,
    state: Arc<Mutex<PaxosState>>,
    tx_out: mpsc::UnboundedSender<PaxosSend>,
    seq: SeqNum,
    v: Op,
) {
    let majority = population / 2 + 1;
    let mut is_first = true;
    let mut penalty_ms = BACKOFF_PENALTY_INIT_MS;

    loop {
        // randomized backoff between retry cycles so that concurrent
        // proposers do not livelock each other
        if !is_first {
            penalty_ms = ((penalty_ms * 3) / 2).min(BACKOFF_PENALTY_MAX_MS);
            let sleep_ms =
                penalty_ms + rand::thread_rng().gen_range(0..penalty_ms);
            pf_debug!(me; "backoff {}ms (penalty {}) before retrying seq {}",
                          sleep_ms, penalty_ms, seq);
            time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        is_first = false;

        /* Prepare phase */
        let (n, my_done) = {
            let mut state = state.lock().unwrap();
            state.collect_garbage();

            // early exit if the slot got decided meanwhile (e.g. by a
            // Decide arriving from another proposer)
            if let Some(inst) = state.instances.get(&seq) {
                if inst.decided {
                    return;
                }
            }

            let highest_seen = state
                .acceptor_insts
                .get(&seq)
                .map(|acc| acc.highest_promised)
                .unwrap_or(-1);
            let n = make_proposal_num(highest_seen, me);
            let my_done = state.peer_done[&me];

            // open the tally and deliver my own Prepare locally
            state
                .prepare_rounds
                .insert((seq, n), PrepareRound::new(v.clone()));
            if let PaxosMsg::PrepareReply { ok, n_a, v_a, .. } =
                state.handle_prepare(me, seq, n, me, my_done)
            {
                state.note_prepare_reply(seq, n, ok, n_a, v_a);
            }
            (n, my_done)
        };

        pf_trace!(me; "phase 1 Prepare: seq {} n {}", seq, n);
        if tx_out
            .send(PaxosSend::Bcast(PaxosMsg::Prepare {
                seq,
                n,
                sender: me,
                done: my_done,
            }))
            .is_err()
        {
            return; // pump gone, replica shutting down
        }

        // wait until a majority promised or all peers have responded
        let (prepared, value) = loop {
            time::sleep(PHASE_POLL_INTERVAL).await;
            if tx_out.is_closed() {
                return; // replica torn down while waiting
            }
            let mut state = state.lock().unwrap();
            let round = match state.prepare_rounds.get_mut(&(seq, n)) {
                Some(round) => round,
                None => return, // round superseded, yield to the newcomer
            };
            if round.ok_count >= majority || round.all_responses >= population
            {
                round.done = true;
                let outcome = (
                    round.ok_count >= majority,
                    round.next_phase_value.clone(),
                );
                state.prepare_rounds.remove(&(seq, n));
                break outcome;
            }
        };
        if !prepared {
            continue;
        }

        /* Accept phase */
        {
            let mut state = state.lock().unwrap();
            state.accept_rounds.insert((seq, n), AcceptRound::default());
            if let PaxosMsg::AcceptReply { ok, .. } =
                state.handle_accept(seq, n, value.clone())
            {
                state.note_accept_reply(seq, n, ok);
            }
        }

        pf_trace!(me; "phase 2 Accept: seq {} n {}", seq, n);
        if tx_out
            .send(PaxosSend::Bcast(PaxosMsg::Accept {
                seq,
                n,
                v: value.clone(),
            }))
            .is_err()
        {
            return;
        }

        let accepted = loop {
            time::sleep(PHASE_POLL_INTERVAL).await;
            if tx_out.is_closed() {
                return;
            }
            let mut state = state.lock().unwrap();
            let round = match state.accept_rounds.get_mut(&(seq, n)) {
                Some(round) => round,
                None => return,
            };
            if round.ok_count >= majority || round.all_responses >= population
            {
                round.done = true;
                let outcome = round.ok_count >= majority;
                state.accept_rounds.remove(&(seq, n));
                break outcome;
            }
        };
        if !accepted {
            continue;
        }

        /* Decide phase */
        pf_trace!(me; "phase 3 Decide: seq {} n {}", seq, n);
        {
            let mut state = state.lock().unwrap();
            state.handle_decide(seq, value.clone());
            let mut acks = Bitmap::new(population, false);
            let _ = acks.set(me, true);
            state.decide_acks.insert(seq, acks);
        }

        // re-deliver Decide until every peer has acknowledged
        loop {
            let unacked: Vec<ReplicaId> = {
                let state = state.lock().unwrap();
                match state.decide_acks.get(&seq) {
                    Some(acks) => acks
                        .iter()
                        .filter(|&(_, acked)| !acked)
                        .map(|(peer, _)| peer)
                        .collect(),
                    None => Vec::new(),
                }
            };
            if unacked.is_empty() {
                break;
            }
            for peer in unacked {
                if tx_out
                    .send(PaxosSend::To(
                        peer,
                        PaxosMsg::Decide {
                            seq,
                            v: value.clone(),
                        },
                    ))
                    .is_err()
                {
                    return;
                }
            }
            time::sleep(DECIDE_RETRY_INTERVAL).await;
        }

        {
            let mut state = state.lock().unwrap();
            state.decide_acks.remove(&seq);
            state.collect_garbage();
        }
        return;
    }
}
