//! Consensus layer: per-slot single-decree Paxos over a fixed set of
//! replicas, with distributed garbage collection of decided slots.
//!
//! Manages a sequence of agreed values with a fixed set of peers, coping
//! with network failures (partitions, message loss, duplication) and peer
//! crashes up to a minority. References:
//!   - <https://www.microsoft.com/en-us/research/uploads/prod/2016/12/paxos-simple-Copy.pdf>
//!   - <https://github.com/efficient/epaxos/blob/master/src/paxos/paxos.go>

mod messages;
mod proposer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::server::{Op, ReplicaId, TransportHub};
use crate::utils::{Bitmap, PaxkvError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) use messages::{PaxosMsg, PaxosSend};

/// Consensus slot number. `-1` is the "none yet" sentinel.
pub type SeqNum = i64;

/// Proposal number, totally ordered across the cluster. `-1` means "none".
pub(crate) type ProposalNum = i64;

/// Low bits of a proposal number hold the proposer's replica ID, making
/// proposal numbers unique per replica and strictly increasing on retry.
pub(crate) const PEER_ID_BITS: u32 = 8;

/// Composes a proposal number greater than everything seen so far.
#[inline]
pub(crate) fn make_proposal_num(
    highest_seen: ProposalNum,
    me: ReplicaId,
) -> ProposalNum {
    (((highest_seen >> PEER_ID_BITS) + 1) << PEER_ID_BITS) | (me as i64)
}

/// Proposer/decider view of one consensus slot.
#[derive(Debug, Clone, Default)]
pub(crate) struct Instance {
    pub(crate) decided: bool,
    pub(crate) decided_value: Option<Op>,
}

/// Acceptor view of one consensus slot.
#[derive(Debug, Clone)]
pub(crate) struct AcceptorInstance {
    /// Np: highest proposal number promised.
    pub(crate) highest_promised: ProposalNum,

    /// Na: highest proposal number accepted.
    pub(crate) highest_accepted_n: ProposalNum,

    /// Va: value accepted together with Na.
    pub(crate) highest_accepted_value: Option<Op>,
}

impl Default for AcceptorInstance {
    fn default() -> Self {
        AcceptorInstance {
            highest_promised: -1,
            highest_accepted_n: -1,
            highest_accepted_value: None,
        }
    }
}

/// Shared tally of one in-flight Prepare phase. Late replies are discarded
/// once `done` is set.
#[derive(Debug, Clone)]
pub(crate) struct PrepareRound {
    pub(crate) ok_count: u8,
    pub(crate) all_responses: u8,
    pub(crate) highest_accepted_n: ProposalNum,
    pub(crate) next_phase_value: Op,
    pub(crate) done: bool,
}

impl PrepareRound {
    fn new(value: Op) -> Self {
        PrepareRound {
            ok_count: 0,
            all_responses: 0,
            highest_accepted_n: -1,
            next_phase_value: value,
            done: false,
        }
    }
}

/// Shared tally of one in-flight Accept phase.
#[derive(Debug, Clone, Default)]
pub(crate) struct AcceptRound {
    pub(crate) ok_count: u8,
    pub(crate) all_responses: u8,
    pub(crate) done: bool,
}

/// All consensus state of one replica, guarded by a single mutex held only
/// for short critical sections (never across I/O).
pub(crate) struct PaxosState {
    /// Map from slot number -> proposer/decider view.
    pub(crate) instances: HashMap<SeqNum, Instance>,

    /// Map from slot number -> acceptor view.
    pub(crate) acceptor_insts: HashMap<SeqNum, AcceptorInstance>,

    /// Latest known "done up to" sequence number of every replica
    /// (including myself), learned from Prepare piggybacks.
    pub(crate) peer_done: HashMap<ReplicaId, SeqNum>,

    /// Highest slot number ever observed by this replica.
    pub(crate) highest_seq_seen: SeqNum,

    /// Slots strictly below this have been garbage collected.
    pub(crate) done_freed: SeqNum,

    /// In-flight Prepare phase tallies, keyed by (slot, proposal number).
    pub(crate) prepare_rounds: HashMap<(SeqNum, ProposalNum), PrepareRound>,

    /// In-flight Accept phase tallies, keyed by (slot, proposal number).
    pub(crate) accept_rounds: HashMap<(SeqNum, ProposalNum), AcceptRound>,

    /// Peers that have acknowledged my Decide for a slot.
    pub(crate) decide_acks: HashMap<SeqNum, Bitmap>,
}

impl PaxosState {
    fn new(population: u8) -> Self {
        PaxosState {
            instances: HashMap::new(),
            acceptor_insts: HashMap::new(),
            peer_done: (0..population).map(|id| (id, -1)).collect(),
            highest_seq_seen: -1,
            done_freed: 0,
            prepare_rounds: HashMap::new(),
            accept_rounds: HashMap::new(),
            decide_acks: HashMap::new(),
        }
    }

    /// Minimum slot number that all replicas are known to be done with,
    /// plus one. Slots strictly below are eligible for forgetting.
    pub(crate) fn min_seq_num(&self) -> SeqNum {
        self.peer_done.values().min().copied().unwrap_or(-1) + 1
    }

    /// Frees memory for all slots below the current minimum done point.
    ///
    /// Another use of the done points is that, when a peer is dead or
    /// unreachable, the minimum will not increase even if all reachable
    /// peers call `done`; the rejoining peer can then catch up on slots
    /// it missed.
    pub(crate) fn collect_garbage(&mut self) -> Option<SeqNum> {
        let curr_min = self.min_seq_num();
        if curr_min > self.done_freed {
            self.instances.retain(|&seq, _| seq >= curr_min);
            self.acceptor_insts.retain(|&seq, _| seq >= curr_min);
            self.done_freed = curr_min;
            Some(curr_min)
        } else {
            None
        }
    }
}

/// Handle to the consensus layer of one replica. The replicated server owns
/// one of these; proposals proceed on detached tasks and are observed
/// through `status()`.
pub struct Paxos {
    /// My replica ID.
    id: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Shared consensus state.
    state: Arc<Mutex<PaxosState>>,

    /// Sender side of the outbound message channel, consumed by the pump
    /// task which owns the transport hub.
    tx_out: mpsc::UnboundedSender<PaxosSend>,

    /// Join handle of the message pump task.
    _pump_handle: JoinHandle<()>,
}

impl Paxos {
    /// Creates the consensus layer around a fully connected transport hub.
    /// Spawns the message pump task.
    pub(crate) fn new_and_setup(
        id: ReplicaId,
        population: u8,
        transport_hub: TransportHub<PaxosMsg>,
    ) -> Result<Self, PaxkvError> {
        if population == 0 || population <= id {
            return logged_err!(id; "invalid population {}", population);
        }

        let state = Arc::new(Mutex::new(PaxosState::new(population)));
        let (tx_out, rx_out) = mpsc::unbounded_channel();

        let pump_handle = tokio::spawn(messages::pump_task(
            id,
            population,
            state.clone(),
            transport_hub,
            rx_out,
        ));

        Ok(Paxos {
            id,
            population,
            state,
            tx_out,
            _pump_handle: pump_handle,
        })
    }

    /// Asynchronously proposes a value for the given slot and returns
    /// immediately; the proposal proceeds on a detached task. Poll
    /// `status()` to learn if/when agreement is reached. Slots below the
    /// garbage collection point are silently dropped.
    pub fn start(&self, seq: SeqNum, v: Op) -> Result<(), PaxkvError> {
        if seq < self.min_known_seq() {
            pf_debug!(self.id; "ignoring Start at forgotten seq {}", seq);
            return Ok(());
        }

        {
            let mut state = self.state.lock().unwrap();
            if seq > state.highest_seq_seen {
                state.highest_seq_seen = seq;
            }
            if let Some(inst) = state.instances.get(&seq) {
                if inst.decided {
                    return Ok(());
                }
            }
        }

        tokio::spawn(proposer::propose(
            self.id,
            self.population,
            self.state.clone(),
            self.tx_out.clone(),
            seq,
            v,
        ));
        Ok(())
    }

    /// Polls whether the given slot has a decided value locally.
    pub fn status(&self, seq: SeqNum) -> Option<Op> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(&seq)
            .filter(|inst| inst.decided)
            .and_then(|inst| inst.decided_value.clone())
    }

    /// Asserts that this replica has applied every slot <= `seq` and is
    /// fine with them being garbage collected cluster-wide.
    pub fn done(&self, seq: SeqNum) {
        let mut state = self.state.lock().unwrap();
        let me = self.id;
        if seq > state.peer_done[&me] {
            state.peer_done.insert(me, seq);
        }
    }

    /// Highest slot number ever observed by this replica, or -1.
    pub fn max_known_seq(&self) -> SeqNum {
        let state = self.state.lock().unwrap();
        state.highest_seq_seen
    }

    /// Minimum slot number not yet forgotten cluster-wide. Also triggers a
    /// round of local garbage collection.
    pub fn min_known_seq(&self) -> SeqNum {
        let mut state = self.state.lock().unwrap();
        let min_seq = state.min_seq_num();
        if let Some(freed) = state.collect_garbage() {
            pf_debug!(self.id; "garbage collected seqs < {}", freed);
        }
        min_seq
    }
}

impl Drop for Paxos {
    /// Aborts the pump task (and with it the owned transport hub) on
    /// teardown; in-flight proposer tasks notice the closed out-channel
    /// and terminate.
    fn drop(&mut self) {
        self._pump_handle.abort();
    }
}

#[cfg(test)]
mod paxos_tests {
    use super::*;
    use crate::server::OpKind;
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use tokio::time::{self, Duration, Instant};

    #[test]
    fn proposal_num_construction() {
        // first-ever proposal by replica 2
        assert_eq!(make_proposal_num(-1, 2), 2);
        // retries strictly increase
        let n1 = make_proposal_num(2, 2);
        let n2 = make_proposal_num(n1, 2);
        assert!(n1 > 2 && n2 > n1);
        // distinct replicas never collide
        assert_ne!(make_proposal_num(n1, 1), make_proposal_num(n1, 2));
        // higher base wins regardless of replica ID
        assert!(make_proposal_num(n1, 0) > n1);
    }

    #[test]
    fn min_seq_and_gc() {
        let mut state = PaxosState::new(3);
        assert_eq!(state.min_seq_num(), 0);
        state.instances.insert(0, Instance::default());
        state.instances.insert(1, Instance::default());
        state.acceptor_insts.insert(0, AcceptorInstance::default());

        state.peer_done.insert(0, 1);
        state.peer_done.insert(1, 0);
        assert_eq!(state.min_seq_num(), 0); // peer 2 still at -1

        state.peer_done.insert(2, 3);
        assert_eq!(state.min_seq_num(), 1);
        assert_eq!(state.collect_garbage(), Some(1));
        assert!(!state.instances.contains_key(&0));
        assert!(state.instances.contains_key(&1));
        assert!(!state.acceptor_insts.contains_key(&0));

        // GC point is monotonic: no re-collection at the same min
        assert_eq!(state.collect_garbage(), None);
    }

    fn test_op(tag: &str) -> Op {
        Op::cell(OpKind::Put, "row", "col", tag, "", format!("req-{}", tag), "-")
    }

    async fn setup_node(
        id: ReplicaId,
        population: u8,
        addrs: &[&str],
    ) -> Result<Paxos, PaxkvError> {
        let mut hub: TransportHub<PaxosMsg> = TransportHub::new_and_setup(
            id,
            population,
            addrs[id as usize].parse()?,
        )
        .await?;
        // lower-ID nodes proactively connect to higher-ID ones
        for peer in (id + 1)..population {
            hub.connect_to_peer(peer, addrs[peer as usize].parse()?)
                .await?;
        }
        hub.wait_for_group(population).await?;
        Paxos::new_and_setup(id, population, hub)
    }

    async fn wait_decided(paxos: &Paxos, seq: SeqNum) -> Op {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(op) = paxos.status(seq) {
                return op;
            }
            assert!(Instant::now() < deadline, "slot {} never decided", seq);
            time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_proposals_agree() -> Result<(), PaxkvError> {
        let barrier = Arc::new(Barrier::new(3));
        let mut handles = Vec::new();
        for id in 0..3u8 {
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                let addrs =
                    ["127.0.0.1:30110", "127.0.0.1:30111", "127.0.0.1:30112"];
                let paxos = setup_node(id, 3, &addrs).await?;
                barrier.wait().await;
                // all three replicas propose conflicting values at slot 0
                paxos.start(0, test_op(&format!("from-{}", id)))?;
                let decided = wait_decided(&paxos, 0).await;
                Ok::<(Paxos, Op), PaxkvError>((paxos, decided))
            }));
        }

        let mut decisions = Vec::new();
        let mut nodes = Vec::new();
        for handle in handles {
            let (paxos, op) = handle.await.unwrap()?;
            decisions.push(op);
            nodes.push(paxos);
        }
        // consensus safety: everyone decided the same value
        assert_eq!(decisions[0], decisions[1]);
        assert_eq!(decisions[1], decisions[2]);
        assert!(decisions[0].new_value.starts_with("from-"));

        // everyone marks slot 0 done; the done points spread through the
        // Prepare/PrepareReply piggybacks of further proposals, so keep
        // proposing filler slots until every replica's GC point advances
        for paxos in &nodes {
            paxos.done(0);
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut next_seq: SeqNum = 1;
        loop {
            let mins: Vec<SeqNum> =
                nodes.iter().map(|p| p.min_known_seq()).collect();
            if mins.iter().all(|&m| m >= 1) {
                break;
            }
            assert!(Instant::now() < deadline, "GC point never advanced");
            for paxos in &nodes {
                paxos.start(next_seq, test_op("filler"))?;
            }
            for paxos in &nodes {
                wait_decided(paxos, next_seq).await;
            }
            next_seq += 1;
            time::sleep(Duration::from_millis(50)).await;
        }
        // forgotten slots are no longer visible, and the GC point is
        // monotonic from here on
        assert!(nodes[0].status(0).is_none());
        assert!(nodes[0].max_known_seq() >= 1);
        assert!(nodes[0].min_known_seq() >= 1);
        Ok(())
    }

    #[test]
    fn redelivered_decide_is_idempotent() {
        let mut state = PaxosState::new(3);
        let op = test_op("once");
        state.handle_decide(0, op.clone());
        state.handle_decide(0, op.clone());
        let inst = state.instances.get(&0).unwrap();
        assert!(inst.decided);
        assert_eq!(inst.decided_value, Some(op));
    }
}
