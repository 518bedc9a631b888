//! Consensus peer-peer messaging: wire message type, acceptor-side
//! handlers, and the message pump task that owns the transport hub.

use std::sync::{Arc, Mutex};

use crate::paxos::{
    AcceptorInstance, PaxosState, ProposalNum, SeqNum,
};
use crate::server::{Op, ReplicaId, TransportHub};
use crate::utils::Bitmap;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

/// Peer-peer consensus message type.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub(crate) enum PaxosMsg {
    /// Prepare request from a proposer. Carries the sender's done point for
    /// garbage collection bookkeeping.
    Prepare {
        seq: SeqNum,
        n: ProposalNum,
        sender: ReplicaId,
        done: SeqNum,
    },

    /// Reply to Prepare. `n_a`/`v_a` is the acceptor's previously accepted
    /// proposal, if any. Also carries the replier's done point.
    PrepareReply {
        seq: SeqNum,
        n: ProposalNum,
        ok: bool,
        n_a: ProposalNum,
        v_a: Option<Op>,
        done: SeqNum,
    },

    /// Accept request from a proposer.
    Accept { seq: SeqNum, n: ProposalNum, v: Op },

    /// Reply to Accept.
    AcceptReply { seq: SeqNum, n: ProposalNum, ok: bool },

    /// Decide notification; re-delivered until acknowledged.
    Decide { seq: SeqNum, v: Op },

    /// Acknowledgment of a Decide.
    DecideReply { seq: SeqNum },
}

/// An outbound send request from a proposer task to the pump task.
#[derive(Debug)]
pub(crate) enum PaxosSend {
    /// Send to one peer.
    To(ReplicaId, PaxosMsg),

    /// Broadcast to all connected peers.
    Bcast(PaxosMsg),
}

// PaxosState acceptor-side handlers and phase tally updates. The proposer
// invokes these directly for its own replica; the pump task invokes them
// for messages arriving from peers. All run under the state mutex.
impl PaxosState {
    /// Handles a Prepare request: promise iff `n` is strictly greater than
    /// the highest proposal number promised for this slot.
    pub(crate) fn handle_prepare(
        &mut self,
        me: ReplicaId,
        seq: SeqNum,
        n: ProposalNum,
        sender: ReplicaId,
        sender_done: SeqNum,
    ) -> PaxosMsg {
        if seq > self.highest_seq_seen {
            self.highest_seq_seen = seq;
        }

        let acc = self
            .acceptor_insts
            .entry(seq)
            .or_insert_with(AcceptorInstance::default);

        let reply = if n > acc.highest_promised {
            acc.highest_promised = n;
            PaxosMsg::PrepareReply {
                seq,
                n,
                ok: true,
                n_a: acc.highest_accepted_n,
                v_a: acc.highest_accepted_value.clone(),
                done: self.peer_done[&me],
            }
        } else {
            PaxosMsg::PrepareReply {
                seq,
                n,
                ok: false,
                n_a: -1,
                v_a: None,
                done: self.peer_done[&me],
            }
        };

        // learn the sender's done point from the piggyback
        if sender_done > self.peer_done[&sender] {
            self.peer_done.insert(sender, sender_done);
        }

        reply
    }

    /// Handles an Accept request: accept iff `n` is greater than or equal
    /// to the highest proposal number promised for this slot.
    pub(crate) fn handle_accept(
        &mut self,
        seq: SeqNum,
        n: ProposalNum,
        v: Op,
    ) -> PaxosMsg {
        if seq > self.highest_seq_seen {
            self.highest_seq_seen = seq;
        }

        let acc = self
            .acceptor_insts
            .entry(seq)
            .or_insert_with(AcceptorInstance::default);

        if n >= acc.highest_promised {
            acc.highest_promised = n;
            acc.highest_accepted_n = n;
            acc.highest_accepted_value = Some(v);
            PaxosMsg::AcceptReply { seq, n, ok: true }
        } else {
            PaxosMsg::AcceptReply { seq, n, ok: false }
        }
    }

    /// Handles a Decide notification: marks the slot decided. Idempotent
    /// under re-delivery.
    pub(crate) fn handle_decide(&mut self, seq: SeqNum, v: Op) {
        if seq > self.highest_seq_seen {
            self.highest_seq_seen = seq;
        }
        let inst = self.instances.entry(seq).or_default();
        inst.decided = true;
        inst.decided_value = Some(v);
    }

    /// Feeds a Prepare reply into its phase tally, unless the round has
    /// already concluded.
    pub(crate) fn note_prepare_reply(
        &mut self,
        seq: SeqNum,
        n: ProposalNum,
        ok: bool,
        n_a: ProposalNum,
        v_a: Option<Op>,
    ) {
        if let Some(round) = self.prepare_rounds.get_mut(&(seq, n)) {
            if round.done {
                return;
            }
            round.all_responses += 1;
            if ok {
                round.ok_count += 1;
                if n_a > round.highest_accepted_n {
                    if let Some(v_a) = v_a {
                        round.highest_accepted_n = n_a;
                        round.next_phase_value = v_a;
                    }
                }
            }
        }
    }

    /// Feeds an Accept reply into its phase tally.
    pub(crate) fn note_accept_reply(
        &mut self,
        seq: SeqNum,
        n: ProposalNum,
        ok: bool,
    ) {
        if let Some(round) = self.accept_rounds.get_mut(&(seq, n)) {
            if round.done {
                return;
            }
            round.all_responses += 1;
            if ok {
                round.ok_count += 1;
            }
        }
    }

    /// Counts a peer that can never reply (not connected at send time)
    /// toward the "all responded" tally of a phase.
    pub(crate) fn note_unreachable(&mut self, seq: SeqNum, n: ProposalNum) {
        if let Some(round) = self.prepare_rounds.get_mut(&(seq, n)) {
            if !round.done {
                round.all_responses += 1;
            }
        }
        if let Some(round) = self.accept_rounds.get_mut(&(seq, n)) {
            if !round.done {
                round.all_responses += 1;
            }
        }
    }

    /// Records a peer's acknowledgment of my Decide for a slot.
    pub(crate) fn note_decide_ack(&mut self, seq: SeqNum, peer: ReplicaId) {
        if let Some(acks) = self.decide_acks.get_mut(&seq) {
            let _ = acks.set(peer, true);
        }
    }
}

/// Message pump task: owns the transport hub, forwards outbound sends from
/// proposer tasks, and dispatches inbound peer messages into the shared
/// state (replying to Prepare/Accept/Decide as the acceptor).
pub(crate) async fn pump_task(
    me: ReplicaId,
    population: u8,
    state: Arc<Mutex<PaxosState>>,
    mut transport_hub: TransportHub<PaxosMsg>,
    mut rx_out: mpsc::UnboundedReceiver<PaxosSend>,
) {
    pf_debug!(me; "paxos pump task spawned");

    loop {
        tokio::select! {
            // outbound send requested by a proposer task
            send = rx_out.recv() => {
                let send = match send {
                    Some(send) => send,
                    None => break, // handle dropped, terminate
                };
                if let Err(e) = handle_send(
                    me,
                    population,
                    &state,
                    &mut transport_hub,
                    send,
                ) {
                    pf_error!(me; "error sending paxos msg: {}", e);
                }
            },

            // inbound message from a peer
            msg = transport_hub.recv_msg() => {
                let (peer, msg) = match msg {
                    Ok(pair) => pair,
                    Err(_e) => break, // recv channel closed for good
                };
                if let Err(e) = handle_recv(
                    me,
                    &state,
                    &mut transport_hub,
                    peer,
                    msg,
                ) {
                    pf_error!(me; "error handling paxos msg <- {}: {}",
                                  peer, e);
                }
            },
        }
    }

    pf_debug!(me; "paxos pump task exited");
}

/// Carries out one outbound send. For Prepare/Accept broadcasts, peers that
/// are not connected at send time are tallied as responded-with-failure so
/// that proposers do not wait on them.
fn handle_send(
    me: ReplicaId,
    population: u8,
    state: &Arc<Mutex<PaxosState>>,
    transport_hub: &mut TransportHub<PaxosMsg>,
    send: PaxosSend,
) -> Result<(), crate::utils::PaxkvError> {
    match send {
        PaxosSend::To(peer, msg) => transport_hub.send_msg(msg, peer),
        PaxosSend::Bcast(msg) => {
            let phase_key = match &msg {
                PaxosMsg::Prepare { seq, n, .. } => Some((*seq, *n)),
                PaxosMsg::Accept { seq, n, .. } => Some((*seq, *n)),
                _ => None,
            };
            if let Some((seq, n)) = phase_key {
                let connected = transport_hub
                    .current_peers()
                    .unwrap_or(Bitmap::new(population, false));
                let mut state = state.lock().unwrap();
                for peer in 0..population {
                    if peer != me && !connected.get(peer).unwrap_or(false) {
                        state.note_unreachable(seq, n);
                    }
                }
            }
            transport_hub.bcast_msg(msg)
        }
    }
}

/// Dispatches one inbound peer message.
fn handle_recv(
    me: ReplicaId,
    state: &Arc<Mutex<PaxosState>>,
    transport_hub: &mut TransportHub<PaxosMsg>,
    peer: ReplicaId,
    msg: PaxosMsg,
) -> Result<(), crate::utils::PaxkvError> {
    match msg {
        PaxosMsg::Prepare {
            seq,
            n,
            sender,
            done,
        } => {
            pf_trace!(me; "received Prepare <- {} seq {} n {}", peer, seq, n);
            let reply = {
                let mut state = state.lock().unwrap();
                let reply = state.handle_prepare(me, seq, n, sender, done);
                state.collect_garbage();
                reply
            };
            transport_hub.send_msg(reply, peer)
        }

        PaxosMsg::PrepareReply {
            seq,
            n,
            ok,
            n_a,
            v_a,
            done,
        } => {
            pf_trace!(me; "received PrepareReply <- {} seq {} n {} ok {}",
                          peer, seq, n, ok);
            let mut state = state.lock().unwrap();
            // replies piggyback the replier's done point too
            if done > state.peer_done[&peer] {
                state.peer_done.insert(peer, done);
            }
            state.note_prepare_reply(seq, n, ok, n_a, v_a);
            Ok(())
        }

        PaxosMsg::Accept { seq, n, v } => {
            pf_trace!(me; "received Accept <- {} seq {} n {}", peer, seq, n);
            let reply = {
                let mut state = state.lock().unwrap();
                state.handle_accept(seq, n, v)
            };
            transport_hub.send_msg(reply, peer)
        }

        PaxosMsg::AcceptReply { seq, n, ok } => {
            pf_trace!(me; "received AcceptReply <- {} seq {} n {} ok {}",
                          peer, seq, n, ok);
            let mut state = state.lock().unwrap();
            state.note_accept_reply(seq, n, ok);
            Ok(())
        }

        PaxosMsg::Decide { seq, v } => {
            pf_trace!(me; "received Decide <- {} seq {}", peer, seq);
            {
                let mut state = state.lock().unwrap();
                state.handle_decide(seq, v);
            }
            transport_hub.send_msg(PaxosMsg::DecideReply { seq }, peer)
        }

        PaxosMsg::DecideReply { seq } => {
            pf_trace!(me; "received DecideReply <- {} seq {}", peer, seq);
            let mut state = state.lock().unwrap();
            state.note_decide_ack(seq, peer);
            Ok(())
        }
    }
}
