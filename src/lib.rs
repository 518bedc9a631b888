//! Public interface to the paxkv core library, linked by the server,
//! controller, and client executables.

#[macro_use]
pub mod utils;

mod client;
mod manager;
mod paxos;
mod server;
mod storage;

pub use client::{ClientApiStub, ClientId, KvsClient};
pub use manager::{CtrlReply, CtrlRequest, CtrlStatus, CtrlStub, KvsController};
pub use paxos::{Paxos, SeqNum};
pub use server::{
    ApiReply, ApiRequest, KvsReplica, Op, OpKind, OpOutput, ReplicaConfig,
    ReplicaId,
};
pub use storage::{Store, LOCK_BYPASS, NO_LOCK};
pub use utils::PaxkvError;
