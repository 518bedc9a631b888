//! Server functionality modules: the replicated state machine, client API,
//! peer transport, durable op log, and the op taxonomy.

mod external;
mod logger;
mod replica;
mod statemach;
mod transport;

/// Server replica ID type.
pub type ReplicaId = u8;

pub use external::{ApiReply, ApiRequest};
pub use replica::{KvsReplica, ReplicaConfig};
pub use statemach::{Op, OpKind, OpOutput};

pub(crate) use external::ExternalApi;
pub(crate) use logger::OpLogger;
pub(crate) use transport::TransportHub;
