//! Operation taxonomy of the replicated state machine.
//!
//! An `Op` is the unit of consensus: the value agreed on for one slot, and
//! also the record written to the durable op log. Applying a decided `Op`
//! to the storage engine yields an `OpOutput`.

use serde::{Deserialize, Serialize};

/// Kinds of operations the state machine understands.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum OpKind {
    /// Read one cell.
    Get,

    /// Unconditional write of one cell.
    Put,

    /// Conditional write: succeeds iff the current value matches.
    CPut,

    /// Remove one cell.
    Delete,

    /// Acquire the row lock under the carried token.
    SetNx,

    /// Release the row lock.
    DelLock,

    /// Enumerate all rows (bypasses lock checks).
    AllRows,

    /// Enumerate the columns of one row (honors the lock token).
    ColsInRow,
}

/// One operation on the replicated store. Unused fields stay empty for
/// row-only and read-only kinds.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Op {
    /// Operation kind.
    pub kind: OpKind,

    /// Row key.
    pub row: String,

    /// Column key (unused for row-only operations).
    pub col: String,

    /// New value to write (base64-coded opaque bytes; the server never
    /// decodes them).
    pub new_value: String,

    /// Expected current value for `CPut`.
    pub curr_value: String,

    /// Globally-unique request identifier, used to recognize "my proposal
    /// won this slot" and to answer client retries idempotently.
    pub request_id: String,

    /// The caller's asserted lock token.
    pub lock_id: String,
}

impl Op {
    /// Builds a row+col operation.
    pub fn cell(
        kind: OpKind,
        row: impl Into<String>,
        col: impl Into<String>,
        new_value: impl Into<String>,
        curr_value: impl Into<String>,
        request_id: impl Into<String>,
        lock_id: impl Into<String>,
    ) -> Self {
        Op {
            kind,
            row: row.into(),
            col: col.into(),
            new_value: new_value.into(),
            curr_value: curr_value.into(),
            request_id: request_id.into(),
            lock_id: lock_id.into(),
        }
    }

    /// Builds a row-only operation (locks, column enumeration).
    pub fn row_only(
        kind: OpKind,
        row: impl Into<String>,
        request_id: impl Into<String>,
        lock_id: impl Into<String>,
    ) -> Self {
        Self::cell(kind, row, "", "", "", request_id, lock_id)
    }
}

/// Result of applying one operation.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct OpOutput {
    /// Whether the operation succeeded.
    pub success: bool,

    /// Cell value, for `Get`.
    pub value: String,

    /// Enumeration results, for `AllRows` / `ColsInRow`.
    pub values: Vec<String>,
}

impl OpOutput {
    /// A plain success/failure output with no payload.
    pub fn flag(success: bool) -> Self {
        OpOutput {
            success,
            ..Default::default()
        }
    }
}
