//! Synchronization core, as a state machine without IO
//!
//! The [`Core`] consumes [`InEvent`]s — application commands and decoded
//! server messages — and emits [`OutEvent`]s: connection calls to perform,
//! listener events to deliver, completions to resolve. All mutation is
//! synchronous; the embedding runtime (see [`crate::repo`]) owns the IO.

use std::fmt;

use thiserror::Error;

pub mod filter;
pub mod node;
pub mod path;
pub mod push_id;
pub mod sparse;
pub mod state;
pub mod sync;
pub mod transaction;
pub mod view;

#[cfg(test)]
mod tests;

pub use filter::{FilterError, OrderBy, QueryBound, QueryFilter};
pub use node::Node;
pub use path::{Name, Path, PathError};
pub use push_id::PushIdGenerator;
pub use state::{Completion, Config, Core, DisconnectOp, InEvent, OutEvent, PutCtx};
pub use transaction::{TransactionError, TransactionResult, UpdateFn};
pub use view::{DataEvent, EventKind, ListenerId};

/// A typed error reported by the server for a put, merge, or listen.
///
/// The code `"datastale"` is not a failure: it drives transaction reruns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server error: {code}")]
pub struct ServerError {
    /// The server's error code.
    pub code: String,
}

impl ServerError {
    /// Creates an error with the given code.
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }

    /// True for the compare-and-set mismatch code.
    pub fn is_datastale(&self) -> bool {
        self.code == "datastale"
    }
}

/// Correlates server pushes with the filtered listen that caused them.
/// Allocated per listen; scoped to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u32);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag-{}", self.0)
    }
}

/// Routes an [`state::OutEvent::Complete`] back to the waiting caller.
/// Allocated by the runtime; single-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompleterId(pub(crate) u64);
