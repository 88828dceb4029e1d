use crate::directory::{Guid, ObjectKind};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported at the runtime's API boundaries.
///
/// Broken caller contracts (satisfying a sticky event twice, unbalanced finish
/// scopes, signaling a destroyed waiter) are not represented here: they panic.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The handle was never issued or its object has been destroyed.
    #[error("stale or unknown handle {0:?}")]
    StaleHandle(Guid),
    #[error("handle {guid:?} does not refer to {expected:?}")]
    KindMismatch { guid: Guid, expected: ObjectKind },
    /// The event has not been satisfied yet.
    #[error("event {0:?} is not satisfied")]
    Unset(Guid),
    /// A workpile is at capacity. Workpiles never grow.
    #[error("workpile full (capacity {capacity}), increase the workpile capacity")]
    DequeFull { capacity: usize },
    #[error("expected {expected} {what}, got {got}")]
    ArityMismatch { what: &'static str, expected: usize, got: usize },
    #[error("no slot {slot} on {guid:?}")]
    InvalidSlot { guid: Guid, slot: u32 },
    /// Tasks can only be destroyed before they start running.
    #[error("task {0:?} has already started")]
    TaskStarted(Guid),
    #[error("not running inside a task")]
    NoCurrentTask,
    /// Only single-assignment events carrying data can be waited on.
    #[error("event {0:?} cannot be waited on")]
    NotAwaitable(Guid),
}
