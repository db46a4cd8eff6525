//! Build workers.
//!
//! Each [`Worker`] owns one build at a time and drives it from QUEUED to a
//! terminal state:
//!
//! 1. Pop a [`Job`](crate::scheduler::Job) off the dispatch queue
//! 2. Claim the build (QUEUED -> IN_PROGRESS); skip it if someone else got there
//! 3. Resolve the assignment and the [`JobHandler`] that grades it
//! 4. Run the handler against the sandbox, racing the build's cancellation token
//! 5. Persist SUCCESS with the grade, or FAILED with a student-facing message
//! 6. Notify the owners
//!
//! Every terminal write is conditional on the build still being IN_PROGRESS,
//! so a build stopped while it ran stays FAILED.

pub mod handler;
pub mod runner;
pub mod script;

pub use handler::{
    BuildContext, HandlerError, HandlerFuture, HandlerMap, HandlerOutput, HandlerResolver,
    JobHandler,
};
pub use runner::{
    BuildOutcome, FailureKind, Worker, WorkerContext, AUTOGRADER_SOURCE, INTERNAL_ERROR_MESSAGE,
};
pub use script::{ScriptHandler, INTERNALS_FAILURE_MESSAGE};
