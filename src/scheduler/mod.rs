//! Producer side of the build pipeline and the in-memory dispatch queue.

pub mod admission;
pub mod cancel;
pub mod job;
pub mod queue;
pub mod registry;
pub mod submit;

pub use admission::{Admission, AdmissionController};
pub use cancel::CancelRegistry;
pub use job::Job;
pub use queue::DispatchQueue;
pub use registry::{WorkerLogEntry, WorkerProbe, WorkerRegistry, WorkerStatus};
pub use submit::{BuildRequest, GraderService, Submission, INTERRUPTED_MESSAGE};
