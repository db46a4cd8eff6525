//! Assignment policy and the audited grade commit protocol.

pub mod commit;
pub mod policy;

pub use commit::{assign_grade_batch, get_grade, grade_log, Grade, GradeLogEntry, GradeUpdate};
pub use policy::{
    slip_units, Assignment, AssignmentBook, ConfiguredOwners, Extension, GraderSpec,
    OwnerResolver, PolicyLookup,
};
