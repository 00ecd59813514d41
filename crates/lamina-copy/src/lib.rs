#![forbid(unsafe_code)]
//! Per-object snapshot-preserving deep copy.
//!
//! An [`ObjectCopyRequest`] copies one destination object — across its
//! full snapshot history — from a source image into a destination image.
//! The source's sparse multi-snapshot delta is translated into a minimal
//! ordered sequence of reads, write/zero/truncate/remove batches, and
//! object-map updates, such that for every mapped destination snapshot
//! the destination object is byte-equivalent to the source object at the
//! corresponding source snapshot (including zeroed, absent, and truncated
//! states).
//!
//! The work splits into a pure planning layer ([`plan`]) and the request
//! state machine that executes the plan against the store ([`request`]).

pub mod plan;
pub mod request;

pub use plan::{CopyPlan, ReadOp, WriteOp};
pub use request::{Handler, ObjectCopyRequest};
