//! Domain types shared by the admission controller and the scheduler
//!
//! Priority levels, request identifiers and the error taxonomy for units of
//! work submitted to the governor.

mod error;
mod priority;
mod request;

pub use error::{FailureKind, GovernorError, WorkError};
pub use priority::Priority;
pub use request::{Metadata, RequestId, Work, WorkFuture, work};
