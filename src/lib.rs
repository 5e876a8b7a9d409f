//! Pipeline templates for moving EHR extracts through containerized
//! transformation stages.
//!
//! A definition file is loaded into an immutable [`pipeline::Template`]
//! (unique task ids, known edge endpoints, no cycles). The template can be
//! exported for an external executor or run locally by
//! [`execution::TaskRunner`], which honours precedence, queue affinity and
//! per-task retries.

pub mod dispatch;
pub mod error;
pub mod execution;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod util;

pub use error::{FlowError, Result};
