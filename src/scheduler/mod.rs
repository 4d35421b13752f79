//! Build scheduling: submission, cron triggers, post-build actions and the
//! reconciliation loop.

pub mod actions;
pub mod matrix;
pub mod reconcile;
pub mod submit;
pub mod trigger;

pub use submit::{new_pipeline, pull_request_ref, validate_params, SubmitRequest};
pub use trigger::TaskScheduler;
