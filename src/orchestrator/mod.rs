//! Application-level orchestration utilities.
//!
//! Owns the Terraform flow lifecycle (Ctrl-C cancel) and post-run processing
//! such as saving logs and building pipeline output. CLI handlers call into
//! this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, Flow};
pub(crate) use post_process::process_run_completion;
