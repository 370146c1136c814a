//! Load test of the budget portal, built on [`throng`].
//!
//! - [`workload`]: the `fag` and `fin` user classes and their tasks.
//! - [`seed`]: generator of production-sized test data.
//! - [`api`]: the HTTP client both of them share.
//! - [`cli`]: the `throng-portal` command line.

pub mod api;
pub mod cli;
pub mod seed;
pub mod workload;
