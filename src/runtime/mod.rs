//! # Runtime Module
//!
//! Startup, the watch loop, and error handling around them.

pub mod error_policy;
pub mod initialization;
pub mod watch_loop;
