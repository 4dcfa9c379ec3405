//! State module for tracking task progress
//!
//! Per-domain state (token buckets, circuits) lives with the components that
//! own it; this module only holds the task lifecycle shared by all of them.

mod task_state;

pub use task_state::TaskState;
