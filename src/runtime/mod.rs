//! Execution environments (backends) for the ASG.

pub mod backend;
pub mod cpu_backend;
