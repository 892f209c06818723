//! Ready-to-go hooks.
pub mod failure;
pub mod pre_start;
