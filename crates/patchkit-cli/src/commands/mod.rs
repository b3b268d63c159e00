//! CLI command implementations.

pub mod check;
pub mod hex_utils;
pub mod scan;
