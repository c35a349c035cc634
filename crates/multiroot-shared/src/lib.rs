//! This crate contains shared helpers and utilities used across the other
//! crates in this workspace.

pub mod time;
