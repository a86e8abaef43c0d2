//! Shared fixtures for VEIL integration tests.

pub mod fixtures;
