//! Shared fixtures for the ward integration and end-to-end suites

pub mod common;
