//! Shared test utilities for renderq integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated test execution with temp directories
//! - Fake renderer scripts emitting Blender-style output

pub mod harness;
pub mod renderers;

pub use harness::TestHarness;
