//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A mock destination database service answering over the broker

pub mod containers;
pub mod mock_service;

pub use containers::*;
pub use mock_service::*;
