//! Test suite for the duplex streaming engine
//!
//! Fakes for every device and transport boundary live in `test_utils`; the
//! integration tests drive whole sessions through the lifecycle manager.



pub use test_utils::*;
