//! End-to-End Integration Tests
//!
//! These tests drive the directory session core through scripted
//! collaborators: a mock transport, resolver, credential store and
//! availability cache.

mod common;
mod connection_lifecycle;
mod pool;
mod replica_race;
mod scenario;
