//! Integration test crate for the directory session core.
//!
//! The tests live under `tests/`; this library target is intentionally empty.
