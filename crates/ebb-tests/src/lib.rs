//! Integration test support for Ebb.
//!
//! Helpers build scripted remote nodes on top of
//! [`ebb_client::MemoryConnection`], canned chain data and recording
//! handlers; the `tests/` directory exercises the chain-sync client end to end.

pub mod helpers;
