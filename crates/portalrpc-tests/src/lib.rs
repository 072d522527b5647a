//! Integration tests for portalrpc: exchanges, rings and bulk transfers over the simulated fabric.

pub mod harness;

#[cfg(test)]
mod exchange_tests;
#[cfg(test)]
mod proptest_rpc;

pub use harness::{bulk_pattern, eventually, EchoBody, EchoHandler, TestCluster};
