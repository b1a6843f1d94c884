//! Crate test suite. Shared stubs and fixtures live in [`support`].

pub mod support;

mod command_tests;
mod heartbeat_tests;
mod transport_tests;
