//! Producers that observe the device and commit reported state.

pub mod uart;
