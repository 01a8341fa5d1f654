#![no_std]
#![allow(async_fn_in_trait)]

// Connectivity resilience core for the occupancy telemetry node.
//
// Everything here stays portable across the ESP32 firmware and host tooling:
// time, transports, the broker client, and the watchdog are injected through
// traits so the same state machines run in firmware, the emulator, and tests.

pub mod broker;
pub mod clock;
pub mod config;
pub mod link;
pub mod liveness;
pub mod mqtt;
pub mod network;
pub mod node;
pub mod publish;
pub mod status;
pub mod telemetry;
