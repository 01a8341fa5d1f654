#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
extern crate alloc;

#[cfg(target_os = "none")]
use esp_backtrace as _;
#[cfg(target_os = "none")]
use esp_println as _;

mod clock;
mod config;
mod sample;
mod telemetry;

#[cfg(target_os = "none")]
mod runtime;

#[cfg(target_os = "none")]
#[esp_hal::main]
fn main() -> ! {
    runtime::start()
}

#[cfg(not(target_os = "none"))]
fn main() {}
