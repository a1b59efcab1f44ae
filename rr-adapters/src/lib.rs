//! Sample store adapters for RaceReplay

pub mod demo;
pub mod openf1;

pub use demo::{DemoConfig, DemoStore};
pub use openf1::{OpenF1Client, OpenF1Config, OpenF1Store};
