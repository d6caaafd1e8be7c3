//! Configuration loading and structures

mod config;

pub use config::*;
