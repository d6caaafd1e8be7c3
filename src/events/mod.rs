//! Event bus for build and container state propagation

mod bus;

pub use bus::{Event, EventBus};
