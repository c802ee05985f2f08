mod defaults;
mod loader;
mod types;

pub use types::{ClockConfig, NetworkConfig, RuntimeConfig};
