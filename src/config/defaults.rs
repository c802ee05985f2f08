use super::types::{ClockConfig, NetworkConfig, RuntimeConfig};

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: 45_678,
            discovery_interval_ms: 500,
            broadcast_addr: "255.255.255.255".to_string(),
            tcp_port: 0,
            udp_port: 0,
            peer_idle_timeout_ms: 5_000,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            window: 5,
            ema_constant: 0.125,
            dispersion_threshold: 0.010,
            ping_interval_ms: 250,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            application_name: "concord".to_string(),
            network: NetworkConfig::default(),
            clock: ClockConfig::default(),
            poll_rate_hz: 60,
            scheduler_tick_rate_hz: 1000.0,
        }
    }
}
