use serde::{Deserialize, Serialize};

/// Calibration and network parameters for one runtime instance.
///
/// Every field here corresponds to a constant spec.md names but leaves as
/// "a configuration parameter" (poll rate, discovery interval, the clock-sync
/// window `H`, the EMA blending constant, the dispersion threshold).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    #[serde(default = "default_application_name")]
    pub application_name: String,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub clock: ClockConfig,

    #[serde(default = "default_poll_rate_hz")]
    pub poll_rate_hz: u32,

    /// `R` in the scheduler's `floor(t*R) mod B` formula (spec §3/§4.3):
    /// how finely the `B = 128`-bucket wheel subdivides one second.
    #[serde(default = "default_scheduler_tick_rate_hz")]
    pub scheduler_tick_rate_hz: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NetworkConfig {
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,

    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    #[serde(default = "default_peer_idle_timeout_ms")]
    pub peer_idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ClockConfig {
    /// Size of the sliding RTT-sample window (spec §4.6: `H = 5`).
    #[serde(default = "default_clock_window")]
    pub window: usize,

    /// Blending constant for drift smoothing (spec §4.6: "constant ≈ 1/8").
    #[serde(default = "default_ema_constant")]
    pub ema_constant: f64,

    /// Maximum acceptable `max - min` RTT dispersion, in seconds, before the
    /// window is considered good enough to declare sync.
    #[serde(default = "default_dispersion_threshold")]
    pub dispersion_threshold: f64,

    /// Interval between client pings, in milliseconds.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

fn default_application_name() -> String {
    "concord".to_string()
}

fn default_poll_rate_hz() -> u32 {
    60
}

fn default_scheduler_tick_rate_hz() -> f64 {
    1000.0
}

fn default_discovery_port() -> u16 {
    45_678
}

fn default_discovery_interval_ms() -> u64 {
    500
}

fn default_broadcast_addr() -> String {
    "255.255.255.255".to_string()
}

fn default_tcp_port() -> u16 {
    0
}

fn default_udp_port() -> u16 {
    0
}

fn default_peer_idle_timeout_ms() -> u64 {
    5_000
}

fn default_clock_window() -> usize {
    5
}

fn default_ema_constant() -> f64 {
    0.125
}

fn default_dispersion_threshold() -> f64 {
    0.010
}

fn default_ping_interval_ms() -> u64 {
    250
}
