//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/cell.toml

use crate::domain::topology::{
    ChannelRole, ChannelSpec, CornerSpec, Endpoint, RoleKind, StationSpec, Topology,
};
use crate::domain::types::{ChannelId, CornerId, MotorId, RawSource, StationId};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// What a full queue does with a new event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room
    DropOldest,
    /// Refuse the new event
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CellConfig {
    #[serde(default = "default_cell_id")]
    pub id: String,
    /// Use simulated sensors and actuators
    #[serde(default = "default_true")]
    pub simulation: bool,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self { id: default_cell_id(), simulation: true }
    }
}

fn default_cell_id() -> String {
    "lab-cell".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CepConfig {
    /// Dequeue timeout of the consumer loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Expiry sweep and corner timeout tick
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_true")]
    pub drain_on_shutdown: bool,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for CepConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            drain_on_shutdown: true,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_sweep_interval_ms() -> u64 {
    50
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct FusionConfig {
    /// Max span between entry edge and tag read at a station
    #[serde(default = "default_identification_window_ms")]
    pub identification_window_ms: u64,
    /// Max span between rising and falling process edge
    #[serde(default = "default_process_window_ms")]
    pub process_window_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            identification_window_ms: default_identification_window_ms(),
            process_window_ms: default_process_window_ms(),
        }
    }
}

fn default_identification_window_ms() -> u64 {
    2000
}

fn default_process_window_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    #[serde(default = "default_queue_capacity")]
    pub edge_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub polled_capacity: usize,
    /// Capacity of each per-reader tag queue
    #[serde(default = "default_tag_capacity")]
    pub tag_capacity: usize,
    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: OverflowPolicy,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            edge_capacity: default_queue_capacity(),
            polled_capacity: default_queue_capacity(),
            tag_capacity: default_tag_capacity(),
            overflow_policy: default_overflow_policy(),
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}

fn default_tag_capacity() -> usize {
    20
}

fn default_overflow_policy() -> OverflowPolicy {
    OverflowPolicy::DropOldest
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotorsConfig {
    #[serde(default = "default_conveyor_speed")]
    pub conveyor_speed: f64,
    #[serde(default = "default_station_speed")]
    pub station_speed: f64,
    #[serde(default = "default_process_speed")]
    pub process_speed: f64,
    #[serde(default = "default_corner_speed")]
    pub corner_speed: f64,
}

impl Default for MotorsConfig {
    fn default() -> Self {
        Self {
            conveyor_speed: default_conveyor_speed(),
            station_speed: default_station_speed(),
            process_speed: default_process_speed(),
            corner_speed: default_corner_speed(),
        }
    }
}

fn default_conveyor_speed() -> f64 {
    0.5
}

fn default_station_speed() -> f64 {
    0.4
}

fn default_process_speed() -> f64 {
    0.2
}

fn default_corner_speed() -> f64 {
    0.7
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub id: u8,
    pub drive_motor: u8,
    #[serde(default)]
    pub reverse: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CornerConfig {
    pub id: u8,
    pub pusher_motor: u8,
    pub fed_from: Endpoint,
    pub delivers_to: Endpoint,
    /// Overrides `collision.handshake_timeout_ms`
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollisionConfig {
    /// Corner pairs sharing a mechanical path
    #[serde(default = "default_mutually_exclusive")]
    pub mutually_exclusive: Vec<[u8; 2]>,
    #[serde(default = "default_min_reuse_interval_ms")]
    pub min_reuse_interval_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            mutually_exclusive: default_mutually_exclusive(),
            min_reuse_interval_ms: default_min_reuse_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

fn default_mutually_exclusive() -> Vec<[u8; 2]> {
    vec![[1, 2], [2, 3], [3, 4], [4, 1]]
}

fn default_min_reuse_interval_ms() -> u64 {
    2000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub source: RawSource,
    pub role: RoleKind,
    /// Station, corner or conveyor number the role refers to
    pub unit: u8,
    #[serde(default)]
    pub analog_threshold: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Enable MQTT telemetry publishing
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Topic for fused events and part activities (QoS 0)
    #[serde(default = "default_events_topic")]
    pub events_topic: String,
    /// Topic for alerts (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
    /// Topic for KPI snapshots (QoS 0)
    #[serde(default = "default_kpi_topic")]
    pub kpi_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            events_topic: default_events_topic(),
            alerts_topic: default_alerts_topic(),
            kpi_topic: default_kpi_topic(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_events_topic() -> String {
    "cell/events".to_string()
}

fn default_alerts_topic() -> String {
    "cell/alerts".to_string()
}

fn default_kpi_topic() -> String {
    "cell/kpi".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    /// File path for the part activity log (JSONL format)
    #[serde(default = "default_event_log_file")]
    pub file: String,
    /// Bounded hand-off between the core and the telemetry worker
    #[serde(default = "default_telemetry_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self { file: default_event_log_file(), channel_capacity: default_telemetry_capacity() }
    }
}

fn default_event_log_file() -> String {
    "data/events.jsonl".to_string()
}

fn default_telemetry_capacity() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
    /// Interval for publishing KPI snapshots (seconds)
    #[serde(default = "default_kpi_interval")]
    pub kpi_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval(),
            prometheus_port: 0,
            kpi_interval_secs: default_kpi_interval(),
        }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_kpi_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub cell: CellConfig,
    #[serde(default)]
    pub cep: CepConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub motors: MotorsConfig,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
    #[serde(default)]
    pub corners: Vec<CornerConfig>,
    #[serde(default)]
    pub collision: CollisionConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    cell_id: String,
    simulation: bool,
    poll_interval_ms: u64,
    sweep_interval_ms: u64,
    drain_on_shutdown: bool,
    shutdown_grace_ms: u64,
    identification_window_ms: u64,
    process_window_ms: u64,
    edge_capacity: usize,
    polled_capacity: usize,
    tag_capacity: usize,
    overflow_policy: OverflowPolicy,
    conveyor_speed: f64,
    station_speed: f64,
    process_speed: f64,
    corner_speed: f64,
    mutually_exclusive: Vec<(CornerId, CornerId)>,
    min_reuse_interval_ms: u64,
    handshake_timeout_ms: u64,
    topology: Topology,
    mqtt_enabled: bool,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_events_topic: String,
    mqtt_alerts_topic: String,
    mqtt_kpi_topic: String,
    event_log_file: String,
    telemetry_capacity: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    kpi_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        let toml_config = TomlConfig::default();
        let topology =
            Topology::lab_cell(Duration::from_millis(toml_config.collision.handshake_timeout_ms));
        let pairs = toml_config
            .collision
            .mutually_exclusive
            .iter()
            .map(|&[a, b]| (CornerId(a), CornerId(b)))
            .collect();
        Self::assemble(toml_config, topology, pairs, "default")
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/cell.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Self::from_toml(toml_config, &path.display().to_string())
            .with_context(|| format!("Invalid cell layout in {}", path.display()))
    }

    fn from_toml(toml_config: TomlConfig, source: &str) -> anyhow::Result<Self> {
        let collision = &toml_config.collision;
        let default_timeout = Duration::from_millis(collision.handshake_timeout_ms);
        let lab = Topology::lab_cell(default_timeout);

        let stations = if toml_config.stations.is_empty() {
            lab.stations().to_vec()
        } else {
            toml_config
                .stations
                .iter()
                .map(|s| StationSpec {
                    id: StationId(s.id),
                    drive_motor: MotorId(s.drive_motor),
                    direction: if s.reverse { -1.0 } else { 1.0 },
                })
                .collect()
        };

        let corners = if toml_config.corners.is_empty() {
            lab.corners().to_vec()
        } else {
            toml_config
                .corners
                .iter()
                .map(|c| CornerSpec {
                    id: CornerId(c.id),
                    pusher_motor: MotorId(c.pusher_motor),
                    fed_from: c.fed_from,
                    delivers_to: c.delivers_to,
                    handshake_timeout: c
                        .handshake_timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(default_timeout),
                })
                .collect()
        };

        let channels = if toml_config.channels.is_empty() {
            lab.channels().cloned().collect()
        } else {
            toml_config
                .channels
                .iter()
                .map(|c| ChannelSpec {
                    id: ChannelId::new(c.id.as_str()),
                    source: c.source,
                    role: ChannelRole::from_parts(c.role, c.unit),
                    analog_threshold: c.analog_threshold.unwrap_or(0.5),
                })
                .collect()
        };

        let topology = Topology::new(stations, corners, channels)?;

        let mut mutually_exclusive = Vec::with_capacity(collision.mutually_exclusive.len());
        for &[a, b] in &collision.mutually_exclusive {
            anyhow::ensure!(
                topology.corner(CornerId(a)).is_some() && topology.corner(CornerId(b)).is_some(),
                "mutually exclusive pair [{}, {}] references an unknown corner",
                a,
                b
            );
            mutually_exclusive.push((CornerId(a), CornerId(b)));
        }

        anyhow::ensure!(
            toml_config.queues.edge_capacity > 0
                && toml_config.queues.polled_capacity > 0
                && toml_config.queues.tag_capacity > 0,
            "queue capacities must be positive"
        );

        Ok(Self::assemble(toml_config, topology, mutually_exclusive, source))
    }

    fn assemble(
        toml_config: TomlConfig,
        topology: Topology,
        mutually_exclusive: Vec<(CornerId, CornerId)>,
        source: &str,
    ) -> Self {
        Self {
            cell_id: toml_config.cell.id,
            simulation: toml_config.cell.simulation,
            poll_interval_ms: toml_config.cep.poll_interval_ms,
            sweep_interval_ms: toml_config.cep.sweep_interval_ms,
            drain_on_shutdown: toml_config.cep.drain_on_shutdown,
            shutdown_grace_ms: toml_config.cep.shutdown_grace_ms,
            identification_window_ms: toml_config.fusion.identification_window_ms,
            process_window_ms: toml_config.fusion.process_window_ms,
            edge_capacity: toml_config.queues.edge_capacity,
            polled_capacity: toml_config.queues.polled_capacity,
            tag_capacity: toml_config.queues.tag_capacity,
            overflow_policy: toml_config.queues.overflow_policy,
            conveyor_speed: toml_config.motors.conveyor_speed,
            station_speed: toml_config.motors.station_speed,
            process_speed: toml_config.motors.process_speed,
            corner_speed: toml_config.motors.corner_speed,
            mutually_exclusive,
            min_reuse_interval_ms: toml_config.collision.min_reuse_interval_ms,
            handshake_timeout_ms: toml_config.collision.handshake_timeout_ms,
            topology,
            mqtt_enabled: toml_config.mqtt.enabled,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_events_topic: toml_config.mqtt.events_topic,
            mqtt_alerts_topic: toml_config.mqtt.alerts_topic,
            mqtt_kpi_topic: toml_config.mqtt.kpi_topic,
            event_log_file: toml_config.event_log.file,
            telemetry_capacity: toml_config.event_log.channel_capacity,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            kpi_interval_secs: toml_config.metrics.kpi_interval_secs,
            config_file: source.to_string(),
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    pub fn simulation(&self) -> bool {
        self.simulation
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn drain_on_shutdown(&self) -> bool {
        self.drain_on_shutdown
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn identification_window(&self) -> Duration {
        Duration::from_millis(self.identification_window_ms)
    }

    pub fn process_window(&self) -> Duration {
        Duration::from_millis(self.process_window_ms)
    }

    pub fn edge_capacity(&self) -> usize {
        self.edge_capacity
    }

    pub fn polled_capacity(&self) -> usize {
        self.polled_capacity
    }

    pub fn tag_capacity(&self) -> usize {
        self.tag_capacity
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    pub fn conveyor_speed(&self) -> f64 {
        self.conveyor_speed
    }

    pub fn station_speed(&self) -> f64 {
        self.station_speed
    }

    pub fn process_speed(&self) -> f64 {
        self.process_speed
    }

    pub fn corner_speed(&self) -> f64 {
        self.corner_speed
    }

    pub fn mutually_exclusive(&self) -> &[(CornerId, CornerId)] {
        &self.mutually_exclusive
    }

    pub fn min_reuse_interval(&self) -> Duration {
        Duration::from_millis(self.min_reuse_interval_ms)
    }

    pub fn handshake_timeout_ms(&self) -> u64 {
        self.handshake_timeout_ms
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_events_topic(&self) -> &str {
        &self.mqtt_events_topic
    }

    pub fn mqtt_alerts_topic(&self) -> &str {
        &self.mqtt_alerts_topic
    }

    pub fn mqtt_kpi_topic(&self) -> &str {
        &self.mqtt_kpi_topic
    }

    pub fn event_log_file(&self) -> &str {
        &self.event_log_file
    }

    pub fn telemetry_capacity(&self) -> usize {
        self.telemetry_capacity
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn kpi_interval_secs(&self) -> u64 {
        self.kpi_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten the identification window
    pub fn with_identification_window_ms(mut self, ms: u64) -> Self {
        self.identification_window_ms = ms;
        self
    }

    /// Builder method for tests to set queue capacities
    pub fn with_queue_capacity(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.edge_capacity = capacity;
        self.polled_capacity = capacity;
        self.tag_capacity = capacity;
        self.overflow_policy = policy;
        self
    }

    /// Builder method for tests to set the shutdown grace period
    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    pub fn with_drain_on_shutdown(mut self, drain: bool) -> Self {
        self.drain_on_shutdown = drain;
        self
    }

    /// Builder method for tests to shorten collision timing on every corner
    pub fn with_collision_timing_ms(mut self, handshake_ms: u64, reuse_ms: u64) -> Self {
        self.handshake_timeout_ms = handshake_ms;
        self.min_reuse_interval_ms = reuse_ms;
        self.topology = self.topology.with_handshake_timeout(Duration::from_millis(handshake_ms));
        self
    }
}
