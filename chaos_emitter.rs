//! # Chaos Emitter - Synthetic Telemetry for Monitoring Pipelines
//!
//! A pull-based Prometheus metrics endpoint whose values are produced by
//! background tasks simulating realistic, deliberately imperfect application
//! behaviour. Point a scraper, dashboard or alerting rule at it and exercise
//! the whole pipeline without a real workload.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              CHAOS EMITTER                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  GENERATOR LOOP ──(chaos model)──┐                                          │
//! │                                  ├──▶ METRIC REGISTRY ──▶ GET /metrics      │
//! │  PATTERN SCHEDULER ──(phases)────┘                                          │
//! │       ▲                                                                     │
//! │       └── GET /pattern/status, GET /pattern/reset                          │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Chaos Injection**: missing metrics, label dropouts, status flips,
//!   value spikes and monotonic latency drift
//! - **Scripted Phases**: a time-driven schedule of healthy/degraded/recovering
//!   behaviour with a resettable epoch
//! - **Supervised Tasks**: generation survives bad ticks and task panics
//! - **Standard Exposition**: Prometheus text format over HTTP

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

// ----------------------------------------------------------------------------
// Randomness
// ----------------------------------------------------------------------------
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, NormalError};

// ----------------------------------------------------------------------------
// Networking & HTTP
// ----------------------------------------------------------------------------
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::core::Collector;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts,
    Registry as PrometheusRegistry, TextEncoder, TEXT_FORMAT,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults and fixed values that shape generation behaviour. Every default
// here can be overridden from configuration unless stated otherwise.
// ============================================================================

/// Emitter version - follows semantic versioning
pub const EMITTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EMITTER_NAME: &str = "chaos-emitter";
pub const EMITTER_FULL_NAME: &str = "Chaos Emitter";

// ----------------------------------------------------------------------------
// Generator Defaults
// ----------------------------------------------------------------------------

/// Seconds slept after each processed metric
pub const DEFAULT_UPDATE_INTERVAL_SECS: f64 = 2.0;

/// Label-sets sampled per metric per tick
pub const DEFAULT_NUM_LABEL_COMBINATIONS: usize = 10;

/// Base value for a metric definition that omits one
pub const DEFAULT_BASE_VALUE: f64 = 1.0;

/// Standard deviation for a metric definition that omits one
pub const DEFAULT_VARIANCE: f64 = 0.2;

/// Histogram bucket upper bounds for definitions that omit them
pub const DEFAULT_HISTOGRAM_BUCKETS: [f64; 5] = [0.1, 0.5, 1.0, 2.0, 5.0];

// ----------------------------------------------------------------------------
// Chaos Defaults
// ----------------------------------------------------------------------------

/// Drift applied to the trend state per tick
pub const DEFAULT_LATENCY_DRIFT_PER_TICK: f64 = 0.1;

/// Label rewritten by status flips
pub const STATUS_LABEL: &str = "status";

/// Values a flipped status is drawn from
pub const STATUS_FLIP_VALUES: [&str; 2] = ["200", "500"];

// ----------------------------------------------------------------------------
// Pattern Scheduler
// ----------------------------------------------------------------------------

/// Poll interval while the scheduler is globally disabled
pub const DISABLED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval while the current phase does not generate
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Emission interval for phases that omit one (seconds)
pub const DEFAULT_PHASE_INTERVAL_SECS: f64 = 1.0;

/// Target latency for phases that omit one (seconds)
pub const DEFAULT_PHASE_LATENCY: f64 = 0.1;

/// Status code for phases that omit one
pub const DEFAULT_PHASE_STATUS: &str = "200";

/// `max_latency = latency * MAX_LATENCY_FACTOR` when unconfigured
pub const MAX_LATENCY_FACTOR: f64 = 1.5;

/// Name reported once the schedule has run out of phases
pub const COMPLETED_PHASE_NAME: &str = "completed";

/// Histogram fed with phase latency
pub const DEFAULT_PATTERN_HISTOGRAM: &str = "http_server_requests_seconds";

/// Gauge fed with phase max latency
pub const DEFAULT_PATTERN_GAUGE: &str = "http_server_requests_seconds_max";

// ----------------------------------------------------------------------------
// Network & Process
// ----------------------------------------------------------------------------

/// Default port for the HTTP surface
pub const DEFAULT_HTTP_PORT: u16 = 9100;

/// Default restart backoff for supervised tasks (seconds)
pub const DEFAULT_RESTART_BACKOFF_SECS: f64 = 1.0;

/// Default emitter configuration path
pub const DEFAULT_CONFIG_PATH: &str = "emitter.toml";

/// Default pattern configuration path
pub const DEFAULT_PATTERN_CONFIG_PATH: &str = "pattern.toml";

/// Environment prefix for emitter configuration overrides
pub const EMITTER_ENV_PREFIX: &str = "CHAOS_EMITTER_";

/// Environment prefix for pattern configuration overrides
pub const PATTERN_ENV_PREFIX: &str = "CHAOS_EMITTER_PATTERN_";

/// Body served by `GET /`
pub const INDEX_BODY: &str = "Mock Prometheus metrics server (configurable chaos edition) is running!";

/// Body served by `GET /pattern/reset`
pub const RESET_BODY: &str = "Pattern timer reset";

// ----------------------------------------------------------------------------
// Log Sinks
// ----------------------------------------------------------------------------

/// Environment variable that overrides the log directory
pub const LOG_DIR_ENV: &str = "LOG_DIR";

/// Log directory used when neither env nor config name one
pub const DEFAULT_LOG_DIR: &str = "logs";

/// File receiving chaos diagnostics
pub const CHAOS_LOG_FILE: &str = "chaos.log";

/// File receiving pattern phase emissions
pub const PATTERN_LOG_FILE: &str = "pattern.log";

/// Tracing target routed into `chaos.log`
pub const CHAOS_LOG_TARGET: &str = "chaos_emitter::chaos";

/// Tracing target routed into `pattern.log`
pub const PATTERN_LOG_TARGET: &str = "chaos_emitter::pattern";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Labels, label-sets, metric kinds and definitions. Label-sets are small
// (one entry per configured label name) so they live on the stack.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Labels - Key-Value Dimensional Data
// ----------------------------------------------------------------------------

/// A single label (key-value pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    /// Label key (e.g., "app", "status", "uri")
    pub key: CompactString,
    /// Label value (e.g., "orders", "500", "/api/data")
    pub value: CompactString,
}

impl Label {
    /// Create a new label
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// One concrete assignment of values to every configured label name,
/// ordered like the registry's label names.
pub type LabelSet = SmallVec<[Label; 8]>;

/// Extension trait for [`LabelSet`]
pub trait LabelSetExt {
    /// Get a label value by key
    fn value_of(&self, key: &str) -> Option<&str>;

    /// Check if a label exists
    fn contains_key(&self, key: &str) -> bool;

    /// Add or update a label
    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>;

    /// Label values in order, ready for `with_label_values`
    fn values(&self) -> SmallVec<[&str; 8]>;

    /// Render as `{k=v,k=v}` for log lines
    fn render(&self) -> String;
}

impl LabelSetExt for LabelSet {
    fn value_of(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|l| l.key.as_str() == key)
            .map(|l| l.value.as_str())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.iter().any(|l| l.key.as_str() == key)
    }

    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        let key = key.into();
        let value = value.into();

        if let Some(label) = self.iter_mut().find(|l| l.key == key) {
            label.value = value;
        } else {
            self.push(Label { key, value });
        }
    }

    fn values(&self) -> SmallVec<[&str; 8]> {
        self.iter().map(|l| l.value.as_str()).collect()
    }

    fn render(&self) -> String {
        let inner: Vec<String> = self.iter().map(|l| l.to_string()).collect();
        format!("{{{}}}", inner.join(","))
    }
}

/// Build a label-set ordered by `names` from a keyed source.
///
/// Every name must be present in `source`; keys the registry does not know
/// are ignored.
pub fn project_labels(
    names: &[CompactString],
    source: &BTreeMap<String, LabelValue>,
) -> Result<LabelSet, GenerationError> {
    names
        .iter()
        .map(|name| {
            source
                .get(name.as_str())
                .map(|value| Label::new(name.clone(), value.as_str()))
                .ok_or_else(|| GenerationError::MissingLabel {
                    label: name.to_string(),
                })
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 3.2 Label Values - Lenient Scalars
// ----------------------------------------------------------------------------

/// A configuration scalar read as text whether it was written as a string,
/// a number or a boolean. Status codes are commonly written unquoted and env
/// overrides always arrive as parsed scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LabelValue(pub String);

impl LabelValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LabelValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LabelValue {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for LabelValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Scalar {
            Text(String),
            Int(i64),
            Float(f64),
            Bool(bool),
        }

        Ok(match Scalar::deserialize(deserializer)? {
            Scalar::Text(s) => LabelValue(s),
            Scalar::Int(i) => LabelValue(i.to_string()),
            Scalar::Float(f) => LabelValue(f.to_string()),
            Scalar::Bool(b) => LabelValue(b.to_string()),
        })
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric Kinds & Definitions
// ----------------------------------------------------------------------------

/// The closed set of metric kinds the registry can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    /// Resolve the `type` string of a metric definition.
    pub fn parse(metric: &str, kind: &str) -> Result<Self, ConfigError> {
        match kind {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "histogram" => Ok(MetricKind::Histogram),
            other => Err(ConfigError::UnsupportedMetricKind {
                metric: metric.to_string(),
                kind: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction a metric's trend state moves when latency drift is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftDirection {
    #[default]
    Up,
    Down,
}

impl DriftDirection {
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            DriftDirection::Up => 1.0,
            DriftDirection::Down => -1.0,
        }
    }
}

/// Static description of one synthetic metric. The name is the key it is
/// stored under in [`EmitterConfig::metrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// `counter`, `gauge` or `histogram`; resolved at registry creation
    #[serde(rename = "type")]
    pub kind: String,

    /// Help text (defaults to the metric name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Mean of the synthesized value
    #[serde(default = "default_base_value")]
    pub base_value: f64,

    /// Standard deviation of the synthesized value
    #[serde(default = "default_variance")]
    pub variance: f64,

    /// Histogram bucket upper bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<f64>>,

    /// Trend direction under latency drift
    #[serde(default)]
    pub drift_direction: DriftDirection,
}

impl MetricDefinition {
    pub fn new(kind: MetricKind, base_value: f64, variance: f64) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            description: None,
            base_value,
            variance,
            buckets: None,
            drift_direction: DriftDirection::Up,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = Some(buckets);
        self
    }

    pub fn with_drift(mut self, direction: DriftDirection) -> Self {
        self.drift_direction = direction;
        self
    }
}

fn default_base_value() -> f64 {
    DEFAULT_BASE_VALUE
}

fn default_variance() -> f64 {
    DEFAULT_VARIANCE
}

// ----------------------------------------------------------------------------
// 3.4 Label Catalog - The Enumerated Label Space
// ----------------------------------------------------------------------------

/// Every label-set the generator can draw from: the cartesian product of the
/// configured label domains, computed once at startup and never mutated.
#[derive(Debug, Clone, Default)]
pub struct LabelCatalog {
    names: Vec<CompactString>,
    combinations: Vec<LabelSet>,
}

impl LabelCatalog {
    /// Enumerate the product of `domains`. The last label varies fastest.
    pub fn from_domains(domains: &BTreeMap<String, Vec<LabelValue>>) -> Self {
        let names = domains
            .keys()
            .map(|name| CompactString::from(name.as_str()))
            .collect();

        let mut combinations: Vec<LabelSet> = vec![LabelSet::new()];
        for (name, values) in domains {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combo in &combinations {
                for value in values {
                    let mut extended = combo.clone();
                    extended.push(Label::new(name.as_str(), value.as_str()));
                    next.push(extended);
                }
            }
            combinations = next;
        }

        Self {
            names,
            combinations,
        }
    }

    /// Label names in registry order
    pub fn names(&self) -> &[CompactString] {
        &self.names
    }

    /// The full enumeration
    pub fn combinations(&self) -> &[LabelSet] {
        &self.combinations
    }

    pub fn len(&self) -> usize {
        self.combinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }

    /// Draw `amount` distinct label-sets (capped at the catalog size).
    pub fn sample<'a, R>(&'a self, rng: &mut R, amount: usize) -> Vec<&'a LabelSet>
    where
        R: Rng + ?Sized,
    {
        self.combinations.choose_multiple(rng, amount).collect()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Configuration errors are fatal at startup. Generation errors are scoped to
// a single tick: they are logged, counted and the loop moves on.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Emitter Errors
// ----------------------------------------------------------------------------

/// The main error type for the emitter.
#[derive(Error, Debug)]
pub enum EmitterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Exposition error: {0}")]
    Exposition(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EmitterError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            EmitterError::Config(_) => false,
            EmitterError::Generation(_) => true,
            EmitterError::Exposition(_) => true,
            EmitterError::Io(_) => true,
            EmitterError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            EmitterError::Config(_) => "config",
            EmitterError::Generation(_) => "generation",
            EmitterError::Exposition(_) => "exposition",
            EmitterError::Io(_) => "io",
            EmitterError::Internal(_) => "internal",
        }
    }
}

/// Result alias used across the emitter
pub type EmitterResult<T> = Result<T, EmitterError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unsupported metric type '{kind}' for metric '{metric}'")]
    UnsupportedMetricKind { metric: String, kind: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Generation Errors
// ----------------------------------------------------------------------------

/// Failures scoped to one tick of a background loop
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Metric '{metric}' is not registered")]
    UnknownMetric { metric: String },

    #[error("Label '{label}' has no value in the pattern label-set")]
    MissingLabel { label: String },

    #[error("Cannot sample a value for '{metric}': {source}")]
    InvalidDistribution { metric: String, source: NormalError },

    #[error("Counter '{metric}' cannot be incremented by {value}")]
    NegativeCounterIncrement { metric: String, value: f64 },

    #[error("Failed to record into '{metric}': {source}")]
    Record {
        metric: String,
        source: prometheus::Error,
    },
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Two documents: the emitter document (metrics, labels, chaos, loop timing,
// server, logging, supervision) and the pattern document (phase schedule).
// Both accept YAML or TOML with CHAOS_EMITTER_* environment overrides.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Document Loading
// ----------------------------------------------------------------------------

/// Load one document from disk, layering env overrides on top.
fn load_document<T: DeserializeOwned>(path: &Path, env_prefix: &str) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    );
    let figment = if is_yaml {
        Figment::from(Yaml::file(path))
    } else {
        Figment::from(Toml::file(path))
    };

    figment
        .merge(Env::prefixed(env_prefix).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

fn check_finite_non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid_value(
            field,
            format!("must be a finite, non-negative number (got {})", value),
        ));
    }
    Ok(())
}

/// A seconds value that must become a `Duration`.
fn check_duration_seconds(field: &str, value: f64) -> Result<(), ConfigError> {
    check_finite_non_negative(field, value)?;
    Duration::try_from_secs_f64(value).map(|_| ()).map_err(|e| {
        ConfigError::invalid_value(field, format!("not a representable duration ({}): {}", value, e))
    })
}

/// Seconds to `Duration`, saturating instead of panicking on values that
/// skipped validation.
#[inline]
fn duration_from_secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

// ----------------------------------------------------------------------------
// 5.2 Emitter Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the emitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterConfig {
    /// Metric definitions keyed by metric name
    pub metrics: BTreeMap<String, MetricDefinition>,

    /// Label name -> value domain
    pub labels: BTreeMap<String, Vec<LabelValue>>,

    /// Chaos toggles and probabilities
    #[serde(default)]
    pub chaos: ChaosConfig,

    /// Seconds slept per processed metric
    #[serde(default = "default_update_interval")]
    pub update_interval_seconds: f64,

    /// Label-sets sampled per metric per tick
    #[serde(default = "default_num_label_combinations")]
    pub num_label_combinations: usize,

    /// Where the generator sleeps within a pass
    #[serde(default)]
    pub sleep_mode: SleepMode,

    /// HTTP surface
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Generator task supervision
    #[serde(default)]
    pub supervision: SupervisionConfig,
}

impl EmitterConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = load_document(path.as_ref(), EMITTER_ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML string (for testing)
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Yaml::string(yaml))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration_seconds("update_interval_seconds", self.update_interval_seconds)?;
        check_duration_seconds(
            "supervision.restart_backoff_seconds",
            self.supervision.restart_backoff_seconds,
        )?;

        if !self.chaos.latency_drift_per_tick.is_finite() {
            return Err(ConfigError::invalid_value(
                "chaos.latency_drift_per_tick",
                "must be finite",
            ));
        }

        for (name, definition) in &self.metrics {
            if !definition.base_value.is_finite() {
                return Err(ConfigError::invalid_value(
                    format!("metrics.{}.base_value", name),
                    "must be finite",
                ));
            }
            check_finite_non_negative(&format!("metrics.{}.variance", name), definition.variance)?;
        }

        for name in self.labels.keys() {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid_value("labels", "label names must not be empty"));
            }
        }

        Ok(())
    }

    /// Chaos probabilities outside [0, 1]. They are accepted as-is; callers
    /// only report them.
    pub fn out_of_range_probabilities(&self) -> Vec<(&'static str, f64)> {
        let chaos = &self.chaos;
        [
            ("missing_metric_chance", chaos.missing_metric_chance),
            ("dropout_chance", chaos.dropout_chance),
            ("status_flip_chance", chaos.status_flip_chance),
            ("spike_chance", chaos.spike_chance),
        ]
        .into_iter()
        .filter(|(_, p)| !(0.0..=1.0).contains(p))
        .collect()
    }

    /// An example document for `generate-config`
    pub fn example() -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            "http_requests_total".to_string(),
            MetricDefinition::new(MetricKind::Counter, 5.0, 2.0)
                .with_description("Total HTTP requests served"),
        );
        metrics.insert(
            DEFAULT_PATTERN_HISTOGRAM.to_string(),
            MetricDefinition::new(MetricKind::Histogram, 0.25, 0.1)
                .with_description("HTTP request latency")
                .with_buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        );
        metrics.insert(
            DEFAULT_PATTERN_GAUGE.to_string(),
            MetricDefinition::new(MetricKind::Gauge, 0.5, 0.2)
                .with_description("Maximum HTTP request latency"),
        );
        metrics.insert(
            "cache_hit_ratio".to_string(),
            MetricDefinition::new(MetricKind::Gauge, 0.9, 0.05)
                .with_description("Cache hit ratio")
                .with_drift(DriftDirection::Down),
        );

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), vec!["orders".into(), "payments".into()]);
        labels.insert("env".to_string(), vec!["prod".into()]);
        labels.insert("method".to_string(), vec!["GET".into(), "POST".into()]);
        labels.insert("status".to_string(), vec!["200".into(), "500".into()]);
        labels.insert("uri".to_string(), vec!["/api/data".into(), "/api/orders".into()]);

        Self {
            metrics,
            labels,
            chaos: ChaosConfig::default(),
            update_interval_seconds: DEFAULT_UPDATE_INTERVAL_SECS,
            num_label_combinations: DEFAULT_NUM_LABEL_COMBINATIONS,
            sleep_mode: SleepMode::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            supervision: SupervisionConfig::default(),
        }
    }

    /// Render the example document as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

fn default_update_interval() -> f64 {
    DEFAULT_UPDATE_INTERVAL_SECS
}

fn default_num_label_combinations() -> usize {
    DEFAULT_NUM_LABEL_COMBINATIONS
}

/// Where the generator loop sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepMode {
    /// After every processed metric (period = metrics x interval)
    #[default]
    PerMetric,
    /// Once after a full pass over all metrics
    PerPass,
}

// ----------------------------------------------------------------------------
// 5.3 Chaos Configuration
// ----------------------------------------------------------------------------

/// Chaos toggles and probabilities. Probabilities are not range-checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosConfig {
    #[serde(default)]
    pub enable_missing_metrics: bool,
    #[serde(default)]
    pub missing_metric_chance: f64,

    #[serde(default)]
    pub enable_dropouts: bool,
    #[serde(default)]
    pub dropout_chance: f64,

    #[serde(default)]
    pub enable_status_flips: bool,
    #[serde(default)]
    pub status_flip_chance: f64,

    #[serde(default)]
    pub enable_spikes: bool,
    #[serde(default)]
    pub spike_chance: f64,
    #[serde(default = "default_spike_multiplier")]
    pub spike_multiplier: f64,

    #[serde(default)]
    pub enable_latency_trend: bool,
    #[serde(default = "default_latency_drift")]
    pub latency_drift_per_tick: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enable_missing_metrics: false,
            missing_metric_chance: 0.0,
            enable_dropouts: false,
            dropout_chance: 0.0,
            enable_status_flips: false,
            status_flip_chance: 0.0,
            enable_spikes: false,
            spike_chance: 0.0,
            spike_multiplier: default_spike_multiplier(),
            enable_latency_trend: false,
            latency_drift_per_tick: default_latency_drift(),
        }
    }
}

fn default_spike_multiplier() -> f64 {
    1.0
}

fn default_latency_drift() -> f64 {
    DEFAULT_LATENCY_DRIFT_PER_TICK
}

// ----------------------------------------------------------------------------
// 5.4 Server, Supervision & Logging Configuration
// ----------------------------------------------------------------------------

/// HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP surface
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_HTTP_PORT)
}

/// What the supervisor does when the generator task ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Log and respawn after the backoff
    #[default]
    Restart,
    /// Log and stop generating; the HTTP surface keeps serving
    Halt,
}

/// Generator task supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Delay before a restart (seconds)
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_seconds: f64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::default(),
            restart_backoff_seconds: default_restart_backoff(),
        }
    }
}

fn default_restart_backoff() -> f64 {
    DEFAULT_RESTART_BACKOFF_SECS
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory holding chaos.log and pattern.log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.5 Pattern Configuration
// ----------------------------------------------------------------------------

/// Root of the pattern document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternConfig {
    #[serde(default)]
    pub pattern_generator: PatternGeneratorConfig,
}

impl PatternConfig {
    /// Load the pattern document with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = load_document(path.as_ref(), PATTERN_ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the pattern document, or a disabled schedule if there is none
    pub fn load_or_disabled<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::FileNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    /// Load from a YAML string (for testing)
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Yaml::string(yaml))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pattern_generator.validate()
    }

    /// An example schedule for `generate-config --pattern`
    pub fn example() -> Self {
        let phase = |name: &str, start: f64, duration: f64, status: &str, latency: f64| {
            PhaseDefinition {
                name: name.to_string(),
                start_seconds: start,
                duration_seconds: duration,
                status: status.into(),
                latency,
                max_latency: None,
                generate: true,
                interval_seconds: DEFAULT_PHASE_INTERVAL_SECS,
            }
        };

        Self {
            pattern_generator: PatternGeneratorConfig {
                enabled: true,
                phases: vec![
                    phase("healthy", 0.0, 120.0, "200", 0.1),
                    phase("degraded", 120.0, 60.0, "500", 1.8),
                    PhaseDefinition {
                        max_latency: Some(1.2),
                        interval_seconds: 2.0,
                        ..phase("recovering", 180.0, 60.0, "200", 0.4)
                    },
                    PhaseDefinition {
                        generate: false,
                        ..phase("quiet", 240.0, 30.0, "200", 0.1)
                    },
                ],
                ..PatternGeneratorConfig::default()
            },
        }
    }

    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

/// The phase schedule and where its observations land
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternGeneratorConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Ordered phase schedule
    #[serde(default)]
    pub phases: Vec<PhaseDefinition>,

    /// Histogram receiving phase latency
    #[serde(default = "default_pattern_histogram")]
    pub histogram_metric: String,

    /// Gauge receiving phase max latency
    #[serde(default = "default_pattern_gauge")]
    pub gauge_metric: String,

    /// Fixed label values; `status` is replaced by the phase status
    #[serde(default = "default_pattern_labels")]
    pub labels: BTreeMap<String, LabelValue>,
}

impl Default for PatternGeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            phases: Vec::new(),
            histogram_metric: default_pattern_histogram(),
            gauge_metric: default_pattern_gauge(),
            labels: default_pattern_labels(),
        }
    }
}

impl PatternGeneratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (idx, phase) in self.phases.iter().enumerate() {
            let field = |name: &str| format!("pattern_generator.phases[{}].{}", idx, name);
            check_finite_non_negative(&field("start_seconds"), phase.start_seconds)?;
            check_finite_non_negative(&field("duration_seconds"), phase.duration_seconds)?;
            check_duration_seconds(&field("interval_seconds"), phase.interval_seconds)?;
            if !phase.latency.is_finite() {
                return Err(ConfigError::invalid_value(field("latency"), "must be finite"));
            }
            if let Some(max_latency) = phase.max_latency {
                if !max_latency.is_finite() {
                    return Err(ConfigError::invalid_value(field("max_latency"), "must be finite"));
                }
            }
        }
        Ok(())
    }

    /// Phase lookup: the first phase whose half-open window
    /// `[start, start + duration)` contains `elapsed_secs`.
    pub fn phase_at(&self, elapsed_secs: f64) -> PhaseLookup {
        self.phases
            .iter()
            .find(|phase| phase.contains(elapsed_secs))
            .cloned()
            .map(PhaseLookup::Active)
            .unwrap_or(PhaseLookup::Completed)
    }
}

fn default_pattern_histogram() -> String {
    DEFAULT_PATTERN_HISTOGRAM.into()
}

fn default_pattern_gauge() -> String {
    DEFAULT_PATTERN_GAUGE.into()
}

fn default_pattern_labels() -> BTreeMap<String, LabelValue> {
    [
        ("app", "mock_pattern"),
        ("status", DEFAULT_PHASE_STATUS),
        ("method", "GET"),
        ("uri", "/api/data"),
        ("env", "prod"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), LabelValue::from(v)))
    .collect()
}

/// One scripted interval of behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    #[serde(default = "default_phase_name")]
    pub name: String,

    /// Offset from the epoch (seconds)
    #[serde(default)]
    pub start_seconds: f64,

    #[serde(default)]
    pub duration_seconds: f64,

    /// Status label value for emissions
    #[serde(default = "default_phase_status")]
    pub status: LabelValue,

    /// Latency observed into the histogram (seconds)
    #[serde(default = "default_phase_latency")]
    pub latency: f64,

    /// Value set on the max-latency gauge; `latency * 1.5` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<f64>,

    #[serde(default = "default_true")]
    pub generate: bool,

    /// Sleep between emissions (seconds)
    #[serde(default = "default_phase_interval")]
    pub interval_seconds: f64,
}

impl PhaseDefinition {
    #[inline]
    pub fn contains(&self, elapsed_secs: f64) -> bool {
        self.start_seconds <= elapsed_secs && elapsed_secs < self.start_seconds + self.duration_seconds
    }

    #[inline]
    pub fn effective_max_latency(&self) -> f64 {
        self.max_latency.unwrap_or(self.latency * MAX_LATENCY_FACTOR)
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        duration_from_secs(self.interval_seconds)
    }
}

fn default_phase_name() -> String {
    "unknown".into()
}

fn default_phase_status() -> LabelValue {
    LabelValue::from(DEFAULT_PHASE_STATUS)
}

fn default_phase_latency() -> f64 {
    DEFAULT_PHASE_LATENCY
}

fn default_phase_interval() -> f64 {
    DEFAULT_PHASE_INTERVAL_SECS
}

/// Result of a phase lookup: a configured phase, or the synthetic
/// `completed` phase once the schedule has run out.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseLookup {
    Active(PhaseDefinition),
    Completed,
}

impl PhaseLookup {
    pub fn name(&self) -> &str {
        match self {
            PhaseLookup::Active(phase) => &phase.name,
            PhaseLookup::Completed => COMPLETED_PHASE_NAME,
        }
    }

    /// Whether this phase emits observations
    pub fn generates(&self) -> bool {
        match self {
            PhaseLookup::Active(phase) => phase.generate,
            PhaseLookup::Completed => false,
        }
    }

    pub fn phase(&self) -> Option<&PhaseDefinition> {
        match self {
            PhaseLookup::Active(phase) => Some(phase),
            PhaseLookup::Completed => None,
        }
    }
}

impl Serialize for PhaseLookup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct CompletedPhase {
            name: &'static str,
            generate: bool,
        }

        match self {
            PhaseLookup::Active(phase) => phase.serialize(serializer),
            PhaseLookup::Completed => CompletedPhase {
                name: COMPLETED_PHASE_NAME,
                generate: false,
            }
            .serialize(serializer),
        }
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// One stdout layer (pretty/compact/json, EnvFilter) plus two append-only file
// sinks selected by tracing target: chaos.log and pattern.log.
// ============================================================================

/// Keeps the non-blocking file writers flushing; hold for the process lifetime.
#[derive(Debug)]
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
    /// Directory the file sinks write into, if they were set up
    pub dir: Option<PathBuf>,
}

/// Resolve the log directory: `LOG_DIR`, then config, then `./logs`
pub fn resolve_log_dir(config: &LoggingConfig) -> PathBuf {
    std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .or_else(|| config.dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

/// Create the log directory and touch both sink files.
pub fn prepare_log_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    for file in [CHAOS_LOG_FILE, PATTERN_LOG_FILE] {
        OpenOptions::new().create(true).append(true).open(dir.join(file))?;
    }
    Ok(())
}

fn parse_level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> EmitterResult<LogGuards> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level_filter(&config.level).into())
        .from_env_lossy();

    let stdout_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        "compact" => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> =
        vec![stdout_layer.with_filter(env_filter).boxed()];
    let mut guards = Vec::new();
    let mut sink_failure = None;

    let dir = resolve_log_dir(config);
    let sinks_ready = match prepare_log_dir(&dir) {
        Ok(()) => true,
        Err(e) => {
            sink_failure = Some(format!("{}: {}", dir.display(), e));
            false
        }
    };

    if sinks_ready {
        for (file, target) in [
            (CHAOS_LOG_FILE, CHAOS_LOG_TARGET),
            (PATTERN_LOG_FILE, PATTERN_LOG_TARGET),
        ] {
            let appender = match RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file)
                .build(&dir)
            {
                Ok(appender) => appender,
                Err(e) => {
                    sink_failure = Some(format!("{}: {}", dir.join(file).display(), e));
                    continue;
                }
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(Targets::new().with_target(target, LevelFilter::DEBUG))
                    .boxed(),
            );
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| EmitterError::Internal(format!("Failed to set logger: {}", e)))?;

    if let Some(failure) = sink_failure {
        warn!(target: "chaos_emitter::init", "Unable to create log sink {}", failure);
    }

    info!(
        target: "chaos_emitter::init",
        level = %config.level,
        format = %config.format,
        dir = %dir.display(),
        "Logging initialized"
    );

    Ok(LogGuards {
        _guards: guards,
        dir: sinks_ready.then_some(dir),
    })
}

// ============================================================================
// SECTION 7: METRIC REGISTRY
// ============================================================================
// Typed, labeled metric families keyed by name, created once from the
// configuration. Aggregation relies on the prometheus crate's internally
// synchronised vectors: atomic counters and gauges, and histograms whose
// hot/cold shards give consistent bucket/sum/count snapshots to readers.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Metric Handles
// ----------------------------------------------------------------------------

/// A metric family, tagged by kind.
#[derive(Clone)]
pub enum MetricHandle {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

impl Debug for MetricHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MetricHandle::{}", self.kind())
    }
}

impl MetricHandle {
    fn build(
        name: &str,
        help: &str,
        kind: MetricKind,
        definition: &MetricDefinition,
        label_names: &[&str],
    ) -> prometheus::Result<Self> {
        Ok(match kind {
            MetricKind::Counter => {
                MetricHandle::Counter(CounterVec::new(Opts::new(name, help), label_names)?)
            }
            MetricKind::Gauge => {
                MetricHandle::Gauge(GaugeVec::new(Opts::new(name, help), label_names)?)
            }
            MetricKind::Histogram => {
                let buckets = definition
                    .buckets
                    .clone()
                    .unwrap_or_else(|| DEFAULT_HISTOGRAM_BUCKETS.to_vec());
                check_buckets(&buckets)?;
                MetricHandle::Histogram(HistogramVec::new(
                    HistogramOpts::new(name, help).buckets(buckets),
                    label_names,
                )?)
            }
        })
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricHandle::Counter(_) => MetricKind::Counter,
            MetricHandle::Gauge(_) => MetricKind::Gauge,
            MetricHandle::Histogram(_) => MetricKind::Histogram,
        }
    }

    fn collector(&self) -> Box<dyn Collector> {
        match self {
            MetricHandle::Counter(vec) => Box::new(vec.clone()),
            MetricHandle::Gauge(vec) => Box::new(vec.clone()),
            MetricHandle::Histogram(vec) => Box::new(vec.clone()),
        }
    }
}

/// Histogram children are built lazily, so bucket problems are caught here
/// instead of on the first observation.
fn check_buckets(buckets: &[f64]) -> prometheus::Result<()> {
    if buckets.iter().any(|b| b.is_nan()) {
        return Err(prometheus::Error::Msg("histogram buckets must not be NaN".into()));
    }
    if !buckets.windows(2).all(|w| w[0] < w[1]) {
        return Err(prometheus::Error::Msg(
            "histogram buckets must be in strictly increasing order".into(),
        ));
    }
    Ok(())
}

/// Point-in-time view of one metric instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstanceSnapshot {
    Counter(f64),
    Gauge(f64),
    Histogram { count: u64, sum: f64 },
}

// ----------------------------------------------------------------------------
// 7.2 Registered Metrics
// ----------------------------------------------------------------------------

/// One named metric family with its definition.
#[derive(Debug, Clone)]
pub struct RegisteredMetric {
    name: String,
    definition: MetricDefinition,
    handle: MetricHandle,
}

impl RegisteredMetric {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.handle.kind()
    }

    pub fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    pub fn handle(&self) -> &MetricHandle {
        &self.handle
    }

    /// Record one observation with the kind's aggregation: counters add,
    /// gauges set, histograms observe.
    pub fn record(&self, labels: &LabelSet, value: f64) -> Result<(), GenerationError> {
        let values = labels.values();
        let result = match &self.handle {
            MetricHandle::Counter(vec) => {
                if value.is_nan() || value < 0.0 {
                    return Err(GenerationError::NegativeCounterIncrement {
                        metric: self.name.clone(),
                        value,
                    });
                }
                vec.get_metric_with_label_values(&values)
                    .map(|counter| counter.inc_by(value))
            }
            MetricHandle::Gauge(vec) => vec
                .get_metric_with_label_values(&values)
                .map(|gauge| gauge.set(value)),
            MetricHandle::Histogram(vec) => vec
                .get_metric_with_label_values(&values)
                .map(|histogram| histogram.observe(value)),
        };

        result.map_err(|source| GenerationError::Record {
            metric: self.name.clone(),
            source,
        })
    }

    /// Read one instance. Reading an unseen label-set creates it at zero.
    pub fn snapshot(&self, labels: &LabelSet) -> prometheus::Result<InstanceSnapshot> {
        let values = labels.values();
        Ok(match &self.handle {
            MetricHandle::Counter(vec) => {
                InstanceSnapshot::Counter(vec.get_metric_with_label_values(&values)?.get())
            }
            MetricHandle::Gauge(vec) => {
                InstanceSnapshot::Gauge(vec.get_metric_with_label_values(&values)?.get())
            }
            MetricHandle::Histogram(vec) => {
                let histogram = vec.get_metric_with_label_values(&values)?;
                InstanceSnapshot::Histogram {
                    count: histogram.get_sample_count(),
                    sum: histogram.get_sample_sum(),
                }
            }
        })
    }
}

// ----------------------------------------------------------------------------
// 7.3 Metric Registry
// ----------------------------------------------------------------------------

/// All synthetic metrics plus the Prometheus registry that exposes them.
pub struct MetricRegistry {
    registry: PrometheusRegistry,
    label_names: Vec<CompactString>,
    metrics: BTreeMap<String, RegisteredMetric>,
}

impl Debug for MetricRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("label_names", &self.label_names)
            .field("metrics", &self.metrics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MetricRegistry {
    /// Build every configured metric family. All kinds are resolved before
    /// anything is registered, so an unsupported kind leaves nothing behind.
    pub fn create(
        definitions: &BTreeMap<String, MetricDefinition>,
        label_names: &[CompactString],
    ) -> Result<Self, ConfigError> {
        let resolved = definitions
            .iter()
            .map(|(name, definition)| {
                MetricKind::parse(name, &definition.kind).map(|kind| (name, definition, kind))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let registry = PrometheusRegistry::new();
        let names: Vec<&str> = label_names.iter().map(|n| n.as_str()).collect();
        let mut metrics = BTreeMap::new();

        for (name, definition, kind) in resolved {
            let help = definition
                .description
                .as_deref()
                .filter(|d| !d.is_empty())
                .unwrap_or(name);
            let handle = MetricHandle::build(name, help, kind, definition, &names)
                .map_err(|e| ConfigError::invalid_value(format!("metrics.{}", name), e.to_string()))?;
            registry
                .register(handle.collector())
                .map_err(|e| ConfigError::invalid_value(format!("metrics.{}", name), e.to_string()))?;

            metrics.insert(
                name.clone(),
                RegisteredMetric {
                    name: name.clone(),
                    definition: definition.clone(),
                    handle,
                },
            );
        }

        Ok(Self {
            registry,
            label_names: label_names.to_vec(),
            metrics,
        })
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredMetric> {
        self.metrics.get(name)
    }

    /// Metric names in iteration order
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.metrics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Label names every family was declared with
    pub fn label_names(&self) -> &[CompactString] {
        &self.label_names
    }

    pub fn record(&self, name: &str, labels: &LabelSet, value: f64) -> Result<(), GenerationError> {
        self.get(name)
            .ok_or_else(|| GenerationError::UnknownMetric {
                metric: name.to_string(),
            })?
            .record(labels, value)
    }

    /// Register an extra collector (e.g. process metrics) for exposition.
    pub fn register_collector(&self, collector: Box<dyn Collector>) -> prometheus::Result<()> {
        self.registry.register(collector)
    }

    /// Render current state in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

// ============================================================================
// SECTION 8: CHAOS MODEL
// ============================================================================
// Per-tick perturbations. Every decision draws from a caller-supplied random
// source, so a seeded rng makes a whole tick reproducible. The trend state is
// the only mutable state and is owned by the model instance.
// ============================================================================

/// Bernoulli draw as `uniform[0,1) < chance`; out-of-range chances saturate.
#[inline]
fn bernoulli<R: Rng + ?Sized>(rng: &mut R, chance: f64) -> bool {
    rng.gen::<f64>() < chance
}

/// Draw from `Normal(mean, std_dev)` clamped at zero. A zero deviation
/// returns the mean without touching the rng.
pub fn sample_normal<R: Rng + ?Sized>(mean: f64, std_dev: f64, rng: &mut R) -> Result<f64, NormalError> {
    if std_dev == 0.0 {
        return Ok(mean.max(0.0));
    }
    let normal = Normal::new(mean, std_dev)?;
    Ok(normal.sample(rng).max(0.0))
}

/// A synthesized value and whether a spike multiplied it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesizedValue {
    pub value: f64,
    pub spiked: bool,
}

/// Chaos decisions plus the per-metric trend state.
#[derive(Debug)]
pub struct ChaosModel {
    config: ChaosConfig,
    trend: DashMap<String, f64>,
    directions: HashMap<String, DriftDirection>,
}

impl ChaosModel {
    /// Seed the trend state from each definition's base value.
    pub fn new(config: ChaosConfig, definitions: &BTreeMap<String, MetricDefinition>) -> Self {
        Self {
            config,
            trend: definitions
                .iter()
                .map(|(name, d)| (name.clone(), d.base_value))
                .collect(),
            directions: definitions
                .iter()
                .map(|(name, d)| (name.clone(), d.drift_direction))
                .collect(),
        }
    }

    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Whether a metric sits out this tick.
    pub fn skip_metric<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.config.enable_missing_metrics && bernoulli(rng, self.config.missing_metric_chance)
    }

    /// Whether one sampled label-set is dropped.
    pub fn skip_labelset<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.config.enable_dropouts && bernoulli(rng, self.config.dropout_chance)
    }

    /// Copy of `labels`, possibly with `status` redrawn from {"200","500"}.
    /// The input is never modified.
    pub fn flip_status<R: Rng + ?Sized>(&self, labels: &LabelSet, rng: &mut R) -> LabelSet {
        let mut flipped = labels.clone();
        if self.config.enable_status_flips
            && bernoulli(rng, self.config.status_flip_chance)
            && flipped.contains_key(STATUS_LABEL)
        {
            if let Some(status) = STATUS_FLIP_VALUES.choose(rng) {
                flipped.set(STATUS_LABEL, *status);
            }
        }
        flipped
    }

    /// Advance the metric's trend by one drift step and return it floored at
    /// zero. With latency trend disabled, returns `configured_base` and leaves
    /// the state alone.
    pub fn apply_trend(&self, metric: &str, configured_base: f64) -> f64 {
        if !self.config.enable_latency_trend {
            return configured_base;
        }

        let direction = self.directions.get(metric).copied().unwrap_or_default();
        let drift = self.config.latency_drift_per_tick * direction.sign();

        let mut state = self
            .trend
            .entry(metric.to_string())
            .or_insert(configured_base);
        *state += drift;
        (*state).max(0.0)
    }

    /// Current trend state for a metric (unclamped)
    pub fn trend_value(&self, metric: &str) -> Option<f64> {
        self.trend.get(metric).map(|v| *v)
    }

    #[inline]
    fn spike_fires<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.config.enable_spikes && bernoulli(rng, self.config.spike_chance)
    }

    /// Multiply by `spike_multiplier` with probability `spike_chance`.
    pub fn maybe_spike<R: Rng + ?Sized>(&self, value: f64, rng: &mut R) -> f64 {
        if self.spike_fires(rng) {
            value * self.config.spike_multiplier
        } else {
            value
        }
    }

    /// trend -> normal sample (clamped) -> spike
    pub fn synthesize<R: Rng + ?Sized>(
        &self,
        metric: &str,
        definition: &MetricDefinition,
        rng: &mut R,
    ) -> Result<SynthesizedValue, GenerationError> {
        let base = self.apply_trend(metric, definition.base_value);
        let raw = sample_normal(base, definition.variance, rng).map_err(|source| {
            GenerationError::InvalidDistribution {
                metric: metric.to_string(),
                source,
            }
        })?;

        let spiked = self.spike_fires(rng);
        let value = if spiked {
            raw * self.config.spike_multiplier
        } else {
            raw
        };

        Ok(SynthesizedValue { value, spiked })
    }
}

// ============================================================================
// SECTION 9: TESTS - CORE, CONFIGURATION, REGISTRY & CHAOS
// ============================================================================


// ============================================================================
// SECTION 10: CONTINUOUS GENERATOR LOOP
// ============================================================================
// One pass visits every registered metric in registry order. For each metric
// the chaos model decides whether it sits out, a single value is synthesized
// and recorded into a random sample of label-sets (minus dropouts, with
// possible status flips). Per-tick errors are logged and counted; the loop
// itself never returns.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Generator Statistics
// ----------------------------------------------------------------------------

/// Atomic counters maintained by the generator loop
#[derive(Debug, Default)]
pub struct GeneratorStats {
    passes: AtomicU64,
    metrics_recorded: AtomicU64,
    observations: AtomicU64,
    metrics_skipped: AtomicU64,
    label_sets_dropped: AtomicU64,
    status_flips: AtomicU64,
    spikes: AtomicU64,
    errors: AtomicU64,
}

impl GeneratorStats {
    pub fn snapshot(&self) -> GeneratorStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(AtomicOrdering::Relaxed);
        GeneratorStatsSnapshot {
            passes: load(&self.passes),
            metrics_recorded: load(&self.metrics_recorded),
            observations: load(&self.observations),
            metrics_skipped: load(&self.metrics_skipped),
            label_sets_dropped: load(&self.label_sets_dropped),
            status_flips: load(&self.status_flips),
            spikes: load(&self.spikes),
            errors: load(&self.errors),
        }
    }

    #[inline]
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, AtomicOrdering::Relaxed);
    }
}

/// Point-in-time copy of [`GeneratorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeneratorStatsSnapshot {
    pub passes: u64,
    pub metrics_recorded: u64,
    pub observations: u64,
    pub metrics_skipped: u64,
    pub label_sets_dropped: u64,
    pub status_flips: u64,
    pub spikes: u64,
    pub errors: u64,
}

// ----------------------------------------------------------------------------
// 10.2 Generator
// ----------------------------------------------------------------------------

/// Loop timing and sampling parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratorSettings {
    pub update_interval: Duration,
    pub num_label_combinations: usize,
    pub sleep_mode: SleepMode,
}

impl GeneratorSettings {
    pub fn from_config(config: &EmitterConfig) -> Self {
        Self {
            update_interval: duration_from_secs(config.update_interval_seconds),
            num_label_combinations: config.num_label_combinations,
            sleep_mode: config.sleep_mode,
        }
    }
}

/// What one metric tick did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Missing-metric chaos fired; nothing recorded, no sleep
    Skipped,
    /// `value` recorded into `label_sets` label-sets
    Recorded { label_sets: usize, value: f64 },
}

/// The continuous generator
#[derive(Debug)]
pub struct MetricGenerator {
    registry: Arc<MetricRegistry>,
    catalog: Arc<LabelCatalog>,
    chaos: Arc<ChaosModel>,
    settings: GeneratorSettings,
    stats: GeneratorStats,
}

impl MetricGenerator {
    pub fn new(
        registry: Arc<MetricRegistry>,
        catalog: Arc<LabelCatalog>,
        chaos: Arc<ChaosModel>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            registry,
            catalog,
            chaos,
            settings,
            stats: GeneratorStats::default(),
        }
    }

    pub fn stats(&self) -> &GeneratorStats {
        &self.stats
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Run one metric through the chaos pipeline and record it.
    pub fn tick_metric<R: Rng + ?Sized>(
        &self,
        name: &str,
        rng: &mut R,
    ) -> Result<TickOutcome, GenerationError> {
        let metric = self
            .registry
            .get(name)
            .ok_or_else(|| GenerationError::UnknownMetric {
                metric: name.to_string(),
            })?;

        if self.chaos.skip_metric(rng) {
            GeneratorStats::bump(&self.stats.metrics_skipped, 1);
            debug!(target: CHAOS_LOG_TARGET, metric = name, "Metric missing this tick");
            return Ok(TickOutcome::Skipped);
        }

        let synthesized = self.chaos.synthesize(name, metric.definition(), rng)?;
        if synthesized.spiked {
            GeneratorStats::bump(&self.stats.spikes, 1);
            debug!(
                target: CHAOS_LOG_TARGET,
                metric = name,
                value = synthesized.value,
                "Spike applied"
            );
        }

        let mut recorded = 0usize;
        for labels in self.catalog.sample(rng, self.settings.num_label_combinations) {
            if self.chaos.skip_labelset(rng) {
                GeneratorStats::bump(&self.stats.label_sets_dropped, 1);
                debug!(
                    target: CHAOS_LOG_TARGET,
                    metric = name,
                    labels = %labels.render(),
                    "Label-set dropped"
                );
                continue;
            }

            let flipped = self.chaos.flip_status(labels, rng);
            if flipped.value_of(STATUS_LABEL) != labels.value_of(STATUS_LABEL) {
                GeneratorStats::bump(&self.stats.status_flips, 1);
                debug!(
                    target: CHAOS_LOG_TARGET,
                    metric = name,
                    labels = %flipped.render(),
                    "Status flipped"
                );
            }

            metric.record(&flipped, synthesized.value)?;
            recorded += 1;
        }

        GeneratorStats::bump(&self.stats.metrics_recorded, 1);
        GeneratorStats::bump(&self.stats.observations, recorded as u64);

        Ok(TickOutcome::Recorded {
            label_sets: recorded,
            value: synthesized.value,
        })
    }

    /// One pass over every metric, sleeping per the configured mode.
    ///
    /// A pass that processed nothing (empty registry, every metric skipped)
    /// still sleeps once so the loop cannot spin.
    pub async fn run_pass<R: Rng + Send + ?Sized>(&self, rng: &mut R) {
        let mut processed = 0usize;

        for name in self.registry.names() {
            match self.tick_metric(name, rng) {
                Ok(TickOutcome::Skipped) => continue,
                Ok(TickOutcome::Recorded { .. }) => {}
                Err(e) => {
                    GeneratorStats::bump(&self.stats.errors, 1);
                    warn!(metric = name, error = %e, "Generation tick failed");
                }
            }

            processed += 1;
            if self.settings.sleep_mode == SleepMode::PerMetric {
                sleep(self.settings.update_interval).await;
            }
        }

        GeneratorStats::bump(&self.stats.passes, 1);
        if self.settings.sleep_mode == SleepMode::PerPass || processed == 0 {
            sleep(self.settings.update_interval).await;
        }

        debug!(stats = ?self.stats.snapshot(), "Generator pass complete");
    }

    /// Loop forever. Meant to be spawned under [`supervise`].
    pub async fn run(self: Arc<Self>) {
        let mut rng = StdRng::from_entropy();
        info!(
            metrics = self.registry.len(),
            label_sets = self.catalog.len(),
            interval_secs = self.settings.update_interval.as_secs_f64(),
            sleep_mode = ?self.settings.sleep_mode,
            "Generator loop started"
        );

        loop {
            self.run_pass(&mut rng).await;
        }
    }
}

// ============================================================================
// SECTION 11: TASK SUPERVISION
// ============================================================================
// The generator runs as a child task of a supervisor. When the child ends
// (panic or unexpected return) the supervisor applies the restart policy.
// Cancellation aborts the child and returns.
// ============================================================================

/// How a supervisor finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisionOutcome {
    pub restarts: u64,
    /// True when the task ended and the policy was `halt`
    pub halted: bool,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Spawn `factory()` and keep it running according to `config`.
pub async fn supervise<F, Fut>(
    name: &'static str,
    config: SupervisionConfig,
    token: CancellationToken,
    mut factory: F,
) -> SupervisionOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let backoff = duration_from_secs(config.restart_backoff_seconds);
    let mut restarts = 0u64;

    loop {
        let mut handle = tokio::spawn(factory());

        let result = tokio::select! {
            _ = token.cancelled() => {
                handle.abort();
                let _ = handle.await;
                info!(task = name, restarts, "Supervised task cancelled");
                return SupervisionOutcome { restarts, halted: false };
            }
            result = &mut handle => result,
        };

        match result {
            Ok(()) => warn!(task = name, "Supervised task returned unexpectedly"),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                error!(task = name, panic = %message, "Supervised task panicked");
            }
            Err(e) => warn!(task = name, error = %e, "Supervised task ended"),
        }

        match config.restart_policy {
            RestartPolicy::Halt => {
                error!(task = name, "Restart policy is halt; generation stopped");
                return SupervisionOutcome {
                    restarts,
                    halted: true,
                };
            }
            RestartPolicy::Restart => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return SupervisionOutcome { restarts, halted: false };
                    }
                    _ = sleep(backoff) => {}
                }
                restarts += 1;
                info!(task = name, restarts, "Restarting supervised task");
            }
        }
    }
}

// ============================================================================
// SECTION 12: PATTERN PHASE SCHEDULER
// ============================================================================
// A time-driven state machine: elapsed time since the epoch selects a phase,
// and generating phases feed fixed observations into the designated
// histogram and gauge on the phase's own cadence. The epoch is the only
// mutable control state and can be reset from the HTTP surface.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Scheduler Statistics
// ----------------------------------------------------------------------------

/// Counters for the scheduler loop. A generating tick with no designated
/// metric registered counts as an unrecorded tick, not an emission.
#[derive(Debug, Default)]
pub struct PatternStats {
    emissions: AtomicU64,
    unrecorded_ticks: AtomicU64,
    idle_polls: AtomicU64,
    errors: AtomicU64,
}

impl PatternStats {
    pub fn snapshot(&self) -> PatternStatsSnapshot {
        PatternStatsSnapshot {
            emissions: self.emissions.load(AtomicOrdering::Relaxed),
            unrecorded_ticks: self.unrecorded_ticks.load(AtomicOrdering::Relaxed),
            idle_polls: self.idle_polls.load(AtomicOrdering::Relaxed),
            errors: self.errors.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatternStatsSnapshot {
    pub emissions: u64,
    pub unrecorded_ticks: u64,
    pub idle_polls: u64,
    pub errors: u64,
}

// ----------------------------------------------------------------------------
// 12.2 Scheduler
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct SchedulerShared {
    config: PatternGeneratorConfig,
    registry: Arc<MetricRegistry>,
    epoch: Mutex<Option<Instant>>,
    stats: PatternStats,
}

impl SchedulerShared {
    fn elapsed(&self) -> Duration {
        let mut epoch = self.epoch.lock();
        epoch.get_or_insert_with(Instant::now).elapsed()
    }

    fn current_phase(&self) -> PhaseLookup {
        self.config.phase_at(self.elapsed().as_secs_f64())
    }

    fn pattern_labels(&self, phase: &PhaseDefinition) -> Result<LabelSet, GenerationError> {
        let mut labels = self.config.labels.clone();
        labels.insert(STATUS_LABEL.to_string(), phase.status.clone());
        project_labels(self.registry.label_names(), &labels)
    }

    fn emit(&self, phase: &PhaseDefinition) -> Result<usize, GenerationError> {
        let histogram = self.registry.get(&self.config.histogram_metric);
        let gauge = self.registry.get(&self.config.gauge_metric);
        let max_latency = phase.effective_max_latency();
        let mut recorded = 0usize;

        if histogram.is_some() || gauge.is_some() {
            let labels = self.pattern_labels(phase)?;
            if let Some(histogram) = histogram {
                histogram.record(&labels, phase.latency)?;
                recorded += 1;
            }
            if let Some(gauge) = gauge {
                gauge.record(&labels, max_latency)?;
                recorded += 1;
            }
        }

        info!(
            target: PATTERN_LOG_TARGET,
            phase = %phase.name,
            status = %phase.status,
            latency = phase.latency,
            max_latency,
            recorded,
            "Pattern emission"
        );
        Ok(recorded)
    }

    async fn run_loop(self: Arc<Self>, running: Arc<AtomicBool>) {
        info!(
            target: PATTERN_LOG_TARGET,
            phases = self.config.phases.len(),
            "Pattern scheduler started"
        );
        let mut last_phase: Option<String> = None;

        while running.load(AtomicOrdering::Acquire) {
            if !self.config.enabled {
                sleep(DISABLED_POLL_INTERVAL).await;
                continue;
            }

            let lookup = self.current_phase();
            if last_phase.as_deref() != Some(lookup.name()) {
                info!(target: PATTERN_LOG_TARGET, phase = lookup.name(), "Entered phase");
                last_phase = Some(lookup.name().to_string());
            }

            let phase = match lookup {
                PhaseLookup::Active(phase) if phase.generate => phase,
                _ => {
                    self.stats.idle_polls.fetch_add(1, AtomicOrdering::Relaxed);
                    sleep(IDLE_POLL_INTERVAL).await;
                    continue;
                }
            };

            match self.emit(&phase) {
                Ok(0) => {
                    self.stats.unrecorded_ticks.fetch_add(1, AtomicOrdering::Relaxed);
                }
                Ok(_) => {
                    self.stats.emissions.fetch_add(1, AtomicOrdering::Relaxed);
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(
                        target: PATTERN_LOG_TARGET,
                        phase = %phase.name,
                        error = %e,
                        "Pattern emission failed"
                    );
                }
            }

            sleep(phase.interval()).await;
        }

        info!(target: PATTERN_LOG_TARGET, "Pattern scheduler stopped");
    }
}

/// One spawned scheduler loop and the flag only that loop observes.
#[derive(Debug)]
struct LoopTask {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl LoopTask {
    fn is_live(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire) && !self.handle.is_finished()
    }
}

/// Drives the scripted phase schedule.
#[derive(Debug)]
pub struct PatternScheduler {
    shared: Arc<SchedulerShared>,
    task: Mutex<Option<LoopTask>>,
}

impl PatternScheduler {
    pub fn new(config: PatternGeneratorConfig, registry: Arc<MetricRegistry>) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                registry,
                epoch: Mutex::new(None),
                stats: PatternStats::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PatternGeneratorConfig {
        &self.shared.config
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.config.enabled
    }

    /// True while a loop is spawned, not asked to stop and not finished.
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(LoopTask::is_live)
    }

    pub fn stats(&self) -> &PatternStats {
        &self.shared.stats
    }

    /// The phase for the current elapsed time. Sets the epoch on first use.
    pub fn current_phase(&self) -> PhaseLookup {
        self.shared.current_phase()
    }

    /// Restart the schedule from elapsed = 0.
    pub fn reset_epoch(&self) {
        *self.shared.epoch.lock() = Some(Instant::now());
        info!(target: PATTERN_LOG_TARGET, "Pattern timer reset");
    }

    /// The label-set a phase emits with, ordered like the registry labels.
    pub fn pattern_labels(&self, phase: &PhaseDefinition) -> Result<LabelSet, GenerationError> {
        self.shared.pattern_labels(phase)
    }

    /// Record one observation for `phase` and write the pattern log line.
    /// Returns how many designated metrics were recorded; unregistered ones
    /// are skipped.
    pub fn emit(&self, phase: &PhaseDefinition) -> Result<usize, GenerationError> {
        self.shared.emit(phase)
    }

    /// Spawn the scheduler loop. Returns false (and does nothing) when
    /// already running or disabled.
    pub fn start(&self) -> bool {
        if !self.is_enabled() {
            info!(target: PATTERN_LOG_TARGET, "Pattern generator disabled");
            return false;
        }

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(LoopTask::is_live) {
            return false;
        }

        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        *task = Some(LoopTask {
            handle: tokio::spawn(shared.run_loop(Arc::clone(&running))),
            running,
        });
        true
    }

    /// Clear the running loop's flag and wait for it to finish its current
    /// iteration. A loop started meanwhile has its own flag and keeps running.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(LoopTask { running, handle }) = task {
            running.store(false, AtomicOrdering::Release);
            if let Err(e) = handle.await {
                warn!(target: PATTERN_LOG_TARGET, error = %e, "Pattern task ended abnormally");
            }
        }
    }
}

// ============================================================================
// SECTION 13: TESTS - GENERATOR, SUPERVISION & SCHEDULER
// ============================================================================

#[cfg(test)]
mod engine_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    fn generator_from_yaml(yaml: &str) -> MetricGenerator {
        let config = EmitterConfig::from_yaml_str(yaml).unwrap();
        let catalog = Arc::new(LabelCatalog::from_domains(&config.labels));
        let registry = Arc::new(MetricRegistry::create(&config.metrics, catalog.names()).unwrap());
        let chaos = Arc::new(ChaosModel::new(config.chaos.clone(), &config.metrics));
        MetricGenerator::new(registry, catalog, chaos, GeneratorSettings::from_config(&config))
    }

    const GAUGE_YAML: &str = r#"
metrics:
  g:
    type: gauge
    base_value: 5
    variance: 0
labels:
  app: [a, b]
  status: ["200"]
"#;

    const THREE_GAUGES_YAML: &str = r#"
metrics:
  a: {type: gauge, variance: 0}
  b: {type: gauge, variance: 0}
  c: {type: gauge, variance: 0}
labels:
  app: [x]
update_interval_seconds: 2
"#;

    // ---- Generator ----

    #[test]
    fn test_tick_records_base_value_on_every_sampled_set() {
        let generator = generator_from_yaml(GAUGE_YAML);
        let mut rng = StdRng::seed_from_u64(5);

        let outcome = generator.tick_metric("g", &mut rng).unwrap();
        assert_eq!(outcome, TickOutcome::Recorded { label_sets: 2, value: 5.0 });

        let metric = generator.registry.get("g").unwrap();
        for labels in generator.catalog.combinations() {
            assert_eq!(metric.snapshot(labels).unwrap(), InstanceSnapshot::Gauge(5.0));
        }
    }

    #[test]
    fn test_tick_sample_size_caps_label_sets() {
        let yaml = r#"
metrics:
  c: {type: counter, base_value: 1, variance: 0}
labels:
  a: ["1", "2", "3", "4"]
  b: ["1", "2", "3"]
num_label_combinations: 5
"#;
        let generator = generator_from_yaml(yaml);
        let outcome = generator.tick_metric("c", &mut StdRng::seed_from_u64(1)).unwrap();

        assert_eq!(outcome, TickOutcome::Recorded { label_sets: 5, value: 1.0 });
        assert_eq!(generator.stats().snapshot().observations, 5);
    }

    #[test]
    fn test_tick_skip_and_dropout_at_certainty() {
        let skip_all = format!(
            "{}chaos:\n  enable_missing_metrics: true\n  missing_metric_chance: 1.0\n",
            GAUGE_YAML
        );
        let generator = generator_from_yaml(&skip_all);
        assert_eq!(
            generator.tick_metric("g", &mut StdRng::seed_from_u64(2)).unwrap(),
            TickOutcome::Skipped
        );
        assert_eq!(generator.stats().snapshot().metrics_skipped, 1);

        let drop_all = format!("{}chaos:\n  enable_dropouts: true\n  dropout_chance: 1.0\n", GAUGE_YAML);
        let generator = generator_from_yaml(&drop_all);
        assert_eq!(
            generator.tick_metric("g", &mut StdRng::seed_from_u64(2)).unwrap(),
            TickOutcome::Recorded { label_sets: 0, value: 5.0 }
        );
        assert_eq!(generator.stats().snapshot().label_sets_dropped, 2);
        assert!(!generator.registry.render().unwrap().contains("g{"));
    }

    #[test]
    fn test_tick_negative_counter_value_is_an_error() {
        let yaml = r#"
metrics:
  c: {type: counter, base_value: 1, variance: 0}
labels:
  app: [x]
chaos:
  enable_spikes: true
  spike_chance: 1.0
  spike_multiplier: -2.0
"#;
        let generator = generator_from_yaml(yaml);
        let err = generator.tick_metric("c", &mut StdRng::seed_from_u64(3)).unwrap_err();
        assert!(matches!(err, GenerationError::NegativeCounterIncrement { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pass_sleeps_per_metric() {
        let generator = generator_from_yaml(THREE_GAUGES_YAML);
        let mut rng = StdRng::seed_from_u64(4);

        let started = Instant::now();
        generator.run_pass(&mut rng).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(7), "elapsed {:?}", elapsed);
        assert_eq!(generator.stats().snapshot().passes, 1);
        assert_eq!(generator.stats().snapshot().metrics_recorded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pass_sleeps_once_in_per_pass_mode() {
        let yaml = format!("{}sleep_mode: per_pass\n", THREE_GAUGES_YAML);
        let generator = generator_from_yaml(&yaml);

        let started = Instant::now();
        generator.run_pass(&mut StdRng::seed_from_u64(4)).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pass_all_skipped_still_sleeps_once() {
        let yaml = format!(
            "{}chaos:\n  enable_missing_metrics: true\n  missing_metric_chance: 1.0\n",
            THREE_GAUGES_YAML
        );
        let generator = generator_from_yaml(&yaml);

        let started = Instant::now();
        generator.run_pass(&mut StdRng::seed_from_u64(4)).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert_eq!(generator.stats().snapshot().metrics_skipped, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pass_continues_after_tick_error() {
        let yaml = r#"
metrics:
  a_counter: {type: counter, base_value: 1, variance: 0}
  b_gauge: {type: gauge, base_value: 2, variance: 0}
labels:
  app: [x]
update_interval_seconds: 0.1
chaos:
  enable_spikes: true
  spike_chance: 1.0
  spike_multiplier: -1.0
"#;
        let generator = generator_from_yaml(yaml);
        generator.run_pass(&mut StdRng::seed_from_u64(8)).await;

        let stats = generator.stats().snapshot();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.metrics_recorded, 1);
        assert!(generator.registry.render().unwrap().contains(r#"b_gauge{app="x"} -2"#));
    }

    // ---- Supervision ----

    fn supervision(policy: RestartPolicy) -> SupervisionConfig {
        SupervisionConfig {
            restart_policy: policy,
            restart_backoff_seconds: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_halts_after_panic() {
        let outcome = supervise(
            "test",
            supervision(RestartPolicy::Halt),
            CancellationToken::new(),
            || async { panic!("tick exploded") },
        )
        .await;

        assert_eq!(outcome, SupervisionOutcome { restarts: 0, halted: true });
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_restarts_until_cancelled() {
        let attempts = Arc::new(AtomicU64::new(0));
        let token = CancellationToken::new();

        let outcome = supervise("test", supervision(RestartPolicy::Restart), token.clone(), {
            let attempts = Arc::clone(&attempts);
            let token = token.clone();
            move || {
                let attempts = Arc::clone(&attempts);
                let token = token.clone();
                async move {
                    let attempt = attempts.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    if attempt < 3 {
                        panic!("attempt {} failed", attempt);
                    }
                    token.cancel();
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

        assert_eq!(outcome, SupervisionOutcome { restarts: 2, halted: false });
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 3);
    }

    // ---- Pattern scheduler ----

    fn pattern_registry() -> Arc<MetricRegistry> {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            DEFAULT_PATTERN_HISTOGRAM.to_string(),
            MetricDefinition::new(MetricKind::Histogram, 0.1, 0.0),
        );
        metrics.insert(
            DEFAULT_PATTERN_GAUGE.to_string(),
            MetricDefinition::new(MetricKind::Gauge, 0.1, 0.0),
        );
        let names: Vec<CompactString> = ["app", "env", "method", "status", "uri"]
            .into_iter()
            .map(CompactString::from)
            .collect();
        Arc::new(MetricRegistry::create(&metrics, &names).unwrap())
    }

    fn schedule() -> PatternGeneratorConfig {
        let phase = |name: &str, start: f64, duration: f64, status: &str, latency: f64| PhaseDefinition {
            name: name.to_string(),
            start_seconds: start,
            duration_seconds: duration,
            status: status.into(),
            latency,
            max_latency: None,
            generate: true,
            interval_seconds: 1.0,
        };
        PatternGeneratorConfig {
            enabled: true,
            phases: vec![
                phase("healthy", 0.0, 10.0, "200", 0.1),
                phase("degraded", 10.0, 5.0, "500", 0.4),
            ],
            ..PatternGeneratorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_epoch_is_lazy_and_resettable() {
        let scheduler = PatternScheduler::new(schedule(), pattern_registry());

        assert_eq!(scheduler.current_phase().name(), "healthy");
        tokio::time::advance(Duration::from_secs(12)).await;
        assert_eq!(scheduler.current_phase().name(), "degraded");

        scheduler.reset_epoch();
        assert_eq!(scheduler.current_phase().name(), "healthy");

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(scheduler.current_phase(), PhaseLookup::Completed);
    }

    #[test]
    fn test_emit_records_latency_and_max_latency() {
        let registry = pattern_registry();
        let scheduler = PatternScheduler::new(schedule(), Arc::clone(&registry));
        let degraded = scheduler.config().phases[1].clone();

        assert_eq!(scheduler.emit(&degraded).unwrap(), 2);

        let labels = scheduler.pattern_labels(&degraded).unwrap();
        assert_eq!(labels.value_of("status"), Some("500"));
        assert_eq!(labels.value_of("app"), Some("mock_pattern"));

        match registry.get(DEFAULT_PATTERN_HISTOGRAM).unwrap().snapshot(&labels).unwrap() {
            InstanceSnapshot::Histogram { count, sum } => {
                assert_eq!(count, 1);
                assert!((sum - 0.4).abs() < 1e-9);
            }
            other => panic!("unexpected snapshot: {:?}", other),
        }
        match registry.get(DEFAULT_PATTERN_GAUGE).unwrap().snapshot(&labels).unwrap() {
            InstanceSnapshot::Gauge(value) => assert!((value - 0.6).abs() < 1e-9),
            other => panic!("unexpected snapshot: {:?}", other),
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn registry_without_pattern_metrics() -> Arc<MetricRegistry> {
        let mut metrics = BTreeMap::new();
        metrics.insert("other".to_string(), MetricDefinition::new(MetricKind::Gauge, 1.0, 0.0));
        Arc::new(MetricRegistry::create(&metrics, &[CompactString::from("region")]).unwrap())
    }

    #[test]
    fn test_emit_without_designated_metrics_still_logs() {
        let scheduler = PatternScheduler::new(schedule(), registry_without_pattern_metrics());
        let phase = scheduler.config().phases[1].clone();

        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_ansi(false)
            .finish();
        let recorded = tracing::subscriber::with_default(subscriber, || scheduler.emit(&phase));

        assert_eq!(recorded.unwrap(), 0);
        let text = logs.text();
        assert!(text.contains("Pattern emission"), "missing log line: {}", text);
        assert!(text.contains("phase=degraded"), "missing phase field: {}", text);
        assert!(text.contains("status=500"), "missing status field: {}", text);
        assert!(text.contains("recorded=0"), "missing recorded field: {}", text);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_without_designated_metrics_are_not_emissions() {
        let scheduler = PatternScheduler::new(schedule(), registry_without_pattern_metrics());

        assert!(scheduler.start());
        sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await;

        let stats = scheduler.stats().snapshot();
        assert_eq!(stats.emissions, 0);
        assert_eq!(stats.errors, 0);
        assert!(stats.unrecorded_ticks >= 2, "stats: {:?}", stats);
    }

    #[test]
    fn test_emit_with_unprojectable_labels_errors() {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            DEFAULT_PATTERN_GAUGE.to_string(),
            MetricDefinition::new(MetricKind::Gauge, 1.0, 0.0),
        );
        let registry = Arc::new(MetricRegistry::create(&metrics, &[CompactString::from("region")]).unwrap());
        let scheduler = PatternScheduler::new(schedule(), registry);

        let phase = scheduler.config().phases[0].clone();
        assert!(matches!(
            scheduler.emit(&phase),
            Err(GenerationError::MissingLabel { label }) if label == "region"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_waits() {
        let scheduler = PatternScheduler::new(schedule(), pattern_registry());

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        sleep(Duration::from_millis(3500)).await;
        scheduler.stop().await;

        assert!(!scheduler.is_running());
        assert!(scheduler.stats().snapshot().emissions >= 3);
        assert!(scheduler.start());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_during_pending_stop_spawns_independent_loop() {
        let scheduler = PatternScheduler::new(schedule(), pattern_registry());
        assert!(scheduler.start());
        sleep(Duration::from_millis(100)).await;

        // old loop is asleep in its 1s interval, so the stop stays pending
        let stopping = scheduler.stop();
        tokio::pin!(stopping);
        assert!(timeout(Duration::from_millis(10), &mut stopping).await.is_err());
        assert!(!scheduler.is_running());

        assert!(scheduler.start());
        assert!(timeout(Duration::from_secs(5), &mut stopping).await.is_ok());
        assert!(scheduler.is_running());

        sleep(Duration::from_millis(2500)).await;
        assert!(scheduler.is_running());
        assert!(timeout(Duration::from_secs(5), scheduler.stop()).await.is_ok());
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_when_disabled_is_noop() {
        let config = PatternGeneratorConfig {
            enabled: false,
            ..schedule()
        };
        let scheduler = PatternScheduler::new(config, pattern_registry());

        assert!(!scheduler.start());
        assert!(!scheduler.is_running());
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_generating_phase_idles() {
        let mut config = schedule();
        config.phases[0].generate = false;
        let scheduler = PatternScheduler::new(config, pattern_registry());

        scheduler.start();
        sleep(Duration::from_secs(2)).await;
        scheduler.stop().await;

        let stats = scheduler.stats().snapshot();
        assert_eq!(stats.emissions, 0);
        assert!(stats.idle_polls >= 3);
    }
}

// ============================================================================
// SECTION 14: HTTP CONTROL SURFACE
// ============================================================================
// Read-only exposition plus two pattern endpoints. Handlers hold no locks
// beyond the epoch mutex inside the scheduler.
// ============================================================================

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: Arc<MetricRegistry>,
    pub scheduler: Arc<PatternScheduler>,
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .route("/pattern/reset", get(pattern_reset_handler))
        .route("/pattern/status", get(pattern_status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index_handler() -> &'static str {
    INDEX_BODY
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.registry.render() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn pattern_reset_handler(State(state): State<AppState>) -> &'static str {
    state.scheduler.reset_epoch();
    RESET_BODY
}

async fn pattern_status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "current_phase": state.scheduler.current_phase() }))
}

/// Serve the router until `token` is cancelled
pub async fn serve(addr: SocketAddr, state: AppState, token: CancellationToken) -> EmitterResult<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    info!("HTTP surface stopped");
    Ok(())
}

// ============================================================================
// SECTION 15: EMITTER ASSEMBLY
// ============================================================================
// Wires configuration into the registry, chaos model, generator and
// scheduler, then runs them next to the HTTP surface until a shutdown signal.
// ============================================================================

#[cfg(target_os = "linux")]
fn register_process_collector(registry: &MetricRegistry) {
    let collector = prometheus::process_collector::ProcessCollector::for_self();
    if let Err(e) = registry.register_collector(Box::new(collector)) {
        warn!(error = %e, "Process collector not registered");
    }
}

#[cfg(not(target_os = "linux"))]
fn register_process_collector(_registry: &MetricRegistry) {}

/// Resolves on SIGINT/SIGTERM (cancelling `token`) or when `token` is
/// cancelled elsewhere.
async fn watch_shutdown_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Unable to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

/// The assembled emitter
#[derive(Debug)]
pub struct Emitter {
    config: EmitterConfig,
    registry: Arc<MetricRegistry>,
    generator: Arc<MetricGenerator>,
    scheduler: Arc<PatternScheduler>,
    shutdown: CancellationToken,
}

impl Emitter {
    /// Build every component. Fails on any configuration error.
    pub fn new(config: EmitterConfig, pattern: PatternConfig) -> EmitterResult<Self> {
        config.validate()?;
        pattern.validate()?;

        for (field, value) in config.out_of_range_probabilities() {
            warn!(
                target: CHAOS_LOG_TARGET,
                field,
                value,
                "Chaos probability outside [0, 1]; draws saturate"
            );
        }

        let catalog = Arc::new(LabelCatalog::from_domains(&config.labels));
        let registry = Arc::new(MetricRegistry::create(&config.metrics, catalog.names())?);
        register_process_collector(&registry);

        let chaos = Arc::new(ChaosModel::new(config.chaos.clone(), &config.metrics));
        let generator = Arc::new(MetricGenerator::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            chaos,
            GeneratorSettings::from_config(&config),
        ));
        let scheduler = Arc::new(PatternScheduler::new(
            pattern.pattern_generator,
            Arc::clone(&registry),
        ));

        info!(
            metrics = registry.len(),
            label_sets = catalog.len(),
            pattern_enabled = scheduler.is_enabled(),
            "Emitter assembled"
        );

        Ok(Self {
            config,
            registry,
            generator,
            scheduler,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn generator(&self) -> &Arc<MetricGenerator> {
        &self.generator
    }

    pub fn scheduler(&self) -> &Arc<PatternScheduler> {
        &self.scheduler
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    /// Token that stops [`Emitter::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// Run generation, the scheduler and the HTTP surface until shutdown.
    pub async fn run(&self) -> EmitterResult<()> {
        info!(version = EMITTER_VERSION, bind = %self.config.server.bind, "Starting {}", EMITTER_FULL_NAME);

        let generator = Arc::clone(&self.generator);
        let supervisor = tokio::spawn(supervise(
            "generator",
            self.config.supervision.clone(),
            self.shutdown.child_token(),
            move || Arc::clone(&generator).run(),
        ));

        self.scheduler.start();
        tokio::spawn(watch_shutdown_signals(self.shutdown.clone()));

        let served = serve(self.config.server.bind, self.app_state(), self.shutdown.clone()).await;

        info!("Starting graceful shutdown");
        self.shutdown.cancel();
        self.scheduler.stop().await;

        match supervisor.await {
            Ok(outcome) => info!(
                restarts = outcome.restarts,
                halted = outcome.halted,
                "Generator supervisor finished"
            ),
            Err(e) => warn!(error = %e, "Generator supervisor ended abnormally"),
        }

        info!(
            generator = ?self.generator.stats().snapshot(),
            pattern = ?self.scheduler.stats().snapshot(),
            "Emitter stopped"
        );

        served
    }
}

// ============================================================================
// SECTION 16: COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Chaos Emitter CLI
#[derive(Parser, Debug)]
#[command(
    name = "chaos-emitter",
    author = "AIOps Team",
    version,
    about = "Synthetic Prometheus metrics with chaos injection",
    long_about = "Chaos Emitter serves synthetic Prometheus metrics produced by a \
                  continuous generator with configurable chaos (missing metrics, \
                  dropouts, status flips, spikes, drift) and a scripted phase \
                  schedule for deterministic scenarios."
)]
pub struct Cli {
    /// Emitter configuration file (TOML or YAML)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "CHAOS_EMITTER_CONFIG")]
    pub config: PathBuf,

    /// Pattern schedule file; absent means the scheduler is disabled
    #[arg(
        short,
        long,
        default_value = DEFAULT_PATTERN_CONFIG_PATH,
        env = "CHAOS_EMITTER_PATTERN_CONFIG"
    )]
    pub pattern_config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "CHAOS_EMITTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "CHAOS_EMITTER_DEBUG")]
    pub debug: bool,

    /// Bind address override
    #[arg(short, long, env = "CHAOS_EMITTER_BIND")]
    pub bind: Option<SocketAddr>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut EmitterConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.debug {
            config.logging.level = "debug".into();
        }
    }
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the emitter (default)
    Run,

    /// Validate configuration files
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate an example configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Generate the pattern schedule instead of the emitter document
        #[arg(long)]
        pattern: bool,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 16.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
pub fn handle_validate(config_path: &Path, pattern_path: &Path, verbose: bool) -> EmitterResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match EmitterConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            return Err(EmitterError::Config(e));
        }
    };

    let pattern = match PatternConfig::load_or_disabled(pattern_path) {
        Ok(pattern) => pattern,
        Err(e) => {
            println!("❌ Pattern schedule validation failed!");
            println!("Error: {}", e);
            return Err(EmitterError::Config(e));
        }
    };

    let catalog = LabelCatalog::from_domains(&config.labels);
    MetricRegistry::create(&config.metrics, catalog.names())?;

    println!("✅ Configuration is valid!");

    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
        match toml::to_string_pretty(&pattern) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!("\n📊 Configuration Summary:");
    println!("  • Metrics defined: {}", config.metrics.len());
    println!("  • Label combinations: {}", catalog.len());
    println!("  • Update interval: {}s", config.update_interval_seconds);
    println!("  • Label-sets per tick: {}", config.num_label_combinations);
    println!("  • Bind address: {}", config.server.bind);
    println!("  • Chaos enabled:");
    let chaos = &config.chaos;
    if chaos.enable_missing_metrics { println!("    - Missing metrics ({})", chaos.missing_metric_chance); }
    if chaos.enable_dropouts { println!("    - Label dropouts ({})", chaos.dropout_chance); }
    if chaos.enable_status_flips { println!("    - Status flips ({})", chaos.status_flip_chance); }
    if chaos.enable_spikes { println!("    - Spikes ({} x{})", chaos.spike_chance, chaos.spike_multiplier); }
    if chaos.enable_latency_trend { println!("    - Latency drift ({}/tick)", chaos.latency_drift_per_tick); }
    for (field, value) in config.out_of_range_probabilities() {
        println!("  ⚠️  {} = {} is outside [0, 1]", field, value);
    }
    println!(
        "  • Pattern schedule: {} ({} phases)",
        if pattern.pattern_generator.enabled { "enabled" } else { "disabled" },
        pattern.pattern_generator.phases.len()
    );

    Ok(())
}

/// Handle the generate-config subcommand
pub fn handle_generate_config(output: Option<&Path>, pattern: bool) -> EmitterResult<()> {
    let config_str = if pattern {
        PatternConfig::generate_default_config()
    } else {
        EmitterConfig::generate_default_config()
    };

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Example configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
pub fn handle_version() {
    println!("🌀 {} v{}", EMITTER_FULL_NAME, EMITTER_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Features:");
    println!("  • Counter, gauge and histogram generation");
    println!("  • Chaos injection (missing metrics, dropouts, status flips, spikes, drift)");
    println!("  • Scripted phase schedules with resettable epoch");
    println!("  • Prometheus text exposition over HTTP");
    println!();
    println!("License: MIT");
}

// ============================================================================
// SECTION 17: TESTS - HTTP SURFACE, ASSEMBLY & CLI
// ============================================================================

#[cfg(test)]
mod surface_tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn test_state(pattern: PatternGeneratorConfig) -> AppState {
        let mut metrics = BTreeMap::new();
        metrics.insert("queue_depth".to_string(), MetricDefinition::new(MetricKind::Gauge, 3.0, 0.0));
        let registry = Arc::new(MetricRegistry::create(&metrics, &[CompactString::from("app")]).unwrap());
        let scheduler = Arc::new(PatternScheduler::new(pattern, Arc::clone(&registry)));
        AppState { registry, scheduler }
    }

    fn two_phase_schedule() -> PatternGeneratorConfig {
        PatternConfig::from_yaml_str(
            r#"
pattern_generator:
  enabled: true
  phases:
    - {name: healthy, start_seconds: 0, duration_seconds: 10}
    - {name: degraded, start_seconds: 10, duration_seconds: 5, status: 500, latency: 1.5}
"#,
        )
        .unwrap()
        .pattern_generator
    }

    async fn get_request(state: AppState, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    // ---- HTTP ----

    #[tokio::test]
    async fn test_index_endpoint() {
        let (status, _, body) = get_request(test_state(PatternGeneratorConfig::default()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, INDEX_BODY);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_text_format() {
        let state = test_state(PatternGeneratorConfig::default());
        let labels: LabelSet = smallvec::smallvec![Label::new("app", "orders")];
        state.registry.record("queue_depth", &labels, 3.0).unwrap();

        let (status, content_type, body) = get_request(state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain; version=0.0.4"));
        assert!(body.contains(r#"queue_depth{app="orders"} 3"#));
    }

    #[tokio::test]
    async fn test_pattern_status_when_schedule_disabled() {
        let (status, _, body) = get_request(test_state(PatternGeneratorConfig::default()), "/pattern/status").await;
        assert_eq!(status, StatusCode::OK);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value, json!({"current_phase": {"name": "completed", "generate": false}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_reset_restarts_schedule() {
        let state = test_state(two_phase_schedule());

        let (_, _, body) = get_request(state.clone(), "/pattern/status").await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["current_phase"]["name"], "healthy");

        tokio::time::advance(Duration::from_secs(12)).await;
        let (_, _, body) = get_request(state.clone(), "/pattern/status").await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["current_phase"]["name"], "degraded");
        assert_eq!(value["current_phase"]["status"], "500");
        assert_eq!(value["current_phase"]["latency"], 1.5);

        let (status, _, body) = get_request(state.clone(), "/pattern/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, RESET_BODY);

        let (_, _, body) = get_request(state, "/pattern/status").await;
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["current_phase"]["name"], "healthy");
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (status, _, _) = get_request(test_state(PatternGeneratorConfig::default()), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ---- Assembly ----

    #[test]
    fn test_emitter_rejects_unsupported_metric_kind() {
        let mut config = EmitterConfig::example();
        config.metrics.get_mut("http_requests_total").unwrap().kind = "summary".into();

        let err = Emitter::new(config, PatternConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            EmitterError::Config(ConfigError::UnsupportedMetricKind { .. })
        ));
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_emitter_assembles_example_documents() {
        let emitter = Emitter::new(EmitterConfig::example(), PatternConfig::example()).unwrap();

        assert_eq!(emitter.registry().len(), 4);
        assert!(emitter.scheduler().is_enabled());
        assert!(!emitter.scheduler().is_running());
    }

    #[tokio::test]
    async fn test_emitter_runs_until_shutdown() {
        let mut config = EmitterConfig::example();
        config.server.bind = "127.0.0.1:0".parse().unwrap();
        config.update_interval_seconds = 0.01;

        let emitter = Arc::new(Emitter::new(config, PatternConfig::example()).unwrap());
        let running = tokio::spawn({
            let emitter = Arc::clone(&emitter);
            async move { emitter.run().await }
        });

        sleep(Duration::from_millis(200)).await;
        emitter.shutdown();
        running.await.unwrap().unwrap();

        assert!(emitter.generator().stats().snapshot().passes > 0);
        assert!(emitter.scheduler().stats().snapshot().emissions > 0);
        assert!(!emitter.scheduler().is_running());
    }

    // ---- CLI ----

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["chaos-emitter"]).unwrap();

        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.pattern_config, PathBuf::from(DEFAULT_PATTERN_CONFIG_PATH));
        assert!(cli.command.is_none());
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_overrides_apply_to_config() {
        let cli = Cli::try_parse_from([
            "chaos-emitter",
            "--bind",
            "127.0.0.1:9200",
            "--debug",
            "validate",
            "--verbose",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Commands::Validate { verbose: true }));

        let mut config = EmitterConfig::example();
        cli.apply_overrides(&mut config);
        assert_eq!(config.server.bind, "127.0.0.1:9200".parse::<SocketAddr>().unwrap());
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_generate_then_validate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("emitter.toml");
        let pattern_path = dir.path().join("pattern.toml");

        handle_generate_config(Some(&config_path), false).unwrap();
        handle_generate_config(Some(&pattern_path), true).unwrap();
        handle_validate(&config_path, &pattern_path, true).unwrap();

        let missing = dir.path().join("missing.toml");
        assert!(handle_validate(&missing, &pattern_path, false).is_err());
    }

    #[test]
    fn test_log_dir_preparation_creates_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");

        prepare_log_dir(&log_dir).unwrap();
        assert!(log_dir.join(CHAOS_LOG_FILE).exists());
        assert!(log_dir.join(PATTERN_LOG_FILE).exists());
    }
}
