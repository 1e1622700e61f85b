use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::File;
use std::num::{ParseFloatError, ParseIntError};
use std::path::{Path, PathBuf};

use crate::lock::UnlockPolicy;
use crate::rebalance::MAX_HEDGE_CHECK_SECS;

const DEFAULT_PRIMARY: &str = "XAUUSD";
const DEFAULT_SECONDARY: &str = "XAGUSD";
const DEFAULT_WINDOW: usize = 240;
const DEFAULT_HEDGE_WINDOW: usize = 240;
const DEFAULT_HEDGE_RECOMPUTE_EVERY: usize = 1;
const DEFAULT_ENTRY_THRESHOLD: f64 = 2.0;
const DEFAULT_EXIT_THRESHOLD: f64 = 0.5;
const DEFAULT_STOP_LOSS_Z: f64 = 4.0;
const DEFAULT_SCALE_INTERVAL: f64 = 0.5;
const DEFAULT_BASE_VOLUME: &str = "0.10";
const DEFAULT_SCALE_FRACTION: &str = "0.33";
const DEFAULT_LOT_STEP: &str = "0.01";
const DEFAULT_MIN_LOT: &str = "0.01";
const DEFAULT_MAX_ENTRIES: u32 = 10;
const DEFAULT_MAX_SCALE_Z: f64 = 3.5;
const DEFAULT_HEDGE_DRIFT_THRESHOLD: f64 = 0.05;
const DEFAULT_HEDGE_CHECK_INTERVAL_SECS: u64 = 300;
const DEFAULT_MIN_ADJUST_LOTS: &str = "0.01";
const DEFAULT_MAX_LOSS_PER_SETUP_PCT: f64 = 2.0;
const DEFAULT_MAX_TOTAL_UNREALIZED_LOSS_PCT: f64 = 5.0;
const DEFAULT_DAILY_LOSS_LIMIT_PCT: f64 = 10.0;
const DEFAULT_SESSION_START: &str = "00:00";
const DEFAULT_EQUITY_FALLBACK: f64 = 10_000.0;
const DEFAULT_QUEUE_CAPACITY: usize = 64;
const DEFAULT_CLOSE_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_CLOSE_BACKOFF_MS: u64 = 500;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;
const DEFAULT_VOLUME_TOLERANCE: &str = "0.0001";
const DEFAULT_SHUTDOWN_DRAIN_SECS: u64 = 10;
const DEFAULT_QUOTE_INTERVAL_SECS: u64 = 5;
const DEFAULT_STATE_FILE: &str = "state/positions.json";
const DEFAULT_LOCK_FILE: &str = "state/trading_lock.json";

#[derive(Debug)]
pub enum ConfigError {
    ParseIntError(ParseIntError),
    ParseFloatError(ParseFloatError),
    DecimalParseError(rust_decimal::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseIntError(e) => write!(f, "Parse int error: {}", e),
            ConfigError::ParseFloatError(e) => write!(f, "Parse float error: {}", e),
            ConfigError::DecimalParseError(e) => write!(f, "Decimal parse error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseIntError> for ConfigError {
    fn from(err: ParseIntError) -> ConfigError {
        ConfigError::ParseIntError(err)
    }
}

impl From<ParseFloatError> for ConfigError {
    fn from(err: ParseFloatError) -> ConfigError {
        ConfigError::ParseFloatError(err)
    }
}

impl From<rust_decimal::Error> for ConfigError {
    fn from(err: rust_decimal::Error) -> ConfigError {
        ConfigError::DecimalParseError(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairSpec {
    pub primary: String,
    pub secondary: String,
}

impl PairSpec {
    pub fn key(&self) -> String {
        format!("{}/{}", self.primary, self.secondary)
    }
}

#[derive(Debug, Clone)]
pub struct SpreadConfig {
    pub window: usize,
    pub hedge_window: usize,
    pub hedge_recompute_every: usize,
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub entry_threshold: f64,
    pub exit_threshold: f64,
    pub stop_loss_z: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    pub scale_interval: f64,
    pub base_volume: Decimal,
    pub scale_fraction: Decimal,
    pub lot_step: Decimal,
    pub min_lot: Decimal,
    pub max_entries: u32,
    pub max_scale_z: Option<f64>,
    pub hedge_drift_threshold: f64,
    pub hedge_check_interval_secs: u64,
    pub min_adjust_lots: Decimal,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_loss_per_setup_pct: f64,
    pub max_total_unrealized_loss_pct: f64,
    pub daily_loss_limit_pct: f64,
    pub unlock_policy: UnlockPolicy,
    pub session_start: NaiveTime,
    pub equity_fallback: f64,
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub queue_capacity: usize,
    pub close_max_attempts: u32,
    pub close_backoff_ms: u64,
    pub reconcile_interval_secs: u64,
    pub volume_tolerance: Decimal,
    pub shutdown_drain_secs: u64,
    pub quote_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
}

/// Canonical configuration consumed by every component.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub pair: PairSpec,
    pub spread: SpreadConfig,
    pub signal: SignalConfig,
    pub rebalance: RebalanceConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub storage: StorageConfig,
    pub replay_file: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pair: PairSpec {
                primary: DEFAULT_PRIMARY.to_string(),
                secondary: DEFAULT_SECONDARY.to_string(),
            },
            spread: SpreadConfig {
                window: DEFAULT_WINDOW,
                hedge_window: DEFAULT_HEDGE_WINDOW,
                hedge_recompute_every: DEFAULT_HEDGE_RECOMPUTE_EVERY,
            },
            signal: SignalConfig {
                entry_threshold: DEFAULT_ENTRY_THRESHOLD,
                exit_threshold: DEFAULT_EXIT_THRESHOLD,
                stop_loss_z: Some(DEFAULT_STOP_LOSS_Z),
            },
            rebalance: RebalanceConfig {
                scale_interval: DEFAULT_SCALE_INTERVAL,
                base_volume: default_decimal(DEFAULT_BASE_VOLUME),
                scale_fraction: default_decimal(DEFAULT_SCALE_FRACTION),
                lot_step: default_decimal(DEFAULT_LOT_STEP),
                min_lot: default_decimal(DEFAULT_MIN_LOT),
                max_entries: DEFAULT_MAX_ENTRIES,
                max_scale_z: Some(DEFAULT_MAX_SCALE_Z),
                hedge_drift_threshold: DEFAULT_HEDGE_DRIFT_THRESHOLD,
                hedge_check_interval_secs: DEFAULT_HEDGE_CHECK_INTERVAL_SECS,
                min_adjust_lots: default_decimal(DEFAULT_MIN_ADJUST_LOTS),
            },
            risk: RiskConfig {
                max_loss_per_setup_pct: DEFAULT_MAX_LOSS_PER_SETUP_PCT,
                max_total_unrealized_loss_pct: DEFAULT_MAX_TOTAL_UNREALIZED_LOSS_PCT,
                daily_loss_limit_pct: DEFAULT_DAILY_LOSS_LIMIT_PCT,
                unlock_policy: UnlockPolicy::NextSession,
                session_start: NaiveTime::from_hms_opt(0, 0, 0).unwrap_or(NaiveTime::MIN),
                equity_fallback: DEFAULT_EQUITY_FALLBACK,
            },
            execution: ExecutionConfig {
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                close_max_attempts: DEFAULT_CLOSE_MAX_ATTEMPTS,
                close_backoff_ms: DEFAULT_CLOSE_BACKOFF_MS,
                reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
                volume_tolerance: default_decimal(DEFAULT_VOLUME_TOLERANCE),
                shutdown_drain_secs: DEFAULT_SHUTDOWN_DRAIN_SECS,
                quote_interval_secs: DEFAULT_QUOTE_INTERVAL_SECS,
            },
            storage: StorageConfig {
                state_file: PathBuf::from(DEFAULT_STATE_FILE),
                lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            },
            replay_file: None,
        }
    }
}

fn default_decimal(raw: &str) -> Decimal {
    raw.parse().unwrap_or(Decimal::ZERO)
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    String(String),
    Vec(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::String(value) => value
                .split(|c| c == ',' || c == '/')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            StringOrVec::Vec(values) => values
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SpreadYaml {
    window: Option<usize>,
    hedge_window: Option<usize>,
    hedge_recompute_every: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SignalYaml {
    entry_threshold: Option<f64>,
    exit_threshold: Option<f64>,
    stop_loss_z: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RebalanceYaml {
    scale_interval: Option<f64>,
    base_volume: Option<Decimal>,
    scale_fraction: Option<Decimal>,
    lot_step: Option<Decimal>,
    min_lot: Option<Decimal>,
    max_entries: Option<u32>,
    max_scale_z: Option<f64>,
    hedge_drift_threshold: Option<f64>,
    hedge_check_interval_secs: Option<u64>,
    min_adjust_lots: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct RiskYaml {
    max_loss_per_setup_pct: Option<f64>,
    max_total_unrealized_loss_pct: Option<f64>,
    daily_loss_limit_pct: Option<f64>,
    unlock_policy: Option<String>,
    session_start_time: Option<String>,
    equity_fallback: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionYaml {
    queue_capacity: Option<usize>,
    close_max_attempts: Option<u32>,
    close_backoff_ms: Option<u64>,
    reconcile_interval_secs: Option<u64>,
    volume_tolerance: Option<Decimal>,
    shutdown_drain_secs: Option<u64>,
    quote_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageYaml {
    state_file: Option<String>,
    lock_file: Option<String>,
}

/// Flat key layout written by older deployments. Only consulted when the
/// sectioned key is absent.
#[derive(Debug, Default, Deserialize)]
struct LegacyFlatYaml {
    primary_symbol: Option<String>,
    secondary_symbol: Option<String>,
    rolling_window_size: Option<usize>,
    entry_threshold: Option<f64>,
    exit_threshold: Option<f64>,
    stop_loss_zscore: Option<f64>,
    scale_interval: Option<f64>,
    initial_fraction: Option<Decimal>,
    max_entries: Option<u32>,
    max_zscore: Option<f64>,
    hedge_drift_threshold: Option<f64>,
    max_loss_per_setup_pct: Option<f64>,
    max_total_unrealized_loss_pct: Option<f64>,
    daily_loss_limit_pct: Option<f64>,
    session_start_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct EngineYaml {
    pair: Option<StringOrVec>,
    spread: Option<SpreadYaml>,
    signal: Option<SignalYaml>,
    rebalance: Option<RebalanceYaml>,
    risk: Option<RiskYaml>,
    execution: Option<ExecutionYaml>,
    storage: Option<StorageYaml>,
    replay_file: Option<String>,
    #[serde(flatten)]
    legacy: LegacyFlatYaml,
}

impl EngineConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("PAIRTRADE_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open pairtrade config {}", path_ref.display()))?;
        let yaml: EngineYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse pairtrade config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let yaml: EngineYaml =
            serde_yaml::from_str(raw).context("failed to parse pairtrade config")?;
        let cfg = Self::from_yaml(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_yaml(yaml: EngineYaml) -> Result<Self, ConfigError> {
        let d = Self::default();
        let legacy = yaml.legacy;
        let spread = yaml.spread.unwrap_or_default();
        let signal = yaml.signal.unwrap_or_default();
        let rebalance = yaml.rebalance.unwrap_or_default();
        let risk = yaml.risk.unwrap_or_default();
        let execution = yaml.execution.unwrap_or_default();
        let storage = yaml.storage.unwrap_or_default();

        let pair = match yaml.pair.map(StringOrVec::into_vec) {
            Some(symbols) => match symbols.as_slice() {
                [primary, secondary] => PairSpec {
                    primary: primary.clone(),
                    secondary: secondary.clone(),
                },
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "pair must name exactly two instruments, got {:?}",
                        other
                    )))
                }
            },
            None => PairSpec {
                primary: legacy.primary_symbol.unwrap_or(d.pair.primary),
                secondary: legacy.secondary_symbol.unwrap_or(d.pair.secondary),
            },
        };

        let session_start = match risk.session_start_time.or(legacy.session_start_time) {
            Some(raw) => parse_session_start(&raw)?,
            None => d.risk.session_start,
        };
        let unlock_policy = match risk.unlock_policy {
            Some(raw) => raw.parse()?,
            None => d.risk.unlock_policy,
        };

        Ok(Self {
            pair,
            spread: SpreadConfig {
                window: spread
                    .window
                    .or(legacy.rolling_window_size)
                    .unwrap_or(d.spread.window),
                hedge_window: spread.hedge_window.unwrap_or(d.spread.hedge_window),
                hedge_recompute_every: spread
                    .hedge_recompute_every
                    .unwrap_or(d.spread.hedge_recompute_every),
            },
            signal: SignalConfig {
                entry_threshold: signal
                    .entry_threshold
                    .or(legacy.entry_threshold)
                    .unwrap_or(d.signal.entry_threshold),
                exit_threshold: signal
                    .exit_threshold
                    .or(legacy.exit_threshold)
                    .unwrap_or(d.signal.exit_threshold),
                stop_loss_z: signal
                    .stop_loss_z
                    .or(legacy.stop_loss_zscore)
                    .or(d.signal.stop_loss_z)
                    .filter(|z| *z > 0.0),
            },
            rebalance: RebalanceConfig {
                scale_interval: rebalance
                    .scale_interval
                    .or(legacy.scale_interval)
                    .unwrap_or(d.rebalance.scale_interval),
                base_volume: rebalance.base_volume.unwrap_or(d.rebalance.base_volume),
                scale_fraction: rebalance
                    .scale_fraction
                    .or(legacy.initial_fraction)
                    .unwrap_or(d.rebalance.scale_fraction),
                lot_step: rebalance.lot_step.unwrap_or(d.rebalance.lot_step),
                min_lot: rebalance.min_lot.unwrap_or(d.rebalance.min_lot),
                max_entries: rebalance
                    .max_entries
                    .or(legacy.max_entries)
                    .unwrap_or(d.rebalance.max_entries),
                max_scale_z: rebalance
                    .max_scale_z
                    .or(legacy.max_zscore)
                    .or(d.rebalance.max_scale_z)
                    .filter(|z| *z > 0.0),
                hedge_drift_threshold: rebalance
                    .hedge_drift_threshold
                    .or(legacy.hedge_drift_threshold)
                    .unwrap_or(d.rebalance.hedge_drift_threshold),
                hedge_check_interval_secs: rebalance
                    .hedge_check_interval_secs
                    .unwrap_or(d.rebalance.hedge_check_interval_secs),
                min_adjust_lots: rebalance
                    .min_adjust_lots
                    .unwrap_or(d.rebalance.min_adjust_lots),
            },
            risk: RiskConfig {
                max_loss_per_setup_pct: risk
                    .max_loss_per_setup_pct
                    .or(legacy.max_loss_per_setup_pct)
                    .unwrap_or(d.risk.max_loss_per_setup_pct),
                max_total_unrealized_loss_pct: risk
                    .max_total_unrealized_loss_pct
                    .or(legacy.max_total_unrealized_loss_pct)
                    .unwrap_or(d.risk.max_total_unrealized_loss_pct),
                daily_loss_limit_pct: risk
                    .daily_loss_limit_pct
                    .or(legacy.daily_loss_limit_pct)
                    .unwrap_or(d.risk.daily_loss_limit_pct),
                unlock_policy,
                session_start,
                equity_fallback: risk.equity_fallback.unwrap_or(d.risk.equity_fallback),
            },
            execution: ExecutionConfig {
                queue_capacity: execution
                    .queue_capacity
                    .unwrap_or(d.execution.queue_capacity),
                close_max_attempts: execution
                    .close_max_attempts
                    .unwrap_or(d.execution.close_max_attempts),
                close_backoff_ms: execution
                    .close_backoff_ms
                    .unwrap_or(d.execution.close_backoff_ms),
                reconcile_interval_secs: execution
                    .reconcile_interval_secs
                    .unwrap_or(d.execution.reconcile_interval_secs),
                volume_tolerance: execution
                    .volume_tolerance
                    .unwrap_or(d.execution.volume_tolerance),
                shutdown_drain_secs: execution
                    .shutdown_drain_secs
                    .unwrap_or(d.execution.shutdown_drain_secs),
                quote_interval_secs: execution
                    .quote_interval_secs
                    .unwrap_or(d.execution.quote_interval_secs),
            },
            storage: StorageConfig {
                state_file: storage
                    .state_file
                    .map(PathBuf::from)
                    .unwrap_or(d.storage.state_file),
                lock_file: storage
                    .lock_file
                    .map(PathBuf::from)
                    .unwrap_or(d.storage.lock_file),
            },
            replay_file: yaml.replay_file.filter(|v| !v.trim().is_empty()),
        })
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(pair) = env_string("PAIR") {
            let symbols = StringOrVec::String(pair).into_vec();
            if let [primary, secondary] = symbols.as_slice() {
                self.pair = PairSpec {
                    primary: primary.clone(),
                    secondary: secondary.clone(),
                };
            } else {
                return Err(ConfigError::Invalid(format!(
                    "PAIR must name exactly two instruments, got {:?}",
                    symbols
                )));
            }
        }
        if let Some(v) = env_parse::<usize>("ROLLING_WINDOW")? {
            self.spread.window = v;
        }
        if let Some(v) = env_parse::<usize>("HEDGE_WINDOW")? {
            self.spread.hedge_window = v;
        }
        if let Some(v) = env_float("ENTRY_THRESHOLD")? {
            self.signal.entry_threshold = v;
        }
        if let Some(v) = env_float("EXIT_THRESHOLD")? {
            self.signal.exit_threshold = v;
        }
        if let Some(v) = env_float("STOP_LOSS_Z")? {
            self.signal.stop_loss_z = Some(v).filter(|z| *z > 0.0);
        }
        if let Some(v) = env_float("SCALE_INTERVAL")? {
            self.rebalance.scale_interval = v;
        }
        if let Some(v) = env_decimal("BASE_VOLUME")? {
            self.rebalance.base_volume = v;
        }
        if let Some(v) = env_decimal("SCALE_FRACTION")? {
            self.rebalance.scale_fraction = v;
        }
        if let Some(v) = env_parse::<u32>("MAX_ENTRIES")? {
            self.rebalance.max_entries = v;
        }
        if let Some(v) = env_float("HEDGE_DRIFT_THRESHOLD")? {
            self.rebalance.hedge_drift_threshold = v;
        }
        if let Some(v) = env_float("MAX_LOSS_PER_SETUP_PCT")? {
            self.risk.max_loss_per_setup_pct = v;
        }
        if let Some(v) = env_float("MAX_TOTAL_UNREALIZED_LOSS_PCT")? {
            self.risk.max_total_unrealized_loss_pct = v;
        }
        if let Some(v) = env_float("DAILY_LOSS_LIMIT_PCT")? {
            self.risk.daily_loss_limit_pct = v;
        }
        if let Some(v) = env_string("UNLOCK_POLICY") {
            self.risk.unlock_policy = v.parse()?;
        }
        if let Some(v) = env_string("SESSION_START_TIME") {
            self.risk.session_start = parse_session_start(&v)?;
        }
        if let Some(v) = env_float("EQUITY_FALLBACK")? {
            self.risk.equity_fallback = v;
        }
        if let Some(v) = env_string("STATE_FILE") {
            self.storage.state_file = PathBuf::from(v);
        }
        if let Some(v) = env_string("LOCK_FILE") {
            self.storage.lock_file = PathBuf::from(v);
        }
        if let Some(v) = env_string("REPLAY_FILE") {
            self.replay_file = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.pair.primary == self.pair.secondary {
            return invalid(format!("pair legs must differ ({})", self.pair.key()));
        }
        if self.spread.window < 2 {
            return invalid(format!("rolling window {} < 2", self.spread.window));
        }
        if self.spread.hedge_window < 2 {
            return invalid(format!("hedge window {} < 2", self.spread.hedge_window));
        }
        if self.spread.hedge_recompute_every == 0 {
            return invalid("hedge_recompute_every must be >= 1".to_string());
        }
        if !(self.signal.exit_threshold >= 0.0
            && self.signal.exit_threshold < self.signal.entry_threshold)
        {
            return invalid(format!(
                "exit_threshold {} must be in [0, entry_threshold {})",
                self.signal.exit_threshold, self.signal.entry_threshold
            ));
        }
        if let Some(stop) = self.signal.stop_loss_z {
            if stop <= self.signal.entry_threshold {
                return invalid(format!(
                    "stop_loss_z {} must exceed entry_threshold {}",
                    stop, self.signal.entry_threshold
                ));
            }
        }
        if self.rebalance.scale_interval <= 0.0 {
            return invalid(format!(
                "scale_interval {} must be positive",
                self.rebalance.scale_interval
            ));
        }
        if self.rebalance.base_volume <= Decimal::ZERO || self.rebalance.lot_step <= Decimal::ZERO
        {
            return invalid("base_volume and lot_step must be positive".to_string());
        }
        if self.rebalance.scale_fraction <= Decimal::ZERO {
            return invalid("scale_fraction must be positive".to_string());
        }
        if self.rebalance.hedge_check_interval_secs > MAX_HEDGE_CHECK_SECS {
            return invalid(format!(
                "hedge_check_interval_secs {} exceeds {}",
                self.rebalance.hedge_check_interval_secs, MAX_HEDGE_CHECK_SECS
            ));
        }
        if self.execution.queue_capacity == 0 {
            return invalid("queue_capacity must be >= 1".to_string());
        }
        if self.execution.close_max_attempts == 0 {
            return invalid("close_max_attempts must be >= 1".to_string());
        }
        Ok(())
    }
}

fn parse_session_start(raw: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| ConfigError::Invalid(format!("session start '{}': {}", raw, e)))
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_float(key: &str) -> Result<Option<f64>, ConfigError> {
    match env_string(key) {
        Some(v) => Ok(Some(v.trim().parse::<f64>()?)),
        None => Ok(None),
    }
}

fn env_decimal(key: &str) -> Result<Option<Decimal>, ConfigError> {
    match env_string(key) {
        Some(v) => Ok(Some(v.trim().parse::<Decimal>()?)),
        None => Ok(None),
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    match env_string(key) {
        Some(v) => Ok(Some(v.trim().parse::<T>()?)),
        None => Ok(None),
    }
}
