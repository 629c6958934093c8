// Archivo: config.rs
// Propósito: configuración del supervisor. Valores por defecto razonables y
// lectura desde variables de entorno (`FLOW_*`), con `.env` opcional.
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::MachineSettings;
use crate::errors::{FlowError, Result};
use crate::hospital::RetryPolicy;
use crate::shard::{ShardRouter, ShardSet, DEFAULT_SHARD_PREFIX_LEN};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub worker_id: String,
    pub shard_prefix_len: usize,
    pub owned_shards: ShardSet,
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub session_gap_timeout_ms: u64,
    pub send_attempts: u32,
    pub tick_interval_ms: u64,
    pub rebalance_timeout_ms: u64,
    pub max_retained_outcomes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { worker_id: "worker-0".into(),
               shard_prefix_len: DEFAULT_SHARD_PREFIX_LEN,
               owned_shards: ShardSet::All,
               max_retry_attempts: 3,
               retry_base_delay_ms: 1_000,
               retry_max_delay_ms: 120_000,
               session_gap_timeout_ms: 30_000,
               send_attempts: 3,
               tick_interval_ms: 500,
               rebalance_timeout_ms: 10_000,
               max_retained_outcomes: 10_000 }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim()
                                                .parse::<T>()
                                                .map_err(|_| FlowError::Validation(format!("{} invalido: '{}'", name, raw))),
        _ => Ok(default),
    }
}

impl SupervisorConfig {
    /// Lee `FLOW_WORKER_ID`, `FLOW_SHARD_PREFIX_LEN`, `FLOW_OWNED_SHARDS`,
    /// `FLOW_MAX_RETRY_ATTEMPTS`, `FLOW_RETRY_BASE_DELAY_MS`,
    /// `FLOW_RETRY_MAX_DELAY_MS`, `FLOW_SESSION_GAP_TIMEOUT_MS`,
    /// `FLOW_SEND_ATTEMPTS`, `FLOW_TICK_INTERVAL_MS`,
    /// `FLOW_REBALANCE_TIMEOUT_MS` y `FLOW_MAX_RETAINED_OUTCOMES`. Las
    /// ausentes toman el valor por defecto.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let d = Self::default();
        let shard_prefix_len = parse_var("FLOW_SHARD_PREFIX_LEN", d.shard_prefix_len)?;
        let owned_shards = match env::var("FLOW_OWNED_SHARDS") {
            Ok(raw) => ShardSet::parse(&raw, shard_prefix_len)?,
            Err(_) => ShardSet::All,
        };
        let cfg = Self { worker_id: env::var("FLOW_WORKER_ID").unwrap_or(d.worker_id),
                         shard_prefix_len,
                         owned_shards,
                         max_retry_attempts: parse_var("FLOW_MAX_RETRY_ATTEMPTS", d.max_retry_attempts)?,
                         retry_base_delay_ms: parse_var("FLOW_RETRY_BASE_DELAY_MS", d.retry_base_delay_ms)?,
                         retry_max_delay_ms: parse_var("FLOW_RETRY_MAX_DELAY_MS", d.retry_max_delay_ms)?,
                         session_gap_timeout_ms: parse_var("FLOW_SESSION_GAP_TIMEOUT_MS", d.session_gap_timeout_ms)?,
                         send_attempts: parse_var("FLOW_SEND_ATTEMPTS", d.send_attempts)?,
                         tick_interval_ms: parse_var("FLOW_TICK_INTERVAL_MS", d.tick_interval_ms)?,
                         rebalance_timeout_ms: parse_var("FLOW_REBALANCE_TIMEOUT_MS", d.rebalance_timeout_ms)?,
                         max_retained_outcomes: parse_var("FLOW_MAX_RETAINED_OUTCOMES", d.max_retained_outcomes)? };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ShardRouter::new(self.shard_prefix_len)?;
        if self.max_retry_attempts == 0 {
            return Err(FlowError::Validation("max_retry_attempts debe ser >= 1".into()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(FlowError::Validation("retry_max_delay_ms debe ser >= retry_base_delay_ms".into()));
        }
        if self.send_attempts == 0 {
            return Err(FlowError::Validation("send_attempts debe ser >= 1".into()));
        }
        if self.max_retained_outcomes == 0 {
            return Err(FlowError::Validation("max_retained_outcomes debe ser >= 1".into()));
        }
        Ok(())
    }

    pub fn router(&self) -> Result<ShardRouter> {
        ShardRouter::new(self.shard_prefix_len)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { max_attempts: self.max_retry_attempts,
                      base_delay: Duration::from_millis(self.retry_base_delay_ms),
                      max_delay: Duration::from_millis(self.retry_max_delay_ms) }
    }

    pub fn machine_settings(&self) -> MachineSettings {
        MachineSettings { send_attempts: self.send_attempts,
                          session_gap_timeout: chrono::Duration::milliseconds(self.session_gap_timeout_ms as i64) }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn rebalance_timeout(&self) -> Duration {
        Duration::from_millis(self.rebalance_timeout_ms)
    }
}
