use ::config::builder::{ConfigBuilder, DefaultState};
use ::config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::time::Duration;

use crate::control::{ClosingPolicies, ControlSettings};
use crate::exchange::retry::RetrySettings;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    pub url: String,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
}

impl EngineSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSettings {
    /// Exchange new strategies are created on
    pub name: String,
    pub gateway_url: String,
    pub timeout_secs: u64,
    /// Book used by `--paper`
    pub paper_state: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub close_position: RetrySettings,
    pub confirm_fill: RetrySettings,
    pub cancel_stop_loss: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    /// Without it actions are only serialized within this process
    pub redis_url: Option<String>,
    pub engine: EngineSettings,
    pub exchange: ExchangeSettings,
    pub retry: RetrySection,
    pub lock_ttl_secs: u64,
    pub log_filter: String,
}

impl Settings {
    /// Defaults, then `config.{toml,yaml,json}` if present, then `CRYPTOBOT_*` variables
    /// (`CRYPTOBOT_ENGINE__URL` for nested keys).
    pub fn load() -> Result<Self, ConfigError> {
        Self::builder()?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("CRYPTOBOT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Self>()?
            .validated()
    }

    /// The lock is a lease that is never renewed, so it has to outlive the slowest close
    fn validated(self) -> Result<Self, ConfigError> {
        let worst_case = self.worst_case_close();
        if self.lock_ttl() <= worst_case {
            return Err(ConfigError::Message(format!(
                "lock_ttl_secs ({}) must exceed the worst-case close of {} s",
                self.lock_ttl_secs,
                worst_case.as_secs()
            )));
        }
        Ok(self)
    }

    /// Every attempt of every close step runs into the request timeout, then sleeps.
    /// The position read and the close order share the `close_position` bounds.
    pub fn worst_case_close(&self) -> Duration {
        let timeout = self.exchange.timeout_secs;
        let retry = &self.retry;
        let secs: u64 = [
            retry.close_position,
            retry.close_position,
            retry.confirm_fill,
            retry.cancel_stop_loss,
        ]
        .iter()
        .map(|step| u64::from(step.max_attempts.max(1)).saturating_mul(step.interval_secs.saturating_add(timeout)))
        .fold(0, u64::saturating_add);
        Duration::from_secs(secs)
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("database_url", "postgres://localhost/cryptobot")?
            .set_default("engine.url", "http://127.0.0.1:8080")?
            .set_default("engine.timeout_secs", 10)?
            .set_default("engine.requests_per_second", 5)?
            .set_default("exchange.name", "FTX")?
            .set_default("exchange.gateway_url", "http://127.0.0.1:8090")?
            .set_default("exchange.timeout_secs", 10)?
            .set_default("exchange.paper_state", "paper_exchange.json")?
            .set_default("retry.close_position.max_attempts", 30)?
            .set_default("retry.close_position.interval_secs", 2)?
            .set_default("retry.confirm_fill.max_attempts", 30)?
            .set_default("retry.confirm_fill.interval_secs", 2)?
            .set_default("retry.cancel_stop_loss.max_attempts", 20)?
            .set_default("retry.cancel_stop_loss.interval_secs", 2)?
            .set_default("lock_ttl_secs", 1800)?
            .set_default("log_filter", "cryptobot_api=info")
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn control(&self) -> ControlSettings {
        ControlSettings {
            default_exchange: self.exchange.name.clone(),
            closing: ClosingPolicies {
                close_position: self.retry.close_position.into(),
                confirm_fill: self.retry.confirm_fill.into(),
                cancel_stop_loss: self.retry.cancel_stop_loss.into(),
            },
        }
    }
}
