//! Application configuration, read from the environment (and `.env`)
//!
//! Missing variables take defaults; malformed ones are reported as
//! `ConfigError` rather than silently ignored.

use crate::assessment::AssessmentPolicy;
use crate::error::UnderwritingError;
use crate::executor::{RetryPolicy, StepPolicies};
use crate::sources::MockFailures;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregatorKind {
    Gemini,
    Ollama,
    #[default]
    Rules,
}

impl FromStr for AggregatorKind {
    type Err = UnderwritingError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "rules" | "none" => Ok(Self::Rules),
            other => Err(UnderwritingError::ConfigError(format!(
                "MODEL_PROVIDER '{}' is not supported (expected gemini, ollama or rules)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub kind: AggregatorKind,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            kind: AggregatorKind::Rules,
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Where fetched records come from. No base URL means the mock source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSourceConfig {
    pub base_url: Option<String>,
    pub mock_failures: MockFailures,
    /// Artificial delay on every mock call, for exercising attempt timeouts.
    pub mock_latency: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewConfig {
    /// Deadline for a parked review; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Periodic re-drive of instances whose last drive stopped short.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryConfig {
    /// `None` disables the sweeper; startup recovery still runs.
    pub sweep_interval: Option<Duration>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Top-level configuration for the service.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub database_url: Option<String>,
    pub data_source: DataSourceConfig,
    pub aggregator: AggregatorConfig,
    pub retry: StepPolicies,
    pub assessment: AssessmentPolicy,
    pub review: ReviewConfig,
    pub recovery: RecoveryConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };

        let port = match vars.first(&["API_PORT", "PORT"]) {
            Some(raw) => raw
                .parse()
                .map_err(|_| invalid("API_PORT", &raw, "a valid u16"))?,
            None => 8080,
        };

        let aggregator = AggregatorConfig {
            kind: vars.parse_or("MODEL_PROVIDER", AggregatorKind::Rules)?,
            gemini_api_key: vars.get("GEMINI_API_KEY"),
            gemini_model: vars.get("GEMINI_MODEL").unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            ollama_url: vars.get("OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".to_string()),
            ollama_model: vars.get("OLLAMA_MODEL").unwrap_or_else(|| "llama3:latest".to_string()),
        };

        let data_source = DataSourceConfig {
            base_url: vars.get("DATA_SOURCE_BASE_URL"),
            mock_failures: MockFailures {
                bank: vars.parse_or("MOCK_BANK_FAILURES", 0)?,
                documents: vars.parse_or("MOCK_DOCUMENTS_FAILURES", 0)?,
                primary_credit: vars.parse_or("MOCK_PRIMARY_CREDIT_FAILURES", 0)?,
                fallback_credit: vars.parse_or("MOCK_FALLBACK_CREDIT_FAILURES", 0)?,
            },
            mock_latency: vars
                .parse::<u64>("MOCK_LATENCY_MS")?
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        };

        let defaults = AssessmentPolicy::default();
        let assessment = AssessmentPolicy {
            income_to_amount_ratio: vars.parse_or("INCOME_TO_AMOUNT_RATIO", defaults.income_to_amount_ratio)?,
            min_account_balance: vars.parse_or("MIN_ACCOUNT_BALANCE", defaults.min_account_balance)?,
            min_credit_score: vars.parse_or("MIN_CREDIT_SCORE", defaults.min_credit_score)?,
            approve_credit_score: vars.parse_or("APPROVE_CREDIT_SCORE", defaults.approve_credit_score)?,
            default_monthly_expenses: vars
                .parse_or("DEFAULT_MONTHLY_EXPENSES", defaults.default_monthly_expenses)?,
        };

        let review = ReviewConfig {
            timeout: vars
                .parse::<u64>("REVIEW_TIMEOUT_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            sweep_interval: Duration::from_secs(vars.parse_or::<u64>("REVIEW_SWEEP_INTERVAL_SECS", 60)?.max(1)),
        };

        let recovery = RecoveryConfig {
            sweep_interval: Some(vars.parse_or::<u64>("RECOVERY_SWEEP_INTERVAL_SECS", 60)?)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        Ok(Self {
            server: ServerConfig { port },
            telemetry: TelemetryConfig {
                log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            },
            database_url: vars.first(&["POSTGRES_URL", "DATABASE_URL"]),
            data_source,
            aggregator,
            retry: retry_policies(&vars)?,
            assessment,
            review,
            recovery,
        })
    }
}

fn retry_policies<F>(vars: &Vars<'_, F>) -> Result<StepPolicies>
where
    F: Fn(&str) -> Option<String>,
{
    let initial = Duration::from_millis(vars.parse_or("RETRY_INITIAL_INTERVAL_MS", 1_000)?);
    let maximum = Duration::from_millis(vars.parse_or("RETRY_MAX_INTERVAL_MS", 10_000)?);
    let coefficient: f64 = vars.parse_or("RETRY_BACKOFF_COEFFICIENT", 2.0)?;
    let fetch_timeout = Duration::from_secs(vars.parse_or("FETCH_TIMEOUT_SECS", 60)?);
    let aggregation_timeout = Duration::from_secs(vars.parse_or("AGGREGATION_TIMEOUT_SECS", 1_200)?);

    let fetch = |attempts: u32| {
        RetryPolicy::fetch()
            .with_intervals(initial, maximum, coefficient)
            .with_attempt_timeout(fetch_timeout)
            .with_max_attempts(attempts)
    };

    Ok(StepPolicies {
        bank: fetch(vars.parse_or("BANK_MAX_ATTEMPTS", 10)?),
        documents: fetch(vars.parse_or("DOCUMENTS_MAX_ATTEMPTS", 10)?),
        primary_credit: fetch(vars.parse_or("PRIMARY_CREDIT_MAX_ATTEMPTS", 3)?),
        fallback_credit: fetch(vars.parse_or("FALLBACK_CREDIT_MAX_ATTEMPTS", 10)?),
        aggregation: RetryPolicy::aggregation()
            .with_intervals(initial, maximum, coefficient)
            .with_attempt_timeout(aggregation_timeout)
            .with_max_attempts(vars.parse_or("AGGREGATION_MAX_ATTEMPTS", 10)?),
        checkpoint: RetryPolicy::persistence()
            .with_max_attempts(vars.parse_or("CHECKPOINT_MAX_ATTEMPTS", 5)?),
    })
}

struct Vars<'a, F> {
    lookup: &'a F,
}

impl<'a, F> Vars<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, &raw, std::any::type_name::<T>())),
            None => Ok(None),
        }
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.parse(key)?.unwrap_or(default))
    }
}

fn invalid(key: &str, raw: &str, expected: &str) -> UnderwritingError {
    UnderwritingError::ConfigError(format!("{}='{}' is not {}", key, raw, expected))
}
