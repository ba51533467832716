use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::str::FromStr;

/// One OpenAI-compatible completion endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Endpoints for the model-id prefixes we understand
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub openai: ProviderConfig,
    pub deepseek: ProviderConfig,
    /// Overrides the model name sent for `deepseek-*` ids (self-hosted deployments)
    pub deepseek_name: Option<String>,
    pub anthropic: ProviderConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Upper bound on runs in flight; always >= 1
    pub max_parallel_runs: usize,
    /// Age after which an open run is considered dead and reclaimed
    pub timeout_seconds: i64,
    /// How often the driver calls `tick`
    pub poll_interval_secs: u64,
    /// Zone used when printing times in logs; scheduling is always UTC
    pub display_timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_runs: 20,
            timeout_seconds: 15 * 60,
            poll_interval_secs: 60,
            display_timezone: Tz::UTC,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub http_port: u16,

    pub scheduler: SchedulerConfig,
    pub max_execution_turns: usize,
    pub playbooks_dir: String,

    pub models: ModelConfig,
    /// Provider used to turn English descriptions into cron expressions
    pub cron_model_type: String,
    pub cron_model_name: String,
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} must be valid: {}", name, e)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let max_parallel_runs: usize = parse_or(&var, "MAX_PARALLEL_RUNS", 20)?;
        if max_parallel_runs < 1 {
            anyhow::bail!("MAX_PARALLEL_RUNS must be at least 1");
        }

        let timeout_seconds: i64 = parse_or(&var, "TIMEOUT_FOR_RUNNING_SCHEDULE_SECS", 15 * 60)?;
        if timeout_seconds < 1 {
            anyhow::bail!("TIMEOUT_FOR_RUNNING_SCHEDULE_SECS must be positive");
        }

        let display_timezone: Tz = var("DISPLAY_TIMEZONE")
            .map(|tz| {
                tz.parse::<Tz>()
                    .map_err(|_| anyhow::anyhow!("Invalid timezone: {}", tz))
            })
            .transpose()?
            .unwrap_or(Tz::UTC);

        Ok(Self {
            database_url: var("DATABASE_URL").context("DATABASE_URL must be set")?,
            http_port: parse_or(&var, "HTTP_PORT", 3000)?,

            scheduler: SchedulerConfig {
                max_parallel_runs,
                timeout_seconds,
                poll_interval_secs: parse_or(&var, "SCHEDULER_POLL_SECS", 60)?,
                display_timezone,
            },
            max_execution_turns: parse_or(&var, "MAX_EXECUTION_TURNS", 25)?,
            playbooks_dir: var("PLAYBOOKS_DIR").unwrap_or_else(|| "./playbooks".to_string()),

            models: ModelConfig {
                openai: ProviderConfig {
                    base_url: var("OPENAI_API_URL")
                        .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                    api_key: var("OPENAI_API_KEY"),
                },
                deepseek: ProviderConfig {
                    base_url: var("DEEPSEEK_URL")
                        .unwrap_or_else(|| "https://api.deepseek.com/v1".to_string()),
                    api_key: var("DEEPSEEK_API_KEY"),
                },
                deepseek_name: var("DEEPSEEK_NAME"),
                anthropic: ProviderConfig {
                    base_url: var("ANTHROPIC_URL")
                        .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
                    api_key: var("ANTHROPIC_API_KEY"),
                },
            },
            cron_model_type: var("CRON_MODEL_TYPE").unwrap_or_else(|| "deepseek".to_string()),
            cron_model_name: var("CRON_MODEL_NAME").unwrap_or_else(|| "deepseek-chat".to_string()),
        })
    }

    /// Model id (with provider prefix) used for cron generation
    pub fn cron_model(&self) -> String {
        match self.cron_model_type.as_str() {
            "openai" => format!("openai-{}", self.cron_model_name),
            "anthropic" => format!("anthropic-{}", self.cron_model_name),
            // deepseek ids already carry their prefix
            _ => self.cron_model_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/vigil")]))
            .unwrap();

        assert_eq!(config.scheduler.max_parallel_runs, 20);
        assert_eq!(config.scheduler.timeout_seconds, 900);
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.scheduler.display_timezone, Tz::UTC);
        assert_eq!(config.max_execution_turns, 25);
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.models.openai.base_url, "https://api.openai.com/v1");
        assert_eq!(config.cron_model(), "deepseek-chat");
    }

    #[test]
    fn test_database_url_required() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_scheduler_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/vigil"),
            ("MAX_PARALLEL_RUNS", "2"),
            ("TIMEOUT_FOR_RUNNING_SCHEDULE_SECS", "120"),
            ("DISPLAY_TIMEZONE", "Europe/Berlin"),
            ("CRON_MODEL_TYPE", "openai"),
            ("CRON_MODEL_NAME", "gpt-4o-mini"),
        ]))
        .unwrap();

        assert_eq!(config.scheduler.max_parallel_runs, 2);
        assert_eq!(config.scheduler.timeout_seconds, 120);
        assert_eq!(config.scheduler.display_timezone, chrono_tz::Europe::Berlin);
        assert_eq!(config.cron_model(), "openai-gpt-4o-mini");
    }

    #[test]
    fn test_rejects_zero_parallelism_and_bad_numbers() {
        let zero = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/vigil"),
            ("MAX_PARALLEL_RUNS", "0"),
        ]));
        assert!(zero.is_err());

        let garbage = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/vigil"),
            ("HTTP_PORT", "eighty"),
        ]));
        assert!(garbage.is_err());

        let bad_tz = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/vigil"),
            ("DISPLAY_TIMEZONE", "Mars/Olympus"),
        ]));
        assert!(bad_tz.is_err());
    }
}
