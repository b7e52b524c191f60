//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration — time budget and batch caps for one tick.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock budget for one invocation of the guard.
    pub time_budget: Duration,
    /// Safety margin subtracted from the budget so a phase stops cleanly
    /// before an external hard kill.
    pub safety_margin: Duration,
    /// Maximum leads selected per campaign per send cycle.
    pub max_leads_per_campaign_cycle: usize,
    /// Number of accounts whose mailboxes are checked per inbound cycle.
    pub inbound_batch_accounts: usize,
    /// Pause between mailbox connections within one inbound cycle.
    pub inbound_stagger: Duration,
    /// Maximum reminders dispatched per tick.
    pub reminder_batch: usize,
    /// Warmup traffic settings.
    pub warmup: WarmupConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(55),
            safety_margin: Duration::from_secs(5),
            max_leads_per_campaign_cycle: 50,
            inbound_batch_accounts: 5,
            inbound_stagger: Duration::from_secs(2),
            reminder_batch: 20,
            warmup: WarmupConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            time_budget: env_secs("OUTFLOW_TIME_BUDGET_SECS", defaults.time_budget),
            safety_margin: env_secs("OUTFLOW_SAFETY_MARGIN_SECS", defaults.safety_margin),
            max_leads_per_campaign_cycle: env_parse(
                "OUTFLOW_MAX_LEADS_PER_CYCLE",
                defaults.max_leads_per_campaign_cycle,
            ),
            inbound_batch_accounts: env_parse(
                "OUTFLOW_INBOUND_BATCH_ACCOUNTS",
                defaults.inbound_batch_accounts,
            ),
            inbound_stagger: env_secs("OUTFLOW_INBOUND_STAGGER_SECS", defaults.inbound_stagger),
            reminder_batch: env_parse("OUTFLOW_REMINDER_BATCH", defaults.reminder_batch),
            warmup: WarmupConfig::from_env(),
        }
    }
}

/// Warmup traffic settings.
#[derive(Debug, Clone)]
pub struct WarmupConfig {
    /// Token embedded in every warmup subject line, used by the maintenance
    /// phase to locate warmup mail in a mailbox.
    pub subject_marker: String,
    /// Folder names checked for misplaced warmup mail.
    pub spam_folders: Vec<String>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            subject_marker: "OFW".to_string(),
            spam_folders: vec!["Junk".to_string(), "Spam".to_string()],
        }
    }
}

impl WarmupConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let subject_marker =
            std::env::var("OUTFLOW_WARMUP_MARKER").unwrap_or(defaults.subject_marker);

        let spam_folders: Vec<String> = std::env::var("OUTFLOW_SPAM_FOLDERS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.spam_folders);

        Self {
            subject_marker,
            spam_folders,
        }
    }
}

/// HTTP trigger surface configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the trigger endpoint listens on.
    pub port: u16,
    /// Bearer token the external scheduler must present.
    pub trigger_token: String,
}

impl ServerConfig {
    /// Build config from environment. The trigger token is required — an
    /// unauthenticated tick endpoint would let anyone drain send capacity.
    pub fn from_env() -> Result<Self, ConfigError> {
        let trigger_token = std::env::var("OUTFLOW_TRIGGER_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("OUTFLOW_TRIGGER_TOKEN".to_string()))?;

        let port: u16 = env_parse("OUTFLOW_PORT", 8080);

        Ok(Self {
            port,
            trigger_token,
        })
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_leave_working_margin() {
        let config = EngineConfig::default();
        assert!(config.safety_margin < config.time_budget);
    }

    #[test]
    fn warmup_defaults_have_marker_and_spam_folders() {
        let warmup = WarmupConfig::default();
        assert!(!warmup.subject_marker.is_empty());
        assert!(!warmup.spam_folders.is_empty());
    }
}
