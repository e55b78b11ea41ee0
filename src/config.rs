//! Crate-wide tunables (spec §4.1/§6), analogous to the teacher's
//! `src/config/mod.rs` but far smaller: this crate has no file-based
//! config loader, only environment-variable defaults.

use std::path::PathBuf;

use crate::logging::Level;
use crate::retry::RetryConfig;

/// Runtime configuration for a single embedding application.
///
/// Constructed with [`RuntimeConfig::from_env`] or built up directly for
/// tests. Nothing here is loaded from a config file — see spec.md §1's
/// out-of-scope list.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Used as the log file name stem and the `<APP>_LOG_LEVEL` env var
    /// prefix.
    pub app_name: String,
    pub log_level: Option<Level>,
    pub log_dir: PathBuf,
    pub console_logging: bool,
    pub retry: RetryConfig,
    pub transaction_base_dir: PathBuf,
}

impl RuntimeConfig {
    /// Defaults: `Info` log level, `./logs`, console echoing on, default
    /// retry ladder, transactions rooted at the current directory.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            log_level: None,
            log_dir: PathBuf::from("logs"),
            console_logging: true,
            retry: RetryConfig::default(),
            transaction_base_dir: PathBuf::from("."),
        }
    }

    /// Reads `<APP_NAME_UPPER>_LOG_LEVEL` from the environment (spec
    /// §4.1/§6); every other field keeps its programmer-supplied default.
    pub fn from_env(app_name: impl Into<String>) -> Self {
        let mut config = Self::new(app_name);
        let env_var = format!("{}_LOG_LEVEL", config.app_name.to_uppercase());
        if let Ok(raw) = std::env::var(&env_var) {
            config.log_level = Level::from_env_value(&raw);
        }
        config
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_transaction_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transaction_base_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_reads_the_app_prefixed_variable() {
        let var = "CCORETESTAPP_LOG_LEVEL";
        std::env::set_var(var, "debug");
        let config = RuntimeConfig::from_env("ccoretestapp");
        std::env::remove_var(var);

        assert_eq!(config.log_level, Some(Level::Debug));
    }

    #[test]
    fn from_env_defaults_when_variable_is_absent() {
        std::env::remove_var("CCORENOPE_LOG_LEVEL");
        let config = RuntimeConfig::from_env("ccorenope");
        assert_eq!(config.log_level, None);
    }
}
