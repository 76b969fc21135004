//! Environment-backed configuration for `chatsync-demo`.

use std::{env, error::Error, fmt};

use chatsync_core::ViewConfig;

const DEFAULT_SEED_ROOMS: usize = 2;
const DEFAULT_PASSWORD: &str = "demo-password";

/// Runtime configuration used by the demo.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoConfig {
    /// Tuning forwarded to every opened view.
    pub view: ViewConfig,
    /// Rooms created by the first demo account before any view opens.
    pub seed_rooms: usize,
    /// Password shared by the demo accounts.
    pub password: String,
}

impl DemoConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = ViewConfig::default();
        let page_size = parse_or("CHATSYNC_PAGE_SIZE", defaults.page_size, &mut lookup)?;
        let command_buffer =
            parse_or("CHATSYNC_COMMAND_BUFFER", defaults.command_buffer, &mut lookup)?;
        let event_buffer = parse_or("CHATSYNC_EVENT_BUFFER", defaults.event_buffer, &mut lookup)?;
        let item_warn_threshold = parse_or(
            "CHATSYNC_ITEM_WARN_THRESHOLD",
            defaults.item_warn_threshold,
            &mut lookup,
        )?;
        let seed_rooms = parse_or("CHATSYNC_DEMO_SEED_ROOMS", DEFAULT_SEED_ROOMS, &mut lookup)?;
        let password = lookup("CHATSYNC_DEMO_PASSWORD")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_PASSWORD.to_owned());

        require_nonzero("CHATSYNC_PAGE_SIZE", usize::from(page_size))?;
        require_nonzero("CHATSYNC_COMMAND_BUFFER", command_buffer)?;
        require_nonzero("CHATSYNC_EVENT_BUFFER", event_buffer)?;

        Ok(Self {
            view: ViewConfig {
                page_size,
                command_buffer,
                event_buffer,
                item_warn_threshold,
            },
            seed_rooms,
            password,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn require_nonzero(key: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<DemoConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        DemoConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_view_config() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg.view, ViewConfig::default());
        assert_eq!(cfg.seed_rooms, DEFAULT_SEED_ROOMS);
        assert_eq!(cfg.password, DEFAULT_PASSWORD);
    }

    #[test]
    fn parses_overrides() {
        let cfg = config_from_pairs(&[
            ("CHATSYNC_PAGE_SIZE", " 3 "),
            ("CHATSYNC_EVENT_BUFFER", "8"),
            ("CHATSYNC_DEMO_SEED_ROOMS", "7"),
            ("CHATSYNC_DEMO_PASSWORD", "hunter22"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.view.page_size, 3);
        assert_eq!(cfg.view.event_buffer, 8);
        assert_eq!(cfg.seed_rooms, 7);
        assert_eq!(cfg.password, "hunter22");
    }

    #[test]
    fn rejects_zero_page_size() {
        let err = config_from_pairs(&[("CHATSYNC_PAGE_SIZE", "0")]).expect_err("zero page size");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "CHATSYNC_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            }
        );
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("CHATSYNC_COMMAND_BUFFER", "lots")])
            .expect_err("invalid buffer should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHATSYNC_COMMAND_BUFFER",
                ..
            }
        ));
    }
}
