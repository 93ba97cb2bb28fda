use std::time::Duration;

use crate::crypto::Codec;
use crate::error::ConfigError;

pub const DEFAULT_BIND: &str = "127.0.0.1:7070";
pub const DEFAULT_CHANNEL: &str = "chat";
pub const DEFAULT_HISTORY_KEY: &str = "chat:messages";
pub const REPLAY_DEPTH: usize = 50;
pub const OUTBOUND_CAPACITY: usize = 256;
pub const SESSION_DEADLINE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    /// When unset, history and pub/sub stay inside this process.
    pub redis_url: Option<String>,
    pub channel: String,
    pub history_key: String,
    pub encryption_key: String,
    pub replay_depth: usize,
    pub outbound_capacity: usize,
    pub session_deadline: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let encryption_key = lookup("HUB_ENCRYPTION_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::Missing("HUB_ENCRYPTION_KEY"))?;

        let cfg = Self {
            bind: lookup("HUB_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            redis_url: lookup("REDIS_URL").filter(|u| !u.is_empty()),
            channel: lookup("REDIS_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            history_key: lookup("HUB_HISTORY_KEY")
                .unwrap_or_else(|| DEFAULT_HISTORY_KEY.to_string()),
            encryption_key,
            replay_depth: parse(&lookup, "HUB_REPLAY_DEPTH", REPLAY_DEPTH)?,
            outbound_capacity: parse(&lookup, "HUB_OUTBOUND_CAPACITY", OUTBOUND_CAPACITY)?,
            session_deadline: Duration::from_secs(parse(
                &lookup,
                "HUB_SESSION_TIMEOUT_SECS",
                SESSION_DEADLINE.as_secs(),
            )?),
        };

        if cfg.outbound_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "HUB_OUTBOUND_CAPACITY",
                reason: "must be at least 1".to_string(),
            });
        }
        if cfg.replay_depth > cfg.outbound_capacity {
            return Err(ConfigError::Invalid {
                name: "HUB_REPLAY_DEPTH",
                reason: format!(
                    "{} exceeds HUB_OUTBOUND_CAPACITY {}",
                    cfg.replay_depth, cfg.outbound_capacity
                ),
            });
        }
        Ok(cfg)
    }

    pub fn codec(&self) -> Result<Codec, ConfigError> {
        Codec::from_base64_key(&self.encryption_key).map_err(|e| ConfigError::Invalid {
            name: "HUB_ENCRYPTION_KEY",
            reason: e.to_string(),
        })
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let key = STANDARD.encode(Codec::generate_key());
        let cfg = Config::from_lookup(lookup(&[("HUB_ENCRYPTION_KEY", &key)])).unwrap();

        assert_eq!(cfg.bind, DEFAULT_BIND);
        assert_eq!(cfg.redis_url, None);
        assert_eq!(cfg.channel, "chat");
        assert_eq!(cfg.history_key, "chat:messages");
        assert_eq!(cfg.replay_depth, 50);
        assert_eq!(cfg.outbound_capacity, 256);
        assert_eq!(cfg.session_deadline, Duration::from_secs(600));
        assert!(cfg.codec().is_ok());
    }

    #[test]
    fn overrides() {
        let key = STANDARD.encode(Codec::generate_key());
        let cfg = Config::from_lookup(lookup(&[
            ("HUB_ENCRYPTION_KEY", &key),
            ("REDIS_URL", "redis://127.0.0.1/"),
            ("HUB_REPLAY_DEPTH", "10"),
            ("HUB_SESSION_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(cfg.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(cfg.replay_depth, 10);
        assert_eq!(cfg.session_deadline, Duration::from_secs(5));
    }

    #[test]
    fn rejects_missing_or_bad_key() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("HUB_ENCRYPTION_KEY"))
        ));

        let cfg = Config::from_lookup(lookup(&[("HUB_ENCRYPTION_KEY", "c2hvcnQ=")])).unwrap();
        assert!(cfg.codec().is_err());
    }

    #[test]
    fn rejects_bad_numbers() {
        let key = STANDARD.encode(Codec::generate_key());
        assert!(Config::from_lookup(lookup(&[
            ("HUB_ENCRYPTION_KEY", &key),
            ("HUB_REPLAY_DEPTH", "lots"),
        ]))
        .is_err());
        assert!(Config::from_lookup(lookup(&[
            ("HUB_ENCRYPTION_KEY", &key),
            ("HUB_OUTBOUND_CAPACITY", "0"),
        ]))
        .is_err());
    }

    #[test]
    fn rejects_replay_deeper_than_queue() {
        let key = STANDARD.encode(Codec::generate_key());
        let res = Config::from_lookup(lookup(&[
            ("HUB_ENCRYPTION_KEY", &key),
            ("HUB_REPLAY_DEPTH", "300"),
        ]));
        assert!(matches!(
            res,
            Err(ConfigError::Invalid {
                name: "HUB_REPLAY_DEPTH",
                ..
            })
        ));

        assert!(Config::from_lookup(lookup(&[
            ("HUB_ENCRYPTION_KEY", &key),
            ("HUB_REPLAY_DEPTH", "8"),
            ("HUB_OUTBOUND_CAPACITY", "8"),
        ]))
        .is_ok());
    }
}
