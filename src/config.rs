//! Broker configuration.
//!
//! Loaded from JSON. Every field has a default matching the classic broker,
//! so an empty object is a valid (if useless) configuration:
//!
//! ```json
//! {
//!   "local_ivo": "ivo://example.org/broker",
//!   "receiver": { "listen": "0.0.0.0:8098", "whitelist": ["10.0.0.0/8"] },
//!   "broadcaster": { "listen": "0.0.0.0:8099", "test_interval": "1h" },
//!   "remotes": ["voevent.example.org:8099"],
//!   "filters": ["//Param[@name='snr' and @value > 10]"],
//!   "event_db": { "path": "/var/lib/vtp-broker", "max_age": "30days" }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::event_db::{DEFAULT_MAX_AGE, DEFAULT_PRUNE_INTERVAL};
use crate::filter::{FilterCompiler, XPathCompiler};
use crate::ivoid::parse_ivoid;
use crate::tcp::broadcaster::{
    DEFAULT_ALIVE_INTERVAL, DEFAULT_QUEUE_DEPTH, DEFAULT_TEST_INTERVAL, MAX_ALIVE_COUNT,
    MAX_OUTSTANDING_ACK,
};
use crate::tcp::receiver::DEFAULT_RECEIVE_TIMEOUT;
use crate::tcp::subscriber::DEFAULT_ALIVE_TIMEOUT;
use crate::types::{VtpError, DEFAULT_MAX_FRAME_LEN};
use crate::whitelist::Whitelist;

fn default_local_ivo() -> String {
    "ivo://vtp-broker/default_ivo".to_string()
}

const fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// IVOA identifier this broker signs its messages with.
    #[serde(default = "default_local_ivo")]
    pub local_ivo: String,

    #[serde(default)]
    pub event_db: EventDbConfig,

    /// Accept submissions from authors.
    #[serde(default)]
    pub receiver: Option<ReceiverSection>,

    /// Relay events to subscribers.
    #[serde(default)]
    pub broadcaster: Option<BroadcasterSection>,

    /// Upstream brokers to subscribe to, as `host:port`.
    #[serde(default)]
    pub remotes: Vec<String>,

    /// Filters sent to every upstream.
    #[serde(default)]
    pub filters: Vec<String>,

    #[serde(default)]
    pub subscriber: SubscriberSection,

    #[serde(default)]
    pub handlers: HandlersConfig,

    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Threads for blocking work; defaults to the number of CPUs.
    #[serde(default)]
    pub workers: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            local_ivo: default_local_ivo(),
            event_db: EventDbConfig::default(),
            receiver: None,
            broadcaster: None,
            remotes: Vec::new(),
            filters: Vec::new(),
            subscriber: SubscriberSection::default(),
            handlers: HandlersConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            workers: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    std::env::temp_dir().join("vtp-broker")
}

const fn default_prune_interval() -> Duration {
    DEFAULT_PRUNE_INTERVAL
}

const fn default_max_age() -> Duration {
    DEFAULT_MAX_AGE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: Duration,

    #[serde(default = "default_max_age", with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for EventDbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

fn default_receiver_listen() -> String {
    "0.0.0.0:8098".to_string()
}

const fn default_receive_timeout() -> Duration {
    DEFAULT_RECEIVE_TIMEOUT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverSection {
    #[serde(default = "default_receiver_listen")]
    pub listen: String,

    /// Also listen on this Unix-domain socket (no whitelist applies).
    #[serde(default)]
    pub unix_socket: Option<PathBuf>,

    #[serde(default)]
    pub whitelist: Whitelist,

    #[serde(default = "default_receive_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Expect tar archives of events instead of single events.
    #[serde(default)]
    pub archive: bool,
}

impl Default for ReceiverSection {
    fn default() -> Self {
        Self {
            listen: default_receiver_listen(),
            unix_socket: None,
            whitelist: Whitelist::default(),
            timeout: DEFAULT_RECEIVE_TIMEOUT,
            archive: false,
        }
    }
}

fn default_broadcaster_listen() -> String {
    "0.0.0.0:8099".to_string()
}

const fn default_alive_interval() -> Duration {
    DEFAULT_ALIVE_INTERVAL
}

const fn default_test_interval() -> Duration {
    DEFAULT_TEST_INTERVAL
}

const fn default_max_alive_count() -> u32 {
    MAX_ALIVE_COUNT
}

const fn default_max_outstanding_ack() -> u32 {
    MAX_OUTSTANDING_ACK
}

const fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcasterSection {
    #[serde(default = "default_broadcaster_listen")]
    pub listen: String,

    #[serde(default)]
    pub whitelist: Whitelist,

    #[serde(default = "default_alive_interval", with = "humantime_serde")]
    pub alive_interval: Duration,

    /// `0s` disables test events.
    #[serde(default = "default_test_interval", with = "humantime_serde")]
    pub test_interval: Duration,

    #[serde(default = "default_max_alive_count")]
    pub max_alive_count: u32,

    #[serde(default = "default_max_outstanding_ack")]
    pub max_outstanding_ack: u32,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for BroadcasterSection {
    fn default() -> Self {
        Self {
            listen: default_broadcaster_listen(),
            whitelist: Whitelist::default(),
            alive_interval: DEFAULT_ALIVE_INTERVAL,
            test_interval: DEFAULT_TEST_INTERVAL,
            max_alive_count: MAX_ALIVE_COUNT,
            max_outstanding_ack: MAX_OUTSTANDING_ACK,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

const fn default_alive_timeout() -> Duration {
    DEFAULT_ALIVE_TIMEOUT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberSection {
    #[serde(default = "default_alive_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for SubscriberSection {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ALIVE_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

/// External command run for each accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlersConfig {
    /// Print accepted events to standard output.
    #[serde(default)]
    pub print_events: bool,

    /// Save accepted events into this directory.
    #[serde(default)]
    pub save_events: Option<PathBuf>,

    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

impl BrokerConfig {
    pub fn from_json(text: &str) -> Result<Self, VtpError> {
        serde_json::from_str(text).map_err(|e| VtpError::config(format!("invalid configuration: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, VtpError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| VtpError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Check everything that can be checked before binding sockets.
    pub fn validate(&self) -> Result<(), VtpError> {
        if parse_ivoid(&self.local_ivo).is_none() {
            return Err(VtpError::config(format!(
                "local_ivo {:?} is not a valid IVOA identifier",
                self.local_ivo
            )));
        }
        if self.receiver.is_none() && self.broadcaster.is_none() && self.remotes.is_empty() {
            return Err(VtpError::config("no services requested"));
        }
        for remote in &self.remotes {
            match remote.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                _ => {
                    return Err(VtpError::config(format!(
                        "remote {remote:?} is not of the form host:port"
                    )))
                }
            }
        }
        for filter in &self.filters {
            XPathCompiler
                .compile(filter)
                .map_err(|e| VtpError::config(e.to_string()))?;
        }
        if self.max_frame_len == 0 {
            return Err(VtpError::config("max_frame_len must be positive"));
        }
        if let Some(broadcaster) = &self.broadcaster {
            if broadcaster.alive_interval.is_zero() {
                return Err(VtpError::config("broadcaster alive_interval must be positive"));
            }
        }
        self.subscriber
            .backoff
            .validate()
            .map_err(VtpError::config)?;
        if self.event_db.prune_interval.is_zero() {
            return Err(VtpError::config("event_db prune_interval must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = BrokerConfig::from_json("{}").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.max_frame_len, 99_999);
        assert_eq!(config.event_db.max_age, Duration::from_secs(30 * 24 * 3600));
    }

    #[test]
    fn sections_fill_in_defaults() {
        let config = BrokerConfig::from_json(
            r#"{
                "local_ivo": "ivo://example.org/broker",
                "receiver": { "whitelist": ["10.0.0.0/8"], "timeout": "200s", "archive": true },
                "broadcaster": { "test_interval": "0s" },
                "remotes": ["upstream.example.org:8099"],
                "subscriber": { "backoff": { "max_delay": "5m" } },
                "handlers": { "commands": [{ "command": "/bin/true" }] }
            }"#,
        )
        .unwrap();

        let receiver = config.receiver.as_ref().unwrap();
        assert_eq!(receiver.listen, "0.0.0.0:8098");
        assert_eq!(receiver.timeout, Duration::from_secs(200));
        assert!(receiver.archive);
        assert!(!receiver.whitelist.allows("127.0.0.1".parse().unwrap()));

        let broadcaster = config.broadcaster.as_ref().unwrap();
        assert_eq!(broadcaster.listen, "0.0.0.0:8099");
        assert!(broadcaster.test_interval.is_zero());
        assert_eq!(broadcaster.alive_interval, Duration::from_secs(60));

        assert_eq!(config.subscriber.timeout, Duration::from_secs(120));
        assert_eq!(config.subscriber.backoff.max_delay, Duration::from_secs(300));
        assert_eq!(config.handlers.commands[0].args, Vec::<String>::new());
        config.validate().unwrap();
    }

    #[test]
    fn nothing_to_do_is_an_error() {
        let config = BrokerConfig::default();
        assert!(matches!(config.validate(), Err(VtpError::Config(_))));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = BrokerConfig {
            remotes: vec!["no-port".into()],
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());

        config.remotes = vec!["host:8099".into()];
        config.validate().unwrap();

        config.local_ivo = "not an ivoid".into();
        assert!(config.validate().is_err());

        config.local_ivo = default_local_ivo();
        config.filters = vec!["//Param[".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_backoff() {
        let with_backoff = |json: &str| {
            BrokerConfig::from_json(&format!(
                r#"{{ "remotes": ["host:8099"], "subscriber": {{ "backoff": {json} }} }}"#
            ))
            .unwrap()
        };

        with_backoff(r#"{ "jitter": 1.0 }"#).validate().unwrap();
        for bad in [
            r#"{ "jitter": 1.5 }"#,
            r#"{ "jitter": -0.1 }"#,
            r#"{ "jitter": 1e308 }"#,
            r#"{ "initial_delay": "2m", "max_delay": "1m" }"#,
        ] {
            assert!(
                matches!(with_backoff(bad).validate(), Err(VtpError::Config(_))),
                "{bad} should be refused"
            );
        }

        let mut config = with_backoff("{}");
        config.subscriber.backoff.jitter = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            BrokerConfig::from_json("{ \"receiver\": 12 }"),
            Err(VtpError::Config(_))
        ));
    }
}
