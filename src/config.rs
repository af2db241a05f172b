//! Runtime configuration from environment variables.
//!
//! Every setting has a default. A variable that is unset, blank or does not
//! parse leaves the default in place, so a typo degrades to stock behavior
//! instead of refusing to start.
//!
//! | Variable | Default |
//! |---|---|
//! | `RELAY_LISTEN_ADDR` | `0.0.0.0:3000` |
//! | `RELAY_DATABASE_URL` | `sqlite://clinic-relay.db` |
//! | `RELAY_DATABASE_MAX_CONNECTIONS` | `5` |
//! | `RELAY_PUBLIC_BASE_URL` | unset (derived from request headers) |
//! | `RELAY_SQUARE_SIGNATURE_KEY` | empty (verification bypassed) |
//! | `RELAY_SQUARE_ACCESS_TOKEN` | empty (order lookup disabled) |
//! | `RELAY_SQUARE_API_URL` | `https://connect.squareup.com` |
//! | `RELAY_STRIPE_WEBHOOK_SECRET` | empty (verification bypassed) |
//! | `RELAY_STRIPE_TOLERANCE_SECS` | `300` |
//! | `RELAY_OUTBOX_INTERVAL_MS` | `2000` |
//! | `RELAY_OUTBOX_BATCH_SIZE` | `25` |
//! | `RELAY_RETRY_MAX_ATTEMPTS` | `5` |
//! | `RELAY_RETRY_BASE_DELAY_SECS` | `300` |
//! | `RELAY_RETRY_INTERVAL_SECS` | `60` |
//! | `RELAY_HOSTED_POLL_INTERVAL_SECS` | `600` |
//! | `RELAY_VELOCITY_MAX_DEPOSITS` | `3` |
//! | `RELAY_VELOCITY_DEPOSIT_WINDOW_HOURS` | `24` |
//! | `RELAY_VELOCITY_MAX_REFUNDS` | `1` |
//! | `RELAY_VELOCITY_REFUND_WINDOW_DAYS` | `7` |
//! | `RELAY_VELOCITY_MAX_PHONES_PER_CARD` | unset (card check off) |
//! | `RELAY_VELOCITY_CARD_WINDOW_HOURS` | `24` |
//! | `RELAY_MESSAGING_API_URL` | `https://api.telnyx.com/v2` |
//! | `RELAY_MESSAGING_API_KEY` | empty |
//! | `RELAY_HTTP_TIMEOUT_SECS` | `10` |
//! | `RELAY_DEFAULT_FROM_NUMBERS` | empty |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::clients::{self, square_orders};
use crate::outbox::deliverer;
use crate::velocity::{VelocityConfig, VelocityRule};
use crate::webhooks::signature::DEFAULT_STRIPE_TOLERANCE;
use crate::worker::{RetryConfig, hosted};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://clinic-relay.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_MESSAGING_API_URL: &str = "https://api.telnyx.com/v2";

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub database_max_connections: u32,
    pub public_base_url: Option<String>,

    pub square_signature_key: String,
    pub square_access_token: String,
    pub square_api_url: String,
    pub stripe_webhook_secret: String,
    pub stripe_tolerance: Duration,

    pub outbox_interval: Duration,
    pub outbox_batch_size: u32,
    pub retry: RetryConfig,
    pub hosted_poll_interval: Duration,
    pub velocity: VelocityConfig,

    pub messaging_api_url: String,
    pub messaging_api_key: String,
    pub http_timeout: Duration,
    /// `org=+1555...,*=+1555...`; see [`crate::numbers::StaticNumberResolver::parse`].
    pub default_from_numbers: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_max_connections: DEFAULT_MAX_CONNECTIONS,
            public_base_url: None,
            square_signature_key: String::new(),
            square_access_token: String::new(),
            square_api_url: square_orders::DEFAULT_BASE_URL.to_string(),
            stripe_webhook_secret: String::new(),
            stripe_tolerance: DEFAULT_STRIPE_TOLERANCE,
            outbox_interval: deliverer::DEFAULT_INTERVAL,
            outbox_batch_size: deliverer::DEFAULT_BATCH_SIZE,
            retry: RetryConfig::default(),
            hosted_poll_interval: hosted::DEFAULT_INTERVAL,
            velocity: VelocityConfig::default(),
            messaging_api_url: DEFAULT_MESSAGING_API_URL.to_string(),
            messaging_api_key: String::new(),
            http_timeout: clients::DEFAULT_TIMEOUT,
            default_from_numbers: String::new(),
        }
    }
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = Env { lookup };
        let d = Config::default();

        let velocity = VelocityConfig {
            deposit: rule(
                d.velocity.deposit.clone(),
                env.parse("RELAY_VELOCITY_MAX_DEPOSITS"),
                env.parse::<u64>("RELAY_VELOCITY_DEPOSIT_WINDOW_HOURS")
                    .map(|h| Duration::from_secs(h * HOUR)),
            ),
            refund: rule(
                d.velocity.refund.clone(),
                env.parse("RELAY_VELOCITY_MAX_REFUNDS"),
                env.parse::<u64>("RELAY_VELOCITY_REFUND_WINDOW_DAYS")
                    .map(|days| Duration::from_secs(days * DAY)),
            ),
            card: rule(
                d.velocity.card.clone(),
                env.parse("RELAY_VELOCITY_MAX_PHONES_PER_CARD"),
                env.parse::<u64>("RELAY_VELOCITY_CARD_WINDOW_HOURS")
                    .map(|h| Duration::from_secs(h * HOUR)),
            ),
            ..d.velocity
        };

        let retry = RetryConfig {
            max_attempts: env.positive("RELAY_RETRY_MAX_ATTEMPTS").unwrap_or(d.retry.max_attempts),
            base_delay: env.secs("RELAY_RETRY_BASE_DELAY_SECS").unwrap_or(d.retry.base_delay),
            interval: env.secs("RELAY_RETRY_INTERVAL_SECS").unwrap_or(d.retry.interval),
            ..d.retry
        };

        Config {
            listen_addr: env.parse("RELAY_LISTEN_ADDR").unwrap_or(d.listen_addr),
            database_url: env.string("RELAY_DATABASE_URL").unwrap_or(d.database_url),
            database_max_connections: env
                .positive("RELAY_DATABASE_MAX_CONNECTIONS")
                .unwrap_or(d.database_max_connections),
            public_base_url: env.string("RELAY_PUBLIC_BASE_URL"),
            square_signature_key: env.string("RELAY_SQUARE_SIGNATURE_KEY").unwrap_or_default(),
            square_access_token: env.string("RELAY_SQUARE_ACCESS_TOKEN").unwrap_or_default(),
            square_api_url: env.string("RELAY_SQUARE_API_URL").unwrap_or(d.square_api_url),
            stripe_webhook_secret: env.string("RELAY_STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            stripe_tolerance: env.secs("RELAY_STRIPE_TOLERANCE_SECS").unwrap_or(d.stripe_tolerance),
            outbox_interval: env
                .positive::<u64>("RELAY_OUTBOX_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.outbox_interval),
            outbox_batch_size: env.positive("RELAY_OUTBOX_BATCH_SIZE").unwrap_or(d.outbox_batch_size),
            retry,
            hosted_poll_interval: env
                .secs("RELAY_HOSTED_POLL_INTERVAL_SECS")
                .unwrap_or(d.hosted_poll_interval),
            velocity,
            messaging_api_url: env.string("RELAY_MESSAGING_API_URL").unwrap_or(d.messaging_api_url),
            messaging_api_key: env.string("RELAY_MESSAGING_API_KEY").unwrap_or_default(),
            http_timeout: env.secs("RELAY_HTTP_TIMEOUT_SECS").unwrap_or(d.http_timeout),
            default_from_numbers: env.string("RELAY_DEFAULT_FROM_NUMBERS").unwrap_or_default(),
        }
    }
}

/// A rule with its maximum and window overridden where given. A maximum of
/// zero disables the rule and a positive one enables it.
fn rule(base: VelocityRule, max_allowed: Option<u64>, window: Option<Duration>) -> VelocityRule {
    VelocityRule {
        max_allowed: max_allowed.unwrap_or(base.max_allowed),
        window: window.filter(|w| !w.is_zero()).unwrap_or(base.window),
        enabled: max_allowed.map_or(base.enabled, |max| max > 0),
        ..base
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.string(name)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(variable = name, value = %raw, "Ignoring unparseable setting, using default");
                None
            }
        }
    }

    fn positive<T: FromStr + PartialOrd + Default>(&self, name: &str) -> Option<T> {
        self.parse(name).filter(|v: &T| *v > T::default())
    }

    fn secs(&self, name: &str) -> Option<Duration> {
        self.positive::<u64>(name).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let c = config(&[]);
        assert_eq!(c.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(c.database_url, DEFAULT_DATABASE_URL);
        assert!(c.public_base_url.is_none());
        assert_eq!(c.stripe_tolerance, Duration::from_secs(300));
        assert_eq!(c.outbox_interval, Duration::from_secs(2));
        assert_eq!(c.retry, RetryConfig::default());
        assert_eq!(c.velocity, VelocityConfig::default());
        assert_eq!(c.http_timeout, Duration::from_secs(10));
        assert!(c.square_signature_key.is_empty());
    }

    #[test]
    fn values_override_defaults() {
        let c = config(&[
            ("RELAY_LISTEN_ADDR", "127.0.0.1:8080"),
            ("RELAY_DATABASE_URL", "sqlite::memory:"),
            ("RELAY_PUBLIC_BASE_URL", "https://relay.example.com"),
            ("RELAY_STRIPE_WEBHOOK_SECRET", "whsec_x"),
            ("RELAY_OUTBOX_INTERVAL_MS", "250"),
            ("RELAY_OUTBOX_BATCH_SIZE", "10"),
            ("RELAY_RETRY_MAX_ATTEMPTS", "3"),
            ("RELAY_RETRY_BASE_DELAY_SECS", "30"),
            ("RELAY_HOSTED_POLL_INTERVAL_SECS", "120"),
            ("RELAY_VELOCITY_MAX_DEPOSITS", "5"),
            ("RELAY_VELOCITY_DEPOSIT_WINDOW_HOURS", "12"),
            ("RELAY_VELOCITY_REFUND_WINDOW_DAYS", "30"),
        ]);
        assert_eq!(c.listen_addr.port(), 8080);
        assert_eq!(c.database_url, "sqlite::memory:");
        assert_eq!(c.public_base_url.as_deref(), Some("https://relay.example.com"));
        assert_eq!(c.stripe_webhook_secret, "whsec_x");
        assert_eq!(c.outbox_interval, Duration::from_millis(250));
        assert_eq!(c.outbox_batch_size, 10);
        assert_eq!(c.retry.max_attempts, 3);
        assert_eq!(c.retry.base_delay, Duration::from_secs(30));
        assert_eq!(c.retry.max_delay, RetryConfig::DEFAULT_MAX_DELAY);
        assert_eq!(c.hosted_poll_interval, Duration::from_secs(120));
        assert_eq!(c.velocity.deposit.max_allowed, 5);
        assert_eq!(c.velocity.deposit.window, Duration::from_secs(12 * HOUR));
        assert_eq!(c.velocity.refund.max_allowed, 1);
        assert_eq!(c.velocity.refund.window, Duration::from_secs(30 * DAY));
    }

    #[test]
    fn unparseable_and_zero_values_fall_back() {
        let c = config(&[
            ("RELAY_LISTEN_ADDR", "not an address"),
            ("RELAY_OUTBOX_BATCH_SIZE", "-4"),
            ("RELAY_RETRY_MAX_ATTEMPTS", "0"),
            ("RELAY_HTTP_TIMEOUT_SECS", "soon"),
            ("RELAY_DATABASE_URL", "   "),
        ]);
        assert_eq!(c.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(c.outbox_batch_size, deliverer::DEFAULT_BATCH_SIZE);
        assert_eq!(c.retry.max_attempts, RetryConfig::DEFAULT_MAX_ATTEMPTS);
        assert_eq!(c.http_timeout, clients::DEFAULT_TIMEOUT);
        assert_eq!(c.database_url, DEFAULT_DATABASE_URL);
    }

    #[test]
    fn zero_velocity_max_disables_rule() {
        let c = config(&[("RELAY_VELOCITY_MAX_REFUNDS", "0")]);
        assert!(!c.velocity.refund.enabled);
        assert!(c.velocity.deposit.enabled);
    }

    #[test]
    fn card_rule_is_enabled_by_setting_a_maximum() {
        assert!(!config(&[]).velocity.card.enabled);

        let c = config(&[
            ("RELAY_VELOCITY_MAX_PHONES_PER_CARD", "2"),
            ("RELAY_VELOCITY_CARD_WINDOW_HOURS", "6"),
        ]);
        assert!(c.velocity.card.enabled);
        assert_eq!(c.velocity.card.max_allowed, 2);
        assert_eq!(c.velocity.card.window, Duration::from_secs(6 * HOUR));
    }
}
