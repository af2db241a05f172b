//! Velocity checks for deposits, refunds and shared cards.
//!
//! Each check increments a windowed counter and compares the new count to the
//! rule's maximum. The card check counts distinct phone numbers per card
//! fingerprint instead of attempts. Checks fail open: if the counter store errors or times out
//! the action is allowed and the failure is logged at error level.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::store::{CounterError, CounterState, CounterStore};

/// Message attached to results produced while the store is unavailable.
pub const UNAVAILABLE_MESSAGE: &str = "velocity check unavailable";

/// A single rate rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VelocityRule {
    /// Short name, used in the counter key and in results.
    pub check_type: &'static str,
    pub max_allowed: u64,
    pub window: Duration,
    pub enabled: bool,
}

impl VelocityRule {
    pub const fn new(check_type: &'static str, max_allowed: u64, window: Duration) -> Self {
        VelocityRule {
            check_type,
            max_allowed,
            window,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Deposit, refund and card rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VelocityConfig {
    pub deposit: VelocityRule,
    pub refund: VelocityRule,
    /// Distinct phones per card fingerprint.
    pub card: VelocityRule,
    /// Bound on each counter store call.
    pub store_timeout: Duration,
}

impl VelocityConfig {
    /// Default deposit limit: 3 per phone per 24 hours.
    pub const DEFAULT_DEPOSIT: VelocityRule =
        VelocityRule::new("deposit", 3, Duration::from_secs(24 * 60 * 60));

    /// Default refund limit: 1 per lead per 7 days.
    pub const DEFAULT_REFUND: VelocityRule =
        VelocityRule::new("refund", 1, Duration::from_secs(7 * 24 * 60 * 60));

    /// Default card limit: 5 phones per card per 24 hours, off until enabled.
    pub const DEFAULT_CARD: VelocityRule = VelocityRule {
        enabled: false,
        ..VelocityRule::new("card", 5, Duration::from_secs(24 * 60 * 60))
    };

    pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
}

impl Default for VelocityConfig {
    fn default() -> Self {
        VelocityConfig {
            deposit: Self::DEFAULT_DEPOSIT,
            refund: Self::DEFAULT_REFUND,
            card: Self::DEFAULT_CARD,
            store_timeout: Self::DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// Outcome of a velocity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VelocityResult {
    pub allowed: bool,
    pub check_type: String,
    pub current_count: u64,
    pub max_allowed: u64,
    pub window_expiry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VelocityResult {
    fn allowed_without_count(rule: &VelocityRule, message: Option<&str>) -> Self {
        VelocityResult {
            allowed: true,
            check_type: rule.check_type.to_string(),
            current_count: 0,
            max_allowed: rule.max_allowed,
            window_expiry: None,
            message: message.map(str::to_string),
        }
    }
}

/// Builds a counter key: `velocity:{check_type}:{part}:{part}...`.
pub fn velocity_key(check_type: &str, parts: &[&str]) -> String {
    let mut key = format!("velocity:{check_type}");
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

/// Applies velocity rules against a counter store.
#[derive(Clone)]
pub struct VelocityChecker {
    store: Arc<dyn CounterStore>,
    config: VelocityConfig,
}

impl VelocityChecker {
    pub fn new(store: Arc<dyn CounterStore>, config: VelocityConfig) -> Self {
        VelocityChecker { store, config }
    }

    pub fn config(&self) -> &VelocityConfig {
        &self.config
    }

    /// Counts one attempt for the key built from `parts` and reports whether
    /// it is within the rule.
    ///
    /// Disabled rules allow without touching the store.
    pub async fn check_and_increment(&self, rule: &VelocityRule, parts: &[&str]) -> VelocityResult {
        self.check_and_increment_at(rule, parts, Utc::now()).await
    }

    pub async fn check_and_increment_at(
        &self,
        rule: &VelocityRule,
        parts: &[&str],
        now: DateTime<Utc>,
    ) -> VelocityResult {
        if !rule.enabled {
            return VelocityResult::allowed_without_count(rule, None);
        }

        let key = velocity_key(rule.check_type, parts);
        let increment = self.store.increment(&key, rule.window, now);
        self.evaluate(rule, &key, increment).await
    }

    /// Bounds a store call by the store timeout and compares its count to
    /// `rule`. Store failures allow.
    async fn evaluate(
        &self,
        rule: &VelocityRule,
        key: &str,
        call: impl Future<Output = Result<CounterState, CounterError>>,
    ) -> VelocityResult {
        let outcome = tokio::time::timeout(self.config.store_timeout, call)
            .await
            .unwrap_or_else(|_| Err(CounterError::Unavailable("counter store timed out".to_string())));

        let state = match outcome {
            Ok(state) => state,
            Err(e) => {
                error!(
                    check_type = rule.check_type,
                    key = %key,
                    error = %e,
                    "Velocity store failed, allowing"
                );
                return VelocityResult::allowed_without_count(rule, Some(UNAVAILABLE_MESSAGE));
            }
        };

        let allowed = state.count <= rule.max_allowed;
        let message = if allowed {
            debug!(check_type = rule.check_type, key = %key, count = state.count, "Velocity check passed");
            None
        } else {
            warn!(
                check_type = rule.check_type,
                key = %key,
                count = state.count,
                max_allowed = rule.max_allowed,
                window_expiry = %state.expires_at,
                "Velocity limit exceeded"
            );
            Some(format!(
                "{} limit of {} exceeded; try again after {}",
                rule.check_type,
                rule.max_allowed,
                state.expires_at.to_rfc3339()
            ))
        };

        VelocityResult {
            allowed,
            check_type: rule.check_type.to_string(),
            current_count: state.count,
            max_allowed: rule.max_allowed,
            window_expiry: Some(state.expires_at),
            message,
        }
    }

    /// Deposit attempts per phone number within a tenant.
    pub async fn check_deposit(&self, org_id: &str, phone: &str) -> VelocityResult {
        let rule = self.config.deposit.clone();
        self.check_and_increment(&rule, &[org_id, phone]).await
    }

    /// Refund requests per lead within a tenant.
    pub async fn check_refund(&self, org_id: &str, lead_id: &str) -> VelocityResult {
        let rule = self.config.refund.clone();
        self.check_and_increment(&rule, &[org_id, lead_id]).await
    }

    /// Records `phone` against a card and reports whether the card has been
    /// used by more distinct phones than allowed. A blank fingerprint allows.
    pub async fn check_card(&self, org_id: &str, fingerprint: &str, phone: &str) -> VelocityResult {
        self.check_card_at(org_id, fingerprint, phone, Utc::now()).await
    }

    pub async fn check_card_at(
        &self,
        org_id: &str,
        fingerprint: &str,
        phone: &str,
        now: DateTime<Utc>,
    ) -> VelocityResult {
        let rule = &self.config.card;
        if !rule.enabled || fingerprint.trim().is_empty() {
            return VelocityResult::allowed_without_count(rule, None);
        }
        let key = velocity_key(rule.check_type, &[org_id, fingerprint]);
        let add = self.store.add_member(&key, phone, rule.window, now);
        self.evaluate(rule, &key, add).await
    }

    /// Reads the deposit counter without counting an attempt.
    pub async fn deposit_stats(&self, org_id: &str, phone: &str) -> Result<VelocityResult, CounterError> {
        let rule = &self.config.deposit;
        let key = velocity_key(rule.check_type, &[org_id, phone]);
        let state = self.store.current(&key, Utc::now()).await?;
        let count = state.map_or(0, |s| s.count);
        Ok(VelocityResult {
            allowed: count < rule.max_allowed || !rule.enabled,
            check_type: rule.check_type.to_string(),
            current_count: count,
            max_allowed: rule.max_allowed,
            window_expiry: state.map(|s| s.expires_at),
            message: None,
        })
    }

    /// Clears the deposit counter, e.g. after manual review.
    pub async fn reset_deposit(&self, org_id: &str, phone: &str) -> Result<(), CounterError> {
        let key = velocity_key(self.config.deposit.check_type, &[org_id, phone]);
        self.store.reset(&key).await
    }

    /// Clears the refund counter.
    pub async fn reset_refund(&self, org_id: &str, lead_id: &str) -> Result<(), CounterError> {
        let key = velocity_key(self.config.refund.check_type, &[org_id, lead_id]);
        self.store.reset(&key).await
    }
}
