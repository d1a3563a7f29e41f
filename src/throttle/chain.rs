//! Ordered evaluation of throttle rules into a single admission decision.

use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::rule::ThrottleRule;

/// How the chain treats a rule whose store failed to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the rule as not throttling; the request carries on.
    #[default]
    FailOpen,
    /// Treat the rule as throttling; the request is rejected.
    FailClosed,
}

/// Outcome of evaluating a chain against one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Every rule passed; hand the request downstream.
    Allowed,
    /// The named rule rejected the request.
    Rejected {
        /// Prefix of the rule that rejected.
        rule: String,
    },
}

impl Decision {
    /// Whether the request may proceed downstream.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// An ordered list of rules sharing one rejection response.
///
/// Rules are evaluated in order. The first rule that throttles ends the
/// evaluation: later rules are neither consulted nor recorded against. A rule
/// that lets the request through records an event before the next rule runs.
#[derive(Debug)]
pub struct ThrottleChain {
    rules: Vec<Arc<dyn ThrottleRule>>,
    reject_status: StatusCode,
    reject_body: Bytes,
    failure_policy: FailurePolicy,
}

impl ThrottleChain {
    /// Create a fail-open chain.
    pub fn new(
        rules: Vec<Arc<dyn ThrottleRule>>,
        reject_status: StatusCode,
        reject_body: impl Into<Bytes>,
    ) -> Self {
        Self {
            rules,
            reject_status,
            reject_body: reject_body.into(),
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Override how storage failures are treated.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Run the rules against a request head.
    pub async fn evaluate(&self, request: &Parts) -> Decision {
        for rule in &self.rules {
            let throttle = match rule.should_throttle(request).await {
                Ok(throttle) => throttle,
                Err(e) => {
                    warn!(
                        prefix = %rule.prefix(),
                        error = %e,
                        policy = ?self.failure_policy,
                        "Throttle rule failed to evaluate"
                    );
                    self.failure_policy == FailurePolicy::FailClosed
                }
            };

            if throttle {
                debug!(
                    prefix = %rule.prefix(),
                    method = %request.method,
                    path = %request.uri.path(),
                    "Request throttled"
                );
                return Decision::Rejected {
                    rule: rule.prefix().to_string(),
                };
            }

            if let Err(e) = rule.append_event(request).await {
                warn!(prefix = %rule.prefix(), error = %e, "Failed to record throttle event");
            }
        }

        trace!(method = %request.method, path = %request.uri.path(), "Request admitted");
        Decision::Allowed
    }

    /// Stop background work of every rule.
    pub async fn shutdown(&self) {
        for rule in &self.rules {
            rule.shutdown().await;
        }
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Arc<dyn ThrottleRule>] {
        &self.rules
    }

    /// Status code of the rejection response.
    pub fn reject_status(&self) -> StatusCode {
        self.reject_status
    }

    /// Body of the rejection response.
    pub fn reject_body(&self) -> &Bytes {
        &self.reject_body
    }

    /// How storage failures are treated.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }
}
