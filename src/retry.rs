//! Retry decisions for a single search term.

use crate::client::Outcome;
use crate::{HarvestError, Result};

/// What the worker does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Keep the payload; the term is done.
    Accept,
    /// Try again through a different proxy.
    RetryWithNewProxy,
    /// Stop; the term has failed.
    GiveUp,
}

/// Bounded retry budget per term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    /// Creates a policy allowing at most `max_attempts` attempts per term.
    pub fn new(max_attempts: u32) -> Result<Self> {
        if max_attempts == 0 {
            return Err(HarvestError::Config(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(Self { max_attempts })
    }

    /// Maximum attempts per term.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after `attempts_so_far` attempts ended in `outcome`.
    pub fn decide(&self, outcome: &Outcome, attempts_so_far: u32) -> Decision {
        decide(outcome, attempts_so_far, self.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 11 }
    }
}

/// Retry decision table.
///
/// Bad credentials are not a proxy problem, so `AuthError` gives up at once
/// whatever budget remains.
pub fn decide(outcome: &Outcome, attempts_so_far: u32, max_attempts: u32) -> Decision {
    match outcome {
        Outcome::Success(_) => Decision::Accept,
        Outcome::AuthError { .. } => Decision::GiveUp,
        Outcome::Blocked { .. } | Outcome::CaptchaChallenge | Outcome::TransportError(_) => {
            if attempts_so_far < max_attempts {
                Decision::RetryWithNewProxy
            } else {
                Decision::GiveUp
            }
        }
    }
}

/// Whether the proxy used for an attempt goes back to the pool healthy.
pub fn proxy_healthy(outcome: &Outcome) -> bool {
    !outcome.implicates_proxy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn retryable() -> Vec<Outcome> {
        vec![
            Outcome::Blocked { status: 403 },
            Outcome::CaptchaChallenge,
            Outcome::TransportError("timeout".into()),
        ]
    }

    #[test]
    fn test_success_is_accepted() {
        let outcome = Outcome::Success(json!({"results": []}));
        assert_eq!(decide(&outcome, 1, 3), Decision::Accept);
        assert_eq!(decide(&outcome, 3, 3), Decision::Accept);
    }

    #[test]
    fn test_retryable_outcomes_retry_while_budget_remains() {
        for outcome in retryable() {
            assert_eq!(decide(&outcome, 1, 3), Decision::RetryWithNewProxy);
            assert_eq!(decide(&outcome, 2, 3), Decision::RetryWithNewProxy);
        }
    }

    #[test]
    fn test_exhausted_budget_gives_up() {
        for outcome in retryable() {
            assert_eq!(decide(&outcome, 3, 3), Decision::GiveUp);
            assert_eq!(decide(&outcome, 4, 3), Decision::GiveUp);
        }
    }

    #[test]
    fn test_auth_error_gives_up_immediately() {
        let outcome = Outcome::AuthError { status: 401 };
        assert_eq!(decide(&outcome, 1, 10), Decision::GiveUp);
    }

    #[test]
    fn test_proxy_health_rule() {
        assert!(!proxy_healthy(&Outcome::Blocked { status: 403 }));
        assert!(!proxy_healthy(&Outcome::CaptchaChallenge));
        assert!(proxy_healthy(&Outcome::TransportError("refused".into())));
        assert!(proxy_healthy(&Outcome::AuthError { status: 401 }));
        assert!(proxy_healthy(&Outcome::Success(json!({}))));
    }

    #[test]
    fn test_policy_rejects_zero_attempts() {
        assert!(matches!(RetryPolicy::new(0), Err(HarvestError::Config(_))));
    }

    #[test]
    fn test_policy_default() {
        assert_eq!(RetryPolicy::default().max_attempts(), 11);
    }

    #[test]
    fn test_policy_decide() {
        let policy = RetryPolicy::new(1).unwrap();
        assert_eq!(
            policy.decide(&Outcome::CaptchaChallenge, 1),
            Decision::GiveUp
        );
    }
}
