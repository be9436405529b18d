//! Failure handling as a pure decision function.
//!
//! After handler execution fails, the pipeline asks [`FailurePolicies`]
//! what to do next. The decision depends only on the failure, the number
//! of attempts made so far and the configured rules; executing the
//! resulting [`Continuation`] is the caller's job. Rules are matched in
//! registration order, falling through to a default policy.

use std::{fmt, sync::Arc, time::Duration};

/// A handler failure, reduced to the identity and text the policy rules
/// and dead-letter storage need.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Type name of the underlying error, used for rule matching and
    /// bulk dead-letter replay.
    pub error_type: String,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self {
            error_type: std::any::type_name::<E>().to_owned(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for HandlerFailure {}

/// Side-effecting callback attached to a `Discard` action. Invoked
/// fire-and-forget; never allowed to fail the pipeline.
pub type DiscardCallback = Arc<dyn Fn(&HandlerFailure) + Send + Sync>;

/// The decided next action for a message after a handler failure.
#[derive(Clone)]
pub enum Continuation {
    Success,
    /// Retry inline, immediately.
    Retry,
    /// Retry after the given cooldown, without giving up the envelope.
    RetryWithCooldown(Duration),
    /// Schedule a future delivery through the scheduling subsystem.
    ScheduleRetry(Duration),
    /// Resubmit to the local queue; escalates once attempts exceed the
    /// configured bound.
    Requeue,
    MoveToErrorQueue(HandlerFailure),
    Discard(Option<DiscardCallback>),
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Retry => write!(f, "Retry"),
            Self::RetryWithCooldown(d) => write!(f, "RetryWithCooldown({d:?})"),
            Self::ScheduleRetry(d) => write!(f, "ScheduleRetry({d:?})"),
            Self::Requeue => write!(f, "Requeue"),
            Self::MoveToErrorQueue(e) => write!(f, "MoveToErrorQueue({e})"),
            Self::Discard(_) => write!(f, "Discard"),
        }
    }
}

/// What a matched rule does with the failure.
#[derive(Clone)]
pub enum FailureAction {
    /// Retry inline up to `max_attempts` total attempts.
    Retry { max_attempts: u32 },
    /// Retry after a per-attempt cooldown. The last delay repeats once
    /// the schedule is exhausted, bounded by `max_attempts`.
    RetryWithCooldown {
        delays: Vec<Duration>,
        max_attempts: u32,
    },
    /// Like `RetryWithCooldown`, but through the durable scheduling
    /// subsystem rather than holding the envelope.
    ScheduleRetry {
        delays: Vec<Duration>,
        max_attempts: u32,
    },
    /// Resubmit locally up to `max_requeues` additional deliveries.
    Requeue { max_requeues: u32 },
    MoveToErrorQueue,
    Discard,
    DiscardAndDelegate(DiscardCallback),
}

type FailurePredicate = Arc<dyn Fn(&HandlerFailure) -> bool + Send + Sync>;

#[derive(Clone)]
enum FailureMatch {
    Any,
    ErrorType(String),
    Predicate(FailurePredicate),
}

impl FailureMatch {
    fn matches(&self, failure: &HandlerFailure) -> bool {
        match self {
            Self::Any => true,
            Self::ErrorType(name) => failure.error_type == *name,
            Self::Predicate(predicate) => predicate(failure),
        }
    }
}

#[derive(Clone)]
pub struct FailureRule {
    matcher: FailureMatch,
    action: FailureAction,
}

impl FailureRule {
    pub fn on_any(action: FailureAction) -> Self {
        Self {
            matcher: FailureMatch::Any,
            action,
        }
    }

    pub fn on_error_type(error_type: impl Into<String>, action: FailureAction) -> Self {
        Self {
            matcher: FailureMatch::ErrorType(error_type.into()),
            action,
        }
    }

    pub fn on_predicate<F>(predicate: F, action: FailureAction) -> Self
    where
        F: Fn(&HandlerFailure) -> bool + Send + Sync + 'static,
    {
        Self {
            matcher: FailureMatch::Predicate(Arc::new(predicate)),
            action,
        }
    }
}

/// Ordered failure rules with a default fallback.
///
/// The default policy is retry-twice-then-dead-letter, the common shape
/// for queue consumers.
#[derive(Clone)]
pub struct FailurePolicies {
    rules: Vec<FailureRule>,
    fallback: FailureAction,
}

impl Default for FailurePolicies {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            fallback: FailureAction::Retry { max_attempts: 3 },
        }
    }
}

impl FailurePolicies {
    pub fn new(fallback: FailureAction) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    pub fn with_rule(mut self, rule: FailureRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The decision function. `attempts` is the number of attempts
    /// already made, including the one that just failed.
    pub fn decide(&self, failure: &HandlerFailure, attempts: u32) -> Continuation {
        let action = self
            .rules
            .iter()
            .find(|rule| rule.matcher.matches(failure))
            .map(|rule| &rule.action)
            .unwrap_or(&self.fallback);

        Self::apply(action, failure, attempts)
    }

    fn apply(action: &FailureAction, failure: &HandlerFailure, attempts: u32) -> Continuation {
        match action {
            FailureAction::Retry { max_attempts } => {
                if attempts < *max_attempts {
                    Continuation::Retry
                } else {
                    Continuation::MoveToErrorQueue(failure.clone())
                }
            }
            FailureAction::RetryWithCooldown {
                delays,
                max_attempts,
            } => match Self::cooldown(delays, attempts, *max_attempts) {
                Some(delay) => Continuation::RetryWithCooldown(delay),
                None => Continuation::MoveToErrorQueue(failure.clone()),
            },
            FailureAction::ScheduleRetry {
                delays,
                max_attempts,
            } => match Self::cooldown(delays, attempts, *max_attempts) {
                Some(delay) => Continuation::ScheduleRetry(delay),
                None => Continuation::MoveToErrorQueue(failure.clone()),
            },
            FailureAction::Requeue { max_requeues } => {
                // attempts counts the original delivery too
                if attempts <= *max_requeues {
                    Continuation::Requeue
                } else {
                    Continuation::MoveToErrorQueue(failure.clone())
                }
            }
            FailureAction::MoveToErrorQueue => Continuation::MoveToErrorQueue(failure.clone()),
            FailureAction::Discard => Continuation::Discard(None),
            FailureAction::DiscardAndDelegate(callback) => {
                Continuation::Discard(Some(callback.clone()))
            }
        }
    }

    /// Picks the cooldown for the next attempt. The last configured
    /// delay repeats, so an exhausted schedule never degenerates into a
    /// zero-cooldown tight loop, and `max_attempts` keeps the retries
    /// bounded.
    fn cooldown(delays: &[Duration], attempts: u32, max_attempts: u32) -> Option<Duration> {
        if delays.is_empty() || attempts >= max_attempts {
            return None;
        }
        let index = (attempts as usize).saturating_sub(1).min(delays.len() - 1);
        Some(delays[index])
    }
}
