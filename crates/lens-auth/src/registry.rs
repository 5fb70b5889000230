//! Pending exchange records keyed by one-shot code value.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use lens_session::Session;
use tokio::sync::watch;

use crate::error::{AuthError, AuthExchangeError};

/// Where an authenticated session came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Freshly issued by a successful code exchange.
    Exchanged,
    /// Loaded from the persistent store with no code to exchange.
    Restored,
    /// The exchange failed; the previously trusted session is used instead.
    Fallback { error: AuthExchangeError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub session: Session,
    pub origin: SessionOrigin,
}

pub type ExchangeOutcome = Result<Authenticated, AuthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    Idle,
    Exchanging,
    Succeeded,
    Failed,
}

/// One code's exchange; the outcome is published once and then frozen.
#[derive(Debug)]
pub struct PendingExchange {
    code: String,
    outcome: watch::Sender<Option<ExchangeOutcome>>,
}

impl PendingExchange {
    fn new(code: &str) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            code: code.to_string(),
            outcome,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn status(&self) -> ExchangeStatus {
        match &*self.outcome.borrow() {
            None => ExchangeStatus::Exchanging,
            Some(Ok(Authenticated {
                origin: SessionOrigin::Exchanged,
                ..
            })) => ExchangeStatus::Succeeded,
            Some(_) => ExchangeStatus::Failed,
        }
    }

    /// Publishes the outcome unless one was already recorded.
    pub(crate) fn publish(&self, outcome: ExchangeOutcome) -> bool {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    /// Waits for the recorded outcome.
    pub async fn outcome(&self) -> ExchangeOutcome {
        let mut receiver = self.outcome.subscribe();
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or(Err(AuthError::Unauthenticated)),
            // The sender lives as long as `self`, so the channel cannot close here.
            Err(_) => Err(AuthError::ExchangeFailed(AuthExchangeError::Network(
                "exchange abandoned".to_string(),
            ))),
        };
        outcome
    }
}

pub(crate) enum ExchangeClaim {
    Leader(Arc<PendingExchange>),
    Follower(Arc<PendingExchange>),
}

/// Shared map of pending exchanges.
///
/// Clones share the same map so duplicate coordinators created during one
/// startup observe each other's exchanges.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRegistry {
    pending: Arc<Mutex<HashMap<String, Arc<PendingExchange>>>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pending record for `code` unless one exists. Check and insert
    /// happen under one lock acquisition.
    pub(crate) fn claim(&self, code: &str) -> ExchangeClaim {
        let mut pending = self.pending.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(existing) = pending.get(code) {
            return ExchangeClaim::Follower(Arc::clone(existing));
        }
        let record = Arc::new(PendingExchange::new(code));
        pending.insert(code.to_string(), Arc::clone(&record));
        ExchangeClaim::Leader(record)
    }

    pub fn status(&self, code: &str) -> ExchangeStatus {
        let pending = self.pending.lock().unwrap_or_else(|poison| poison.into_inner());
        pending
            .get(code)
            .map(|record| record.status())
            .unwrap_or(ExchangeStatus::Idle)
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
