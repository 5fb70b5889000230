//! Exactly-once exchange of a captured one-shot code.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, OnceLock,
};

use async_trait::async_trait;
use lens_session::{OneShotTokenStore, PersistentSessionStore, Session};

use crate::error::{AuthError, AuthExchangeError};
use crate::registry::{
    Authenticated, ExchangeClaim, ExchangeOutcome, ExchangeRegistry, PendingExchange,
    SessionOrigin,
};

/// Backend seam for `POST /auth/exchange`.
#[async_trait]
pub trait CodeExchanger: Send + Sync {
    async fn exchange(&self, code: &str) -> Result<Session, AuthExchangeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    CodeCaptured,
    Exchanging,
    Authenticated,
    Failed,
}

/// Coordinates startup authentication.
///
/// The one-shot code is taken from its store once, during [`Self::capture_code`];
/// the exchange for a given code runs at most once across every coordinator
/// sharing the same [`ExchangeRegistry`].
pub struct AuthExchangeCoordinator {
    exchanger: Arc<dyn CodeExchanger>,
    sessions: Arc<dyn PersistentSessionStore>,
    codes: Arc<dyn OneShotTokenStore>,
    registry: ExchangeRegistry,
    captured: OnceLock<Option<String>>,
    phase: Mutex<AuthPhase>,
    signed_out: AtomicBool,
}

impl AuthExchangeCoordinator {
    pub fn new(
        exchanger: Arc<dyn CodeExchanger>,
        sessions: Arc<dyn PersistentSessionStore>,
        codes: Arc<dyn OneShotTokenStore>,
    ) -> Self {
        Self::with_registry(exchanger, sessions, codes, ExchangeRegistry::new())
    }

    pub fn with_registry(
        exchanger: Arc<dyn CodeExchanger>,
        sessions: Arc<dyn PersistentSessionStore>,
        codes: Arc<dyn OneShotTokenStore>,
        registry: ExchangeRegistry,
    ) -> Self {
        Self {
            exchanger,
            sessions,
            codes,
            registry,
            captured: OnceLock::new(),
            phase: Mutex::new(AuthPhase::Idle),
            signed_out: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &ExchangeRegistry {
        &self.registry
    }

    pub fn phase(&self) -> AuthPhase {
        *self.phase.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn set_phase(&self, phase: AuthPhase) {
        let mut guard = self.phase.lock().unwrap_or_else(|poison| poison.into_inner());
        *guard = phase;
    }

    /// Takes the one-shot code from its store on first call; later calls
    /// return the same immutable result.
    pub fn capture_code(&self) -> Option<&str> {
        let captured = self.captured.get_or_init(|| {
            let code = self.codes.take_code();
            if code.is_some() {
                tracing::info!("one-shot authorization code captured");
            }
            code
        });
        if captured.is_some() && self.phase() == AuthPhase::Idle {
            self.set_phase(AuthPhase::CodeCaptured);
        }
        captured.as_deref()
    }

    /// Authenticates using the captured code, or the stored session when no
    /// code was captured. After [`Self::logout`] only the stored session counts.
    pub async fn run(&self) -> ExchangeOutcome {
        if self.signed_out.load(Ordering::SeqCst) {
            return self.restore();
        }
        match self.capture_code().map(ToOwned::to_owned) {
            Some(code) => self.exchange_code(&code).await,
            None => self.restore(),
        }
    }

    /// Exchanges `code`, joining an exchange already pending for it.
    pub async fn exchange_code(&self, code: &str) -> ExchangeOutcome {
        let code = code.trim();
        if code.is_empty() {
            return self.restore();
        }

        let outcome = match self.registry.claim(code) {
            ExchangeClaim::Leader(pending) => {
                self.set_phase(AuthPhase::Exchanging);
                tracing::info!("starting one-shot code exchange");
                self.lead_exchange(pending).await
            }
            ExchangeClaim::Follower(pending) => {
                tracing::debug!("exchange for this code already recorded; observing its outcome");
                if self.phase() != AuthPhase::Authenticated {
                    self.set_phase(AuthPhase::Exchanging);
                }
                pending.outcome().await
            }
        };
        self.record_outcome(&outcome);
        outcome
    }

    /// Clears the stored session. A consumed code is never re-armed.
    pub fn logout(&self) -> anyhow::Result<()> {
        self.sessions.clear()?;
        self.signed_out.store(true, Ordering::SeqCst);
        self.set_phase(AuthPhase::Idle);
        tracing::info!("session cleared");
        Ok(())
    }

    fn restore(&self) -> ExchangeOutcome {
        match self.sessions.load() {
            Some(session) => {
                self.set_phase(AuthPhase::Authenticated);
                Ok(Authenticated {
                    session,
                    origin: SessionOrigin::Restored,
                })
            }
            None => Err(AuthError::Unauthenticated),
        }
    }

    async fn lead_exchange(&self, pending: Arc<PendingExchange>) -> ExchangeOutcome {
        // The exchange runs detached so that dropping this future cannot strand
        // other observers of the same code.
        let exchanger = Arc::clone(&self.exchanger);
        let sessions = Arc::clone(&self.sessions);
        let task_pending = Arc::clone(&pending);
        let task = tokio::spawn(async move {
            let outcome =
                perform_exchange(exchanger.as_ref(), sessions.as_ref(), task_pending.code()).await;
            task_pending.publish(outcome);
        });
        if let Err(error) = task.await {
            tracing::warn!(%error, "exchange task aborted");
            pending.publish(fallback_or_fail(
                self.sessions.as_ref(),
                AuthExchangeError::Network(format!("exchange task aborted: {error}")),
            ));
        }
        pending.outcome().await
    }

    fn record_outcome(&self, outcome: &ExchangeOutcome) {
        match outcome {
            Ok(_) => self.set_phase(AuthPhase::Authenticated),
            Err(_) => self.set_phase(AuthPhase::Failed),
        }
    }
}

async fn perform_exchange(
    exchanger: &dyn CodeExchanger,
    sessions: &dyn PersistentSessionStore,
    code: &str,
) -> ExchangeOutcome {
    let result = match exchanger.exchange(code).await {
        Ok(session) if session.is_valid() => Ok(session),
        Ok(_) => Err(AuthExchangeError::MalformedResponse(
            "exchange returned an incomplete session".to_string(),
        )),
        Err(error) => Err(error),
    };

    match result {
        Ok(session) => {
            if let Err(error) = sessions.save(&session) {
                tracing::warn!(%error, "session obtained but could not be persisted");
            }
            tracing::info!(user_id = %session.user_id, "one-shot code exchanged");
            Ok(Authenticated {
                session,
                origin: SessionOrigin::Exchanged,
            })
        }
        Err(error) => {
            tracing::warn!(%error, "one-shot code exchange failed");
            fallback_or_fail(sessions, error)
        }
    }
}

fn fallback_or_fail(
    sessions: &dyn PersistentSessionStore,
    error: AuthExchangeError,
) -> ExchangeOutcome {
    match sessions.load() {
        Some(session) => {
            tracing::info!("continuing with previously trusted session");
            Ok(Authenticated {
                session,
                origin: SessionOrigin::Fallback { error },
            })
        }
        None => Err(AuthError::ExchangeFailed(error)),
    }
}
