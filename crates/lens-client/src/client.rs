use std::{any::Any, future::Future, sync::Arc};

use anyhow::{Context, Result};
use lens_api::{
    Analytics, ApiError, BackendClient, Branch, Commit, Note, Notification, Page, PullRequest,
    RepositoryAccessOutcome, RepositoryFile, RepositoryStatus, RepositorySummary,
};
use lens_auth::{AuthError, AuthExchangeCoordinator, AuthPhase, Authenticated};
use lens_cache::{
    canonicalize, list_prefix, repository_prefix, resource_key, CacheKey, CachePolicy,
    FetchError, JanitorHandle, ListQuery, ListResource, QueryCache, ResourceRef,
};
use lens_core::RepositoryId;
use lens_poller::{AnalysisJobPoller, PollHandle};
use lens_session::{
    FileOneShotTokenStore, FileSessionStore, OneShotTokenStore, PersistentSessionStore, Session,
};

use crate::config::ClientConfig;
use crate::view_state::ViewState;

type CachedPayload = Box<dyn Any + Send + Sync>;

/// Application-facing entry point: authentication, cached reads, and
/// mutations that keep the cache coherent.
pub struct LensClient {
    config: ClientConfig,
    backend: BackendClient,
    sessions: Arc<dyn PersistentSessionStore>,
    codes: Arc<dyn OneShotTokenStore>,
    auth: AuthExchangeCoordinator,
    cache: QueryCache<CachedPayload>,
    poller: AnalysisJobPoller,
}

impl LensClient {
    /// Builds a client backed by the file stores under `config.state_dir`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let sessions = Arc::new(FileSessionStore::in_state_dir(&config.state_dir));
        let codes = Arc::new(FileOneShotTokenStore::for_tab(
            &config.state_dir,
            &config.tab_id,
        ));
        Self::with_stores(config, sessions, codes)
    }

    pub fn with_stores(
        config: ClientConfig,
        sessions: Arc<dyn PersistentSessionStore>,
        codes: Arc<dyn OneShotTokenStore>,
    ) -> Result<Self> {
        let backend = BackendClient::new(&config.backend_config())
            .context("failed to initialize backend client")?;
        let cache = QueryCache::new(config.cache_policy());
        let auth = AuthExchangeCoordinator::new(
            Arc::new(backend.clone()),
            Arc::clone(&sessions),
            Arc::clone(&codes),
        );
        let poller = AnalysisJobPoller::new(Arc::new(backend.clone()), Arc::new(cache.clone()));
        Ok(Self {
            config,
            backend,
            sessions,
            codes,
            auth,
            cache,
            poller,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn auth_phase(&self) -> AuthPhase {
        self.auth.phase()
    }

    /// True once [`Self::authenticate`] has produced a session. Reads and
    /// mutations are refused until then.
    pub fn is_signed_in(&self) -> bool {
        self.auth.phase() == AuthPhase::Authenticated
    }

    fn require_session(&self) -> Result<(), ApiError> {
        if self.is_signed_in() {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    /// Exchanges the captured one-shot code, or restores the stored session.
    pub async fn authenticate(&self) -> Result<Authenticated, AuthError> {
        let outcome = self.auth.run().await;
        match &outcome {
            Ok(authenticated) => self.backend.set_session(Some(&authenticated.session)),
            Err(_) => self.backend.set_session(None),
        }
        outcome
    }

    /// Stores a code delivered by the sign-in redirect for this tab. It is
    /// consumed by the next [`Self::authenticate`].
    pub fn deliver_code(&self, code: &str) -> Result<()> {
        self.codes.put_code(code)
    }

    pub fn current_session(&self) -> Option<Session> {
        self.sessions.load()
    }

    pub fn logout(&self) -> Result<()> {
        self.auth.logout()?;
        self.backend.set_session(None);
        let cleared = self.cache.clear();
        tracing::debug!(cleared, "cache cleared on logout");
        Ok(())
    }

    pub async fn repositories(&self, query: &ListQuery) -> ViewState<Page<RepositorySummary>> {
        let canonical = query.canonical();
        ViewState::from_page(
            self.read(canonical.cache_key(), move |backend| async move {
                backend.list_repositories(&canonical).await
            })
            .await,
        )
    }

    pub async fn notifications(&self, query: &ListQuery) -> ViewState<Page<Notification>> {
        let canonical = query.canonical();
        ViewState::from_page(
            self.read(canonical.cache_key(), move |backend| async move {
                backend.list_notifications(&canonical).await
            })
            .await,
        )
    }

    pub async fn branches(&self, query: &ListQuery) -> ViewState<Page<Branch>> {
        let canonical = query.canonical();
        ViewState::from_page(
            self.read(canonical.cache_key(), move |backend| async move {
                backend.list_branches(&canonical).await
            })
            .await,
        )
    }

    pub async fn commits(&self, query: &ListQuery) -> ViewState<Page<Commit>> {
        let canonical = query.canonical();
        ViewState::from_page(
            self.read(canonical.cache_key(), move |backend| async move {
                backend.list_commits(&canonical).await
            })
            .await,
        )
    }

    pub async fn pull_requests(&self, query: &ListQuery) -> ViewState<Page<PullRequest>> {
        let canonical = query.canonical();
        ViewState::from_page(
            self.read(canonical.cache_key(), move |backend| async move {
                backend.list_pull_requests(&canonical).await
            })
            .await,
        )
    }

    pub async fn files(&self, query: &ListQuery) -> ViewState<Page<RepositoryFile>> {
        let canonical = query.canonical();
        ViewState::from_page(
            self.read(canonical.cache_key(), move |backend| async move {
                backend.list_files(&canonical).await
            })
            .await,
        )
    }

    pub async fn notes(&self, query: &ListQuery) -> ViewState<Page<Note>> {
        let canonical = query.canonical();
        ViewState::from_page(
            self.read(canonical.cache_key(), move |backend| async move {
                backend.list_notes(&canonical).await
            })
            .await,
        )
    }

    pub async fn repository(&self, repository: &RepositoryId) -> ViewState<RepositorySummary> {
        let key = resource_key(&ResourceRef::Repository(repository.clone()));
        let repository = repository.clone();
        self.read(key, move |backend| async move {
            backend.repository(&repository).await
        })
        .await
        .into()
    }

    pub async fn status(&self, repository: &RepositoryId) -> ViewState<RepositoryStatus> {
        let key = resource_key(&ResourceRef::Status(repository.clone()));
        let repository = repository.clone();
        self.read(key, move |backend| async move {
            backend.repository_status(&repository).await
        })
        .await
        .into()
    }

    pub async fn analytics(
        &self,
        repository: &RepositoryId,
        branch: Option<&str>,
    ) -> ViewState<Analytics> {
        let branch = branch.map(str::to_string);
        let key = resource_key(&ResourceRef::Analytics {
            repository: repository.clone(),
            branch: branch.clone(),
        });
        let repository = repository.clone();
        self.read(key, move |backend| async move {
            backend.analytics(&repository, branch.as_deref()).await
        })
        .await
        .into()
    }

    pub async fn commit(&self, repository: &RepositoryId, sha: &str) -> ViewState<Commit> {
        let key = resource_key(&ResourceRef::Commit {
            repository: repository.clone(),
            sha: sha.to_string(),
        });
        let repository = repository.clone();
        let sha = sha.to_string();
        self.read(key, move |backend| async move {
            backend.commit(&repository, &sha).await
        })
        .await
        .into()
    }

    pub async fn pull_request(
        &self,
        repository: &RepositoryId,
        number: u64,
    ) -> ViewState<PullRequest> {
        let key = resource_key(&ResourceRef::PullRequest {
            repository: repository.clone(),
            number,
        });
        let repository = repository.clone();
        self.read(key, move |backend| async move {
            backend.pull_request(&repository, number).await
        })
        .await
        .into()
    }

    pub async fn file(&self, repository: &RepositoryId, file_id: &str) -> ViewState<RepositoryFile> {
        let key = resource_key(&ResourceRef::File {
            repository: repository.clone(),
            file_id: file_id.to_string(),
        });
        let repository = repository.clone();
        let file_id = file_id.to_string();
        self.read(key, move |backend| async move {
            backend.file(&repository, &file_id).await
        })
        .await
        .into()
    }

    /// Current view of `key` without fetching.
    pub fn cached<T>(&self, key: &CacheKey) -> ViewState<T>
    where
        T: Clone + 'static,
    {
        match self.cache.peek(key) {
            Some(payload) => match downcast::<T>(&payload, key) {
                Ok(value) => ViewState::Ready(value),
                Err(error) => ViewState::Failed(error),
            },
            None => match self.cache.last_error(key) {
                Some(error) => ViewState::Failed(error),
                None => ViewState::Loading,
            },
        }
    }

    /// Asks the backend to re-analyse `repository`. When it accepts, the
    /// returned handle polls the job until it settles; dropping the handle
    /// stops polling. `None` means the backend declined and nothing started.
    pub async fn refresh(&self, repository: &RepositoryId) -> Result<Option<PollHandle>, ApiError> {
        self.require_session()?;
        let accepted = self.backend.request_refresh(repository).await?;
        if !accepted.accepted {
            tracing::info!(repository = %repository, "refresh declined by backend; not polling");
            return Ok(None);
        }
        self.cache
            .invalidate(&resource_key(&ResourceRef::Status(repository.clone())));
        Ok(Some(
            self.poller.start(repository.clone(), self.config.poll_settings()),
        ))
    }

    /// Requests access to `url`. When the backend starts an analysis, the
    /// returned handle polls it.
    pub async fn add_repository(
        &self,
        url: &str,
    ) -> Result<(RepositoryAccessOutcome, Option<PollHandle>), ApiError> {
        self.require_session()?;
        let outcome = self.backend.add_repository(url).await?;
        self.cache.invalidate(&list_prefix(&ListResource::Repositories));
        let handle = match outcome.repository_id() {
            Some(repository) if outcome.starts_analysis() => Some(
                self.poller
                    .start(repository.clone(), self.config.poll_settings()),
            ),
            _ => None,
        };
        Ok((outcome, handle))
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<Notification, ApiError> {
        self.require_session()?;
        let notification = self.backend.mark_notification_read(notification_id).await?;
        self.cache
            .invalidate(&list_prefix(&ListResource::Notifications));
        Ok(notification)
    }

    pub async fn create_note(&self, repository: &RepositoryId, body: &str) -> Result<Note, ApiError> {
        self.require_session()?;
        let note = self.backend.create_note(repository, body).await?;
        self.cache
            .invalidate(&list_prefix(&ListResource::Notes(repository.clone())));
        Ok(note)
    }

    pub fn invalidate_repository(&self, repository: &RepositoryId) -> usize {
        self.cache.invalidate(&repository_prefix(repository))
    }

    pub fn spawn_janitor(&self) -> JanitorHandle {
        self.cache.spawn_janitor(self.config.janitor_interval())
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache.default_policy()
    }

    async fn read<T, F, Fut>(&self, key: CacheKey, fetch: F) -> Result<T, FetchError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(BackendClient) -> Fut,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        if !self.is_signed_in() {
            tracing::debug!(key = %key, "read refused before sign-in");
            return Err(FetchError::Unauthorized);
        }
        let backend = self.backend.clone();
        let payload = self
            .cache
            .get(&key, self.cache.default_policy(), move || {
                let request = fetch(backend);
                async move {
                    request
                        .await
                        .map(|value| Box::new(value) as CachedPayload)
                        .map_err(FetchError::from)
                }
            })
            .await?;
        downcast::<T>(&payload, &key)
    }
}

fn downcast<T>(payload: &CachedPayload, key: &CacheKey) -> Result<T, FetchError>
where
    T: Clone + 'static,
{
    payload
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| FetchError::Decode(format!("cached value at {key} has an unexpected type")))
}
