use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lens_auth::{AuthExchangeError, CodeExchanger};
use lens_cache::{CanonicalListQuery, FetchError, ListResource};
use lens_core::{current_unix_timestamp_ms, RepositoryId};
use lens_poller::{JobState, JobStatusSource};
use lens_session::{Session, SessionCredential};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::retry::{
    is_retryable_transport_error, parse_retry_after_ms, retry_delay, should_retry_status,
    truncate_for_error,
};
use crate::types::{
    decode_access_outcome, Analytics, Branch, Commit, ExchangeResponse, Note, Notification, Page,
    PullRequest, RefreshAccepted, RepositoryAccessOutcome, RepositoryFile, RepositoryStatus,
    RepositorySummary,
};

const USER_AGENT: &str = "repolens-client";
const RETRY_ATTEMPT_HEADER: &str = "x-lens-retry-attempt";
const ERROR_BODY_LIMIT: usize = 800;
/// Non-idempotent requests are sent once; a retry could apply them twice.
const SINGLE_ATTEMPT: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendClientConfig {
    pub api_base: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for BackendClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8080".to_string(),
            request_timeout_ms: 10_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 200,
        }
    }
}

/// Typed access to the backend's JSON endpoints.
///
/// Clones share the HTTP connection pool and the bearer credential.
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    api_base: reqwest::Url,
    credential: Arc<RwLock<Option<SessionCredential>>>,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl BackendClient {
    pub fn new(config: &BackendClientConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let api_base = reqwest::Url::parse(config.api_base.trim())
            .with_context(|| format!("invalid api base url '{}'", config.api_base))?;
        if api_base.cannot_be_a_base() {
            bail!("api base url '{}' cannot carry request paths", config.api_base);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create backend http client")?;
        Ok(Self {
            http,
            api_base,
            credential: Arc::new(RwLock::new(None)),
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms,
        })
    }

    pub fn api_base(&self) -> &reqwest::Url {
        &self.api_base
    }

    /// Sets or clears the bearer credential sent with every request.
    pub fn set_session(&self, session: Option<&Session>) {
        let mut credential = self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *credential = session.map(|session| session.credential.clone());
    }

    pub fn has_credential(&self) -> bool {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub async fn exchange_code(&self, code: &str) -> Result<Session, AuthExchangeError> {
        let url = self
            .endpoint(&["auth", "exchange"])
            .map_err(AuthExchangeError::from)?;
        let body = json!({ "code": code });
        // Codes are single-use on the backend; the exchange is never re-sent.
        let response: ExchangeResponse = self
            .request_json("auth exchange", SINGLE_ATTEMPT, || self.http.post(url.clone()).json(&body))
            .await
            .map_err(AuthExchangeError::from)?;

        if response.user_id.trim().is_empty() || response.token.trim().is_empty() {
            return Err(AuthExchangeError::MalformedResponse(
                "exchange response is missing user_id or token".to_string(),
            ));
        }
        Ok(Session::new(
            response.user_id.trim(),
            SessionCredential::new(response.token.trim()),
            response
                .issued_at_unix_ms
                .unwrap_or_else(current_unix_timestamp_ms),
        ))
    }

    pub async fn list_repositories(
        &self,
        query: &CanonicalListQuery,
    ) -> Result<Page<RepositorySummary>, ApiError> {
        self.list_page("list repositories", query).await
    }

    pub async fn list_branches(&self, query: &CanonicalListQuery) -> Result<Page<Branch>, ApiError> {
        self.list_page("list branches", query).await
    }

    pub async fn list_commits(&self, query: &CanonicalListQuery) -> Result<Page<Commit>, ApiError> {
        self.list_page("list commits", query).await
    }

    pub async fn list_pull_requests(
        &self,
        query: &CanonicalListQuery,
    ) -> Result<Page<PullRequest>, ApiError> {
        self.list_page("list pull requests", query).await
    }

    pub async fn list_files(
        &self,
        query: &CanonicalListQuery,
    ) -> Result<Page<RepositoryFile>, ApiError> {
        self.list_page("list files", query).await
    }

    pub async fn list_notes(&self, query: &CanonicalListQuery) -> Result<Page<Note>, ApiError> {
        self.list_page("list notes", query).await
    }

    pub async fn list_notifications(
        &self,
        query: &CanonicalListQuery,
    ) -> Result<Page<Notification>, ApiError> {
        self.list_page("list notifications", query).await
    }

    pub async fn repository(&self, repository: &RepositoryId) -> Result<RepositorySummary, ApiError> {
        self.get_json("repository detail", &["repositories", repository.as_str()], &[])
            .await
    }

    pub async fn repository_status(
        &self,
        repository: &RepositoryId,
    ) -> Result<RepositoryStatus, ApiError> {
        self.get_json(
            "repository status",
            &["repositories", repository.as_str(), "status"],
            &[],
        )
        .await
    }

    pub async fn analytics(
        &self,
        repository: &RepositoryId,
        branch: Option<&str>,
    ) -> Result<Analytics, ApiError> {
        let query = branch
            .map(str::trim)
            .filter(|branch| !branch.is_empty())
            .map(|branch| vec![("branch".to_string(), branch.to_string())])
            .unwrap_or_default();
        self.get_json(
            "repository analytics",
            &["repositories", repository.as_str(), "analytics"],
            &query,
        )
        .await
    }

    pub async fn commit(&self, repository: &RepositoryId, sha: &str) -> Result<Commit, ApiError> {
        self.get_json(
            "commit detail",
            &["repositories", repository.as_str(), "commits", sha.trim()],
            &[],
        )
        .await
    }

    pub async fn pull_request(
        &self,
        repository: &RepositoryId,
        number: u64,
    ) -> Result<PullRequest, ApiError> {
        let number = number.to_string();
        self.get_json(
            "pull request detail",
            &["repositories", repository.as_str(), "pulls", number.as_str()],
            &[],
        )
        .await
    }

    pub async fn file(
        &self,
        repository: &RepositoryId,
        file_id: &str,
    ) -> Result<RepositoryFile, ApiError> {
        self.get_json(
            "file detail",
            &["repositories", repository.as_str(), "files", file_id.trim()],
            &[],
        )
        .await
    }

    /// Asks the backend to re-run analysis for `repository`.
    pub async fn request_refresh(&self, repository: &RepositoryId) -> Result<RefreshAccepted, ApiError> {
        let url = self.endpoint(&["repositories", repository.as_str(), "refresh"])?;
        self.request_json("repository refresh", self.retry_max_attempts, || {
            self.authorized(self.http.post(url.clone()))
        })
        .await
    }

    /// Requests access to a repository by URL.
    pub async fn add_repository(&self, url: &str) -> Result<RepositoryAccessOutcome, ApiError> {
        let endpoint = self.endpoint(&["repositories"])?;
        let body = json!({ "url": url.trim() });
        let raw: Value = self
            .request_json("repository access", SINGLE_ATTEMPT, || {
                self.authorized(self.http.post(endpoint.clone()).json(&body))
            })
            .await?;
        let outcome = decode_access_outcome(raw)?;
        tracing::info!(?outcome, "repository access resolved");
        Ok(outcome)
    }

    pub async fn mark_notification_read(&self, notification_id: &str) -> Result<Notification, ApiError> {
        let url = self.endpoint(&["notifications", notification_id.trim(), "read"])?;
        self.request_json("mark notification read", SINGLE_ATTEMPT, || {
            self.authorized(self.http.post(url.clone()))
        })
        .await
    }

    pub async fn create_note(&self, repository: &RepositoryId, body: &str) -> Result<Note, ApiError> {
        let url = self.endpoint(&["repositories", repository.as_str(), "notes"])?;
        let payload = json!({ "body": body });
        self.request_json("create note", SINGLE_ATTEMPT, || {
            self.authorized(self.http.post(url.clone()).json(&payload))
        })
        .await
    }

    async fn list_page<T>(&self, operation: &str, query: &CanonicalListQuery) -> Result<Page<T>, ApiError>
    where
        T: DeserializeOwned,
    {
        let segments = list_path(&query.resource);
        let segments = segments.iter().map(String::as_str).collect::<Vec<_>>();
        self.get_json(operation, &segments, &query.query_pairs()).await
    }

    async fn get_json<T>(
        &self,
        operation: &str,
        segments: &[&str],
        query: &[(String, String)],
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint(segments)?;
        self.request_json(operation, self.retry_max_attempts, || {
            self.authorized(self.http.get(url.clone()).query(query))
        })
        .await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, ApiError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Transport {
                operation: "build url".to_string(),
                message: format!("api base '{}' cannot carry request paths", self.api_base),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let credential = self
            .credential
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match credential.as_ref() {
            Some(credential) => builder.bearer_auth(credential.expose()),
            None => builder,
        }
    }

    async fn request_json<T, F>(
        &self,
        operation: &str,
        max_attempts: usize,
        mut request_builder: F,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder()
                .header(RETRY_ATTEMPT_HEADER, attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(|error| ApiError::Decode {
                            operation: operation.to_string(),
                            message: error.to_string(),
                        });
                    }
                    if status == reqwest::StatusCode::UNAUTHORIZED {
                        return Err(ApiError::Unauthorized);
                    }

                    let retry_after = parse_retry_after_ms(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < max_attempts && should_retry_status(status.as_u16()) {
                        let delay = retry_delay(self.retry_base_delay_ms, attempt, retry_after);
                        tracing::debug!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying backend request"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(ApiError::Status {
                        operation: operation.to_string(),
                        status: status.as_u16(),
                        body: truncate_for_error(&body, ERROR_BODY_LIMIT),
                    });
                }
                Err(error) => {
                    if attempt < max_attempts && is_retryable_transport_error(&error) {
                        tracing::debug!(operation, attempt, %error, "retrying backend request");
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(ApiError::Transport {
                        operation: operation.to_string(),
                        message: error.to_string(),
                    });
                }
            }
        }
    }
}

fn list_path(resource: &ListResource) -> Vec<String> {
    let scoped = |repository: &RepositoryId, collection: &str| {
        vec![
            "repositories".to_string(),
            repository.to_string(),
            collection.to_string(),
        ]
    };
    match resource {
        ListResource::Repositories => vec!["repositories".to_string()],
        ListResource::Notifications => vec!["notifications".to_string()],
        ListResource::Branches(repository) => scoped(repository, "branches"),
        ListResource::Commits(repository) => scoped(repository, "commits"),
        ListResource::PullRequests(repository) => scoped(repository, "pulls"),
        ListResource::Files(repository) => scoped(repository, "files"),
        ListResource::Notes(repository) => scoped(repository, "notes"),
    }
}

#[async_trait]
impl CodeExchanger for BackendClient {
    async fn exchange(&self, code: &str) -> Result<Session, AuthExchangeError> {
        self.exchange_code(code).await
    }
}

#[async_trait]
impl JobStatusSource for BackendClient {
    async fn fetch_status(&self, repository: &RepositoryId) -> Result<JobState, FetchError> {
        self.repository_status(repository)
            .await
            .map(|status| status.state)
            .map_err(FetchError::from)
    }
}
