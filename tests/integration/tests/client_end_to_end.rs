use std::{path::Path, sync::Arc, time::Duration};

use httpmock::prelude::*;
use lens_auth::SessionOrigin;
use lens_cache::{ListQuery, ListResource};
use lens_client::{ClientConfig, LensClient, ViewState};
use lens_core::RepositoryId;
use lens_poller::{JobState, PollOutcome};
use lens_session::{
    FileOneShotTokenStore, FileSessionStore, OneShotTokenStore, PersistentSessionStore, Session,
    SessionCredential,
};
use serde_json::json;
use tempfile::tempdir;

fn config(server: &MockServer, state_dir: &Path) -> ClientConfig {
    ClientConfig {
        api_base: server.base_url(),
        state_dir: state_dir.to_path_buf(),
        tab_id: "tab-1".to_string(),
        retry_base_delay_ms: 1,
        poll_interval_ms: 10,
        poll_timeout_ms: 5_000,
        ..ClientConfig::default()
    }
}

fn repository() -> RepositoryId {
    RepositoryId::new("42").expect("repository id")
}

async fn signed_in_client(server: &MockServer, state_dir: &Path) -> LensClient {
    FileSessionStore::in_state_dir(state_dir)
        .save(&Session::new("u-1", SessionCredential::new("tok-1"), 1))
        .expect("seed session");
    let client = LensClient::new(config(server, state_dir)).expect("client");
    client.authenticate().await.expect("restored session");
    client
}

fn empty_page() -> serde_json::Value {
    json!({"items": [], "page_info": {"page": 1, "page_size": 20}})
}

#[tokio::test]
async fn integration_redirect_code_is_exchanged_once_across_restarts() {
    let server = MockServer::start();
    let temp = tempdir().expect("tempdir");
    let exchange = server.mock(|when, then| {
        when.method(POST)
            .path("/auth/exchange")
            .json_body(json!({"code": "abc123"}));
        then.status(200)
            .json_body(json!({"user_id": "u-1", "token": "tok-1", "issued_at_unix_ms": 5}));
    });

    let first = LensClient::new(config(&server, temp.path())).expect("client");
    first.deliver_code("abc123").expect("deliver code");
    let authenticated = first.authenticate().await.expect("exchanged");
    assert_eq!(authenticated.origin, SessionOrigin::Exchanged);
    assert_eq!(
        first.authenticate().await.expect("repeat"),
        authenticated,
        "repeat observation returns the recorded outcome"
    );

    let restarted = LensClient::new(config(&server, temp.path())).expect("client");
    let restored = restarted.authenticate().await.expect("restored");
    assert_eq!(restored.origin, SessionOrigin::Restored);
    assert_eq!(restored.session.user_id, "u-1");

    exchange.assert_calls(1);
    assert!(FileOneShotTokenStore::for_tab(temp.path(), "tab-1")
        .take_code()
        .is_none());
}

#[tokio::test]
async fn integration_failed_exchange_falls_back_to_trusted_session() {
    let server = MockServer::start();
    let temp = tempdir().expect("tempdir");
    let exchange = server.mock(|when, then| {
        when.method(POST).path("/auth/exchange");
        then.status(502).body("upstream down");
    });
    let trusted = Session::new("u-9", SessionCredential::new("tok-9"), 9);
    FileSessionStore::in_state_dir(temp.path())
        .save(&trusted)
        .expect("seed session");

    let client = LensClient::new(config(&server, temp.path())).expect("client");
    client.deliver_code("stale-code").expect("deliver code");
    let authenticated = client.authenticate().await.expect("fallback");

    exchange.assert_calls(1);
    assert_eq!(authenticated.session, trusted);
    assert!(matches!(authenticated.origin, SessionOrigin::Fallback { .. }));
    assert!(client.backend().has_credential());
}

#[tokio::test]
async fn integration_refresh_polls_until_ready_then_invalidates_repository_views() {
    let server = MockServer::start();
    let temp = tempdir().expect("tempdir");
    let commits = server.mock(|when, then| {
        when.method(GET).path("/repositories/42/commits");
        then.status(200).json_body(empty_page());
    });
    let repositories = server.mock(|when, then| {
        when.method(GET).path("/repositories");
        then.status(200).json_body(json!({
            "items": [{"id": "42", "name": "lens"}],
            "page_info": {"page": 1, "page_size": 20}
        }));
    });
    server.mock(|when, then| {
        when.method(POST).path("/repositories/42/refresh");
        then.status(202).json_body(json!({"accepted": true}));
    });
    let mut queued = server.mock(|when, then| {
        when.method(GET).path("/repositories/42/status");
        then.status(200)
            .json_body(json!({"repository_id": "42", "state": "queued"}));
    });

    let client = signed_in_client(&server, temp.path()).await;
    let commit_query = ListQuery::new(ListResource::Commits(repository()));
    let repository_query = ListQuery::new(ListResource::Repositories);
    assert_eq!(client.commits(&commit_query).await, ViewState::Empty);
    assert!(client.repositories(&repository_query).await.is_ready());

    let mut handle = client
        .refresh(&repository())
        .await
        .expect("refresh")
        .expect("refresh accepted");
    let mut updates = handle.subscribe();
    updates
        .wait_for(|snapshot| snapshot.checks >= 2)
        .await
        .expect("queued checks observed");
    assert_eq!(commits.calls(), 1, "views stay cached while the job runs");

    queued.delete();
    let ready = server.mock(|when, then| {
        when.method(GET).path("/repositories/42/status");
        then.status(200)
            .json_body(json!({"repository_id": "42", "state": "ready"}));
    });
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("poll finishes");
    let PollOutcome::Completed(job) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(job.state, JobState::Ready);
    ready.assert_calls(1);

    assert_eq!(client.commits(&commit_query).await, ViewState::Empty);
    commits.assert_calls(2);
    assert!(client.repositories(&repository_query).await.is_ready());
    repositories.assert_calls(1);
}

#[tokio::test]
async fn integration_unrecognized_access_outcome_is_rejected_without_polling() {
    let server = MockServer::start();
    let temp = tempdir().expect("tempdir");
    server.mock(|when, then| {
        when.method(POST).path("/repositories");
        then.status(200)
            .json_body(json!({"outcome": "awaiting_owner_approval", "repository_id": "42"}));
    });
    let status = server.mock(|when, then| {
        when.method(GET).path("/repositories/42/status");
        then.status(200)
            .json_body(json!({"repository_id": "42", "state": "queued"}));
    });

    let client = signed_in_client(&server, temp.path()).await;
    let error = client
        .add_repository("https://git.example.com/acme/app")
        .await
        .err()
        .expect("unrecognized outcome rejected");

    assert_eq!(
        error,
        lens_api::ApiError::UnrecognizedOutcome("awaiting_owner_approval".to_string())
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    status.assert_calls(0);
}

#[tokio::test]
async fn integration_logout_keeps_tab_code_consumed() {
    let server = MockServer::start();
    let temp = tempdir().expect("tempdir");
    let exchange = server.mock(|when, then| {
        when.method(POST).path("/auth/exchange");
        then.status(200)
            .json_body(json!({"user_id": "u-1", "token": "tok-1"}));
    });
    let codes: Arc<dyn OneShotTokenStore> =
        Arc::new(FileOneShotTokenStore::for_tab(temp.path(), "tab-1"));
    let sessions: Arc<dyn PersistentSessionStore> =
        Arc::new(FileSessionStore::in_state_dir(temp.path()));
    codes.put_code("abc123").expect("deliver code");

    let client = LensClient::with_stores(config(&server, temp.path()), sessions, codes)
        .expect("client");
    client.authenticate().await.expect("exchanged");
    client.logout().expect("logout");

    assert!(client.current_session().is_none());
    assert!(client.authenticate().await.is_err());
    exchange.assert_calls(1);
}
