use std::{io::Write, path::PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lens_auth::{Authenticated, SessionOrigin};
use lens_cache::{ListFilter, ListQuery, ListResource, SortDirection};
use lens_core::RepositoryId;
use lens_poller::PollOutcome;
use serde::Serialize;
use serde_json::{json, Value};

use crate::client::LensClient;
use crate::config::ClientConfig;
use crate::view_state::ViewState;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(name = "lens", about = "RepoLens command-line client", version)]
pub struct Cli {
    #[arg(
        long,
        env = "LENS_CONFIG",
        global = true,
        help = "TOML config file; defaults to ./lens.toml when present"
    )]
    pub config: Option<PathBuf>,

    #[arg(long = "api-base", global = true, help = "Backend base URL")]
    pub api_base: Option<String>,

    #[arg(
        long = "state-dir",
        global = true,
        help = "Directory holding the session and one-shot code files"
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(long = "tab-id", global = true, help = "Scope for the one-shot sign-in code")]
    pub tab_id: Option<String>,

    #[arg(
        long = "request-timeout-ms",
        global = true,
        value_parser = parse_positive_u64
    )]
    pub request_timeout_ms: Option<u64>,

    #[arg(
        long = "poll-interval-ms",
        global = true,
        value_parser = parse_positive_u64
    )]
    pub poll_interval_ms: Option<u64>,

    #[arg(
        long = "poll-timeout-ms",
        global = true,
        value_parser = parse_positive_u64
    )]
    pub poll_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Flags win over file and environment settings.
    pub fn apply_overrides(&self, config: &mut ClientConfig) {
        if let Some(api_base) = &self.api_base {
            config.api_base = api_base.clone();
        }
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if let Some(tab_id) = &self.tab_id {
            config.tab_id = tab_id.clone();
        }
        if let Some(value) = self.request_timeout_ms {
            config.request_timeout_ms = value;
        }
        if let Some(value) = self.poll_interval_ms {
            config.poll_interval_ms = value;
        }
        if let Some(value) = self.poll_timeout_ms {
            config.poll_timeout_ms = value;
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Exchange a sign-in code, or restore the stored session.
    Login {
        #[arg(long)]
        code: Option<String>,
    },
    Logout,
    Whoami,
    /// List repositories you can access.
    Repos(ListArgs),
    Commits {
        repository: RepositoryId,
        #[arg(long)]
        branch: Option<String>,
        #[command(flatten)]
        list: ListArgs,
    },
    /// Show the analysis status of a repository.
    Status { repository: RepositoryId },
    /// Re-run analysis for a repository.
    Refresh {
        repository: RepositoryId,
        #[arg(long, help = "Poll until the analysis finishes or times out")]
        wait: bool,
    },
    /// Request access to a repository by URL.
    Add {
        url: String,
        #[arg(long, help = "Poll a newly started analysis until it finishes")]
        wait: bool,
    },
    Notifications(ListArgs),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum CliSortDirection {
    Asc,
    #[default]
    Desc,
}

impl From<CliSortDirection> for SortDirection {
    fn from(value: CliSortDirection) -> Self {
        match value {
            CliSortDirection::Asc => SortDirection::Asc,
            CliSortDirection::Desc => SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ListArgs {
    #[arg(long = "filter", value_name = "FIELD=VALUE")]
    pub filters: Vec<String>,
    #[arg(long)]
    pub sort: Option<String>,
    #[arg(long, value_enum, default_value_t = CliSortDirection::Desc)]
    pub direction: CliSortDirection,
    #[arg(long, default_value_t = 1)]
    pub page: i64,
    #[arg(long = "page-size", default_value_t = 20)]
    pub page_size: i64,
}

impl ListArgs {
    pub fn to_query(&self, resource: ListResource) -> Result<ListQuery> {
        let mut query = ListQuery::new(resource)
            .page(self.page)
            .page_size(self.page_size);
        for raw in &self.filters {
            let filter = ListFilter::parse(raw).ok_or_else(|| {
                anyhow!("invalid filter '{raw}'; expected FIELD=VALUE with a non-reserved field")
            })?;
            query = query.filter(filter.field, filter.value);
        }
        if let Some(sort) = &self.sort {
            query = query.sort(sort.clone(), self.direction.into());
        }
        Ok(query)
    }
}

/// Runs one command, writing its JSON result to `out`.
pub async fn execute<W>(client: &LensClient, command: &Command, out: &mut W) -> Result<()>
where
    W: Write,
{
    match command {
        Command::Login { code } => {
            if let Some(code) = code {
                client.deliver_code(code)?;
            }
            let authenticated = client.authenticate().await?;
            write_json(out, &authenticated_json(&authenticated))
        }
        Command::Logout => {
            client.logout()?;
            write_json(out, &json!({ "signed_out": true }))
        }
        Command::Whoami => {
            let session = client
                .current_session()
                .ok_or_else(|| anyhow!("not signed in; run `lens login`"))?;
            write_json(
                out,
                &json!({
                    "user_id": session.user_id,
                    "issued_at_unix_ms": session.issued_at_unix_ms,
                }),
            )
        }
        Command::Repos(list) => {
            ensure_signed_in(client).await?;
            let query = list.to_query(ListResource::Repositories)?;
            render(out, client.repositories(&query).await)
        }
        Command::Commits {
            repository,
            branch,
            list,
        } => {
            ensure_signed_in(client).await?;
            let mut query = list.to_query(ListResource::Commits(repository.clone()))?;
            if let Some(branch) = branch {
                query = query.branch(branch.clone());
            }
            render(out, client.commits(&query).await)
        }
        Command::Status { repository } => {
            ensure_signed_in(client).await?;
            render(out, client.status(repository).await)
        }
        Command::Refresh { repository, wait } => {
            ensure_signed_in(client).await?;
            let handle = client
                .refresh(repository)
                .await
                .with_context(|| format!("failed to refresh repository {repository}"))?;
            match handle {
                Some(mut handle) if *wait => {
                    let mut payload = poll_outcome_json(&handle.wait().await);
                    if let Value::Object(map) = &mut payload {
                        map.insert("accepted".to_string(), Value::Bool(true));
                    }
                    write_json(out, &payload)
                }
                handle => write_json(
                    out,
                    &json!({ "repository_id": repository, "accepted": handle.is_some() }),
                ),
            }
        }
        Command::Add { url, wait } => {
            ensure_signed_in(client).await?;
            let (outcome, handle) = client
                .add_repository(url)
                .await
                .with_context(|| format!("failed to add repository {url}"))?;
            let mut payload = serde_json::to_value(&outcome)?;
            if let (true, Some(mut handle)) = (*wait, handle) {
                let polled = handle.wait().await;
                if let Value::Object(map) = &mut payload {
                    map.insert("analysis".to_string(), poll_outcome_json(&polled));
                }
            }
            write_json(out, &payload)
        }
        Command::Notifications(list) => {
            ensure_signed_in(client).await?;
            let query = list.to_query(ListResource::Notifications)?;
            render(out, client.notifications(&query).await)
        }
    }
}

/// Restores the stored session when this process has not authenticated yet.
async fn ensure_signed_in(client: &LensClient) -> Result<()> {
    if !client.is_signed_in() {
        client
            .authenticate()
            .await
            .context("not signed in; run `lens login`")?;
    }
    Ok(())
}

fn render<W, T>(out: &mut W, view: ViewState<T>) -> Result<()>
where
    W: Write,
    T: Serialize,
{
    match view {
        ViewState::Ready(value) => write_json(out, &value),
        ViewState::Empty => write_json(out, &json!({ "items": [], "state": "empty" })),
        ViewState::Loading => write_json(out, &json!({ "state": "loading" })),
        ViewState::Failed(error) => bail!(error),
    }
}

fn write_json<W, T>(out: &mut W, value: &T) -> Result<()>
where
    W: Write,
    T: Serialize + ?Sized,
{
    serde_json::to_writer_pretty(&mut *out, value).context("failed to encode output")?;
    writeln!(out).context("failed to write output")?;
    Ok(())
}

fn authenticated_json(authenticated: &Authenticated) -> Value {
    let (origin, error) = match &authenticated.origin {
        SessionOrigin::Exchanged => ("exchanged", None),
        SessionOrigin::Restored => ("restored", None),
        SessionOrigin::Fallback { error } => ("fallback", Some(error.to_string())),
    };
    json!({
        "user_id": authenticated.session.user_id,
        "origin": origin,
        "exchange_error": error,
    })
}

fn poll_outcome_json(outcome: &PollOutcome) -> Value {
    match outcome {
        PollOutcome::Completed(job) => json!({
            "outcome": "completed",
            "state": job.state,
            "last_observed_unix_ms": job.last_observed_unix_ms,
        }),
        PollOutcome::TimedOut { last } => json!({
            "outcome": "timed_out",
            "message": "analysis status unknown; try again later",
            "last_state": last.as_ref().map(|job| job.state),
        }),
        PollOutcome::Cancelled { last } => json!({
            "outcome": "cancelled",
            "last_state": last.as_ref().map(|job| job.state),
        }),
    }
}
