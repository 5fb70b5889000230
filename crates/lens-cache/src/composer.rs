//! Canonical cache identities for list views and single resources.
//!
//! These functions are the only way cache keys are built. List queries are
//! normalized first (filters sorted and de-duplicated, paging clamped,
//! presentation-only settings dropped) so equal queries always share a key.

use lens_core::RepositoryId;
use serde::{Deserialize, Serialize};

use crate::key::CacheKey;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

const REPOSITORY_SCOPE: &str = "repository";

/// Query parameters the canonical form emits itself; filters may not use them.
pub const RESERVED_FILTER_FIELDS: [&str; 5] = ["sort", "direction", "branch", "page", "page_size"];

/// The collection a list query targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListResource {
    Repositories,
    Notifications,
    Branches(RepositoryId),
    Commits(RepositoryId),
    PullRequests(RepositoryId),
    Files(RepositoryId),
    Notes(RepositoryId),
}

impl ListResource {
    pub fn kind(&self) -> &'static str {
        match self {
            ListResource::Repositories => "repositories",
            ListResource::Notifications => "notifications",
            ListResource::Branches(_) => "branches",
            ListResource::Commits(_) => "commits",
            ListResource::PullRequests(_) => "pull_requests",
            ListResource::Files(_) => "files",
            ListResource::Notes(_) => "notes",
        }
    }

    pub fn repository(&self) -> Option<&RepositoryId> {
        match self {
            ListResource::Repositories | ListResource::Notifications => None,
            ListResource::Branches(id)
            | ListResource::Commits(id)
            | ListResource::PullRequests(id)
            | ListResource::Files(id)
            | ListResource::Notes(id) => Some(id),
        }
    }
}

/// A single cached resource addressed by its own identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Repository(RepositoryId),
    Status(RepositoryId),
    Analytics {
        repository: RepositoryId,
        branch: Option<String>,
    },
    Commit {
        repository: RepositoryId,
        sha: String,
    },
    PullRequest {
        repository: RepositoryId,
        number: u64,
    },
    File {
        repository: RepositoryId,
        file_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListFilter {
    pub field: String,
    pub value: String,
}

impl ListFilter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Parses `field=value`; returns `None` when either side is blank or the
    /// field is reserved.
    pub fn parse(raw: &str) -> Option<Self> {
        let (field, value) = raw.split_once('=')?;
        Self::new(field, value).normalized()
    }

    fn normalized(&self) -> Option<Self> {
        let field = self.field.trim().to_ascii_lowercase();
        let value = self.value.trim();
        if field.is_empty() || value.is_empty() {
            return None;
        }
        if RESERVED_FILTER_FIELDS.contains(&field.as_str()) {
            tracing::debug!(field = %field, "dropping filter on reserved field");
            return None;
        }
        Some(Self {
            field,
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

/// A list view request as the UI builds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub resource: ListResource,
    pub filters: Vec<ListFilter>,
    pub sort: Option<SortSpec>,
    pub branch: Option<String>,
    pub page: i64,
    pub page_size: i64,
    /// How many rows the view renders at once; never part of the key.
    pub presentation_size: Option<u32>,
}

impl ListQuery {
    pub fn new(resource: ListResource) -> Self {
        Self {
            resource,
            filters: Vec::new(),
            sort: None,
            branch: None,
            page: 1,
            page_size: i64::from(DEFAULT_PAGE_SIZE),
            presentation_size: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(ListFilter::new(field, value));
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec::new(field, direction));
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn presentation_size(mut self, presentation_size: u32) -> Self {
        self.presentation_size = Some(presentation_size);
        self
    }

    pub fn canonical(&self) -> CanonicalListQuery {
        let mut filters = self
            .filters
            .iter()
            .filter_map(ListFilter::normalized)
            .collect::<Vec<_>>();
        filters.sort();
        filters.dedup();

        let sort = self.sort.as_ref().and_then(|sort| {
            let field = sort.field.trim().to_ascii_lowercase();
            (!field.is_empty()).then(|| SortSpec::new(field, sort.direction))
        });
        let branch = self
            .branch
            .as_deref()
            .map(str::trim)
            .filter(|branch| !branch.is_empty())
            .map(ToOwned::to_owned);

        CanonicalListQuery {
            resource: self.resource.clone(),
            filters,
            sort,
            branch,
            page: clamp_to_u32(self.page, 1, u32::MAX),
            page_size: clamp_to_u32(self.page_size, 1, MAX_PAGE_SIZE),
        }
    }
}

fn clamp_to_u32(value: i64, min: u32, max: u32) -> u32 {
    let clamped = value.clamp(i64::from(min), i64::from(max));
    u32::try_from(clamped).unwrap_or(min)
}

/// Normalized list query: the form both cache keys and request parameters
/// are derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalListQuery {
    pub resource: ListResource,
    pub filters: Vec<ListFilter>,
    pub sort: Option<SortSpec>,
    pub branch: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl CanonicalListQuery {
    /// Query-string pairs in canonical order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self
            .filters
            .iter()
            .map(|filter| (filter.field.clone(), filter.value.clone()))
            .collect::<Vec<_>>();
        if let Some(sort) = &self.sort {
            pairs.push(("sort".to_string(), sort.field.clone()));
            pairs.push(("direction".to_string(), sort.direction.as_str().to_string()));
        }
        if let Some(branch) = &self.branch {
            pairs.push(("branch".to_string(), branch.clone()));
        }
        pairs.push(("page".to_string(), self.page.to_string()));
        pairs.push(("page_size".to_string(), self.page_size.to_string()));
        pairs
    }

    pub fn cache_key(&self) -> CacheKey {
        let mut segments = match self.resource.repository() {
            Some(repository) => vec![
                REPOSITORY_SCOPE.to_string(),
                repository.to_string(),
                self.resource.kind().to_string(),
            ],
            None => vec![self.resource.kind().to_string(), "list".to_string()],
        };
        let filters = self
            .filters
            .iter()
            .map(|filter| format!("{}:{}", escape(&filter.field), escape(&filter.value)))
            .collect::<Vec<_>>()
            .join(",");
        segments.push(format!("filters={filters}"));
        segments.push(match &self.sort {
            Some(sort) => format!("sort={}:{}", escape(&sort.field), sort.direction.as_str()),
            None => "sort=default".to_string(),
        });
        segments.push(format!("branch={}", escape(self.branch.as_deref().unwrap_or(""))));
        segments.push(format!("page={}", self.page));
        segments.push(format!("page_size={}", self.page_size));
        CacheKey::from_segments(segments)
    }
}

/// Percent-escapes the separators used inside a key segment.
fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for character in raw.chars() {
        match character {
            '%' => escaped.push_str("%25"),
            ',' => escaped.push_str("%2C"),
            ':' => escaped.push_str("%3A"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Canonical cache key for a list query.
pub fn canonicalize(query: &ListQuery) -> CacheKey {
    query.canonical().cache_key()
}

/// Cache key for a single resource.
pub fn resource_key(resource: &ResourceRef) -> CacheKey {
    let scoped = |repository: &RepositoryId, rest: Vec<String>| {
        let mut segments = vec![REPOSITORY_SCOPE.to_string(), repository.to_string()];
        segments.extend(rest);
        CacheKey::from_segments(segments)
    };
    match resource {
        ResourceRef::Repository(repository) => scoped(repository, vec!["detail".to_string()]),
        ResourceRef::Status(repository) => scoped(repository, vec!["status".to_string()]),
        ResourceRef::Analytics { repository, branch } => scoped(
            repository,
            vec![
                "analytics".to_string(),
                format!(
                    "branch={}",
                    branch.as_deref().map(str::trim).unwrap_or_default()
                ),
            ],
        ),
        ResourceRef::Commit { repository, sha } => {
            scoped(repository, vec!["commit".to_string(), sha.trim().to_string()])
        }
        ResourceRef::PullRequest { repository, number } => {
            scoped(repository, vec!["pull_request".to_string(), number.to_string()])
        }
        ResourceRef::File {
            repository,
            file_id,
        } => scoped(repository, vec!["file".to_string(), file_id.trim().to_string()]),
    }
}

/// Prefix covering every key derived from one repository's data.
pub fn repository_prefix(repository: &RepositoryId) -> CacheKey {
    CacheKey::from_segments(vec![REPOSITORY_SCOPE.to_string(), repository.to_string()])
}

/// Prefix covering every page of one list, whatever its filters or paging.
pub fn list_prefix(resource: &ListResource) -> CacheKey {
    let segments = match resource.repository() {
        Some(repository) => vec![
            REPOSITORY_SCOPE.to_string(),
            repository.to_string(),
            resource.kind().to_string(),
        ],
        None => vec![resource.kind().to_string(), "list".to_string()],
    };
    CacheKey::from_segments(segments)
}
