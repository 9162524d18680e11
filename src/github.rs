use crate::config::RepoId;
use crate::error::ApiError;
use crate::retry::RetryPolicy;
use crate::transport::{OctocrabTransport, RawResponse, Transport};
use crate::types::{Labels, PrState, PullRequest, Repository};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

/// Wait used when GitHub signals a rate limit without saying for how long.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Connection settings for [`GitHubClient`].
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// API root without a trailing slash.
    pub base_url: String,
    pub token: Option<String>,
    pub per_page: u32,
    /// Safety cap on pages per listing.
    pub max_pages: u32,
    pub retry: RetryPolicy,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: None,
            per_page: 100,
            max_pages: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubUser {
    pub login: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubLabel {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubRef {
    #[serde(rename = "ref")]
    pub name: String,
}

/// Entry of `GET /repos/{owner}/{repo}/issues`. Pull requests carry a
/// `pull_request` object; plain issues don't.
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubIssue {
    pub number: u64,
    pub updated_at: DateTime<Utc>,
    pub pull_request: Option<serde_json::Value>,
}

/// `GET /repos/{owner}/{repo}/pulls/{number}`
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubPullRequest {
    pub number: u64,
    pub title: String,
    pub html_url: String,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    pub user: Option<GitHubUser>,
    pub author_association: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub base: GitHubRef,
    pub head: GitHubRef,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub changed_files: u64,
    #[serde(default)]
    pub labels: Vec<GitHubLabel>,
}

impl GitHubPullRequest {
    pub fn into_record(self, repo: &RepoId) -> PullRequest {
        let state = if self.merged_at.is_some() {
            PrState::Merged
        } else if self.state.eq_ignore_ascii_case("open") {
            PrState::Open
        } else {
            PrState::Closed
        };

        PullRequest {
            repository_slug: repo.slug(),
            pr_number: self.number,
            title: self.title,
            url: self.html_url,
            author_login: self.user.map(|u| u.login),
            author_association: self.author_association,
            state,
            is_draft: self.draft,
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            merged_at: self.merged_at,
            base_branch: self.base.name,
            head_branch: self.head.name,
            additions: self.additions,
            deletions: self.deletions,
            files_changed: self.changed_files,
            labels: Labels(self.labels.into_iter().map(|l| l.name).collect()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubOwner {
    pub login: String,
    pub avatar_url: Option<String>,
}

/// `GET /repos/{owner}/{repo}`
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubRepository {
    pub name: String,
    pub html_url: String,
    pub description: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    pub language: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub owner: GitHubOwner,
}

impl GitHubRepository {
    pub fn into_record(self, repo: &RepoId, collected_at: DateTime<Utc>) -> Repository {
        Repository {
            repository_slug: repo.slug(),
            url: self.html_url,
            name: self.name,
            organization: self.owner.login,
            description: self.description.filter(|d| !d.is_empty()),
            logo_url: self.owner.avatar_url,
            stars: self.stargazers_count,
            language: self.language,
            created_at: self.created_at,
            collected_at,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GitAuthor {
    pub name: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RequestedTeam {
    pub slug: String,
}

/// Entry of `GET /repos/{owner}/{repo}/issues/{number}/timeline`.
///
/// The endpoint returns heterogeneous objects keyed by `event`; every field
/// beyond `event` is optional and only meaningful for some kinds.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TimelineEntry {
    pub event: Option<String>,
    pub id: Option<u64>,
    /// Commit SHA for `committed` entries.
    pub sha: Option<String>,
    pub actor: Option<GitHubUser>,
    /// Author of reviews and comments.
    pub user: Option<GitHubUser>,
    pub created_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Review state for `reviewed` entries.
    pub state: Option<String>,
    pub requested_reviewer: Option<GitHubUser>,
    pub requested_team: Option<RequestedTeam>,
    pub label: Option<GitHubLabel>,
    pub author: Option<GitAuthor>,
    pub committer: Option<GitAuthor>,
}

/// Resumption point for incremental PR collection.
///
/// GitHub's `since` filter is inclusive, so PRs updated at exactly `since`
/// come back again; those already collected at that instant are listed in
/// `seen` and skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    pub since: Option<DateTime<Utc>>,
    pub seen: BTreeSet<u64>,
}

impl Cursor {
    /// Cursor positioned after the most recently updated PR in `existing`.
    pub fn after(existing: &[PullRequest]) -> Self {
        let Some(since) = existing.iter().map(|pr| pr.updated_at).max() else {
            return Self::default();
        };
        let seen = existing
            .iter()
            .filter(|pr| pr.updated_at == since)
            .map(|pr| pr.pr_number)
            .collect();
        Self {
            since: Some(since),
            seen,
        }
    }

    pub fn admits(&self, number: u64, updated_at: DateTime<Utc>) -> bool {
        match self.since {
            None => true,
            Some(since) => {
                updated_at > since || (updated_at == since && !self.seen.contains(&number))
            }
        }
    }

    /// Moves the cursor past an admitted item. Returns false, leaving the
    /// cursor unchanged, if the item is not admitted.
    pub fn advance(&mut self, number: u64, updated_at: DateTime<Utc>) -> bool {
        if !self.admits(number, updated_at) {
            return false;
        }
        if self.since == Some(updated_at) {
            self.seen.insert(number);
        } else {
            self.since = Some(updated_at);
            self.seen = BTreeSet::from([number]);
        }
        true
    }

    fn since_param(&self) -> String {
        self.since
            .map(|since| format!("&since={}", since.to_rfc3339_opts(SecondsFormat::Secs, true)))
            .unwrap_or_default()
    }
}

/// Paging state of [`GitHubClient::list_issues`].
struct Listing {
    cursor: Cursor,
    /// Page number within the current `since`; only grows while a full page
    /// yields nothing new.
    page: u32,
    requests: u32,
}

#[derive(Debug, Default)]
struct RateLimitState {
    remaining: Option<u64>,
    reset_at: Option<DateTime<Utc>>,
}

/// Paginated, rate-limit aware access to the GitHub REST API.
pub struct GitHubClient<T = OctocrabTransport> {
    transport: T,
    config: ApiConfig,
    rate_limit: Mutex<RateLimitState>,
}

impl GitHubClient<OctocrabTransport> {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let transport = OctocrabTransport::new(&config.base_url, config.token.clone())?;
        Ok(Self::with_transport(transport, config))
    }
}

impl<T: Transport> GitHubClient<T> {
    pub fn with_transport(transport: T, config: ApiConfig) -> Self {
        Self {
            transport,
            config,
            rate_limit: Mutex::new(RateLimitState::default()),
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Repository metadata.
    pub async fn fetch_repository(&self, repo: &RepoId) -> Result<GitHubRepository, ApiError> {
        self.get_json(&format!("/repos/{}/{}", repo.owner, repo.repo))
            .await
    }

    /// One pull request with its size fields.
    pub async fn fetch_pull_request(
        &self,
        repo: &RepoId,
        number: u64,
    ) -> Result<PullRequest, ApiError> {
        let pr: GitHubPullRequest = self
            .get_json(&format!("/repos/{}/{}/pulls/{}", repo.owner, repo.repo, number))
            .await?;
        Ok(pr.into_record(repo))
    }

    /// Pull requests admitted by `cursor`, oldest update first, at most `max_count`.
    ///
    /// Lists issues sorted by `updated` ascending (the pulls listing has no
    /// `since` filter) and expands each pull request with a detail request.
    /// The stream is lazy: dropping it stops further requests.
    pub fn fetch_pull_requests<'a>(
        &'a self,
        repo: &'a RepoId,
        cursor: &Cursor,
        max_count: usize,
    ) -> impl Stream<Item = Result<PullRequest, ApiError>> + 'a {
        self.list_issues(repo, cursor.clone())
            .try_filter(|issue| future::ready(issue.pull_request.is_some()))
            .take(max_count)
            .and_then(move |issue| async move { self.fetch_pull_request(repo, issue.number).await })
    }

    /// Issues admitted by `cursor`, oldest update first.
    ///
    /// Each request restarts the listing at the last `updated_at` returned
    /// instead of asking for the next page number. An issue updated while the
    /// listing is read moves to its end; with page numbers that shifts an
    /// unread issue onto a page already consumed.
    fn list_issues<'a>(
        &'a self,
        repo: &'a RepoId,
        cursor: Cursor,
    ) -> impl Stream<Item = Result<GitHubIssue, ApiError>> + 'a {
        let per_page = self.config.per_page;
        let max_pages = self.config.max_pages;
        let start = Listing {
            cursor,
            page: 1,
            requests: 0,
        };

        stream::try_unfold(Some(start), move |listing| async move {
            let Some(mut listing) = listing else {
                return Ok::<_, ApiError>(None);
            };

            let route = format!(
                "/repos/{}/{}/issues?state=all&sort=updated&direction=asc{}&per_page={}&page={}",
                repo.owner,
                repo.repo,
                listing.cursor.since_param(),
                per_page,
                listing.page
            );
            let issues: Vec<GitHubIssue> = self.get_json(&route).await?;
            listing.requests += 1;

            let exhausted = issues.len() < per_page as usize;
            let since_before = listing.cursor.since;
            let admitted: Vec<GitHubIssue> = issues
                .into_iter()
                .filter(|issue| listing.cursor.advance(issue.number, issue.updated_at))
                .collect();

            let next = if exhausted {
                None
            } else if listing.requests >= max_pages {
                tracing::warn!(
                    route = %route,
                    "Hit max_github_api_pages ({}) before the listing was exhausted. Data may be incomplete.",
                    max_pages
                );
                None
            } else {
                // A full page of issues sharing one instant leaves `since`
                // in place; step past them by page number.
                listing.page = if listing.cursor.since == since_before {
                    listing.page + 1
                } else {
                    1
                };
                Some(listing)
            };

            Ok(Some((stream::iter(admitted.into_iter().map(Ok::<_, ApiError>)), next)))
        })
        .try_flatten()
    }

    /// Raw timeline entries of one pull request, in GitHub's (chronological) order.
    pub fn fetch_pr_timeline<'a>(
        &'a self,
        repo: &'a RepoId,
        pr_number: u64,
    ) -> impl Stream<Item = Result<TimelineEntry, ApiError>> + 'a {
        self.paginate(format!(
            "/repos/{}/{}/issues/{}/timeline?",
            repo.owner, repo.repo, pr_number
        ))
    }

    /// Streams the items of a page-numbered listing. `base_route` must end in
    /// a query string (possibly just `?`) that `per_page`/`page` are appended to.
    fn paginate<'a, I>(&'a self, base_route: String) -> impl Stream<Item = Result<I, ApiError>> + 'a
    where
        I: DeserializeOwned + Send + 'a,
    {
        let per_page = self.config.per_page;
        let max_pages = self.config.max_pages;
        let separator = if base_route.ends_with('?') { "" } else { "&" };

        stream::try_unfold(Some(1u32), move |page| {
            let route = page.map(|page| {
                format!("{base_route}{separator}per_page={per_page}&page={page}")
            });
            async move {
                let (Some(page), Some(route)) = (page, route) else {
                    return Ok::<_, ApiError>(None);
                };

                let items: Vec<I> = self.get_json(&route).await?;
                let exhausted = items.len() < per_page as usize;
                let next = if exhausted {
                    None
                } else if page >= max_pages {
                    tracing::warn!(
                        route = %route,
                        "Hit max_github_api_pages ({}) before the listing was exhausted. Data may be incomplete.",
                        max_pages
                    );
                    None
                } else {
                    Some(page + 1)
                };

                Ok(Some((stream::iter(items.into_iter().map(Ok::<I, ApiError>)), next)))
            }
        })
        .try_flatten()
    }

    /// GET with retries, decoded from JSON.
    async fn get_json<R: DeserializeOwned>(&self, route: &str) -> Result<R, ApiError> {
        let response = self
            .config
            .retry
            .run(route, || self.send_once(route))
            .await?;

        serde_json::from_str(&response.body).map_err(|e| ApiError::Decode {
            route: route.to_string(),
            message: e.to_string(),
        })
    }

    /// A single attempt: waits out a known-exhausted quota, sends, records
    /// rate-limit headers and classifies the status.
    async fn send_once(&self, route: &str) -> Result<RawResponse, ApiError> {
        if let Some(wait) = self.quota_wait(Utc::now()) {
            tracing::info!(
                route,
                wait_secs = wait.as_secs(),
                "Rate limit quota exhausted, waiting for reset"
            );
            tokio::time::sleep(wait).await;
        }

        tracing::debug!(route, "GET");
        let response = self.transport.get(route).await?;
        self.record_rate_limit(&response);
        classify(route, response, Utc::now())
    }

    fn record_rate_limit(&self, response: &RawResponse) {
        let headers = &response.rate_limit;
        if headers.remaining.is_none() && headers.reset_epoch.is_none() {
            return;
        }
        let mut state = match self.rate_limit.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.remaining = headers.remaining;
        state.reset_at = headers
            .reset_epoch
            .and_then(|epoch| DateTime::from_timestamp(epoch, 0));
    }

    /// How long to hold off before the next call, if the quota is known to be spent.
    fn quota_wait(&self, now: DateTime<Utc>) -> Option<Duration> {
        let state = match self.rate_limit.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.remaining != Some(0) {
            return None;
        }
        let reset_at = state.reset_at?;
        (reset_at - now).to_std().ok().filter(|wait| !wait.is_zero())
    }
}

/// Maps a response onto the error taxonomy.
fn classify(route: &str, response: RawResponse, now: DateTime<Utc>) -> Result<RawResponse, ApiError> {
    if response.is_success() {
        return Ok(response);
    }

    let message = github_message(&response.body);
    let quota_spent = response.rate_limit.remaining == Some(0);
    let has_retry_after = response.rate_limit.retry_after.is_some();

    match response.status {
        429 => Err(rate_limited(&response, now)),
        403 if quota_spent || has_retry_after || message.to_lowercase().contains("rate limit") => {
            Err(rate_limited(&response, now))
        }
        401 | 403 => Err(ApiError::Auth { message }),
        404 => Err(ApiError::NotFound {
            resource: route.split('?').next().unwrap_or(route).to_string(),
        }),
        500..=599 => Err(ApiError::TransientNetwork {
            message: format!("server error {}: {}", response.status, message),
        }),
        status => Err(ApiError::Unexpected { status, message }),
    }
}

fn rate_limited(response: &RawResponse, now: DateTime<Utc>) -> ApiError {
    let headers = &response.rate_limit;
    let retry_after = headers
        .retry_after
        .map(Duration::from_secs)
        .or_else(|| {
            headers
                .reset_epoch
                .and_then(|epoch| DateTime::from_timestamp(epoch, 0))
                .and_then(|reset_at| (reset_at - now).to_std().ok())
        })
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT);

    ApiError::RateLimited { retry_after }
}

/// Extracts GitHub's `{"message": ...}` error text, falling back to the raw body.
fn github_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    serde_json::from_str::<ErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.chars().take(200).collect())
}
