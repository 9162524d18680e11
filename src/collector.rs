//! Incremental collection of one repository into the on-disk dataset.
//!
//! A run resumes from the most recently updated PR already on disk, fetches
//! PRs updated since then, and flushes each PR (its events first, then its
//! row) before moving to the next one. A run that aborts keeps everything
//! flushed so far and the next run picks up where it stopped.

use crate::config::RepoId;
use crate::error::{ApiError, CollectError, StoreError};
use crate::github::{Cursor, GitHubClient, TimelineEntry};
use crate::store::{append_dedup, merge_upsert, DatasetStore};
use crate::transport::Transport;
use crate::types::{is_bot_actor, EventType, PullRequest, TimelineEvent};
use chrono::{DateTime, Utc};
use futures::{pin_mut, TryStreamExt};
use serde::{Deserialize, Serialize};

/// How events are matched against an existing per-PR table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventIdentity {
    /// The `event_id` column: GitHub's event, review or comment id, or the
    /// commit SHA.
    #[default]
    RemoteId,
    /// `event_type`, actor, timestamp, label and target user. The last two
    /// tell apart labels added or reviewers requested in the same second.
    Composite,
}

impl EventIdentity {
    pub fn key(&self, event: &TimelineEvent) -> String {
        match self {
            EventIdentity::RemoteId => event.event_id.clone(),
            EventIdentity::Composite => format!(
                "{}|{}|{}|{}|{}",
                event.event_type,
                event.actor.as_deref().unwrap_or_default(),
                event.time.timestamp(),
                event.label.as_deref().unwrap_or_default(),
                event.target_user.as_deref().unwrap_or_default()
            ),
        }
    }
}

/// What a collection run did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CollectSummary {
    pub new_prs: usize,
    pub updated_prs: usize,
    pub backfilled_prs: usize,
    pub events_appended: usize,
    pub total_prs: usize,
    pub total_events: usize,
}

pub struct Collector<T: Transport> {
    client: GitHubClient<T>,
    store: DatasetStore,
    identity: EventIdentity,
}

impl<T: Transport> Collector<T> {
    pub fn new(client: GitHubClient<T>, store: DatasetStore, identity: EventIdentity) -> Self {
        Self {
            client,
            store,
            identity,
        }
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    /// Collects new and updated pull requests of `repo` until the dataset
    /// holds `max_prs` PRs. At most `max_prs` PRs are fetched per run.
    pub async fn collect(&self, repo: &RepoId, max_prs: usize) -> Result<CollectSummary, CollectError> {
        let api_err = |source: ApiError| CollectError::Api {
            repo: repo.clone(),
            source,
        };
        let store_err = |source: StoreError| CollectError::Store {
            repo: repo.clone(),
            source,
        };

        tracing::info!(repo = %repo, max_prs, "Starting collection");

        // Fail on a missing repository or bad token before touching the disk.
        let metadata = self.client.fetch_repository(repo).await.map_err(api_err)?;

        let mut pull_requests = self.store.load_pull_requests(repo).map_err(store_err)?;
        let cursor = Cursor::after(&pull_requests);
        tracing::info!(
            repo = %repo,
            existing = pull_requests.len(),
            since = ?cursor.since,
            "Loaded existing pull requests"
        );

        let mut summary = CollectSummary::default();
        let mut new_budget = max_prs.saturating_sub(pull_requests.len());

        let fetched = self.client.fetch_pull_requests(repo, &cursor, max_prs);
        pin_mut!(fetched);
        while let Some(pr) = fetched.try_next().await.map_err(api_err)? {
            let is_new = !pull_requests.iter().any(|p| p.pr_number == pr.pr_number);
            let number = pr.pr_number;

            // Stop rather than skip: collecting anything updated later would
            // move the cursor past this PR and it would never be picked up.
            if is_new {
                if new_budget == 0 {
                    tracing::info!(repo = %repo, pr_number = number, "Reached PR limit");
                    break;
                }
                new_budget -= 1;
            }

            summary.events_appended += self.collect_events(repo, &pr).await?;

            // Row after events: a crash in between leaves the cursor behind this PR.
            pull_requests = merge_upsert(pull_requests, vec![pr], |p| p.pr_number);
            self.store
                .save_pull_requests(repo, &pull_requests)
                .map_err(store_err)?;

            if is_new {
                summary.new_prs += 1;
            } else {
                summary.updated_prs += 1;
            }
            tracing::info!(repo = %repo, pr_number = number, new = is_new, "Collected pull request");
        }

        let missing: Vec<PullRequest> = pull_requests
            .iter()
            .filter(|pr| !self.store.has_pr_events(repo, pr.pr_number))
            .cloned()
            .collect();
        for pr in &missing {
            tracing::info!(repo = %repo, pr_number = pr.pr_number, "Backfilling missing events");
            summary.events_appended += self.collect_events(repo, pr).await?;
            summary.backfilled_prs += 1;
        }

        summary.total_prs = pull_requests.len();
        summary.total_events = self
            .store
            .rebuild_all_events(repo, &pull_requests)
            .map_err(store_err)?;

        // Written last: its presence marks a completed run.
        let repository = metadata.into_record(repo, Utc::now());
        self.store
            .save_repository(repo, &repository)
            .map_err(store_err)?;

        tracing::info!(
            repo = %repo,
            new_prs = summary.new_prs,
            updated_prs = summary.updated_prs,
            events_appended = summary.events_appended,
            total_prs = summary.total_prs,
            total_events = summary.total_events,
            "Collection finished"
        );

        Ok(summary)
    }

    /// Fetches the PR's timeline and merges it into `pr_{n}/events.csv`.
    /// Returns the number of events appended.
    async fn collect_events(&self, repo: &RepoId, pr: &PullRequest) -> Result<usize, CollectError> {
        let entries: Vec<TimelineEntry> = self
            .client
            .fetch_pr_timeline(repo, pr.pr_number)
            .try_collect()
            .await
            .map_err(|source| CollectError::Api {
                repo: repo.clone(),
                source,
            })?;
        let store_err = |source: StoreError| CollectError::Store {
            repo: repo.clone(),
            source,
        };

        let fetched = build_events(pr, &entries);
        let existing = self
            .store
            .load_pr_events(repo, pr.pr_number)
            .map_err(store_err)?;

        let identity = self.identity;
        let (mut merged, appended) = append_dedup(existing, fetched, |e| identity.key(e));
        merged.sort_by_key(|e| e.time);

        self.store
            .save_pr_events(repo, pr.pr_number, &merged)
            .map_err(store_err)?;

        tracing::debug!(repo = %repo, pr_number = pr.pr_number, appended, total = merged.len(), "Merged timeline");
        Ok(appended)
    }
}

/// Converts raw timeline entries into event rows, preceded by a synthesized
/// `pr_created` event. Entries of kinds that are not tracked are dropped.
pub fn build_events(pr: &PullRequest, entries: &[TimelineEntry]) -> Vec<TimelineEvent> {
    let mut events = Vec::with_capacity(entries.len() + 1);
    events.push(event_row(
        pr,
        format!("pr_created-{}", pr.pr_number),
        EventType::PrCreated,
        pr.created_at,
        pr.author_login.clone(),
    ));

    for entry in entries {
        if let Some(event) = convert_entry(pr, entry) {
            events.push(event);
        }
    }
    events
}

fn convert_entry(pr: &PullRequest, entry: &TimelineEntry) -> Option<TimelineEvent> {
    let kind = entry.event.as_deref()?;
    let actor_login = entry.actor.as_ref().map(|u| u.login.clone());
    let user_login = entry.user.as_ref().map(|u| u.login.clone());

    let (event_type, time, actor) = match kind {
        "committed" => {
            let author = entry.author.as_ref();
            let time = author
                .and_then(|a| a.date)
                .or_else(|| entry.committer.as_ref().and_then(|c| c.date))?;
            (EventType::CommitPushed, time, author.and_then(|a| a.name.clone()))
        }
        "reviewed" => {
            let event_type = match entry.state.as_deref()?.to_ascii_lowercase().as_str() {
                "approved" => EventType::ReviewApproved,
                "changes_requested" => EventType::ReviewChangesRequested,
                "commented" => EventType::ReviewCommented,
                "dismissed" => EventType::ReviewDismissed,
                // Pending reviews are not visible to others yet.
                _ => return None,
            };
            (event_type, entry.submitted_at?, user_login.or(actor_login))
        }
        "commented" => (EventType::CommentAdded, entry.created_at?, user_login.or(actor_login)),
        "review_requested" => (EventType::ReviewRequested, entry.created_at?, actor_login),
        "merged" => (EventType::PrMerged, entry.created_at?, actor_login),
        "closed" => (EventType::PrClosed, entry.created_at?, actor_login),
        "reopened" => (EventType::PrReopened, entry.created_at?, actor_login),
        "labeled" => (EventType::Labeled, entry.created_at?, actor_login),
        "unlabeled" => (EventType::Unlabeled, entry.created_at?, actor_login),
        "ready_for_review" => (EventType::ReadyForReview, entry.created_at?, actor_login),
        "convert_to_draft" => (EventType::ConvertedToDraft, entry.created_at?, actor_login),
        _ => return None,
    };

    let event_id = match (&entry.id, &entry.sha) {
        (Some(id), _) => format!("{kind}-{id}"),
        (None, Some(sha)) => format!("{kind}-{sha}"),
        (None, None) => format!(
            "{kind}-{}-{}",
            actor.as_deref().unwrap_or_default(),
            time.timestamp()
        ),
    };

    let mut event = event_row(pr, event_id, event_type, time, actor);
    event.target_user = match event_type {
        EventType::ReviewRequested => entry
            .requested_reviewer
            .as_ref()
            .map(|u| u.login.clone())
            .or_else(|| entry.requested_team.as_ref().map(|t| t.slug.clone())),
        _ => None,
    };
    event.review_state = event_type
        .is_review()
        .then(|| review_state(event_type))
        .or((event_type == EventType::ReviewDismissed).then(|| "dismissed".to_string()));
    event.label = match event_type {
        EventType::Labeled | EventType::Unlabeled => entry.label.as_ref().map(|l| l.name.clone()),
        _ => None,
    };
    Some(event)
}

fn review_state(event_type: EventType) -> String {
    match event_type {
        EventType::ReviewApproved => "approved",
        EventType::ReviewChangesRequested => "changes_requested",
        _ => "commented",
    }
    .to_string()
}

fn event_row(
    pr: &PullRequest,
    event_id: String,
    event_type: EventType,
    time: DateTime<Utc>,
    actor: Option<String>,
) -> TimelineEvent {
    let actor = actor.filter(|a| !a.is_empty());
    TimelineEvent {
        event_id,
        time,
        pr_number: pr.pr_number,
        repository_slug: pr.repository_slug.clone(),
        pr_title: pr.title.clone(),
        pr_url: pr.url.clone(),
        event_type,
        is_bot: actor.as_deref().is_some_and(is_bot_actor),
        actor,
        target_user: None,
        review_state: None,
        label: None,
        files_changed: pr.files_changed,
        lines_added: pr.additions,
        lines_deleted: pr.deletions,
        is_core_team: pr.is_core_team(),
        source_branch: pr.head_branch.clone(),
        target_branch: pr.base_branch.clone(),
        was_draft: pr.is_draft,
    }
}
