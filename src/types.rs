//! Record types for the on-disk tables.
//!
//! Each struct maps one-to-one onto a CSV table; field order is column order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A table row type with a fixed, documented column set.
pub trait Record: Serialize + for<'de> Deserialize<'de> {
    /// Column names, in the order the fields are declared.
    const COLUMNS: &'static [&'static str];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

/// Label names stored in a single cell as a JSON array, e.g. `["bug","a;b"]`.
/// Label names may contain any character, so no separator is safe. An empty
/// cell reads as no labels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Labels(pub Vec<String>);

impl Serialize for Labels {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let cell = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&cell)
    }
}

impl<'de> Deserialize<'de> for Labels {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.trim().is_empty() {
            return Ok(Labels::default());
        }
        serde_json::from_str(&raw)
            .map(Labels)
            .map_err(|e| serde::de::Error::custom(format!("labels cell {raw:?}: {e}")))
    }
}

/// One row of `repository.csv`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub repository_slug: String,
    pub url: String,
    pub name: String,
    pub organization: String,
    pub description: Option<String>,
    pub logo_url: Option<String>,
    pub stars: u64,
    pub language: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
}

impl Record for Repository {
    const COLUMNS: &'static [&'static str] = &[
        "repository_slug",
        "url",
        "name",
        "organization",
        "description",
        "logo_url",
        "stars",
        "language",
        "created_at",
        "collected_at",
    ];
}

/// One row of `pull_requests.csv`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub repository_slug: String,
    pub pr_number: u64,
    pub title: String,
    pub url: String,
    pub author_login: Option<String>,
    pub author_association: Option<String>,
    pub state: PrState,
    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub base_branch: String,
    pub head_branch: String,
    pub additions: u64,
    pub deletions: u64,
    pub files_changed: u64,
    pub labels: Labels,
}

impl Record for PullRequest {
    const COLUMNS: &'static [&'static str] = &[
        "repository_slug",
        "pr_number",
        "title",
        "url",
        "author_login",
        "author_association",
        "state",
        "is_draft",
        "created_at",
        "updated_at",
        "closed_at",
        "merged_at",
        "base_branch",
        "head_branch",
        "additions",
        "deletions",
        "files_changed",
        "labels",
    ];
}

impl PullRequest {
    /// Owners, members and collaborators count as the core team.
    pub fn is_core_team(&self) -> bool {
        matches!(
            self.author_association.as_deref(),
            Some("OWNER" | "MEMBER" | "COLLABORATOR")
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PrCreated,
    CommitPushed,
    ReviewRequested,
    ReviewApproved,
    ReviewChangesRequested,
    ReviewCommented,
    ReviewDismissed,
    CommentAdded,
    PrMerged,
    PrClosed,
    PrReopened,
    Labeled,
    Unlabeled,
    ReadyForReview,
    ConvertedToDraft,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PrCreated => "pr_created",
            EventType::CommitPushed => "commit_pushed",
            EventType::ReviewRequested => "review_requested",
            EventType::ReviewApproved => "review_approved",
            EventType::ReviewChangesRequested => "review_changes_requested",
            EventType::ReviewCommented => "review_commented",
            EventType::ReviewDismissed => "review_dismissed",
            EventType::CommentAdded => "comment_added",
            EventType::PrMerged => "pr_merged",
            EventType::PrClosed => "pr_closed",
            EventType::PrReopened => "pr_reopened",
            EventType::Labeled => "labeled",
            EventType::Unlabeled => "unlabeled",
            EventType::ReadyForReview => "ready_for_review",
            EventType::ConvertedToDraft => "converted_to_draft",
        }
    }

    pub fn is_review(&self) -> bool {
        matches!(
            self,
            EventType::ReviewApproved
                | EventType::ReviewChangesRequested
                | EventType::ReviewCommented
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `pr_{n}/events.csv` and `all_events.csv`.
///
/// PR-level fields are copied onto every event so the consolidated table can
/// be analysed without a join.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_id: String,
    pub time: DateTime<Utc>,
    pub pr_number: u64,
    pub repository_slug: String,
    pub pr_title: String,
    pub pr_url: String,
    pub event_type: EventType,
    pub actor: Option<String>,
    pub target_user: Option<String>,
    pub review_state: Option<String>,
    pub label: Option<String>,
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub is_core_team: bool,
    pub source_branch: String,
    pub target_branch: String,
    pub was_draft: bool,
    pub is_bot: bool,
}

impl Record for TimelineEvent {
    const COLUMNS: &'static [&'static str] = &[
        "event_id",
        "time",
        "pr_number",
        "repository_slug",
        "pr_title",
        "pr_url",
        "event_type",
        "actor",
        "target_user",
        "review_state",
        "label",
        "files_changed",
        "lines_added",
        "lines_deleted",
        "is_core_team",
        "source_branch",
        "target_branch",
        "was_draft",
        "is_bot",
    ];
}

/// Everything collected for one repository, as loaded by the metrics layer.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    pub repository: Option<Repository>,
    pub pull_requests: Vec<PullRequest>,
    pub events: Vec<TimelineEvent>,
}

const KNOWN_BOTS: &[&str] = &[
    "dependabot",
    "renovate",
    "github-actions",
    "semantic-release",
    "codecov",
    "sonarcloud",
    "snyk-bot",
    "imgbot",
    "deepsource-autofix",
    "stale",
    "allcontributors",
    "prettier",
    "vercel",
    "mergify",
    "probot",
    "goreleaserbot",
    "greenkeeper",
    "lgtm-com",
    "circleci",
    "travis-ci",
    "gitter-badger",
    "whitesource-bolt-for-github",
];

/// Heuristic bot detection on a login name.
pub fn is_bot_actor(login: &str) -> bool {
    if login.is_empty() {
        return false;
    }
    let login = login.to_lowercase();

    KNOWN_BOTS.iter().any(|bot| login.contains(bot))
        || login.ends_with("bot")
        || login.ends_with("[bot]")
        || login.ends_with("app")
        || login.contains("bot-")
}
