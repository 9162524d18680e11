#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use collabflow::collector::{Collector, EventIdentity};
use collabflow::config::RepoId;
use collabflow::error::ApiError;
use collabflow::github::{ApiConfig, GitHubClient};
use collabflow::retry::RetryPolicy;
use collabflow::store::DatasetStore;
use collabflow::transport::{RateLimitHeaders, RawResponse, Transport};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

pub const PER_PAGE: u32 = 2;

/// 2024-01-01T00:00:00Z plus `minutes`.
pub fn ts(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn repo() -> RepoId {
    RepoId::new("acme", "widgets")
}

#[derive(Clone, Debug)]
pub struct FakePr {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub association: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub timeline: Vec<Value>,
}

impl FakePr {
    /// An open PR with one commit and one approving review.
    pub fn new(number: u64, updated_at: DateTime<Utc>) -> Self {
        let created_at = updated_at - Duration::hours(2);
        Self {
            number,
            title: format!("Change #{number}"),
            author: "octocat".to_string(),
            association: "CONTRIBUTOR".to_string(),
            created_at,
            updated_at,
            closed_at: None,
            merged_at: None,
            timeline: vec![
                committed(&format!("sha{number}"), created_at, "Octo Cat"),
                reviewed(number * 100 + 1, updated_at, "reviewer", "APPROVED"),
            ],
        }
    }

    fn detail(&self) -> Value {
        json!({
            "number": self.number,
            "title": self.title,
            "html_url": format!("https://github.com/acme/widgets/pull/{}", self.number),
            "state": if self.closed_at.is_some() { "closed" } else { "open" },
            "draft": false,
            "user": { "login": self.author },
            "author_association": self.association,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
            "closed_at": self.closed_at,
            "merged_at": self.merged_at,
            "base": { "ref": "main" },
            "head": { "ref": format!("feature-{}", self.number) },
            "additions": 10,
            "deletions": 2,
            "changed_files": 3,
            "labels": [{ "name": "enhancement" }],
        })
    }
}

pub fn committed(sha: &str, at: DateTime<Utc>, name: &str) -> Value {
    json!({
        "event": "committed",
        "sha": sha,
        "author": { "name": name, "date": at },
        "committer": { "name": name, "date": at },
    })
}

pub fn reviewed(id: u64, at: DateTime<Utc>, user: &str, state: &str) -> Value {
    json!({
        "event": "reviewed",
        "id": id,
        "user": { "login": user },
        "submitted_at": at,
        "state": state,
    })
}

pub fn commented(id: u64, at: DateTime<Utc>, user: &str) -> Value {
    json!({
        "event": "commented",
        "id": id,
        "user": { "login": user },
        "created_at": at,
    })
}

pub fn issue_event(kind: &str, id: u64, at: DateTime<Utc>, actor: &str) -> Value {
    json!({
        "event": kind,
        "id": id,
        "actor": { "login": actor },
        "created_at": at,
    })
}

pub fn labeled(id: u64, at: DateTime<Utc>, actor: &str, label: &str) -> Value {
    let mut entry = issue_event("labeled", id, at, actor);
    entry["label"] = json!({ "name": label });
    entry
}

pub fn status(code: u16, message: &str) -> RawResponse {
    RawResponse {
        status: code,
        rate_limit: RateLimitHeaders::default(),
        body: json!({ "message": message }).to_string(),
    }
}

struct Failure {
    fragment: String,
    response: RawResponse,
    persistent: bool,
}

struct Touch {
    fragment: String,
    number: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct FakeState {
    repository_missing: bool,
    prs: BTreeMap<u64, FakePr>,
    plain_issues: Vec<(u64, DateTime<Utc>)>,
    failures: Vec<Failure>,
    touches: Vec<Touch>,
    next_headers: Option<RateLimitHeaders>,
    requests: Vec<String>,
}

/// In-memory GitHub serving the handful of routes the collector uses.
#[derive(Clone, Default)]
pub struct FakeGitHub {
    state: Arc<Mutex<FakeState>>,
}

impl FakeGitHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prs(prs: impl IntoIterator<Item = FakePr>) -> Self {
        let fake = Self::new();
        for pr in prs {
            fake.add_pr(pr);
        }
        fake
    }

    pub fn add_pr(&self, pr: FakePr) {
        self.state.lock().unwrap().prs.insert(pr.number, pr);
    }

    pub fn update_pr(&self, number: u64, update: impl FnOnce(&mut FakePr)) {
        let mut state = self.state.lock().unwrap();
        update(state.prs.get_mut(&number).expect("unknown fake PR"));
    }

    pub fn add_plain_issue(&self, number: u64, updated_at: DateTime<Utc>) {
        self.state
            .lock()
            .unwrap()
            .plain_issues
            .push((number, updated_at));
    }

    pub fn remove_repository(&self) {
        self.state.lock().unwrap().repository_missing = true;
    }

    /// Answers the next request whose route contains `fragment` with `response`.
    pub fn fail_once(&self, fragment: &str, response: RawResponse) {
        self.push_failure(fragment, response, false);
    }

    /// Answers every request whose route contains `fragment` with `response`.
    pub fn fail_always(&self, fragment: &str, response: RawResponse) {
        self.push_failure(fragment, response, true);
    }

    /// Sets PR `number`'s `updated_at` once a request whose route contains
    /// `fragment` arrives, as if someone pushed to it mid-collection.
    pub fn touch_on_request(&self, fragment: &str, number: u64, updated_at: DateTime<Utc>) {
        self.state.lock().unwrap().touches.push(Touch {
            fragment: fragment.to_string(),
            number,
            updated_at,
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Rate-limit headers attached to the next successful response.
    pub fn set_next_headers(&self, headers: RateLimitHeaders) {
        self.state.lock().unwrap().next_headers = Some(headers);
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    fn push_failure(&self, fragment: &str, response: RawResponse, persistent: bool) {
        self.state.lock().unwrap().failures.push(Failure {
            fragment: fragment.to_string(),
            response,
            persistent,
        });
    }

    fn respond(&self, route: &str) -> RawResponse {
        let mut state = self.state.lock().unwrap();
        state.requests.push(route.to_string());

        while let Some(index) = state.touches.iter().position(|t| route.contains(&t.fragment)) {
            let touch = state.touches.remove(index);
            if let Some(pr) = state.prs.get_mut(&touch.number) {
                pr.updated_at = touch.updated_at;
            }
        }

        if let Some(index) = state
            .failures
            .iter()
            .position(|f| route.contains(&f.fragment))
        {
            let failure = &state.failures[index];
            let response = failure.response.clone();
            if !failure.persistent {
                state.failures.remove(index);
            }
            return response;
        }

        let (path, query) = route.split_once('?').unwrap_or((route, ""));
        let params: HashMap<&str, &str> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let per_page: usize = params.get("per_page").map_or(30, |v| v.parse().unwrap());
        let page: usize = params.get("page").map_or(1, |v| v.parse().unwrap());
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        let body = match segments.as_slice() {
            ["repos", "acme", "widgets"] if !state.repository_missing => json!({
                "name": "widgets",
                "html_url": "https://github.com/acme/widgets",
                "description": "Widgets, assembled",
                "stargazers_count": 42,
                "language": "Rust",
                "created_at": ts(-100_000),
                "owner": { "login": "acme", "avatar_url": "https://avatars.example/acme" },
            }),
            ["repos", "acme", "widgets", "issues"] if !state.repository_missing => {
                let since = params
                    .get("since")
                    .map(|s| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc));
                let mut issues: Vec<(DateTime<Utc>, u64, bool)> = state
                    .prs
                    .values()
                    .map(|pr| (pr.updated_at, pr.number, true))
                    .chain(state.plain_issues.iter().map(|(n, at)| (*at, *n, false)))
                    .filter(|(updated, _, _)| since.map_or(true, |s| *updated >= s))
                    .collect();
                issues.sort();
                let items: Vec<Value> = issues
                    .into_iter()
                    .map(|(updated_at, number, is_pr)| {
                        let mut issue = json!({ "number": number, "updated_at": updated_at });
                        if is_pr {
                            issue["pull_request"] = json!({ "url": "ignored" });
                        }
                        issue
                    })
                    .collect();
                Value::Array(page_of(items, per_page, page))
            }
            ["repos", "acme", "widgets", "pulls", number] => {
                match state.prs.get(&number.parse::<u64>().unwrap()) {
                    Some(pr) => pr.detail(),
                    None => return status(404, "Not Found"),
                }
            }
            ["repos", "acme", "widgets", "issues", number, "timeline"] => {
                match state.prs.get(&number.parse::<u64>().unwrap()) {
                    Some(pr) => Value::Array(page_of(pr.timeline.clone(), per_page, page)),
                    None => return status(404, "Not Found"),
                }
            }
            _ => return status(404, "Not Found"),
        };

        RawResponse {
            status: 200,
            rate_limit: state.next_headers.take().unwrap_or_default(),
            body: body.to_string(),
        }
    }
}

fn page_of(items: Vec<Value>, per_page: usize, page: usize) -> Vec<Value> {
    items
        .into_iter()
        .skip(per_page * (page - 1))
        .take(per_page)
        .collect()
}

#[async_trait]
impl Transport for FakeGitHub {
    async fn get(&self, route: &str) -> Result<RawResponse, ApiError> {
        Ok(self.respond(route))
    }
}

pub fn api_config() -> ApiConfig {
    ApiConfig {
        base_url: "http://fake.invalid".to_string(),
        token: None,
        per_page: PER_PAGE,
        max_pages: 100,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(10),
        },
    }
}

pub fn client(fake: &FakeGitHub) -> GitHubClient<FakeGitHub> {
    GitHubClient::with_transport(fake.clone(), api_config())
}

pub fn collector(fake: &FakeGitHub, data_dir: &Path) -> Collector<FakeGitHub> {
    collector_with(fake, data_dir, EventIdentity::RemoteId)
}

pub fn collector_with(
    fake: &FakeGitHub,
    data_dir: &Path,
    identity: EventIdentity,
) -> Collector<FakeGitHub> {
    Collector::new(client(fake), DatasetStore::new(data_dir), identity)
}
