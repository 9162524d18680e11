mod common;

use collabflow::collector::EventIdentity;
use collabflow::error::{ApiError, CollectError, StoreError};
use collabflow::store::DatasetStore;
use collabflow::transport::RateLimitHeaders;
use collabflow::types::{EventType, PrState};
use common::{collector, collector_with, labeled, repo, status, ts, FakeGitHub, FakePr};
use std::fs;

fn numbers(store: &DatasetStore) -> Vec<u64> {
    store
        .load_pull_requests(&repo())
        .unwrap()
        .iter()
        .map(|pr| pr.pr_number)
        .collect()
}

#[tokio::test]
async fn test_first_run_writes_all_tables() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=3).map(|n| FakePr::new(n, ts(n as i64 * 10))));
    let collector = collector(&fake, dir.path());

    let summary = collector.collect(&repo(), 10).await.unwrap();

    assert_eq!(summary.new_prs, 3);
    assert_eq!(summary.updated_prs, 0);
    assert_eq!(summary.total_prs, 3);
    assert_eq!(summary.total_events, 9);

    let store = collector.store();
    assert_eq!(numbers(store), vec![1, 2, 3]);

    let repository = store.load_repository(&repo()).unwrap().unwrap();
    assert_eq!(repository.repository_slug, "acme/widgets");
    assert_eq!(repository.organization, "acme");
    assert_eq!(repository.stars, 42);

    let pr = &store.load_pull_requests(&repo()).unwrap()[0];
    assert_eq!(pr.head_branch, "feature-1");
    assert_eq!(pr.files_changed, 3);
    assert_eq!(pr.labels.0, vec!["enhancement".to_string()]);

    for n in 1..=3 {
        let events = store.load_pr_events(&repo(), n).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, EventType::PrCreated);
        assert!(events.windows(2).all(|w| w[0].time <= w[1].time));
    }

    let all_events = store.load_all_events(&repo()).unwrap();
    let order: Vec<u64> = all_events.iter().map(|e| e.pr_number).collect();
    assert_eq!(order, vec![1, 1, 1, 2, 2, 2, 3, 3, 3]);

    assert_eq!(store.list_repositories().unwrap(), vec![repo()]);
}

#[tokio::test]
async fn test_second_run_without_changes_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=5).map(|n| FakePr::new(n, ts(n as i64))));
    let collector = collector(&fake, dir.path());
    let store = collector.store();

    collector.collect(&repo(), 10).await.unwrap();
    let prs_before = fs::read(store.pull_requests_path(&repo())).unwrap();
    let events_before = fs::read(store.all_events_path(&repo())).unwrap();
    fake.clear_requests();

    let summary = collector.collect(&repo(), 10).await.unwrap();

    assert_eq!(summary.new_prs, 0);
    assert_eq!(summary.updated_prs, 0);
    assert_eq!(summary.events_appended, 0);
    assert_eq!(fs::read(store.pull_requests_path(&repo())).unwrap(), prs_before);
    assert_eq!(fs::read(store.all_events_path(&repo())).unwrap(), events_before);
    assert!(!fake.requests().iter().any(|r| r.contains("/pulls/")));
}

#[tokio::test]
async fn test_updated_pr_is_merged_into_existing_tables() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=3).map(|n| FakePr::new(n, ts(n as i64))));
    let collector = collector(&fake, dir.path());
    collector.collect(&repo(), 10).await.unwrap();

    fake.update_pr(2, |pr| {
        pr.updated_at = ts(500);
        pr.merged_at = Some(ts(500));
        pr.closed_at = Some(ts(500));
        pr.timeline
            .push(common::issue_event("merged", 9001, ts(500), "maintainer"));
    });

    let summary = collector.collect(&repo(), 10).await.unwrap();
    assert_eq!(summary.new_prs, 0);
    assert_eq!(summary.updated_prs, 1);
    assert_eq!(summary.events_appended, 1);

    let store = collector.store();
    let prs = store.load_pull_requests(&repo()).unwrap();
    assert_eq!(prs.len(), 3);
    assert_eq!(prs[1].pr_number, 2);
    assert_eq!(prs[1].state, PrState::Merged);
    assert_eq!(prs[1].merged_at, Some(ts(500)));

    let events = store.load_pr_events(&repo(), 2).unwrap();
    assert_eq!(events.len(), 4);
    assert_eq!(events.last().unwrap().event_type, EventType::PrMerged);
    assert_eq!(events.last().unwrap().actor.as_deref(), Some("maintainer"));

    assert_eq!(store.load_all_events(&repo()).unwrap().len(), 10);
}

#[tokio::test]
async fn test_limit_grows_dataset_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=20).map(|n| FakePr::new(n, ts(n as i64))));
    let collector = collector(&fake, dir.path());
    let store = collector.store();

    let first = collector.collect(&repo(), 10).await.unwrap();
    assert_eq!(first.new_prs, 10);
    assert_eq!(numbers(store), (1..=10).collect::<Vec<_>>());

    let second = collector.collect(&repo(), 15).await.unwrap();
    assert_eq!(second.new_prs, 5);
    assert_eq!(numbers(store), (1..=15).collect::<Vec<_>>());
    assert_eq!(store.load_all_events(&repo()).unwrap().len(), 45);

    let third = collector.collect(&repo(), 15).await.unwrap();
    assert_eq!(third.new_prs, 0);
    assert_eq!(numbers(store).len(), 15);
}

#[tokio::test]
async fn test_prs_sharing_the_cursor_instant_are_not_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=3).map(|n| FakePr::new(n, ts(60))));
    let collector = collector(&fake, dir.path());
    let store = collector.store();

    collector.collect(&repo(), 2).await.unwrap();
    assert_eq!(numbers(store), vec![1, 2]);

    let summary = collector.collect(&repo(), 3).await.unwrap();
    assert_eq!(summary.new_prs, 1);
    assert_eq!(numbers(store), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_pr_updated_during_the_run_does_not_hide_later_prs() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=4).map(|n| FakePr::new(n, ts(n as i64 * 10))));
    // PR 1 jumps to the end of the listing while page one is still being processed.
    fake.touch_on_request("/issues/1/timeline", 1, ts(1000));
    let collector = collector(&fake, dir.path());
    let store = collector.store();

    let summary = collector.collect(&repo(), 10).await.unwrap();

    assert_eq!(numbers(store), vec![1, 2, 3, 4]);
    assert_eq!(summary.new_prs, 4);
    assert_eq!(summary.updated_prs, 1);
    let prs = store.load_pull_requests(&repo()).unwrap();
    assert_eq!(prs[0].updated_at, ts(1000));

    let rerun = collector.collect(&repo(), 10).await.unwrap();
    assert_eq!(rerun.new_prs, 0);
    assert_eq!(rerun.updated_prs, 0);
}

#[tokio::test]
async fn test_listing_restarts_from_the_last_update_seen() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=5).map(|n| FakePr::new(n, ts(n as i64 * 10))));
    let collector = collector(&fake, dir.path());

    collector.collect(&repo(), 10).await.unwrap();

    let listings: Vec<String> = fake
        .requests()
        .into_iter()
        .filter(|r| r.contains("/widgets/issues?"))
        .collect();
    // The PR at `since` comes back first on every restart, so each page of
    // two brings one new PR.
    assert_eq!(listings.len(), 5);
    assert!(!listings[0].contains("since="));
    for (listing, minute) in listings[1..].iter().zip([20, 30, 40, 50]) {
        assert!(listing.contains(&format!("since=2024-01-01T00:{minute}:00Z")));
    }
    assert!(listings.iter().all(|r| r.ends_with("&page=1")));
}

#[tokio::test]
async fn test_composite_identity_keeps_labels_added_together() {
    let dir = tempfile::tempdir().unwrap();
    let mut pr = FakePr::new(1, ts(30));
    pr.timeline.push(labeled(501, ts(20), "triager", "bug"));
    pr.timeline.push(labeled(502, ts(20), "triager", "ui"));
    let fake = FakeGitHub::with_prs([pr]);
    let collector = collector_with(&fake, dir.path(), EventIdentity::Composite);
    let store = collector.store();

    let summary = collector.collect(&repo(), 10).await.unwrap();

    assert_eq!(summary.events_appended, 5);
    let events = store.load_pr_events(&repo(), 1).unwrap();
    let labels: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == EventType::Labeled)
        .filter_map(|e| e.label.as_deref())
        .collect();
    assert_eq!(labels, vec!["bug", "ui"]);

    // Touch the PR so the rerun refetches its timeline.
    fake.update_pr(1, |pr| pr.updated_at = ts(40));
    let events_before = fs::read(store.all_events_path(&repo())).unwrap();

    let rerun = collector.collect(&repo(), 10).await.unwrap();

    assert_eq!(rerun.updated_prs, 1);
    assert_eq!(rerun.events_appended, 0);
    assert_eq!(fs::read(store.all_events_path(&repo())).unwrap(), events_before);
}

#[tokio::test]
async fn test_plain_issues_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs([FakePr::new(1, ts(10)), FakePr::new(3, ts(30))]);
    fake.add_plain_issue(2, ts(20));
    let collector = collector(&fake, dir.path());

    let summary = collector.collect(&repo(), 10).await.unwrap();

    assert_eq!(summary.new_prs, 2);
    assert_eq!(numbers(collector.store()), vec![1, 3]);
    assert!(!fake.requests().iter().any(|r| r.ends_with("/pulls/2")));
}

#[tokio::test]
async fn test_missing_repository_aborts_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs([FakePr::new(1, ts(1))]);
    fake.remove_repository();
    let collector = collector(&fake, dir.path());

    let err = collector.collect(&repo(), 10).await.unwrap_err();

    assert!(matches!(
        err,
        CollectError::Api {
            source: ApiError::NotFound { .. },
            ..
        }
    ));
    assert_eq!(err.repo(), &repo());
    assert!(err.to_string().starts_with("NotFound while collecting acme/widgets"));
    assert!(!collector.store().repo_dir(&repo()).exists());
}

#[tokio::test]
async fn test_auth_failure_keeps_flushed_prs() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=3).map(|n| FakePr::new(n, ts(n as i64))));
    let collector = collector(&fake, dir.path());
    collector.collect(&repo(), 10).await.unwrap();
    let store = collector.store();
    let events_before = fs::read(store.all_events_path(&repo())).unwrap();

    fake.add_pr(FakePr::new(4, ts(100)));
    fake.add_pr(FakePr::new(5, ts(200)));
    fake.fail_always("/pulls/5", status(401, "Bad credentials"));

    let err = collector.collect(&repo(), 10).await.unwrap_err();
    assert!(matches!(
        err,
        CollectError::Api {
            source: ApiError::Auth { .. },
            ..
        }
    ));
    assert_eq!(
        fake.requests().iter().filter(|r| r.ends_with("/pulls/5")).count(),
        1
    );

    // PR 4 was flushed before the failure; the consolidated table was not rebuilt.
    assert_eq!(numbers(store), vec![1, 2, 3, 4]);
    assert!(store.has_pr_events(&repo(), 4));
    assert_eq!(fs::read(store.all_events_path(&repo())).unwrap(), events_before);

    fake.clear_failures();
    let summary = collector.collect(&repo(), 10).await.unwrap();
    assert_eq!(summary.new_prs, 1);
    assert_eq!(numbers(store), vec![1, 2, 3, 4, 5]);
    assert_eq!(store.load_all_events(&repo()).unwrap().len(), 15);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs([FakePr::new(1, ts(1))]);
    fake.fail_once("/issues/1/timeline", status(502, "Bad Gateway"));
    fake.fail_once("/issues/1/timeline", status(503, "Unavailable"));
    let collector = collector(&fake, dir.path());

    let summary = collector.collect(&repo(), 10).await.unwrap();

    assert_eq!(summary.total_events, 3);
    assert_eq!(
        fake.requests()
            .iter()
            .filter(|r| r.contains("/issues/1/timeline"))
            .count(),
        4
    );
}

#[tokio::test]
async fn test_persistent_server_errors_exhaust_retries() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs([FakePr::new(1, ts(1))]);
    fake.fail_always("/issues/1/timeline", status(500, "boom"));
    let collector = collector(&fake, dir.path());

    let err = collector.collect(&repo(), 10).await.unwrap_err();

    match err {
        CollectError::Api {
            source: ApiError::RetriesExhausted { attempts, last },
            ..
        } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, ApiError::TransientNetwork { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The PR row is only written after its events.
    assert!(numbers(collector.store()).is_empty());
}

#[tokio::test]
async fn test_corrupt_local_table_aborts_without_overwriting() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs([FakePr::new(1, ts(1))]);
    let collector = collector(&fake, dir.path());
    let path = collector.store().pull_requests_path(&repo());
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "number,name\n1,oops\n").unwrap();

    let err = collector.collect(&repo(), 10).await.unwrap_err();

    assert!(matches!(
        err,
        CollectError::Store {
            source: StoreError::CorruptLocalData { .. },
            ..
        }
    ));
    assert!(err.to_string().starts_with("CorruptLocalData"));
    assert_eq!(fs::read_to_string(&path).unwrap(), "number,name\n1,oops\n");
}

#[tokio::test]
async fn test_missing_event_tables_are_backfilled() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs((1..=3).map(|n| FakePr::new(n, ts(n as i64))));
    let collector = collector(&fake, dir.path());
    collector.collect(&repo(), 10).await.unwrap();
    let store = collector.store();

    fs::remove_dir_all(store.pr_events_path(&repo(), 2).parent().unwrap()).unwrap();

    let summary = collector.collect(&repo(), 10).await.unwrap();

    assert_eq!(summary.backfilled_prs, 1);
    assert_eq!(summary.events_appended, 3);
    assert_eq!(store.load_pr_events(&repo(), 2).unwrap().len(), 3);
    assert_eq!(store.load_all_events(&repo()).unwrap().len(), 9);
}

#[tokio::test]
async fn test_orphan_event_tables_stay_out_of_consolidation() {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeGitHub::with_prs([FakePr::new(1, ts(1))]);
    let collector = collector(&fake, dir.path());
    collector.collect(&repo(), 10).await.unwrap();
    let store = collector.store();

    let mut orphan = store.load_pr_events(&repo(), 1).unwrap();
    for event in &mut orphan {
        event.pr_number = 77;
    }
    store.save_pr_events(&repo(), 77, &orphan).unwrap();

    collector.collect(&repo(), 10).await.unwrap();

    let all_events = store.load_all_events(&repo()).unwrap();
    assert_eq!(all_events.len(), 3);
    assert!(all_events.iter().all(|e| e.pr_number == 1));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_for_retry_after() {
    let fake = FakeGitHub::new();
    let mut limited = status(429, "secondary rate limit");
    limited.rate_limit.retry_after = Some(60);
    fake.fail_once("/repos/acme/widgets", limited);
    let client = common::client(&fake);

    let started = tokio::time::Instant::now();
    let repository = client.fetch_repository(&repo()).await.unwrap();

    assert_eq!(repository.name, "widgets");
    assert!(started.elapsed() >= std::time::Duration::from_secs(60));
    assert_eq!(fake.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_quota_delays_next_request() {
    let fake = FakeGitHub::new();
    let reset = chrono::Utc::now().timestamp() + 120;
    fake.set_next_headers(RateLimitHeaders {
        remaining: Some(0),
        reset_epoch: Some(reset),
        retry_after: None,
    });
    let client = common::client(&fake);

    client.fetch_repository(&repo()).await.unwrap();
    let started = tokio::time::Instant::now();
    client.fetch_repository(&repo()).await.unwrap();

    assert!(started.elapsed() >= std::time::Duration::from_secs(119));
}

#[tokio::test(start_paused = true)]
async fn test_quota_exhausted_403_is_retried_not_fatal() {
    let fake = FakeGitHub::new();
    let mut limited = status(403, "API rate limit exceeded for user");
    limited.rate_limit.remaining = Some(0);
    fake.fail_once("/repos/acme/widgets", limited);
    let client = common::client(&fake);

    let started = tokio::time::Instant::now();
    client.fetch_repository(&repo()).await.unwrap();

    // No reset header: falls back to a one minute wait.
    assert!(started.elapsed() >= std::time::Duration::from_secs(60));
}
