use crate::types::{Dataset, EventType, PullRequest, TimelineEvent};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Parameters shared by all metric functions.
#[derive(Clone, Copy, Debug)]
pub struct MetricParams {
    /// How many days of history the flow series covers.
    pub days_to_display: Duration,
    /// Size of the rolling window for the flow series.
    pub window_size: Duration,
}

impl Default for MetricParams {
    fn default() -> Self {
        Self {
            days_to_display: Duration::days(30),
            window_size: Duration::days(30),
        }
    }
}

/// A metric is a pure function of the dataset. `None` means "not enough data".
pub type MetricFn = fn(&Dataset, &MetricParams) -> Option<Value>;

/// One computed metric.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricReport {
    pub name: String,
    pub value: Option<Value>,
}

/// Named metric functions, in registration order.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    entries: Vec<(&'static str, MetricFn)>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The metrics served by the dashboard.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("flow", flow_metric);
        registry.register("merge_time", merge_time);
        registry.register("review_turnaround", review_turnaround);
        registry.register("approval_time", approval_time);
        registry.register("review_coverage", review_coverage);
        registry.register("review_funnel", review_funnel);
        registry.register("contribution", contribution);
        registry.register("bot_activity", bot_activity);
        registry
    }

    /// Adds a metric. A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, name: &'static str, metric: MetricFn) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = metric,
            None => self.entries.push((name, metric)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    pub fn compute(&self, name: &str, dataset: &Dataset, params: &MetricParams) -> Option<MetricReport> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(name, metric)| MetricReport {
                name: name.to_string(),
                value: metric(dataset, params),
            })
    }

    pub fn compute_all(&self, dataset: &Dataset, params: &MetricParams) -> Vec<MetricReport> {
        self.entries
            .iter()
            .map(|(name, metric)| MetricReport {
                name: name.to_string(),
                value: metric(dataset, params),
            })
            .collect()
    }
}

/// One day of the flow series. Counts cover the window that ends with that day.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FlowPoint {
    pub date: NaiveDate,
    pub opened: usize,
    pub merged: usize,
    /// Closed without being merged.
    pub abandoned: usize,
    /// Open at the end of the day, regardless of the window.
    pub open: usize,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FlowSummary {
    pub opened: usize,
    pub merged: usize,
    pub abandoned: usize,
    pub open: usize,
    /// Percentage of the PRs resolved in the last window that were merged.
    pub merge_rate: Option<f64>,
    /// More PRs open on the last day than on the first.
    pub backlog_growing: bool,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FlowReport {
    pub summary: FlowSummary,
    pub series: Vec<FlowPoint>,
}

/// Daily flow counts from `days_to_display` days before `last_day` up to it.
pub fn flow_series(prs: &[PullRequest], last_day: NaiveDate, params: &MetricParams) -> Vec<FlowPoint> {
    let first_day = last_day - params.days_to_display;
    first_day
        .iter_days()
        .take_while(|day| *day <= last_day)
        .filter_map(|day| flow_point(prs, day, params.window_size))
        .collect()
}

fn flow_point(prs: &[PullRequest], day: NaiveDate, window: Duration) -> Option<FlowPoint> {
    let end = day.succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
    let start = end - window;
    let within = |t: Option<DateTime<Utc>>| t.is_some_and(|t| t >= start && t < end);

    let opened = prs.iter().filter(|pr| within(Some(pr.created_at))).count();
    let merged = prs.iter().filter(|pr| within(pr.merged_at)).count();
    let abandoned = prs
        .iter()
        .filter(|pr| pr.merged_at.is_none() && within(pr.closed_at))
        .count();
    let open = prs
        .iter()
        .filter(|pr| {
            let resolved_at = pr.closed_at.or(pr.merged_at);
            pr.created_at < end && resolved_at.map_or(true, |t| t >= end)
        })
        .count();

    Some(FlowPoint {
        date: day,
        opened,
        merged,
        abandoned,
        open,
    })
}

pub fn summarize_flow(series: &[FlowPoint]) -> Option<FlowSummary> {
    let first = series.first()?;
    let last = series.last()?;
    let resolved = last.merged + last.abandoned;

    Some(FlowSummary {
        opened: last.opened,
        merged: last.merged,
        abandoned: last.abandoned,
        open: last.open,
        merge_rate: (resolved > 0).then(|| round1(last.merged as f64 / resolved as f64 * 100.0)),
        backlog_growing: last.open > first.open,
    })
}

/// Opened, merged and abandoned PRs per rolling window. The series ends on
/// the day of the latest activity in the dataset, not today.
fn flow_metric(dataset: &Dataset, params: &MetricParams) -> Option<Value> {
    let latest = dataset
        .pull_requests
        .iter()
        .map(|pr| pr.updated_at)
        .chain(dataset.events.iter().map(|e| e.time))
        .max()?;

    let series = flow_series(&dataset.pull_requests, latest.date_naive(), params);
    let summary = summarize_flow(&series)?;
    serde_json::to_value(FlowReport { summary, series }).ok()
}

/// Quartiles and median of a set of durations in hours.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct DurationStats {
    pub count: usize,
    pub median_hours: f64,
    pub p25_hours: f64,
    pub p75_hours: f64,
}

impl DurationStats {
    pub fn from_hours(mut hours: Vec<f64>) -> Option<Self> {
        if hours.is_empty() {
            return None;
        }
        hours.sort_by(|a, b| a.total_cmp(b));
        Some(Self {
            count: hours.len(),
            median_hours: percentile(&hours, 50.0),
            p25_hours: percentile(&hours, 25.0),
            p75_hours: percentile(&hours, 75.0),
        })
    }
}

/// Linear-interpolated percentile of sorted, non-empty data.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

/// Earliest event of `event_type` per PR.
fn first_by_pr(events: &[TimelineEvent], matches: impl Fn(&TimelineEvent) -> bool) -> BTreeMap<u64, DateTime<Utc>> {
    let mut first: BTreeMap<u64, DateTime<Utc>> = BTreeMap::new();
    for event in events.iter().filter(|e| matches(e)) {
        first
            .entry(event.pr_number)
            .and_modify(|t| *t = (*t).min(event.time))
            .or_insert(event.time);
    }
    first
}

fn paired_hours(
    starts: &BTreeMap<u64, DateTime<Utc>>,
    ends: &BTreeMap<u64, DateTime<Utc>>,
) -> Vec<f64> {
    starts
        .iter()
        .filter_map(|(pr, start)| ends.get(pr).map(|end| hours_between(*start, *end)))
        .filter(|hours| *hours >= 0.0)
        .collect()
}

/// Creation to merge.
fn merge_time(dataset: &Dataset, _: &MetricParams) -> Option<Value> {
    let created = first_by_pr(&dataset.events, |e| e.event_type == EventType::PrCreated);
    let merged = first_by_pr(&dataset.events, |e| e.event_type == EventType::PrMerged);
    let stats = DurationStats::from_hours(paired_hours(&created, &merged))?;
    serde_json::to_value(stats).ok()
}

/// Creation to the first review request.
fn review_turnaround(dataset: &Dataset, _: &MetricParams) -> Option<Value> {
    let created = first_by_pr(&dataset.events, |e| e.event_type == EventType::PrCreated);
    let requested = first_by_pr(&dataset.events, |e| e.event_type == EventType::ReviewRequested);
    let stats = DurationStats::from_hours(paired_hours(&created, &requested))?;
    serde_json::to_value(stats).ok()
}

/// First review request to the first approval.
fn approval_time(dataset: &Dataset, _: &MetricParams) -> Option<Value> {
    let requested = first_by_pr(&dataset.events, |e| e.event_type == EventType::ReviewRequested);
    let approved = first_by_pr(&dataset.events, |e| e.event_type == EventType::ReviewApproved);
    let stats = DurationStats::from_hours(paired_hours(&requested, &approved))?;
    serde_json::to_value(stats).ok()
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ReviewCoverage {
    pub total_prs: usize,
    pub reviewed_prs: usize,
    pub unreviewed_prs: usize,
    pub review_percentage: f64,
}

/// Share of PRs that received at least one review.
fn review_coverage(dataset: &Dataset, _: &MetricParams) -> Option<Value> {
    let mut reviewed: HashMap<u64, bool> = HashMap::new();
    for event in &dataset.events {
        let entry = reviewed.entry(event.pr_number).or_insert(false);
        *entry |= event.event_type.is_review();
    }
    if reviewed.is_empty() {
        return None;
    }

    let total_prs = reviewed.len();
    let reviewed_prs = reviewed.values().filter(|r| **r).count();
    serde_json::to_value(ReviewCoverage {
        total_prs,
        reviewed_prs,
        unreviewed_prs: total_prs - reviewed_prs,
        review_percentage: round1(reviewed_prs as f64 / total_prs as f64 * 100.0),
    })
    .ok()
}

/// How far PRs get through review. PRs are counted once per bucket.
#[derive(Debug, Serialize, Clone, PartialEq, Default)]
pub struct ReviewFunnel {
    pub total_prs: usize,
    pub review_requested: usize,
    /// Requested and then reviewed in any way.
    pub review_completed: usize,
    /// Requested and approved.
    pub review_approved: usize,
    pub approved_without_review_request: usize,
    pub merged_without_review: usize,
    /// Reviewed in any way, requested or not.
    pub reviewed_prs: usize,
    /// Approved, requested or not.
    pub approved_prs: usize,
}

fn review_funnel(dataset: &Dataset, _: &MetricParams) -> Option<Value> {
    let mut kinds: HashMap<u64, HashSet<EventType>> = HashMap::new();
    for event in &dataset.events {
        kinds.entry(event.pr_number).or_default().insert(event.event_type);
    }
    if kinds.is_empty() {
        return None;
    }

    let mut funnel = ReviewFunnel {
        total_prs: kinds.len(),
        ..ReviewFunnel::default()
    };
    for seen in kinds.values() {
        let requested = seen.contains(&EventType::ReviewRequested);
        let reviewed = seen.iter().any(EventType::is_review);
        let approved = seen.contains(&EventType::ReviewApproved);

        funnel.review_requested += usize::from(requested);
        funnel.review_completed += usize::from(requested && reviewed);
        funnel.review_approved += usize::from(requested && approved);
        funnel.approved_without_review_request += usize::from(approved && !requested);
        funnel.merged_without_review += usize::from(seen.contains(&EventType::PrMerged) && !reviewed);
        funnel.reviewed_prs += usize::from(reviewed);
        funnel.approved_prs += usize::from(approved);
    }

    serde_json::to_value(funnel).ok()
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn created_events(events: &[TimelineEvent]) -> Vec<&TimelineEvent> {
    let mut by_pr: BTreeMap<u64, &TimelineEvent> = BTreeMap::new();
    for event in events.iter().filter(|e| e.event_type == EventType::PrCreated) {
        by_pr.entry(event.pr_number).or_insert(event);
    }
    by_pr.into_values().collect()
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ContributionStats {
    pub total_prs: usize,
    pub core_prs: usize,
    pub community_prs: usize,
    pub bot_prs: usize,
    pub core_percentage: f64,
    pub community_percentage: f64,
    pub bot_percentage: f64,
}

/// Who opens PRs: core team, community or bots.
fn contribution(dataset: &Dataset, _: &MetricParams) -> Option<Value> {
    let created = created_events(&dataset.events);
    if created.is_empty() {
        return None;
    }

    let total_prs = created.len();
    let bot_prs = created.iter().filter(|e| e.is_bot).count();
    let core_prs = created.iter().filter(|e| !e.is_bot && e.is_core_team).count();
    let community_prs = total_prs - bot_prs - core_prs;
    let pct = |n: usize| round1(n as f64 / total_prs as f64 * 100.0);

    serde_json::to_value(ContributionStats {
        total_prs,
        core_prs,
        community_prs,
        bot_prs,
        core_percentage: pct(core_prs),
        community_percentage: pct(community_prs),
        bot_percentage: pct(bot_prs),
    })
    .ok()
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct BotActivity {
    pub total_prs: usize,
    pub bot_prs: usize,
    pub human_prs: usize,
    pub bot_percentage: f64,
    /// PRs per bot account, most active first.
    pub bot_breakdown: Vec<BotCount>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct BotCount {
    pub actor: String,
    pub pr_count: usize,
}

fn bot_activity(dataset: &Dataset, _: &MetricParams) -> Option<Value> {
    let created: Vec<&TimelineEvent> = created_events(&dataset.events)
        .into_iter()
        .filter(|e| e.actor.is_some())
        .collect();
    if created.is_empty() {
        return None;
    }

    let mut per_bot: BTreeMap<&str, usize> = BTreeMap::new();
    for event in created.iter().filter(|e| e.is_bot) {
        if let Some(actor) = event.actor.as_deref() {
            *per_bot.entry(actor).or_default() += 1;
        }
    }
    let mut bot_breakdown: Vec<BotCount> = per_bot
        .into_iter()
        .map(|(actor, pr_count)| BotCount {
            actor: actor.to_string(),
            pr_count,
        })
        .collect();
    bot_breakdown.sort_by(|a, b| b.pr_count.cmp(&a.pr_count));

    let total_prs = created.len();
    let bot_prs = created.iter().filter(|e| e.is_bot).count();
    serde_json::to_value(BotActivity {
        total_prs,
        bot_prs,
        human_prs: total_prs - bot_prs,
        bot_percentage: round1(bot_prs as f64 / total_prs as f64 * 100.0),
        bot_breakdown,
    })
    .ok()
}
