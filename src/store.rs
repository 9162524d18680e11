//! On-disk dataset layout and merge primitives.
//!
//! ```text
//! {data_dir}/{owner}/{repo}/repository.csv
//! {data_dir}/{owner}/{repo}/pull_requests.csv
//! {data_dir}/{owner}/{repo}/all_events.csv
//! {data_dir}/{owner}/{repo}/pr_{number}/events.csv
//! ```
//!
//! Every write goes through [`write_table`], which writes a temp file next to
//! the target and renames it into place, so readers see either the previous
//! complete table or the new one.

use crate::config::RepoId;
use crate::error::StoreError;
use crate::types::{Dataset, PullRequest, Record, Repository, TimelineEvent};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::hash::Hash;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const REPOSITORY_FILE: &str = "repository.csv";
const PULL_REQUESTS_FILE: &str = "pull_requests.csv";
const ALL_EVENTS_FILE: &str = "all_events.csv";
const EVENTS_FILE: &str = "events.csv";
const PR_DIR_PREFIX: &str = "pr_";

/// Reads a table. A missing file is an empty table, not an error.
pub fn load_table<R: Record>(path: &Path) -> Result<Vec<R>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut reader = csv::Reader::from_reader(io::BufReader::new(file));
    let headers = reader
        .headers()
        .map_err(|e| StoreError::corrupt(path, e))?
        .clone();

    if headers.is_empty() {
        return Ok(Vec::new());
    }
    if headers.iter().ne(R::COLUMNS.iter().copied()) {
        return Err(StoreError::corrupt(
            path,
            format!(
                "unexpected columns [{}], expected [{}]",
                headers.iter().collect::<Vec<_>>().join(","),
                R::COLUMNS.join(",")
            ),
        ));
    }

    reader
        .deserialize()
        .collect::<Result<Vec<R>, _>>()
        .map_err(|e| StoreError::corrupt(path, e))
}

/// Writes a table atomically: temp file in the same directory, fsync, rename.
///
/// The header row is always written, so an empty table is still a valid file.
pub fn write_table<R: Record>(path: &Path, rows: &[R]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::corrupt(path, "table path has no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(io::BufWriter::new(temp.as_file_mut()));

        writer
            .write_record(R::COLUMNS)
            .map_err(|e| csv_write_error(path, e))?;
        for row in rows {
            writer.serialize(row).map_err(|e| csv_write_error(path, e))?;
        }
        let mut buffered = writer
            .into_inner()
            .map_err(|e| StoreError::io(path, e.into_error()))?;
        buffered.flush().map_err(|e| StoreError::io(path, e))?;
    }

    temp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(path, e))?;
    temp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;

    tracing::debug!(path = %path.display(), rows = rows.len(), "Table written");
    Ok(())
}

fn csv_write_error(path: &Path, err: csv::Error) -> StoreError {
    if err.is_io_error() {
        match err.into_kind() {
            csv::ErrorKind::Io(io_err) => StoreError::io(path, io_err),
            other => StoreError::corrupt(path, format!("{other:?}")),
        }
    } else {
        StoreError::corrupt(path, err)
    }
}

/// Update-or-insert by key. Rows in `new_rows` replace existing rows with the
/// same key; the result is sorted by key ascending.
pub fn merge_upsert<R, K, F>(existing_rows: Vec<R>, new_rows: Vec<R>, key_fn: F) -> Vec<R>
where
    K: Ord,
    F: Fn(&R) -> K,
{
    let mut by_key: BTreeMap<K, R> = BTreeMap::new();
    for row in existing_rows.into_iter().chain(new_rows) {
        by_key.insert(key_fn(&row), row);
    }
    by_key.into_values().collect()
}

/// Appends rows whose identity is not already present. Existing rows keep
/// their order; new rows follow in the order given. Returns the merged rows
/// and the number appended.
pub fn append_dedup<R, K, F>(
    existing_rows: Vec<R>,
    new_rows: Vec<R>,
    identity_fn: F,
) -> (Vec<R>, usize)
where
    K: Eq + Hash,
    F: Fn(&R) -> K,
{
    let mut seen: HashSet<K> = existing_rows.iter().map(&identity_fn).collect();
    let mut merged = existing_rows;
    let before = merged.len();

    for row in new_rows {
        if seen.insert(identity_fn(&row)) {
            merged.push(row);
        }
    }

    let appended = merged.len() - before;
    (merged, appended)
}

/// Typed access to the dataset rooted at `data_dir`.
#[derive(Clone, Debug)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self, repo: &RepoId) -> PathBuf {
        self.root.join(&repo.owner).join(&repo.repo)
    }

    pub fn repository_path(&self, repo: &RepoId) -> PathBuf {
        self.repo_dir(repo).join(REPOSITORY_FILE)
    }

    pub fn pull_requests_path(&self, repo: &RepoId) -> PathBuf {
        self.repo_dir(repo).join(PULL_REQUESTS_FILE)
    }

    pub fn all_events_path(&self, repo: &RepoId) -> PathBuf {
        self.repo_dir(repo).join(ALL_EVENTS_FILE)
    }

    pub fn pr_events_path(&self, repo: &RepoId, pr_number: u64) -> PathBuf {
        self.repo_dir(repo)
            .join(format!("{PR_DIR_PREFIX}{pr_number}"))
            .join(EVENTS_FILE)
    }

    pub fn load_repository(&self, repo: &RepoId) -> Result<Option<Repository>, StoreError> {
        let path = self.repository_path(repo);
        let mut rows = load_table::<Repository>(&path)?;
        if rows.len() > 1 {
            return Err(StoreError::corrupt(
                path,
                format!("expected one row, found {}", rows.len()),
            ));
        }
        Ok(rows.pop())
    }

    pub fn save_repository(&self, repo: &RepoId, repository: &Repository) -> Result<(), StoreError> {
        write_table(&self.repository_path(repo), std::slice::from_ref(repository))
    }

    pub fn load_pull_requests(&self, repo: &RepoId) -> Result<Vec<PullRequest>, StoreError> {
        let path = self.pull_requests_path(repo);
        let rows = load_table::<PullRequest>(&path)?;

        let mut numbers = HashSet::new();
        if let Some(dup) = rows.iter().find(|pr| !numbers.insert(pr.pr_number)) {
            return Err(StoreError::corrupt(
                path,
                format!("duplicate pr_number {}", dup.pr_number),
            ));
        }
        Ok(rows)
    }

    pub fn save_pull_requests(
        &self,
        repo: &RepoId,
        pull_requests: &[PullRequest],
    ) -> Result<(), StoreError> {
        write_table(&self.pull_requests_path(repo), pull_requests)
    }

    pub fn has_pr_events(&self, repo: &RepoId, pr_number: u64) -> bool {
        self.pr_events_path(repo, pr_number).is_file()
    }

    pub fn load_pr_events(
        &self,
        repo: &RepoId,
        pr_number: u64,
    ) -> Result<Vec<TimelineEvent>, StoreError> {
        let path = self.pr_events_path(repo, pr_number);
        let events = load_table::<TimelineEvent>(&path)?;
        if let Some(stray) = events.iter().find(|e| e.pr_number != pr_number) {
            return Err(StoreError::corrupt(
                path,
                format!("event {} belongs to PR {}", stray.event_id, stray.pr_number),
            ));
        }
        Ok(events)
    }

    pub fn save_pr_events(
        &self,
        repo: &RepoId,
        pr_number: u64,
        events: &[TimelineEvent],
    ) -> Result<(), StoreError> {
        write_table(&self.pr_events_path(repo, pr_number), events)
    }

    pub fn load_all_events(&self, repo: &RepoId) -> Result<Vec<TimelineEvent>, StoreError> {
        load_table(&self.all_events_path(repo))
    }

    /// PR numbers that have a `pr_{n}` directory, ascending.
    pub fn pr_directories(&self, repo: &RepoId) -> Result<Vec<u64>, StoreError> {
        let dir = self.repo_dir(repo);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut numbers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(number) = name
                .to_str()
                .and_then(|n| n.strip_prefix(PR_DIR_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            {
                numbers.push(number);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Rewrites `all_events.csv` as the concatenation of every per-PR table
    /// whose PR is in `pull_requests`, ascending by PR number.
    ///
    /// Directories for PRs missing from the table (left by a run that died
    /// between the two flushes) are skipped until a later run adds the row.
    pub fn rebuild_all_events(
        &self,
        repo: &RepoId,
        pull_requests: &[PullRequest],
    ) -> Result<usize, StoreError> {
        let known: HashSet<u64> = pull_requests.iter().map(|pr| pr.pr_number).collect();
        let mut all_events = Vec::new();

        for number in self.pr_directories(repo)? {
            if !known.contains(&number) {
                tracing::warn!(repo = %repo, pr_number = number, "Skipping events of PR missing from pull_requests.csv");
                continue;
            }
            all_events.extend(self.load_pr_events(repo, number)?);
        }

        write_table(&self.all_events_path(repo), &all_events)?;
        Ok(all_events.len())
    }

    /// Every `owner/repo` under the root with a completed collection run.
    pub fn list_repositories(&self) -> Result<Vec<RepoId>, StoreError> {
        let mut repos = Vec::new();
        for owner in read_subdirs(&self.root)? {
            for repo in read_subdirs(&self.root.join(&owner))? {
                let id = RepoId::new(owner.clone(), repo);
                if self.repository_path(&id).is_file() {
                    repos.push(id);
                }
            }
        }
        repos.sort();
        Ok(repos)
    }

    /// Loads everything the metrics layer needs for one repository.
    pub fn load_dataset(&self, repo: &RepoId) -> Result<Dataset, StoreError> {
        Ok(Dataset {
            repository: self.load_repository(repo)?,
            pull_requests: self.load_pull_requests(repo)?,
            events: self.load_all_events(repo)?,
        })
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}
