//! Rating Store
//!
//! Persistent per-user scores consulted at match end.
//!
//! The flat-file format is one `username:score` pair per line.
//! Unknown users score [`DEFAULT_RATING`]; scores never drop below zero.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Score of a user with no record.
pub const DEFAULT_RATING: u32 = 1000;

/// Rating store errors.
#[derive(Debug, thiserror::Error)]
pub enum RatingError {
    /// Reading or writing the backing file failed.
    #[error("Rating file I/O failed for {path}: {source}")]
    Io {
        /// Backing file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Score storage used by match sessions.
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Current score, [`DEFAULT_RATING`] if unknown.
    fn score(&self, name: &str) -> u32;

    /// Apply `delta`, clamp at zero, persist, and return the new score.
    async fn update_score(&self, name: &str, delta: i32) -> Result<u32, RatingError>;

    /// All known scores, highest first, ties by name.
    fn rankings(&self) -> Vec<(String, u32)>;
}

fn apply_delta(scores: &mut BTreeMap<String, u32>, name: &str, delta: i32) -> u32 {
    let current = scores.get(name).copied().unwrap_or(DEFAULT_RATING);
    let updated = (i64::from(current) + i64::from(delta)).clamp(0, i64::from(u32::MAX)) as u32;
    scores.insert(name.to_string(), updated);
    updated
}

fn sorted(scores: &BTreeMap<String, u32>) -> Vec<(String, u32)> {
    // BTreeMap iterates by name, so a stable sort on score keeps name order for ties
    let mut ranked: Vec<(String, u32)> = scores.iter().map(|(n, s)| (n.clone(), *s)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

fn lock(scores: &Mutex<BTreeMap<String, u32>>) -> MutexGuard<'_, BTreeMap<String, u32>> {
    scores.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// FILE STORE
// =============================================================================

/// Rating store backed by a flat text file, rewritten on every update.
///
/// Scores live in memory; the file is written with `tokio::fs`, one writer
/// at a time, each write a snapshot taken under the write lock.
pub struct FileRatingStore {
    path: PathBuf,
    scores: Mutex<BTreeMap<String, u32>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileRatingStore {
    /// Load scores from `path`, creating an empty file if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RatingError> {
        let path = path.as_ref().to_path_buf();

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("Creating rating file {}", path.display());
                fs::write(&path, "").map_err(|source| RatingError::Io { path: path.clone(), source })?;
                String::new()
            }
            Err(source) => return Err(RatingError::Io { path, source }),
        };

        let scores = parse_scores(&contents);
        debug!("Loaded {} ratings from {}", scores.len(), path.display());

        Ok(Self {
            path,
            scores: Mutex::new(scores),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, body: String) -> Result<(), RatingError> {
        tokio::fs::write(&self.path, body).await.map_err(|source| RatingError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn render(scores: &BTreeMap<String, u32>) -> String {
    scores
        .iter()
        .map(|(name, score)| format!("{}:{}\n", name, score))
        .collect()
}

fn parse_scores(contents: &str) -> BTreeMap<String, u32> {
    let mut scores = BTreeMap::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = line
            .rsplit_once(':')
            .filter(|(name, _)| !name.is_empty())
            .and_then(|(name, score)| score.trim().parse::<u32>().ok().map(|s| (name, s)));
        match parsed {
            Some((name, score)) => {
                scores.insert(name.to_string(), score);
            }
            None => warn!("Skipping malformed rating line {}: {:?}", number + 1, line),
        }
    }
    scores
}

#[async_trait]
impl RatingStore for FileRatingStore {
    fn score(&self, name: &str) -> u32 {
        lock(&self.scores).get(name).copied().unwrap_or(DEFAULT_RATING)
    }

    async fn update_score(&self, name: &str, delta: i32) -> Result<u32, RatingError> {
        let _writing = self.write_lock.lock().await;
        let (updated, body) = {
            let mut scores = lock(&self.scores);
            let updated = apply_delta(&mut scores, name, delta);
            (updated, render(&scores))
        };
        self.persist(body).await?;
        info!("Rating for {} is now {} ({:+})", name, updated, delta);
        Ok(updated)
    }

    fn rankings(&self) -> Vec<(String, u32)> {
        sorted(&lock(&self.scores))
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Non-persistent rating store.
#[derive(Default)]
pub struct MemoryRatingStore {
    scores: Mutex<BTreeMap<String, u32>>,
}

impl MemoryRatingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RatingStore for MemoryRatingStore {
    fn score(&self, name: &str) -> u32 {
        lock(&self.scores).get(name).copied().unwrap_or(DEFAULT_RATING)
    }

    async fn update_score(&self, name: &str, delta: i32) -> Result<u32, RatingError> {
        Ok(apply_delta(&mut lock(&self.scores), name, delta))
    }

    fn rankings(&self) -> Vec<(String, u32)> {
        sorted(&lock(&self.scores))
    }
}
