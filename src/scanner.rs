use crate::error::{FilterError, Result};
use crate::filter::{FileAddStatus, FileId, IdFilter, IncrementalFilesFilter};
use crate::persistence::FilterState;
use crate::registry::FileIdRegistry;
use globset::{Glob, GlobSet, GlobSetBuilder};
use jwalk::WalkDir as JWalkDir;
use log::{debug, info, warn};
use rayon::prelude::*;
use roaring::RoaringBitmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Configuration for scanning
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// File extensions to admit (empty = all files)
    pub extensions: Vec<String>,

    /// Glob patterns matched against each path component; matches are pruned
    pub exclude_patterns: Vec<String>,

    /// Maximum file size to admit (in bytes)
    pub max_file_size: u64,

    /// Worker threads for admission (0 = rayon default)
    pub threads: usize,
}

impl ScanConfig {
    /// Set the size limit in megabytes, saturating on overflow
    pub fn set_max_size_mb(&mut self, megabytes: u64) {
        self.max_file_size = megabytes.saturating_mul(1024 * 1024);
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: vec![],
            exclude_patterns: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                "target".to_string(),
                ".cache".to_string(),
                "__pycache__".to_string(),
            ],
            max_file_size: 10 * 1024 * 1024, // 10 MB
            threads: 0,
        }
    }
}

/// Compile exclude patterns into a single matcher
pub fn build_exclude_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| FilterError::InvalidPattern(e.to_string()))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| FilterError::InvalidPattern(e.to_string()))
}

/// Walk `root` and return every file outside excluded components, sorted
///
/// Extension and size checks are left to [`admits`] so that rejected files
/// still get an id and show up as skipped.
pub fn discover_files(root: &Path, config: &ScanConfig) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(FilterError::WalkDir(format!(
            "not a directory: {}",
            root.display()
        )));
    }

    let exclude = build_exclude_set(&config.exclude_patterns)?;
    let mut files = Vec::new();

    for entry in JWalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
        .sort(true)
        .process_read_dir(move |_depth, _path, _state, children| {
            // Prune excluded entries before jwalk descends into them
            children.retain(|entry_result| match entry_result {
                Ok(entry) => !exclude.is_match(&entry.file_name),
                Err(_) => true,
            });
        })
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }
        files.push(entry.path());
    }

    debug!("discovered {} files under {}", files.len(), root.display());
    Ok(files)
}

/// Decide whether a discovered file belongs in the scope
pub fn admits(path: &Path, config: &ScanConfig) -> bool {
    if !config.extensions.is_empty() {
        let matched = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| config.extensions.iter().any(|e| e == ext));
        if !matched {
            return false;
        }
    }

    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() && metadata.len() <= config.max_file_size => {
            File::open(path).is_ok()
        }
        _ => false,
    }
}

/// Outcome of one indexing pass
#[derive(Debug, Default)]
pub struct PassReport {
    /// Files found by the walk
    pub discovered: usize,

    /// Files admitted that were not in scope after the last pass
    pub added: Vec<PathBuf>,

    /// Files admitted that were already in scope after the last pass
    pub reconfirmed: usize,

    /// Files rejected by admission
    pub skipped: usize,

    /// Files in scope after the last pass that are no longer in scope
    pub removed: Vec<PathBuf>,

    pub elapsed: Duration,
}

/// Drives indexing passes over one root, keeping the scope filter current
#[derive(Debug)]
pub struct IncrementalIndexer {
    filter: IncrementalFilesFilter,
    registry: FileIdRegistry,
}

impl IncrementalIndexer {
    /// Start with no known files
    pub fn new(root: PathBuf) -> Self {
        Self {
            filter: IncrementalFilesFilter::new(),
            registry: FileIdRegistry::new(root),
        }
    }

    /// Resume from a saved state; its members become the current generation
    pub fn from_state(state: FilterState) -> Self {
        Self {
            filter: IncrementalFilesFilter::from_members(&state.members),
            registry: state.registry,
        }
    }

    /// Capture the registry and the current generation for saving
    pub fn to_state(&self) -> FilterState {
        FilterState::new(self.registry.clone(), self.filter.current_members())
    }

    pub fn filter(&self) -> &IncrementalFilesFilter {
        &self.filter
    }

    pub fn registry(&self) -> &FileIdRegistry {
        &self.registry
    }

    pub fn root(&self) -> &Path {
        self.registry.root_path()
    }

    /// Check whether a path is in scope as of the running or last pass
    pub fn is_in_scope(&self, path: &Path) -> bool {
        self.registry
            .lookup(path)
            .is_some_and(|file_id| self.filter.contains_file_id(file_id))
    }

    /// Drop a deleted file from the scope, returning whether it was in scope
    pub fn forget(&self, path: &Path) -> bool {
        match self.registry.lookup(path) {
            Some(file_id) => {
                let was_present = self.filter.contains_file_id(file_id);
                self.filter.remove_file_id(file_id);
                was_present
            }
            None => false,
        }
    }

    /// Rotate generations for a new pass
    ///
    /// Returns the ids that were in scope when the pass began, which is what
    /// the new pass classifies against.
    pub fn begin_pass(&self) -> RoaringBitmap {
        let prior = self.filter.current_members();
        self.filter.memoize_and_reset_file_ids();
        prior
    }

    /// Release the previous generation once a pass has been classified
    pub fn finish_pass(&self) {
        self.filter.reset_previous_file_ids();
    }

    /// Run one full pass: rotate generations, admit every discovered file in
    /// parallel, classify against the last pass, then release the snapshot
    pub fn run_pass(&mut self, config: &ScanConfig) -> Result<PassReport> {
        let start = Instant::now();
        let root = self.registry.root_path().to_path_buf();

        let files = discover_files(&root, config)?;
        let candidates: Vec<(FileId, PathBuf)> = files
            .into_iter()
            .map(|path| (self.registry.id_for(&path), path))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| FilterError::ThreadPool(e.to_string()))?;

        let prior = self.begin_pass();

        let filter = &self.filter;
        let statuses: Vec<FileAddStatus> = pool.install(|| {
            candidates
                .par_iter()
                .map(|(file_id, path)| {
                    filter.ensure_file_id_present(*file_id, || admits(path, config))
                })
                .collect()
        });

        let mut report = PassReport {
            discovered: candidates.len(),
            ..PassReport::default()
        };
        for ((_, path), status) in candidates.iter().zip(statuses) {
            match status {
                FileAddStatus::Added => report.added.push(path.clone()),
                FileAddStatus::Present => report.reconfirmed += 1,
                FileAddStatus::Skipped => report.skipped += 1,
            }
        }

        let gone = &prior - &self.filter.current_members();
        report.removed = gone
            .iter()
            .filter_map(|file_id| self.registry.path_of(file_id))
            .collect();

        self.finish_pass();
        report.elapsed = start.elapsed();

        info!(
            "pass over {} finished: {} discovered, {} added, {} reconfirmed, {} skipped, {} removed in {:.2}s",
            root.display(),
            report.discovered,
            report.added.len(),
            report.reconfirmed,
            report.skipped,
            report.removed.len(),
            report.elapsed.as_secs_f64()
        );

        Ok(report)
    }
}
