use clap::{Parser, Subcommand};
use log::{debug, warn};
use scopefilter::{
    load_state, load_state_mmap, save_state, state_exists, FilterError, FilterState, IdFilter,
    IncrementalIndexer, ScanConfig,
};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "scopefilter")]
#[command(about = "Incremental project scope tracking for file indexing")]
#[command(version)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an indexing pass and report what changed since the last one
    Scan {
        /// Directory to scan (defaults to current directory)
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// State file path
        #[arg(short, long, default_value = "scope.scpf")]
        state: PathBuf,

        /// File extensions to admit (e.g., rs,py,js)
        #[arg(short, long, value_delimiter = ',')]
        extensions: Option<Vec<String>>,

        /// Glob patterns to exclude
        #[arg(short = 'x', long, value_delimiter = ',')]
        exclude: Option<Vec<String>>,

        /// Maximum file size in MB
        #[arg(long, default_value = "10")]
        max_size: u64,

        /// Worker threads (0 = one per core)
        #[arg(short, long, default_value = "0")]
        threads: usize,

        /// Print added and removed files
        #[arg(short, long)]
        list: bool,
    },

    /// Report whether paths are in scope
    Check {
        /// State file path
        #[arg(short, long, default_value = "scope.scpf")]
        state: PathBuf,

        /// Use memory-mapped loading
        #[arg(long)]
        mmap: bool,

        /// Paths to check
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Drop deleted files from the scope without a full pass
    Forget {
        /// State file path
        #[arg(short, long, default_value = "scope.scpf")]
        state: PathBuf,

        /// Paths to forget
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show state statistics
    Stats {
        /// State file path
        #[arg(short, long, default_value = "scope.scpf")]
        state: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match cli.command {
        Commands::Scan {
            dir,
            state,
            extensions,
            exclude,
            max_size,
            threads,
            list,
        } => cmd_scan(dir, state, extensions, exclude, max_size, threads, list),

        Commands::Check { state, mmap, paths } => cmd_check(state, mmap, paths),

        Commands::Forget { state, paths } => cmd_forget(state, paths),

        Commands::Stats { state } => cmd_stats(state),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_state(state_path: &Path, use_mmap: bool) -> scopefilter::Result<FilterState> {
    if !state_exists(state_path) {
        return Err(FilterError::StateNotFound(
            state_path.display().to_string(),
        ));
    }

    if use_mmap {
        load_state_mmap(state_path)
    } else {
        load_state(state_path)
    }
}

/// Registered paths are canonical; deleted files fall back to a cwd join
fn resolve(path: PathBuf) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        return path;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

fn cmd_scan(
    dir: PathBuf,
    state_path: PathBuf,
    extensions: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    max_size: u64,
    threads: usize,
    list: bool,
) -> scopefilter::Result<()> {
    let mut config = ScanConfig::default();

    if let Some(exts) = extensions {
        config.extensions = exts;
    }

    if let Some(excl) = exclude {
        config.exclude_patterns = excl;
    }

    config.set_max_size_mb(max_size);
    config.threads = threads;

    let dir = dir.canonicalize()?;
    let mut indexer = if state_exists(&state_path) {
        let indexer = IncrementalIndexer::from_state(load_state(&state_path)?);
        if indexer.root() != dir {
            warn!(
                "state was recorded for {}, scanning {} from scratch",
                indexer.root().display(),
                dir.display()
            );
            IncrementalIndexer::new(dir)
        } else {
            indexer
        }
    } else {
        debug!("no state at {}, starting fresh", state_path.display());
        IncrementalIndexer::new(dir)
    };

    println!("Scanning directory: {}", indexer.root().display());

    let report = indexer.run_pass(&config)?;

    println!(
        "Discovered {} files in {:.2}s: {} added, {} reconfirmed, {} skipped, {} removed",
        report.discovered,
        report.elapsed.as_secs_f64(),
        report.added.len(),
        report.reconfirmed,
        report.skipped,
        report.removed.len()
    );

    if list {
        for path in &report.added {
            println!("+ {}", path.display());
        }
        for path in &report.removed {
            println!("- {}", path.display());
        }
    }

    let start = Instant::now();
    save_state(&indexer.to_state(), &state_path)?;
    let file_size = std::fs::metadata(&state_path).map(|m| m.len()).unwrap_or(0);

    println!(
        "Saved state to {} ({:.2} KB) in {:.3}s",
        state_path.display(),
        file_size as f64 / 1024.0,
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn cmd_check(state_path: PathBuf, use_mmap: bool, paths: Vec<PathBuf>) -> scopefilter::Result<()> {
    let indexer = IncrementalIndexer::from_state(open_state(&state_path, use_mmap)?);

    for path in paths {
        let path = resolve(path);
        let verdict = if indexer.is_in_scope(&path) {
            "in-scope"
        } else {
            "out-of-scope"
        };
        println!("{}\t{}", verdict, path.display());
    }

    Ok(())
}

fn cmd_forget(state_path: PathBuf, paths: Vec<PathBuf>) -> scopefilter::Result<()> {
    let indexer = IncrementalIndexer::from_state(open_state(&state_path, false)?);

    let mut forgotten = 0;
    for path in paths {
        let path = resolve(path);
        if indexer.forget(&path) {
            forgotten += 1;
        } else {
            debug!("{} was not in scope", path.display());
        }
    }

    save_state(&indexer.to_state(), &state_path)?;
    println!("Forgot {} files", forgotten);

    Ok(())
}

fn cmd_stats(state_path: PathBuf) -> scopefilter::Result<()> {
    let state = open_state(&state_path, false)?;
    let (version, created_at) = (state.version, state.created_at);
    let indexer = IncrementalIndexer::from_state(state);

    let file_size = std::fs::metadata(&state_path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Scope Statistics");
    println!("================");
    println!("Version:          {}", version);
    println!("Scope:            {}", indexer.filter().filtering_scope_type());
    println!("Root path:        {}", indexer.root().display());
    println!("Registered files: {}", indexer.registry().len());
    println!("Directories:      {}", indexer.registry().directory_count());
    println!("In scope:         {}", indexer.filter().current_len());
    println!("State size:       {:.2} KB", file_size as f64 / 1024.0);
    println!("Created:          {} (unix timestamp)", created_at);

    Ok(())
}
