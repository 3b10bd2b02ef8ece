//! Run command - process a batch of work requests.
//!
//! Requests are read from a JSON-lines document, one reference image per
//! line:
//!
//! ```text
//! {"name": "chip_pre_event.tif", "bounds": [36.0, 36.0, 36.5, 36.5], "reference_time": "2023-02-01T08:00:00Z"}
//! {"name": "chip_post_event_20230210T080000.tif", "footprint": [[36.0,36.0],[36.5,36.0],[36.5,36.5]]}
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sarflow::config::{MAX_CONCURRENT_JOBS, MIN_CONCURRENT_JOBS};
use sarflow::pipeline::{parse_requests, BatchRunner, BatchSummary, WorkRequest};
use sarflow::resolver::OverlapResolver;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the run command.
#[derive(Debug, Default)]
pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub requests: PathBuf,
    /// Override of `[pipeline] max_concurrent_jobs`
    pub max_concurrent: Option<usize>,
    /// Resolve requests against the registry without processing anything
    pub dry_run: bool,
}

/// Run the run command.
pub fn run(args: RunArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(args.config.as_deref())?;
    runner.log_startup("run");

    let requests = read_requests(&runner, &args.requests)?;
    println!("Loaded {} request(s) from {}", requests.len(), args.requests.display());

    if args.dry_run {
        return dry_run(&runner, &requests);
    }

    let mut options = runner.config().batch_options();
    if let Some(n) = args.max_concurrent {
        options.max_concurrent = n.clamp(MIN_CONCURRENT_JOBS, MAX_CONCURRENT_JOBS);
    }
    let orchestrator = Arc::new(runner.create_orchestrator()?);
    let batch = BatchRunner::new(orchestrator, options);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Config(format!("failed to start async runtime: {}", e)))?;

    let summary = rt.block_on(async {
        let cancel = CancellationToken::new();
        let signal_token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling units not yet processing");
                eprintln!("\nInterrupted. Waiting for units already processing...");
                signal_token.cancel();
            }
        });

        batch.run(requests, cancel).await
    })?;

    print_summary(&summary);

    if summary.is_clean() {
        Ok(())
    } else {
        Err(CliError::Unclean {
            failed: summary.failed.len(),
            issues: summary.registry_issues.len(),
        })
    }
}

fn read_requests(runner: &CliRunner, path: &Path) -> Result<Vec<WorkRequest>, CliError> {
    let text = std::fs::read_to_string(path).map_err(|error| CliError::RequestsRead {
        path: path.to_path_buf(),
        error,
    })?;
    let requests = parse_requests(&text, &runner.config().search.request_defaults())?;
    info!(count = requests.len(), path = %path.display(), "Requests loaded");
    Ok(requests)
}

/// Prints the decision the resolver would make for every request.
fn dry_run(runner: &CliRunner, requests: &[WorkRequest]) -> Result<(), CliError> {
    let registry = runner.store().load()?;
    let resolver = OverlapResolver::new(runner.config().search.reuse_policy);

    println!("Registry: {} scene(s), policy {}", registry.len(), resolver.policy());
    println!();

    let mut reused = 0;
    for request in requests {
        match resolver.resolve_where(&registry, request, |record| record.outputs_present()) {
            Some(record) => {
                reused += 1;
                println!("  REUSE    {} -> {}", request.name, record.scene_id);
            }
            None => println!("  PROCESS  {} ({} phase)", request.name, request.phase),
        }
    }

    println!();
    println!(
        "{} of {} request(s) would reuse a registered scene",
        reused,
        requests.len()
    );
    Ok(())
}

fn print_summary(summary: &BatchSummary) {
    println!();
    for (request, scene) in &summary.registered {
        println!("  REGISTERED {} -> {}", request, scene);
    }
    for (request, scene) in &summary.skipped {
        println!("  SKIPPED    {} -> {}", request, scene);
    }
    println!();
    print!("{}", summary);
}
