//! Registry maintenance commands: `validate`, `rebuild` and `list`.

use std::path::PathBuf;

use tracing::info;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Check that every registered output exists and is non-empty, and report
/// result directories the registry does not know about.
///
/// Findings are reported, never repaired.
pub fn run_validate(config: Option<PathBuf>) -> Result<(), CliError> {
    let runner = CliRunner::new(config.as_deref())?;
    runner.log_startup("validate");

    let store = runner.store();
    let registry = store.load()?;
    let mut issues = store.validate()?;
    issues.extend(store.find_unregistered(&runner.layout().results_root())?);

    println!("Registry: {}", store.path().display());
    println!("  Scenes:     {}", registry.len());
    println!("  Processed:  {}", registry.processed().count());
    println!("  Generation: {}", registry.generation);

    if issues.is_empty() {
        println!();
        println!("No issues found.");
        return Ok(());
    }

    println!();
    for issue in &issues {
        println!("  {}", issue);
    }
    Err(CliError::Unclean {
        failed: 0,
        issues: issues.len(),
    })
}

/// Reconstruct the registry from the result sidecars under the output
/// directory. The previous document is backed up first.
pub fn run_rebuild(config: Option<PathBuf>, scan_root: Option<PathBuf>) -> Result<(), CliError> {
    let runner = CliRunner::new(config.as_deref())?;
    runner.log_startup("rebuild");

    let scan_root = scan_root.unwrap_or_else(|| runner.layout().results_root());
    println!("Rebuilding registry from {}...", scan_root.display());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Config(format!("failed to start async runtime: {}", e)))?;
    let store = runner.store();
    let report = rt.block_on(store.rebuild(&scan_root))?;

    info!(
        scenes = report.registry.len(),
        rejected = report.rejected.len(),
        swept = report.swept.len(),
        "Registry rebuilt"
    );

    println!("✓ Rebuilt {} with {} scene(s)", store.path().display(), report.registry.len());
    if let Some(backup) = &report.backup {
        println!("  Previous document saved as {}", backup.display());
    }
    for issue in &report.rejected {
        println!("  Skipped: {}", issue);
    }
    for stage in &report.swept {
        println!("  Removed abandoned stage {}", stage.display());
    }
    Ok(())
}

/// Print one line per registered scene.
pub fn run_list(config: Option<PathBuf>) -> Result<(), CliError> {
    let runner = CliRunner::new(config.as_deref())?;
    let registry = runner.store().load()?;

    if registry.is_empty() {
        println!("Registry is empty.");
        return Ok(());
    }

    for scene in registry.scenes() {
        let bands: Vec<&str> = scene.output_paths.keys().map(String::as_str).collect();
        println!(
            "{}  {}  {}  {}  [{}]  refs={}",
            scene.scene_id,
            scene.acquisition_time.format("%Y-%m-%d %H:%M"),
            scene.polarization,
            scene.phase,
            bands.join(","),
            scene.references.len()
        );
    }
    println!();
    println!("{} scene(s)", registry.len());
    Ok(())
}
