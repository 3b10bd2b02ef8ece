//! INI parsing logic for converting `Ini` → `ConfigFile`.
//!
//! This module contains the `parse_ini()` function and its helpers.
//! It is the single place where INI key names are mapped to struct fields.

use ini::Ini;
use std::path::PathBuf;
use std::str::FromStr;

use super::defaults::clamp_concurrent_jobs;
use super::file::ConfigFileError;
use super::settings::{CompletionMode, ConfigFile};
use crate::registry::Polarization;
use crate::resolver::ReusePolicy;

/// Parse an `Ini` object into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [paths] section
    if let Some(section) = ini.section(Some("paths")) {
        if let Some(v) = non_empty(section.get("output_dir")) {
            config.paths.output_dir = expand_tilde(v);
        }
        if let Some(v) = non_empty(section.get("registry_file")) {
            config.paths.registry_file = Some(expand_tilde(v));
        }
    }

    // [search] section
    if let Some(section) = ini.section(Some("search")) {
        if let Some(v) = section.get("window_days") {
            let days: i64 = parse_number("search", "window_days", v, "must be a non-negative integer (days)")?;
            if days < 0 {
                return Err(invalid("search", "window_days", v, "must be a non-negative integer (days)"));
            }
            config.search.window_days = days;
        }
        if let Some(v) = section.get("tolerance_degrees") {
            let tolerance: f64 =
                parse_number("search", "tolerance_degrees", v, "must be a non-negative number")?;
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(invalid("search", "tolerance_degrees", v, "must be a non-negative number"));
            }
            config.search.tolerance_degrees = tolerance;
        }
        if let Some(v) = section.get("polarization") {
            config.search.polarization = v.parse::<Polarization>().map_err(|_| {
                invalid("search", "polarization", v, "must be 'single-pol' or 'dual-pol'")
            })?;
        }
        if let Some(v) = section.get("reuse_policy") {
            config.search.reuse_policy = v
                .parse::<ReusePolicy>()
                .map_err(|_| invalid("search", "reuse_policy", v, "must be 'closest' or 'latest'"))?;
        }
    }

    // [pipeline] section
    if let Some(section) = ini.section(Some("pipeline")) {
        if let Some(v) = section.get("max_concurrent_jobs") {
            let jobs: usize =
                parse_number("pipeline", "max_concurrent_jobs", v, "must be a positive integer")?;
            config.pipeline.max_concurrent_jobs = clamp_concurrent_jobs(jobs);
        }
        if let Some(v) = section.get("max_active_units") {
            config.pipeline.max_active_units = parse_number(
                "pipeline",
                "max_active_units",
                v,
                "must be a non-negative integer (0 = unlimited)",
            )?;
        }
        if let Some(v) = section.get("admission_timeout_secs") {
            config.pipeline.admission_timeout_secs = parse_number(
                "pipeline",
                "admission_timeout_secs",
                v,
                "must be a non-negative integer (seconds, 0 = wait forever)",
            )?;
        }
        if let Some(v) = section.get("requeue_limit") {
            config.pipeline.requeue_limit =
                parse_number("pipeline", "requeue_limit", v, "must be a non-negative integer")?;
        }
        if let Some(v) = section.get("validate_registry") {
            config.pipeline.validate_registry = parse_bool(v);
        }
    }

    // [registry] section
    if let Some(section) = ini.section(Some("registry")) {
        if let Some(v) = section.get("commit_attempts") {
            let attempts: u32 =
                parse_number("registry", "commit_attempts", v, "must be a positive integer")?;
            if attempts == 0 {
                return Err(invalid("registry", "commit_attempts", v, "must be a positive integer"));
            }
            config.registry.commit_attempts = attempts;
        }
        if let Some(v) = section.get("initial_backoff_ms") {
            config.registry.initial_backoff_ms = parse_number(
                "registry",
                "initial_backoff_ms",
                v,
                "must be a non-negative integer (milliseconds)",
            )?;
        }
        if let Some(v) = section.get("max_backoff_ms") {
            config.registry.max_backoff_ms = parse_number(
                "registry",
                "max_backoff_ms",
                v,
                "must be a non-negative integer (milliseconds)",
            )?;
        }
        if let Some(v) = section.get("lock_stale_secs") {
            config.registry.lock_stale_secs = parse_number(
                "registry",
                "lock_stale_secs",
                v,
                "must be a positive integer (seconds)",
            )?;
        }
        if let Some(v) = section.get("rebuild_on_corrupt") {
            config.registry.rebuild_on_corrupt = parse_bool(v);
        }
    }

    // [acquisition] section
    if let Some(section) = ini.section(Some("acquisition")) {
        if let Some(v) = section.get("command") {
            config.acquisition.command = non_empty(Some(v)).map(expand_tilde);
        }
        if let Some(v) = section.get("args") {
            config.acquisition.args = split_args(v);
        }
        if let Some(v) = section.get("timeout_secs") {
            config.acquisition.timeout_secs = parse_number(
                "acquisition",
                "timeout_secs",
                v,
                "must be a non-negative integer (seconds, 0 = no limit)",
            )?;
        }
    }

    // [processing] section
    if let Some(section) = ini.section(Some("processing")) {
        if let Some(v) = section.get("command") {
            config.processing.command = non_empty(Some(v)).map(expand_tilde);
        }
        if let Some(v) = section.get("args") {
            config.processing.args = split_args(v);
        }
        if let Some(v) = section.get("timeout_secs") {
            config.processing.timeout_secs = parse_number(
                "processing",
                "timeout_secs",
                v,
                "must be a non-negative integer (seconds, 0 = no limit)",
            )?;
        }
        if let Some(v) = section.get("completion") {
            config.processing.completion = match v.trim().to_lowercase().as_str() {
                "exit" => CompletionMode::Exit,
                "marker" => CompletionMode::Marker,
                _ => {
                    return Err(invalid("processing", "completion", v, "must be 'exit' or 'marker'"));
                }
            };
        }
        if let Some(v) = non_empty(section.get("marker_file")) {
            config.processing.marker_file = v.to_string();
        }
        if let Some(v) = section.get("poll_initial_secs") {
            config.processing.poll_initial_secs = parse_number(
                "processing",
                "poll_initial_secs",
                v,
                "must be a positive integer (seconds)",
            )?;
        }
        if let Some(v) = section.get("poll_max_secs") {
            config.processing.poll_max_secs = parse_number(
                "processing",
                "poll_max_secs",
                v,
                "must be a positive integer (seconds)",
            )?;
        }
        if let Some(v) = section.get("gpu_ids") {
            config.processing.gpu_ids = split_list(v)
                .map(|id| id.parse::<u32>())
                .collect::<Result<_, _>>()
                .map_err(|_| {
                    invalid("processing", "gpu_ids", v, "must be device numbers separated by spaces or commas")
                })?;
        }
    }

    // [logging] section
    if let Some(section) = ini.section(Some("logging")) {
        if let Some(v) = non_empty(section.get("file")) {
            config.logging.file = expand_tilde(v);
        }
        if let Some(v) = non_empty(section.get("level")) {
            config.logging.level = v.to_string();
        }
    }

    Ok(config)
}

/// Parse a boolean value from a config string.
/// Accepts: true/false, yes/no, 1/0, on/off (case-insensitive)
pub(super) fn parse_bool(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v == "true" || v == "1" || v == "yes" || v == "on"
}

/// Expand ~ to home directory in paths.
pub(super) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn parse_number<T: FromStr>(
    section: &str,
    key: &str,
    value: &str,
    reason: &str,
) -> Result<T, ConfigFileError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, reason))
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigFileError {
    ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn split_args(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::*;
    use crate::config::settings::ConfigFile;
    use tempfile::TempDir;

    fn load(content: &str) -> Result<ConfigFile, ConfigFileError> {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.ini");
        std::fs::write(&config_path, content).unwrap();
        ConfigFile::load_from(&config_path)
    }

    #[test]
    fn test_invalid_polarization() {
        let err = load("[search]\npolarization = quad\n").unwrap_err();
        assert!(err.to_string().contains("search.polarization"));
        assert!(err.to_string().contains("dual-pol"));
    }

    #[test]
    fn test_negative_window_rejected() {
        let err = load("[search]\nwindow_days = -3\n").unwrap_err();
        assert!(matches!(err, ConfigFileError::InvalidValue { ref key, .. } if key == "window_days"));
    }

    #[test]
    fn test_invalid_completion_mode() {
        let err = load("[processing]\ncompletion = poll\n").unwrap_err();
        assert!(err.to_string().contains("'exit' or 'marker'"));
    }

    #[test]
    fn test_zero_commit_attempts_rejected() {
        assert!(load("[registry]\ncommit_attempts = 0\n").is_err());
    }

    #[test]
    fn test_partial_config() {
        let config = load(
            r#"
[paths]
output_dir = /data/sar

[search]
window_days = 12
polarization = single-pol
reuse_policy = latest

[processing]
command = /opt/hyp3/run_rtc.sh
args = --gamma0 --scale power
completion = marker
"#,
        )
        .unwrap();

        assert_eq!(config.paths.output_dir, PathBuf::from("/data/sar"));
        assert_eq!(config.paths.registry_path(), PathBuf::from("/data/sar/sar_registry.json"));
        assert_eq!(config.search.window_days, 12);
        assert_eq!(config.search.polarization, Polarization::SinglePol);
        assert_eq!(config.search.reuse_policy, ReusePolicy::LatestRegistration);
        assert_eq!(config.processing.args, vec!["--gamma0", "--scale", "power"]);
        assert_eq!(config.processing.completion, CompletionMode::Marker);
        assert!(config.processing.processor().is_some());

        // Unspecified values keep their defaults
        assert_eq!(config.search.tolerance_degrees, 0.01);
        assert_eq!(config.pipeline.max_concurrent_jobs, 2);
        assert!(config.acquisition.acquirer().is_none());
    }

    #[test]
    fn test_gpu_ids() {
        let config = load("[processing]\ngpu_ids = 0, 2 3\n").unwrap();
        assert_eq!(config.processing.gpu_ids, vec![0, 2, 3]);
        assert_eq!(config.batch_options().gpu_ids, vec![0, 2, 3]);

        let config = load("[processing]\ngpu_ids =\n").unwrap();
        assert!(config.processing.gpu_ids.is_empty());

        let err = load("[processing]\ngpu_ids = 0 cuda1\n").unwrap_err();
        assert!(err.to_string().contains("processing.gpu_ids"));
    }

    #[test]
    fn test_concurrent_jobs_clamped() {
        let config = load("[pipeline]\nmax_concurrent_jobs = 0\n").unwrap();
        assert_eq!(config.pipeline.max_concurrent_jobs, MIN_CONCURRENT_JOBS);
        let config = load("[pipeline]\nmax_concurrent_jobs = 5000\n").unwrap();
        assert_eq!(config.pipeline.max_concurrent_jobs, MAX_CONCURRENT_JOBS);
    }

    #[test]
    fn test_registry_settings_to_policy() {
        let config = load("[registry]\ncommit_attempts = 9\nmax_backoff_ms = 500\nrebuild_on_corrupt = yes\n").unwrap();
        let policy = config.registry.commit_policy();
        assert_eq!(policy.max_attempts, 9);
        assert_eq!(policy.max_backoff, std::time::Duration::from_millis(500));
        assert!(config.batch_options().rebuild_on_corrupt);
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/path");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(path, home.join("test/path"));
        }

        // Non-tilde paths should be unchanged
        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_parse_bool_values() {
        for v in ["true", "TRUE", "1", "yes", "on", " on "] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["false", "0", "no", "off", ""] {
            assert!(!parse_bool(v), "{v}");
        }
    }
}
