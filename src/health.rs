//! Preflight checks for restic-monitor
//!
//! `doctor` runs these to verify the restic binary and every configured
//! repository before the monitor is started.

use crate::config::Config;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// restic binary status
    pub restic: CheckResult,
    /// Per repository configuration status, keyed by repository name
    pub repos: Vec<(String, CheckResult)>,
    /// Metrics textfile location status (warning only)
    pub metrics: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config) -> Self {
        Self {
            restic: Self::check_restic(&config.restic.binary),
            repos: Self::check_repos(config),
            metrics: Self::check_metrics(config),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    ///
    /// At least one repository must resolve, matching what `run` requires.
    pub fn all_passed(&self) -> bool {
        self.restic.passed && self.metrics.passed && self.repos.iter().any(|(_, r)| r.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.results()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.results().filter(|r| r.is_warning).collect()
    }

    fn results(&self) -> impl Iterator<Item = &CheckResult> {
        std::iter::once(&self.restic)
            .chain(self.repos.iter().map(|(_, r)| r))
            .chain(std::iter::once(&self.metrics))
    }

    /// Check the restic binary runs
    fn check_restic(binary: &str) -> CheckResult {
        match std::process::Command::new(binary).arg("version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("restic installed", version.trim().to_string())
            }
            Ok(output) => CheckResult::error_with_details(
                "restic version failed",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(_) => CheckResult::error_with_details(
                format!("restic not found: {}", binary),
                "Install restic: https://restic.readthedocs.io/en/stable/020_installation.html",
            ),
        }
    }

    /// Check every repository resolves to valid settings
    fn check_repos(config: &Config) -> Vec<(String, CheckResult)> {
        if config.repos.is_empty() {
            return vec![(
                "Repositories".to_string(),
                CheckResult::error("No repositories configured"),
            )];
        }

        config
            .repos
            .iter()
            .map(|(name, repo)| {
                let result = match repo.resolve(name) {
                    Ok(settings) => CheckResult::ok_with_details(
                        format!("{} configured", name),
                        format!(
                            "poll every {:?}, maintenance \"{}\", {} environment variables",
                            settings.polling_interval,
                            settings.maintenance_schedule,
                            settings.environment.len()
                        ),
                    ),
                    Err(e) => {
                        CheckResult::error_with_details(format!("{} is invalid", name), format!("{:#}", e))
                    }
                };
                (format!("Repository {}", name), result)
            })
            .collect()
    }

    /// Check the metrics textfile can be written
    fn check_metrics(config: &Config) -> CheckResult {
        if let Err(e) = config.metrics_write_interval() {
            return CheckResult::error_with_details("Invalid metrics write interval", format!("{:#}", e));
        }
        if let Err(e) = config.metrics_listen() {
            return CheckResult::error_with_details("Invalid metrics endpoint", format!("{:#}", e));
        }

        let path = match config.metrics_textfile() {
            Ok(Some(path)) => path,
            Ok(None) => return CheckResult::ok("Metrics textfile disabled"),
            Err(e) => return CheckResult::error_with_details("Invalid metrics textfile", format!("{:#}", e)),
        };

        match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) if !dir.exists() => CheckResult::warning_with_details(
                "Metrics textfile directory does not exist",
                format!("Create it before starting: {}", dir.display()),
            ),
            _ => CheckResult::ok_with_details("Metrics textfile", path.display().to_string()),
        }
    }

    /// Get all checks for iteration, in report order
    pub fn all_checks(&self) -> Vec<(String, &CheckResult)> {
        let mut checks = vec![("restic Installation".to_string(), &self.restic)];
        checks.extend(self.repos.iter().map(|(name, r)| (name.clone(), r)));
        checks.push(("Metrics Output".to_string(), &self.metrics));
        checks
    }
}
