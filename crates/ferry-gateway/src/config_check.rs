//! `ferry check`: validate a config file without starting anything.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use ferry_core::parse_capability_pattern;
use ferry_sandbox::parse_memory_size;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CheckResult {
    pub name: &'static str,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    fn marker(&self) -> &'static str {
        match (self.severity, self.passed) {
            (Severity::Info, _) => "·",
            (_, true) => "✓",
            (Severity::Warning, false) => "⚠",
            (Severity::Error, false) => "✗",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CheckReport {
    pub results: Vec<CheckResult>,
}

/// Wire shape of `ferry check --format json`.
#[derive(Serialize)]
struct JsonReport<'a> {
    passed: bool,
    errors: usize,
    warnings: usize,
    checks: &'a [CheckResult],
}

impl CheckReport {
    fn record(&mut self, name: &'static str, severity: Severity, passed: bool, message: String) {
        self.results.push(CheckResult {
            name,
            severity,
            passed,
            message,
        });
    }

    fn pass(&mut self, name: &'static str, severity: Severity, message: String) {
        self.record(name, severity, true, message);
    }

    fn fail(&mut self, name: &'static str, severity: Severity, message: String) {
        self.record(name, severity, false, message);
    }

    fn failures(&self, severity: Severity) -> impl Iterator<Item = &CheckResult> {
        self.results
            .iter()
            .filter(move |r| r.severity == severity && !r.passed)
    }

    pub(crate) fn has_errors(&self) -> bool {
        self.failures(Severity::Error).next().is_some()
    }

    /// Failed error-level checks as `name: message`.
    pub(crate) fn errors(&self) -> Vec<String> {
        self.failures(Severity::Error)
            .map(|r| format!("{}: {}", r.name, r.message))
            .collect()
    }

    pub(crate) fn print_human(&self) {
        println!("{self}");
    }

    pub(crate) fn print_json(&self) {
        println!(
            "{}",
            serde_json::to_string_pretty(&self.to_json_value()).unwrap_or_default()
        );
    }

    pub(crate) fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(JsonReport {
            passed: !self.has_errors(),
            errors: self.failures(Severity::Error).count(),
            warnings: self.failures(Severity::Warning).count(),
            checks: &self.results,
        })
        .unwrap_or_default()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            writeln!(f, "{} {}", result.marker(), result.message)?;
        }
        let errors = self.failures(Severity::Error).count();
        let warnings = self.failures(Severity::Warning).count();
        if errors == 0 && warnings == 0 {
            write!(f, "\nall checks passed")
        } else {
            write!(f, "\n{errors} error(s), {warnings} warning(s)")
        }
    }
}

pub(crate) fn validate_config(config_path: &Path) -> CheckReport {
    let mut report = CheckReport::default();

    // 1. toml_parse
    let config = match Config::load(config_path) {
        Ok(c) => {
            report.pass(
                "toml_parse",
                Severity::Error,
                "config syntax valid".to_owned(),
            );
            c
        }
        Err(e) => {
            report.fail("toml_parse", Severity::Error, format!("{e:#}"));
            return report;
        }
    };

    validate_parsed(&mut report, &config);
    report
}

/// Every check after parsing. Split out so the watcher can validate what it
/// already loaded.
pub(crate) fn validate_parsed(report: &mut CheckReport, config: &Config) {
    check_executor(report, config);
    check_sessions(report, config);
    check_gateways(report, config);
    check_hooks(report, config);
    check_sandbox(report, config);
}

fn check_executor(report: &mut CheckReport, config: &Config) {
    // 2. executor_command
    match config.executor.command.first() {
        Some(program) if !program.is_empty() => {
            report.pass(
                "executor_command",
                Severity::Error,
                format!("executor: {}", config.executor.command.join(" ")),
            );
            if !program_exists(program) {
                report.fail(
                    "executor_binary",
                    Severity::Warning,
                    format!("executor program '{program}' not found"),
                );
            }
        }
        _ => report.fail(
            "executor_command",
            Severity::Error,
            "executor.command must name a program".to_owned(),
        ),
    }

    if config.executor.timeout_secs == 0 {
        report.fail(
            "executor_timeout",
            Severity::Error,
            "executor.timeout_secs must be greater than zero".to_owned(),
        );
    }
}

/// Whether `program` is a path that exists or a name found on `PATH`.
fn program_exists(program: &str) -> bool {
    if program.contains('/') {
        return Path::new(program).exists();
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
    })
}

fn check_sessions(report: &mut CheckReport, config: &Config) {
    // 3. sessions
    if config.sessions.is_empty() {
        report.pass(
            "sessions",
            Severity::Info,
            "no session policies configured, all sessions use defaults".to_owned(),
        );
        return;
    }

    let names: Vec<&str> = config.sessions.iter().map(|s| s.name.as_str()).collect();
    report.pass(
        "sessions",
        Severity::Info,
        format!("{} session(s): {}", names.len(), names.join(", ")),
    );

    let mut seen = HashSet::new();
    let dupes: Vec<&str> = names
        .iter()
        .filter(|n| !seen.insert(**n))
        .copied()
        .collect();
    if !dupes.is_empty() {
        report.fail(
            "sessions_duplicates",
            Severity::Error,
            format!("duplicate session names: {}", dupes.join(", ")),
        );
    }

    // 4. capability_names
    let mut unknown = Vec::new();
    for entry in &config.sessions {
        let caps = &entry.policy.capabilities;
        for pattern in caps.grant.iter().chain(&caps.revoke) {
            if parse_capability_pattern(pattern).is_none() {
                unknown.push(format!("{}: {pattern}", entry.name));
            }
        }
    }
    if unknown.is_empty() {
        report.pass(
            "capability_names",
            Severity::Error,
            "capability overrides valid".to_owned(),
        );
    } else {
        report.fail(
            "capability_names",
            Severity::Error,
            format!("unknown capabilities: {}", unknown.join(", ")),
        );
    }

    // 5. sandbox_overrides
    for entry in &config.sessions {
        let Some(memory) = entry
            .policy
            .sandbox
            .as_ref()
            .and_then(|sandbox| sandbox.memory.as_deref())
        else {
            continue;
        };
        if let Err(e) = parse_memory_size(memory) {
            report.fail(
                "sandbox_memory",
                Severity::Error,
                format!("session '{}': {e}", entry.name),
            );
        }
    }
}

fn check_gateways(report: &mut CheckReport, config: &Config) {
    // 6. gateway_sessions
    for gateway in &config.gateways {
        let marked = config.session(&gateway.session).is_some_and(|s| s.gateway);
        if marked {
            report.pass(
                "gateway_sessions",
                Severity::Error,
                format!("gateway '{}'", gateway.session),
            );
        } else {
            report.fail(
                "gateway_sessions",
                Severity::Error,
                format!(
                    "gateway '{}' is not a session with gateway = true",
                    gateway.session
                ),
            );
        }

        if gateway.sources.is_empty() || gateway.rules.is_empty() {
            report.fail(
                "gateway_rules",
                Severity::Warning,
                format!(
                    "gateway '{}' has no sources or no rules and will never forward",
                    gateway.session
                ),
            );
        }
    }
}

fn check_hooks(report: &mut CheckReport, config: &Config) {
    // 7. hook_commands
    let mut seen = HashSet::new();
    for hook in &config.hooks {
        if hook.command.first().is_none_or(String::is_empty) {
            report.fail(
                "hook_commands",
                Severity::Error,
                format!("hook '{}' has an empty command", hook.name),
            );
        }
        if !seen.insert(hook.name.as_str()) {
            report.fail(
                "hook_names",
                Severity::Error,
                format!("duplicate hook name '{}'", hook.name),
            );
        }
    }
    if !config.hooks.is_empty() {
        report.pass(
            "hooks",
            Severity::Info,
            format!("{} hook(s) configured", config.hooks.len()),
        );
    }
}

fn check_sandbox(report: &mut CheckReport, config: &Config) {
    // 8. sandbox_extension
    match config.sandbox.extension.as_deref() {
        None => report.pass(
            "sandbox_extension",
            Severity::Info,
            "no sandbox extension, executor runs on the host".to_owned(),
        ),
        Some("container") => report.pass(
            "sandbox_extension",
            Severity::Error,
            format!("sandbox: container via {}", config.sandbox.runtime),
        ),
        Some(other) => report.fail(
            "sandbox_extension",
            Severity::Error,
            format!("unknown sandbox extension '{other}' (only 'container' supported)"),
        ),
    }
}
