// Config validation
// Fail fast, before anything is forked, with actionable errors

use crate::config::types::{KeeperError, Result, SandboxConfig, StderrTarget};
use std::time::Duration;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parse a time limit given in (possibly fractional) seconds.
/// Zero disables the limit.
pub fn parse_seconds(value: &str) -> std::result::Result<Option<Duration>, String> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid time value '{}'", value))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("time value must be a non-negative number, got '{}'", value));
    }
    let millis = (secs * 1000.0) as u64;
    if millis == 0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_millis(millis)))
    }
}

/// Validate config at startup; errors are fatal, warnings are logged
pub fn validate_config(config: &SandboxConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_command(config, &mut result);
    validate_limits(config, &mut result);
    validate_redirections(config, &mut result);

    for warning in &result.warnings {
        log::warn!("{}", warning);
    }

    if !result.is_valid() {
        return Err(KeeperError::Config(result.errors.join("; ")));
    }

    Ok(result)
}

fn validate_command(config: &SandboxConfig, result: &mut ValidationResult) {
    match config.command.first() {
        None => result.add_error("--run mode requires a command to run".to_string()),
        Some(program) if program.is_empty() => {
            result.add_error("program path cannot be empty".to_string())
        }
        Some(_) => {}
    }
}

fn validate_limits(config: &SandboxConfig, result: &mut ValidationResult) {
    let limits = &config.limits;

    if let Some(memory_kb) = limits.memory_kb {
        if memory_kb < 1024 {
            result.add_warning(format!(
                "address space limit {} KB is very low, most programs will fail to load",
                memory_kb
            ));
        }
    }

    if limits.process_limit == Some(0) {
        result.add_error("process limit cannot be zero".to_string());
    }

    if !limits.extra_time.is_zero() && limits.cpu_time.is_none() {
        result.add_warning("--extra-time has no effect without --time".to_string());
    }

    if let (Some(cpu), Some(wall)) = (limits.cpu_time, limits.wall_time) {
        if wall < cpu {
            result.add_warning(format!(
                "wall clock limit {:?} is below CPU limit {:?}; the wall limit will always hit first",
                wall, cpu
            ));
        }
    }
}

fn validate_redirections(config: &SandboxConfig, result: &mut ValidationResult) {
    let redirections = &config.redirections;

    if let (Some(stdout), StderrTarget::File(stderr)) = (&redirections.stdout, &redirections.stderr) {
        if stdout == stderr {
            result.add_warning(format!(
                "stdout and stderr both truncate {}; use --stderr-to-stdout to share it",
                stdout.display()
            ));
        }
    }

    if let Some(workdir) = &config.workdir {
        if workdir.as_os_str().is_empty() {
            result.add_error("--chdir requires a directory".to_string());
        }
    }
}
