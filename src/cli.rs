use crate::config::types::{
    MetaDestination, Redirections, ResourceLimits, SandboxConfig, StderrTarget,
    DEFAULT_FD_LIMIT, DEFAULT_PROCESS_LIMIT,
};
use crate::config::validator::{parse_seconds, validate_config};
use crate::core::supervisor::run_sandbox;
use crate::utils::env_rules::EnvRule;
use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, Parser};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

const DESCRIPTION: &str = "Resource-limiting process keeper for contest task pipelines";

fn seconds_arg(value: &str) -> std::result::Result<Duration, String> {
    parse_seconds(value).map(Option::unwrap_or_default)
}

fn env_rule_arg(value: &str) -> std::result::Result<EnvRule, String> {
    EnvRule::parse(value).map_err(|_| format!("Invalid environment specified: {}", value))
}

#[derive(Parser, Debug)]
#[command(
    name = "minibox",
    about = DESCRIPTION,
    disable_version_flag = true,
    after_help = "Exit codes: 0 ok, 1 program violation, 2 internal failure or usage error"
)]
pub struct Cli {
    /// Change directory to DIR before executing the program
    #[arg(short = 'c', long = "chdir", value_name = "DIR")]
    chdir: Option<PathBuf>,

    /// Max size (in KB) of files that can be created
    #[arg(short = 'f', long = "fsize", value_name = "KB")]
    fsize: Option<u64>,

    /// Environment rule: VAR (inherit), VAR=value (set) or VAR= (clear)
    #[arg(short = 'E', long = "env", value_name = "VAR[=VAL]", value_parser = env_rule_arg, action = ArgAction::Append)]
    env: Vec<EnvRule>,

    /// Inherit the full environment of the parent process
    #[arg(short = 'e', long = "full-env")]
    full_env: bool,

    /// Set extra timeout, before which a timing-out program is not yet killed
    #[arg(short = 'x', long = "extra-time", value_name = "SEC", value_parser = seconds_arg)]
    extra_time: Option<Duration>,

    /// Limit address space to KB kilobytes
    #[arg(short = 'm', long = "mem", value_name = "KB")]
    mem: Option<u64>,

    /// Output process information to FILE (name:value); '-' writes to stdout
    #[arg(short = 'M', long = "meta", value_name = "FILE")]
    meta: Option<String>,

    /// Enable multiple processes (at most N of them); bare flag means no limit
    #[arg(
        short = 'p',
        long = "processes",
        value_name = "N",
        num_args = 0..=1,
        default_missing_value = "0"
    )]
    processes: Option<u32>,

    /// Do not print status messages except for fatal errors
    #[arg(short = 's', long = "silent", action = ArgAction::Count)]
    silent: u8,

    /// Limit stack size to KB kilobytes (0 = unlimited)
    #[arg(short = 'k', long = "stack", value_name = "KB")]
    stack: Option<u64>,

    /// Redirect stderr to FILE
    #[arg(short = 'r', long = "stderr", value_name = "FILE", overrides_with = "stderr_to_stdout")]
    stderr: Option<PathBuf>,

    /// Redirect stderr to stdout
    #[arg(long = "stderr-to-stdout", overrides_with = "stderr")]
    stderr_to_stdout: bool,

    /// Redirect stdin from FILE
    #[arg(short = 'i', long = "stdin", value_name = "FILE")]
    stdin: Option<PathBuf>,

    /// Redirect stdout to FILE
    #[arg(short = 'o', long = "stdout", value_name = "FILE")]
    stdout: Option<PathBuf>,

    /// Set run time limit (seconds, fractions allowed)
    #[arg(short = 't', long = "time", value_name = "SEC", value_parser = seconds_arg)]
    time: Option<Duration>,

    /// Be verbose (use multiple times for even more verbosity)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Set wall clock time limit (seconds, fractions allowed)
    #[arg(short = 'w', long = "wall-time", value_name = "SEC", value_parser = seconds_arg)]
    wall_time: Option<Duration>,

    /// Run the given command under the keeper
    #[arg(long = "run")]
    run: bool,

    /// Display program version and configuration
    #[arg(long = "version")]
    version: bool,

    /// Program and its arguments, after `--`
    #[arg(last = true, value_name = "PROGRAM")]
    command: Vec<OsString>,
}

fn nonzero(value: Option<u64>) -> Option<u64> {
    value.filter(|&v| v != 0)
}

fn nonzero_duration(value: Option<Duration>) -> Option<Duration> {
    value.filter(|d| !d.is_zero())
}

impl Cli {
    /// Build the immutable run configuration. Validation is left to the
    /// caller, once logging is set up.
    pub fn into_config(self) -> SandboxConfig {
        let process_limit = match self.processes {
            None => Some(DEFAULT_PROCESS_LIMIT),
            Some(0) => None,
            Some(n) => Some(n),
        };

        let stderr = match (self.stderr, self.stderr_to_stdout) {
            (_, true) => StderrTarget::Stdout,
            (Some(path), false) => StderrTarget::File(path),
            (None, false) => StderrTarget::Inherit,
        };

        SandboxConfig {
            limits: ResourceLimits {
                cpu_time: nonzero_duration(self.time),
                wall_time: nonzero_duration(self.wall_time),
                extra_time: self.extra_time.unwrap_or_default(),
                memory_kb: nonzero(self.mem),
                file_size_kb: nonzero(self.fsize),
                stack_kb: nonzero(self.stack),
                process_limit,
                fd_limit: DEFAULT_FD_LIMIT,
            },
            redirections: Redirections {
                stdin: self.stdin,
                stdout: self.stdout,
                stderr,
            },
            workdir: self.chdir,
            env_rules: self.env,
            inherit_full_env: self.full_env,
            meta: self
                .meta
                .as_deref()
                .map(MetaDestination::parse)
                .unwrap_or_default(),
            verbosity: self.verbose,
            silent: self.silent > 0,
            command: self.command,
        }
    }
}

fn log_level(silent: bool, verbosity: u8) -> log::LevelFilter {
    if silent {
        return log::LevelFilter::Error;
    }
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn init_logging(config: &SandboxConfig) {
    let _ = env_logger::Builder::new()
        .filter_level(log_level(config.silent, config.verbosity))
        .parse_default_env()
        .format_timestamp(None)
        .try_init();
}

fn checked(config: &SandboxConfig) -> Result<()> {
    validate_config(config).context("invalid sandbox configuration")?;
    Ok(())
}

fn usage_error(message: &str) -> ! {
    Cli::command().error(ErrorKind::ArgumentConflict, message).exit()
}

fn print_version() {
    println!("minibox {}", env!("CARGO_PKG_VERSION"));
    println!("{}", DESCRIPTION);
}

/// Parse the command line, run the requested mode and return the exit code
pub fn run() -> i32 {
    let cli = Cli::parse();

    if cli.run && cli.version {
        usage_error("Only one command is allowed");
    }
    if cli.version {
        print_version();
        return 0;
    }
    if !cli.run {
        usage_error("Please specify a minibox command (e.g. --run)");
    }
    if cli.command.is_empty() {
        usage_error("--run mode requires a command to run");
    }

    let config = cli.into_config();
    init_logging(&config);
    if let Err(e) = checked(&config) {
        eprintln!("{:#}", e);
        return 2;
    }

    run_sandbox(&config)
}
