//! CLI argument parsing for the supervisor and the aggregator

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::placement::PlacementPolicy;
use crate::session::{SamplingMode, SessionConfig};
use crate::size::parse_size;

/// Output format for aggregate records
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `emu: local% ...` lines (default)
    Text,
    /// One JSON object per window
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "emu")]
#[command(version)]
#[command(about = "Run a program under an emulated NUMA local-memory budget and report its memory locality", long_about = None)]
pub struct Cli {
    /// Local (near-node) memory budget, with optional K/M/G suffix
    #[arg(short = 'l', long = "local-size", value_name = "SIZE", value_parser = parse_budget)]
    pub local_size: Option<u64>,

    /// Interleave the target's memory across all nodes
    #[arg(short = 'i', long = "interleave")]
    pub interleave: bool,

    /// Rank of this instance; only rank 0 prints availability lines
    #[arg(short = 'n', long = "rank", value_name = "RANK", default_value_t = 0)]
    pub rank: u32,

    /// Sampling interval in seconds (0 disables periodic sampling)
    #[arg(
        short = 't',
        long = "interval",
        value_name = "SECONDS",
        default_value = "1",
        value_parser = parse_interval
    )]
    pub interval: Duration,

    /// Report memory hotness (smaps_rollup) instead of locality
    #[arg(short = 'm', long = "memprof")]
    pub memprof: bool,

    /// Start monitoring when a target output line matches this glob
    #[arg(short = 'S', long = "start", value_name = "PATTERN")]
    pub start: Option<String>,

    /// Stop monitoring when a target output line matches this glob
    #[arg(short = 'E', long = "end", value_name = "PATTERN")]
    pub end: Option<String>,

    /// Print `emu: sync OFFSET` first so the log can be aggregated
    #[arg(long = "sync", value_name = "OFFSET", allow_negative_numbers = true)]
    pub sync: Option<f64>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Command to run and its arguments
    #[arg(required = true, trailing_var_arg = true, num_args = 1..)]
    pub command: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(name = "emu-agg")]
#[command(version)]
#[command(about = "Merge locality logs of a multi-process run into one-second windows", long_about = None)]
pub struct AggregateCli {
    /// Logs written by `emu --sync`
    #[arg(required = true, value_name = "FILES")]
    pub files: Vec<PathBuf>,

    /// Output format for aggregate records
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

fn parse_budget(value: &str) -> Result<u64, String> {
    parse_size(value).map_err(|e| e.to_string())
}

fn parse_interval(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("invalid interval '{}'", value))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("invalid interval '{}'", value))
}

/// Parse arguments; usage errors exit with 1, help and version with 0
pub fn parse_or_exit<P: Parser>() -> P {
    match P::try_parse() {
        Ok(parsed) => parsed,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            std::process::exit(1);
        }
        Err(err) => err.exit(),
    }
}

/// Initialize tracing subscriber on stderr
///
/// Warnings are always shown; `--debug` enables everything and `RUST_LOG`
/// refines either level.
pub fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Everything the supervisor needs, detached from clap
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub budget: Option<u64>,
    pub interleave: bool,
    pub rank: u32,
    /// `None` when periodic sampling is disabled
    pub interval: Option<Duration>,
    pub mode: SamplingMode,
    pub start_pattern: Option<String>,
    pub end_pattern: Option<String>,
    pub sync: Option<f64>,
    pub command: Vec<String>,
}

impl SupervisorConfig {
    pub fn placement_policy(&self) -> PlacementPolicy {
        PlacementPolicy::select(self.budget, self.interleave)
    }

    /// Output is only captured when a phase pattern needs it
    pub fn captures_output(&self) -> bool {
        self.start_pattern.is_some() || self.end_pattern.is_some()
    }

    /// Only rank 0 prints availability and reserves memory
    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mode: self.mode,
            rank: self.rank,
            start_pattern: self.start_pattern.clone(),
            end_pattern: self.end_pattern.clone(),
        }
    }
}

impl From<Cli> for SupervisorConfig {
    fn from(cli: Cli) -> Self {
        Self {
            budget: cli.local_size,
            interleave: cli.interleave,
            rank: cli.rank,
            interval: (!cli.interval.is_zero()).then_some(cli.interval),
            mode: if cli.memprof {
                SamplingMode::Hotness
            } else {
                SamplingMode::Locality
            },
            start_pattern: cli.start,
            end_pattern: cli.end,
            sync: cli.sync,
            command: cli.command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::GIB;

    #[test]
    fn test_cli_parses_command() {
        let cli = Cli::parse_from(["emu", "echo", "hello"]);
        assert_eq!(cli.command, vec!["echo", "hello"]);
    }

    #[test]
    fn test_cli_parses_command_after_separator() {
        let cli = Cli::parse_from(["emu", "-l", "2G", "--", "ls", "-la"]);
        assert_eq!(cli.command, vec!["ls", "-la"]);
        assert_eq!(cli.local_size, Some(2 * GIB));
    }

    #[test]
    fn test_cli_target_flags_are_not_ours() {
        let cli = Cli::parse_from(["emu", "-t", "2", "ls", "-l", "-m"]);
        assert_eq!(cli.command, vec!["ls", "-l", "-m"]);
        assert!(!cli.memprof);
        assert_eq!(cli.local_size, None);
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["emu"]).is_err());
        assert!(Cli::try_parse_from(["emu", "-l", "1G"]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["emu", "true"]);
        assert_eq!(cli.rank, 0);
        assert_eq!(cli.interval, Duration::from_secs(1));
        assert!(!cli.interleave);
        assert!(!cli.memprof);
        assert!(!cli.debug);
        assert_eq!(cli.sync, None);
    }

    #[test]
    fn test_cli_rejects_bad_size() {
        assert!(Cli::try_parse_from(["emu", "-l", "5X", "true"]).is_err());
    }

    #[test]
    fn test_cli_rejects_negative_interval() {
        assert!(Cli::try_parse_from(["emu", "-t", "-1", "true"]).is_err());
    }

    #[test]
    fn test_cli_negative_sync_offset() {
        let cli = Cli::parse_from(["emu", "--sync", "-0.25", "true"]);
        assert_eq!(cli.sync, Some(-0.25));
    }

    #[test]
    fn test_zero_interval_disables_sampling() {
        let config = SupervisorConfig::from(Cli::parse_from(["emu", "-t", "0", "true"]));
        assert_eq!(config.interval, None);
    }

    #[test]
    fn test_config_placement_precedence() {
        let config = SupervisorConfig::from(Cli::parse_from(["emu", "-l", "0", "-i", "true"]));
        assert_eq!(config.placement_policy(), PlacementPolicy::FarOnly);

        let config = SupervisorConfig::from(Cli::parse_from(["emu", "-l", "1G", "-i", "true"]));
        assert_eq!(config.placement_policy(), PlacementPolicy::Interleave);

        let config = SupervisorConfig::from(Cli::parse_from(["emu", "true"]));
        assert_eq!(config.placement_policy(), PlacementPolicy::Default);
    }

    #[test]
    fn test_config_session() {
        let config = SupervisorConfig::from(Cli::parse_from([
            "emu", "-m", "-n", "3", "-S", "start*", "-E", "end?", "app",
        ]));
        assert!(config.captures_output());
        assert!(!config.is_leader());

        let session = config.session_config();
        assert_eq!(session.mode, SamplingMode::Hotness);
        assert_eq!(session.rank, 3);
        assert_eq!(session.start_pattern.as_deref(), Some("start*"));
        assert_eq!(session.end_pattern.as_deref(), Some("end?"));
    }

    #[test]
    fn test_aggregate_cli() {
        let cli = AggregateCli::parse_from(["emu-agg", "--format", "json", "a.log", "b.log"]);
        assert_eq!(cli.files.len(), 2);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(AggregateCli::try_parse_from(["emu-agg"]).is_err());
    }
}
