#![forbid(unsafe_code)]

//! Command-line argument parsing for the observation counter.
//!
//! Parses args manually to keep the binary lean. Supports environment
//! variable overrides via the `FTUI_OBSERVE_DEMO_*` prefix.

use std::env;
use std::process;

use ftui_observation::NestedTracking;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP_TEXT: &str = "\
FrankenTUI Observation Counter

Renders a counter view, mutates the model, and re-renders only when the
registrar reports that a property the view read has changed.

USAGE:
    observation-counter [OPTIONS]

OPTIONS:
    --updates=N          Number of count updates to apply (default: 5)
    --background         Apply updates from a background thread
    --nested=MODE        Nested tracking: 'propagate' or 'innermost' (default: propagate)
    --help, -h           Show this help message
    --version, -V        Show version

ENVIRONMENT VARIABLES:
    FTUI_OBSERVE_DEMO_UPDATES     Override --updates
    FTUI_OBSERVE_DEMO_BACKGROUND  Override --background (1/true to enable)
    FTUI_OBSERVE_DEMO_NESTED      Override --nested
    FTUI_OBSERVE_LOG              Log filter (takes precedence over RUST_LOG)
    FTUI_OBSERVE_NESTED           Registrar default nested tracking policy
    FTUI_OBSERVE_CONTRACT_CHECKS  Report did_set calls without will_set (1/true)";

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
    /// Number of count updates to apply.
    pub updates: u32,
    /// Apply updates from a background thread.
    pub background: bool,
    /// Nested tracking policy of the demo registrar.
    pub nested: NestedTracking,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            updates: 5,
            background: false,
            nested: NestedTracking::Propagate,
        }
    }
}

/// Why parsing stopped before producing options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Help,
    Version,
    Invalid(String),
}

impl Opts {
    /// Parse command-line arguments and environment variables.
    ///
    /// Environment variables take precedence over defaults but are overridden
    /// by explicit command-line flags.
    pub fn parse() -> Self {
        let args: Vec<String> = env::args().skip(1).collect();
        match Self::from_sources(&args, |name| env::var(name).ok()) {
            Ok(opts) => opts,
            Err(Exit::Help) => {
                println!("{HELP_TEXT}");
                process::exit(0);
            }
            Err(Exit::Version) => {
                println!("observation-counter {VERSION}");
                process::exit(0);
            }
            Err(Exit::Invalid(message)) => {
                eprintln!("{message}");
                eprintln!("Run with --help for usage information.");
                process::exit(1);
            }
        }
    }

    fn from_sources(args: &[String], lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Exit> {
        let mut opts = Self::default();

        // Env vars first, flags override them below.
        if let Some(val) = lookup("FTUI_OBSERVE_DEMO_UPDATES")
            && let Ok(n) = val.parse()
        {
            opts.updates = n;
        }
        if let Some(val) = lookup("FTUI_OBSERVE_DEMO_BACKGROUND") {
            opts.background = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Some(val) = lookup("FTUI_OBSERVE_DEMO_NESTED")
            && let Some(nested) = NestedTracking::parse(&val)
        {
            opts.nested = nested;
        }

        // Flags.
        for arg in args {
            match arg.as_str() {
                "--help" | "-h" => return Err(Exit::Help),
                "--version" | "-V" => return Err(Exit::Version),
                "--background" => opts.background = true,
                other => {
                    if let Some(val) = other.strip_prefix("--updates=") {
                        opts.updates = val
                            .parse()
                            .map_err(|_| Exit::Invalid(format!("Invalid --updates value: {val}")))?;
                    } else if let Some(val) = other.strip_prefix("--nested=") {
                        opts.nested = NestedTracking::parse(val)
                            .ok_or_else(|| Exit::Invalid(format!("Invalid --nested value: {val}")))?;
                    } else {
                        return Err(Exit::Invalid(format!("Unknown argument: {other}")));
                    }
                }
            }
        }

        Ok(opts)
    }
}
