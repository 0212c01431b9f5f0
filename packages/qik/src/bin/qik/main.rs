//! The binary entrypoint for `qik`, the cached command runner.

use std::process::ExitCode;

use clap::{Parser, crate_version};

use qik::config::CachePolicy;
use qik::error;
use qik::select::CacheStatus;

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
//
// Relatedly, in this file specifically nothing should be `pub`.
mod cmd;
mod log;

/// Select, execute, and cache commands across the repository.
#[derive(Clone, Debug, Parser)]
#[command(
    name = "qik",
    about = "A cached command runner for modular monorepos",
    version = crate_version!(),
)]
struct Args {
    /// Command names to select; exact, dotted, or glob patterns.
    names: Vec<String>,

    /// Select runnables of these modules.
    #[arg(short = 'm', long = "module")]
    modules: Vec<String>,

    /// Select runnables of these spaces.
    #[arg(short = 's', long = "space")]
    spaces: Vec<String>,

    /// Worker slots; defaults to the logical CPU count.
    #[arg(short = 'n', long = "workers", env = "QIK__WORKERS")]
    workers: Option<usize>,

    /// Bypass cache lookup; entries are still stored per policy.
    #[arg(short = 'f', long = "force", env = "QIK__FORCE")]
    force: bool,

    /// Drop soft transitive upstreams from the selection.
    #[arg(long, env = "QIK__ISOLATED")]
    isolated: bool,

    /// Re-run the selection when watched files change.
    #[arg(long, env = "QIK__WATCH")]
    watch: bool,

    /// Select runnables affected by files changed since the git ref.
    #[arg(long, env = "QIK__SINCE")]
    since: Option<String>,

    /// List the selection without executing anything.
    #[arg(long, env = "QIK__LS")]
    ls: bool,

    /// With --ls: exit non-zero when the selection is non-empty.
    #[arg(long, env = "QIK__FAIL")]
    fail: bool,

    /// Override the assigned cache for selected runnables.
    #[arg(long, env = "QIK__CACHE")]
    cache: Option<String>,

    /// Override the cache policy for selected runnables.
    #[arg(long = "cache-when", env = "QIK__CACHE_WHEN")]
    cache_when: Option<CachePolicy>,

    /// Select by cache status, probing with current fingerprints.
    #[arg(long = "cache-status")]
    cache_status: Option<CacheStatus>,

    /// Select runnables whose assigned cache has this backend type.
    #[arg(long = "cache-type")]
    cache_type: Option<String>,

    /// The context profile.
    #[arg(short = 'p', long = "profile", env = "QIK__PROFILE")]
    profile: Option<String>,

    /// Output verbosity: 0 status only, 1 streamed output, 2 debug.
    #[arg(short = 'v', long = "verbosity", env = "QIK__VERBOSITY", default_value_t = 1)]
    verbosity: u8,

    /// Remove local cache entries for runnables that no longer exist.
    #[arg(long)]
    prune: bool,

    /// Git merge driver mode for repo cache entries.
    #[arg(
        long = "merge-cache",
        num_args = 3,
        value_names = ["ANCESTOR", "CURRENT", "OTHER"],
        hide = true
    )]
    merge_cache: Option<Vec<String>>,

    /// When to colorize output.
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = color_eyre::install() {
        eprintln!("{err:?}");
        return ExitCode::from(3);
    }
    let args = Args::parse();
    if args.color == log::WhenColor::Never {
        colored::control::set_override(false);
    }
    if let Err(err) = log::init_logger(std::io::stderr, args.verbosity, args.color) {
        eprintln!("{err:?}");
        return ExitCode::from(3);
    }

    match cmd::exec(args).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            report(&err);
            ExitCode::from(error::report_exit_code(&err) as u8)
        }
    }
}

fn report(err: &color_eyre::Report) {
    match err.downcast_ref::<error::Error>() {
        Some(typed) => eprintln!("{}", typed.diagnostic()),
        None => eprintln!("error: {err:#}"),
    }
}
