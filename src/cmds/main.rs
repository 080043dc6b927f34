#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

mod crates;
mod rustup;
mod toolchain;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "romt",
    version,
    about = "Rust offline mirror tool",
    propagate_version = true
)]
struct Opts {
    /// More verbose output (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less verbose output (repeat for less)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    quiet: u8,

    /// Number of simultaneous download jobs
    #[arg(
        short = 'j',
        long,
        global = true,
        value_name = "JOBS",
        default_value_t = 4
    )]
    num_jobs: usize,

    /// Download timeout in seconds (0 disables)
    #[arg(long, global = true, value_name = "SECONDS", default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    operation: Operation,
}

#[derive(clap::Subcommand)]
enum Operation {
    /// Mirror and manage crates from crates.io
    Crate(crates::Args),

    /// Mirror and manage toolchain artifacts
    Toolchain(toolchain::Args),

    /// Mirror and manage rustup tooling
    Rustup(rustup::Args),
}

fn init_tracing(opts: &Opts) {
    let level = 1 + opts.verbose as i32 - opts.quiet as i32;
    let default_filter = match level {
        i32::MIN..=0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

async fn run(opts: Opts) -> romt::Result<()> {
    let num_jobs = opts.num_jobs.max(1);
    let timeout = opts.timeout;
    match opts.operation {
        Operation::Crate(args) => crates::run(args, num_jobs, timeout).await,
        Operation::Toolchain(args) => {
            toolchain::run(args, num_jobs, timeout).await
        }
        Operation::Rustup(args) => rustup::run(args, num_jobs, timeout).await,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opts = Opts::parse();
    init_tracing(&opts);

    let result = tokio::select! {
        result = run(opts) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Keyboard interrupt");
            std::process::exit(130);
        }
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
