use std::path::PathBuf;
use std::sync::Arc;

use romt::download::Downloader;
use romt::toolchain::{Toolchain, ToolchainOpts, TOOLCHAIN_DEFAULT_URL};
use tracing::info;

/// Mirror and manage toolchain artifacts.
///
/// SPEC is `<channel>[-<date>]` or `<date>` with channel one of nightly,
/// beta, stable, or X.Y.Z, and date one of YYYY-MM-DD, latest, or `*`.
/// COMMAND values: fetch-manifest, download, verify, list, all-targets,
/// pack, unpack, fixup.
#[derive(clap::Args)]
pub struct Args {
    /// SPEC values for toolchain selection
    #[arg(short = 's', long = "select", value_name = "SPEC")]
    specs: Vec<String>,

    /// Target to download (alias: linux, windows, darwin; also all, *)
    #[arg(short = 't', long = "target", value_name = "TARGET")]
    targets: Vec<String>,

    /// Download only `rust-std` (for cross-compilation)
    #[arg(long)]
    cross: bool,

    /// Local download directory
    #[arg(long, value_name = "DEST", default_value = "dist")]
    dest: PathBuf,

    /// Base URL of the upstream dist tree
    #[arg(
        long,
        value_name = "URL",
        env = "RUSTUP_DIST_SERVER",
        default_value = TOOLCHAIN_DEFAULT_URL
    )]
    url: String,

    /// Archive file for pack/unpack
    #[arg(long, value_name = "ARCHIVE", default_value = "toolchain.tar.gz")]
    archive: PathBuf,

    /// Keep going even if errors occur
    #[arg(long)]
    keep_going: bool,

    /// Assume already-downloaded files are OK (skip hash check)
    #[arg(long)]
    assume_ok: bool,

    /// Warn (instead of fail) on signature verification failure
    #[arg(long)]
    warn_signature: bool,

    /// Disable all use of signature files (*.asc)
    #[arg(long)]
    no_signature: bool,

    /// Commands to execute in the order given
    #[arg(value_name = "COMMAND")]
    commands: Vec<String>,
}

pub async fn run(args: Args, num_jobs: usize, timeout: u64) -> romt::Result<()> {
    if args.commands.is_empty() {
        info!("Nothing to do (try --help)");
        return Ok(());
    }
    let mut downloader = Downloader::new(num_jobs, timeout)?;
    downloader.set_warn_signature(args.warn_signature);
    let opts = ToolchainOpts {
        specs: args.specs,
        targets: args.targets,
        dest: args.dest,
        url: args.url,
        archive: args.archive,
        cross: args.cross,
        assume_ok: args.assume_ok,
        keep_going: args.keep_going,
        no_signature: args.no_signature,
    };
    Toolchain::new(opts, Arc::new(downloader))
        .run(&args.commands)
        .await
}
