use std::path::PathBuf;
use std::sync::Arc;

use romt::download::Downloader;
use romt::rustup::{Rustup, RustupOpts, RUSTUP_DEFAULT_URL};
use tracing::info;

/// Mirror and manage rustup tooling.
///
/// SPEC is X.Y.Z, stable, latest, or `*`. COMMAND values: download, verify,
/// list, all-targets, pack, unpack, fixup.
#[derive(clap::Args)]
pub struct Args {
    /// SPEC values for rustup selection
    #[arg(short = 's', long = "select", value_name = "SPEC")]
    specs: Vec<String>,

    /// Target to download (alias: linux, windows, darwin; also all, *)
    #[arg(short = 't', long = "target", value_name = "TARGET")]
    targets: Vec<String>,

    /// Local download directory
    #[arg(long, value_name = "DEST", default_value = "rustup")]
    dest: PathBuf,

    /// Base URL of the upstream rustup tree
    #[arg(
        long,
        value_name = "URL",
        env = "RUSTUP_UPDATE_ROOT",
        default_value = RUSTUP_DEFAULT_URL
    )]
    url: String,

    /// Archive file for pack/unpack
    #[arg(long, value_name = "ARCHIVE", default_value = "rustup.tar.gz")]
    archive: PathBuf,

    /// Keep going even if errors occur
    #[arg(long)]
    keep_going: bool,

    /// Assume already-downloaded files are OK (skip hash check)
    #[arg(long)]
    assume_ok: bool,

    /// Commands to execute in the order given
    #[arg(value_name = "COMMAND")]
    commands: Vec<String>,
}

pub async fn run(args: Args, num_jobs: usize, timeout: u64) -> romt::Result<()> {
    if args.commands.is_empty() {
        info!("Nothing to do (try --help)");
        return Ok(());
    }
    let downloader = Arc::new(Downloader::new(num_jobs, timeout)?);
    let opts = RustupOpts {
        specs: args.specs,
        targets: args.targets,
        dest: args.dest,
        url: args.url,
        archive: args.archive,
        assume_ok: args.assume_ok,
        keep_going: args.keep_going,
    };
    Rustup::new(opts, downloader).run(&args.commands).await
}
