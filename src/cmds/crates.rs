use std::path::PathBuf;
use std::sync::Arc;

use romt::crates::{Crates, CratesOpts, CRATES_DEFAULT_URL, INDEX_DEFAULT_URL};
use romt::download::Downloader;
use romt::index::INDEX_STANDARD_PATH;
use romt::PrefixStyle;
use tracing::info;

/// Mirror and manage crates from crates.io.
///
/// COMMAND values: init, init-import, config, update (pull prune download
/// mark), export (pull prune download pack mark), import (unpack pull prune
/// verify mark), pull, prune, download, verify, pack, unpack, mark, list.
#[derive(clap::Args)]
pub struct Args {
    /// crates.io-index repository path
    #[arg(long, value_name = "INDEX", default_value = INDEX_STANDARD_PATH)]
    index: PathBuf,

    /// Directory holding the crate files
    #[arg(long, value_name = "CRATES_ROOT", default_value = "crates")]
    crates: PathBuf,

    /// Reference to start of RANGE (`0` for start of repo); defaults to
    /// `mark` with --allow-missing-start implied
    #[arg(long, value_name = "START")]
    start: Option<String>,

    /// Reference to end of RANGE
    #[arg(long, value_name = "END", default_value = "HEAD")]
    end: String,

    /// Treat non-existent START as start of repo instead of an error
    #[arg(long)]
    allow_missing_start: bool,

    /// Record successful paths to file GOOD_PATHS
    #[arg(long, value_name = "GOOD_PATHS")]
    good_paths: Option<PathBuf>,

    /// Record bad paths to file BAD_PATHS
    #[arg(long, value_name = "BAD_PATHS")]
    bad_paths: Option<PathBuf>,

    /// Archive file for pack/unpack
    #[arg(long, value_name = "ARCHIVE", default_value = "crates.tar.gz")]
    archive: PathBuf,

    /// Keep going even if errors occur (helps with missing crates)
    #[arg(long)]
    keep_going: bool,

    /// Assume already-downloaded files are OK (skip hash check)
    #[arg(long)]
    assume_ok: bool,

    /// Template for the crates download URL; {crate}, {version}, {prefix},
    /// and {lowerprefix} parametrize it
    #[arg(long, value_name = "URL", default_value = CRATES_DEFAULT_URL)]
    crates_url: String,

    /// URL of the upstream crates.io-index Git repository for `init`
    #[arg(long, value_name = "URL", default_value = INDEX_DEFAULT_URL)]
    index_url: String,

    /// Local path for origin.bundle for pack/unpack
    #[arg(long, value_name = "BUNDLE_PATH")]
    bundle_path: Option<PathBuf>,

    /// Base URL of the mirror server written to INDEX/config.json by the
    /// `config` command
    #[arg(long, value_name = "URL", default_value = "http://localhost:8000")]
    server_url: String,

    /// Crate path prefix style
    #[arg(long = "prefix", value_name = "STYLE", default_value = "lower")]
    prefix_style: PrefixStyle,

    /// Restrict crates to `<name_glob>[@<version_glob>]` patterns
    #[arg(long = "filter", value_name = "FILTER")]
    filters: Vec<String>,

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
    let opts = CratesOpts {
        index: args.index,
        crates_root: args.crates,
        start: args.start,
        end: args.end,
        allow_missing_start: args.allow_missing_start,
        good_paths_log: args.good_paths,
        bad_paths_log: args.bad_paths,
        archive: args.archive,
        keep_going: args.keep_going,
        assume_ok: args.assume_ok,
        crates_url: args.crates_url,
        index_url: args.index_url,
        bundle_path: args.bundle_path,
        server_url: args.server_url,
        prefix_style: args.prefix_style,
        filters: args.filters,
    };
    Crates::new(opts, downloader)?.run(&args.commands).await
}
