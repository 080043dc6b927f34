use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::archive::{self, ArchiveReader, ArchiveWriter, ARCHIVE_FORMAT_NAME};
use crate::dist;
use crate::download::Downloader;
use crate::error::{Error, Result};
use crate::index::{self, CrateDelta, IndexRepo};
use crate::integrity::HashDigest;
use crate::util;
use crate::{crate_rel_path, Krate, PrefixStyle};

pub const CRATES_DEFAULT_URL: &str =
    "https://static.crates.io/crates/{crate}/{crate}-{version}.crate";

pub const INDEX_DEFAULT_URL: &str =
    "https://github.com/rust-lang/crates.io-index";

const CONFIG_NAME: &str = "config.toml";

const VALID_COMMANDS: &[&str] = &[
    "pull",
    "prune",
    "download",
    "verify",
    "pack",
    "mark",
    "unpack",
    "list",
    "update",
    "export",
    "import",
    "init",
    "init-import",
    "config",
];

fn default_prefix() -> PrefixStyle {
    PrefixStyle::Lower
}

fn default_archive_prefix() -> PrefixStyle {
    PrefixStyle::Mixed
}

/// Persisted per-root configuration (`<crates_root>/config.toml`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CratesConfig {
    #[serde(default = "default_prefix")]
    pub prefix: PrefixStyle,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: PrefixStyle,
}

impl Default for CratesConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            archive_prefix: default_archive_prefix(),
        }
    }
}

impl CratesConfig {
    /// Configuration implied by a root predating `config.toml`.
    pub fn legacy() -> Self {
        Self {
            prefix: PrefixStyle::Mixed,
            archive_prefix: PrefixStyle::Mixed,
        }
    }
}

fn crates_config_path(crates_root: &Path) -> PathBuf {
    crates_root.join(CONFIG_NAME)
}

pub fn read_crates_config(crates_root: &Path) -> Result<CratesConfig> {
    let config_path = crates_config_path(crates_root);
    if !config_path.is_file() {
        return Ok(CratesConfig::legacy());
    }
    toml::from_str(&fs::read_to_string(&config_path)?).map_err(|err| {
        Error::abort(format!(
            "invalid config in {}: {err}",
            config_path.display()
        ))
    })
}

pub fn write_crates_config(
    crates_root: &Path,
    config: &CratesConfig,
) -> Result<()> {
    fs::write(
        crates_config_path(crates_root),
        toml::to_string(config)?,
    )?;
    Ok(())
}

/// Refuse MIXED prefixes on a case-insensitive filesystem, detected by the
/// presence of an uppercased sibling of `config.toml`. Roots without a
/// config file (legacy) are not blocked.
pub fn prevent_mixed_with_case_insensitive(crates_root: &Path) -> Result<()> {
    let config_path = crates_config_path(crates_root);
    if !config_path.is_file() {
        return Ok(());
    }
    let config = read_crates_config(crates_root)?;
    if config.prefix == PrefixStyle::Mixed {
        let upper_config_path =
            config_path.with_file_name(CONFIG_NAME.to_uppercase());
        if upper_config_path.exists() {
            return Err(Error::abort(
                "cannot use mixed-case prefix on case-insensitive share",
            ));
        }
    }
    Ok(())
}

/// Extract `(name, version)` from a member path of the form
/// `.../<name>/<name>-<version>.crate`.
pub fn crate_name_version_from_rel_path(
    rel_path: &str,
) -> Option<(String, String)> {
    let mut parts = rel_path.rsplit('/');
    let basename = parts.next()?;
    let name = parts.next()?;
    parts.next()?;
    let version = basename
        .strip_prefix(name)?
        .strip_prefix('-')?
        .strip_suffix(".crate")?;
    if version.is_empty() {
        return None;
    }
    Some((name.to_owned(), version.to_owned()))
}

/// Selects `(crate, version)` tuples via `<name_glob>[@<version_glob>]`
/// patterns with shell wildcards. An empty filter matches everything; a
/// bare name matches all its versions; a bare `@<vg>` matches all names.
///
/// Name patterns are folded to lowercase to match the index's lowercased
/// lookup names.
#[derive(Clone, Debug, Default)]
pub struct CrateFilter {
    exact: HashMap<String, Vec<Option<glob::Pattern>>>,
    globs: Vec<(glob::Pattern, Option<glob::Pattern>)>,
}

impl CrateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.globs.is_empty()
    }

    pub fn add(&mut self, pattern: &str) -> Result<()> {
        let (name, version) = match pattern.split_once('@') {
            Some((name, version)) => (name, Some(version)),
            None => (pattern, None),
        };
        let name = if name.is_empty() { "*" } else { name };
        let name = name.to_lowercase();
        let version_pattern = version
            .map(glob::Pattern::new)
            .transpose()?;
        if name.contains(['*', '?', '[', ']']) {
            self.globs
                .push((glob::Pattern::new(&name)?, version_pattern));
        } else {
            self.exact.entry(name).or_default().push(version_pattern);
        }
        Ok(())
    }

    pub fn name_matches(&self, name: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        let name = name.to_lowercase();
        self.exact.contains_key(&name)
            || self.globs.iter().any(|(pattern, _)| pattern.matches(&name))
    }

    /// Subset of `versions` selected for `name`.
    pub fn filter_versions(
        &self,
        name: &str,
        versions: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        if self.is_empty() {
            return versions.clone();
        }
        let name = name.to_lowercase();
        let mut version_patterns: Vec<&Option<glob::Pattern>> = Vec::new();
        if let Some(patterns) = self.exact.get(&name) {
            version_patterns.extend(patterns);
        }
        for (name_pattern, version_pattern) in &self.globs {
            if name_pattern.matches(&name) {
                version_patterns.push(version_pattern);
            }
        }
        if version_patterns.is_empty() {
            return BTreeSet::new();
        }
        versions
            .iter()
            .filter(|version| {
                version_patterns.iter().any(|pattern| {
                    pattern
                        .as_ref()
                        .map_or(true, |pattern| pattern.matches(version))
                })
            })
            .cloned()
            .collect()
    }
}

fn download_url(template: &str, krate: &Krate) -> String {
    template
        .replace("{crate}", &krate.name)
        .replace("{version}", &krate.version)
        .replace("{prefix}", &krate.prefix(PrefixStyle::Mixed))
        .replace("{lowerprefix}", &krate.prefix(PrefixStyle::Lower))
}

/// Pack `krates` (and the index bundle, when given) into `archive_path`.
/// Returns `(good, bad)` counts; missing crates abort unless `keep_going`.
pub fn pack_krates(
    krates: &[Krate],
    crates_root: &Path,
    bundle_path: Option<&Path>,
    archive_path: &Path,
    keep_going: bool,
) -> Result<(usize, usize)> {
    let config = read_crates_config(crates_root)?;
    let mut writer = ArchiveWriter::create(archive_path, config.archive_prefix)?;
    if let Some(bundle_path) = bundle_path {
        debug!("[pack] {}", index::BUNDLE_PACKED_NAME);
        writer.append_path(bundle_path, index::BUNDLE_PACKED_NAME)?;
    }

    let mut sorted: Vec<&Krate> = krates.iter().collect();
    sorted.sort_by(|a, b| a.ident().cmp(&b.ident()));

    let mut num_good = 0;
    let mut num_bad = 0;
    for krate in sorted {
        let path = crates_root.join(krate.rel_path(config.prefix));
        let packed_name =
            format!("crates/{}", krate.rel_path(config.archive_prefix));
        debug!("[pack] {}", krate.basename());
        match writer.append_path(&path, &packed_name) {
            Ok(()) => num_good += 1,
            Err(Error::MissingFile(_)) => {
                num_bad += 1;
                error!("missing {}", krate.basename());
                if !keep_going {
                    return Err(Error::abort(format!(
                        "missing {}",
                        krate.basename()
                    )));
                }
            }
            Err(err) => return Err(err),
        }
    }
    writer.finish()?;
    Ok((num_good, num_bad))
}

/// Unpack a crates archive into `crates_root`, landing the index bundle at
/// `bundle_dest`. Stored crate prefixes must match the style declared by
/// `ARCHIVE_FORMAT`; files land per the local `config.toml` style.
pub fn unpack_krates(
    crates_root: &Path,
    bundle_dest: &Path,
    archive_path: &Path,
    keep_going: bool,
) -> Result<usize> {
    let config = read_crates_config(crates_root)?;
    let mut archive_prefix_style: Option<PrefixStyle> = None;
    let mut found_bundle = false;
    let mut num_crates = 0;

    let mut reader = ArchiveReader::open(archive_path)?;
    let mut entries = reader.entries()?;
    while let Some(entry) = entries.next() {
        let mut entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let name = archive::entry_name(&entry)?;
        let Some(style) = archive_prefix_style else {
            if name != ARCHIVE_FORMAT_NAME {
                return Err(Error::UnexpectedArchiveMember(name));
            }
            let style = archive::read_format_entry(&mut entry)?;
            debug!("detected archive prefix style {style:?}");
            archive_prefix_style = Some(style);
            continue;
        };
        if name == ARCHIVE_FORMAT_NAME {
            return Err(Error::abort(
                "unexpected ARCHIVE_FORMAT (not at archive start)",
            ));
        }
        let is_file = entry.header().entry_type().is_file();
        if is_file && name == index::BUNDLE_PACKED_NAME {
            found_bundle = true;
            debug!("[unpack] {}", bundle_dest.display());
            archive::unpack_entry(&mut entry, bundle_dest)?;
        } else if is_file && name.starts_with("crates/") {
            let actual_rel = &name["crates/".len()..];
            archive::checked_member_name(&name)?;
            let Some((crate_name, version)) =
                crate_name_version_from_rel_path(&name)
            else {
                return Err(Error::abort(format!("invalid crate {name}")));
            };
            let expected_rel = crate_rel_path(&crate_name, &version, style);
            if actual_rel != expected_rel {
                return Err(Error::abort(format!(
                    "unexpected crate prefix for {name}"
                )));
            }
            let dest = crates_root
                .join(crate_rel_path(&crate_name, &version, config.prefix));
            debug!("[unpack] {crate_name}-{version}.crate");
            archive::unpack_entry(&mut entry, &dest)?;
            num_crates += 1;
        } else if keep_going {
            warn!("skipping unexpected archive member {name}");
        } else {
            return Err(Error::UnexpectedArchiveMember(name));
        }
    }
    if archive_prefix_style.is_none() {
        return Err(Error::abort("missing ARCHIVE_FORMAT in archive"));
    }
    if !found_bundle {
        return Err(Error::abort(format!(
            "missing {} in archive",
            index::BUNDLE_PACKED_NAME
        )));
    }
    info!("{num_crates} extracted crates");
    Ok(num_crates)
}

pub struct CratesOpts {
    pub index: PathBuf,
    pub crates_root: PathBuf,
    pub start: Option<String>,
    pub end: String,
    pub allow_missing_start: bool,
    pub good_paths_log: Option<PathBuf>,
    pub bad_paths_log: Option<PathBuf>,
    pub archive: PathBuf,
    pub keep_going: bool,
    pub assume_ok: bool,
    pub crates_url: String,
    pub index_url: String,
    pub bundle_path: Option<PathBuf>,
    pub server_url: String,
    pub prefix_style: PrefixStyle,
    pub filters: Vec<String>,
}

/// Mirror engine for the crates.io registry: the Git index plus the crate
/// files it references.
pub struct Crates {
    opts: CratesOpts,
    downloader: Arc<Downloader>,
    filter: CrateFilter,
    repo: Option<IndexRepo>,
    delta: Option<CrateDelta>,
}

impl Crates {
    pub fn new(
        opts: CratesOpts,
        downloader: Arc<Downloader>,
    ) -> Result<Self> {
        let mut filter = CrateFilter::new();
        let patterns = util::normalize_patterns(&opts.filters);
        if patterns != ["*"] {
            for pattern in &patterns {
                filter.add(pattern)?;
            }
        }
        Ok(Self {
            opts,
            downloader,
            filter,
            repo: None,
            delta: None,
        })
    }

    pub async fn run(&mut self, commands: &[String]) -> Result<()> {
        if self.opts.start.is_none() {
            // Without an explicit START, continue from the last mark.
            self.opts.start = Some("mark".to_owned());
            self.opts.allow_missing_start = true;
        }
        prevent_mixed_with_case_insensitive(&self.opts.crates_root)?;
        dist::verify_commands(commands, VALID_COMMANDS)?;

        let mut queue: VecDeque<String> = commands.iter().cloned().collect();
        while let Some(command) = queue.pop_front() {
            info!("{command}...");
            let alias: Option<&[&str]> = match command.as_str() {
                "update" => Some(&["pull", "prune", "download", "mark"]),
                "export" => {
                    Some(&["pull", "prune", "download", "pack", "mark"])
                }
                "import" => {
                    Some(&["unpack", "pull", "prune", "verify", "mark"])
                }
                _ => None,
            };
            if let Some(expansion) = alias {
                for sub in expansion.iter().rev() {
                    queue.push_front(sub.to_string());
                }
                continue;
            }
            match command.as_str() {
                "pull" => self.cmd_pull()?,
                "prune" => self.cmd_prune()?,
                "download" => self.process_crates(true).await?,
                "verify" => self.process_crates(false).await?,
                "pack" => self.cmd_pack()?,
                "mark" => self.cmd_mark()?,
                "unpack" => self.cmd_unpack()?,
                "list" => self.cmd_list()?,
                "init" => self.cmd_init()?,
                "init-import" => self.cmd_init_import()?,
                "config" => self.cmd_config()?,
                _ => unreachable!("command set verified above"),
            }
        }
        Ok(())
    }

    fn repo(&mut self) -> Result<&IndexRepo> {
        if self.repo.is_none() {
            self.repo = Some(IndexRepo::open(&self.opts.index)?);
        }
        Ok(self.repo.as_ref().expect("repo just opened"))
    }

    fn forget_delta(&mut self) {
        self.delta = None;
    }

    /// Start revision for the range, `None` meaning start of history.
    fn start_rev(&mut self) -> Result<Option<String>> {
        let start = self
            .opts
            .start
            .clone()
            .ok_or_else(|| Error::usage("missing START"))?;
        if start == "0" {
            return Ok(None);
        }
        if self.opts.allow_missing_start && !self.repo()?.commit_exists(&start)
        {
            return Ok(None);
        }
        Ok(Some(start))
    }

    fn delta(&mut self) -> Result<&CrateDelta> {
        if self.delta.is_none() {
            debug!("[calculating crate list]");
            let start = self.start_rev()?;
            let end = self.opts.end.clone();
            let filter = self.filter.clone();
            let delta =
                self.repo()?.delta(start.as_deref(), &end, &filter)?;
            debug!(
                "[{} added, {} removed crates in range]",
                delta.added.len(),
                delta.removed.len()
            );
            self.delta = Some(delta);
        }
        Ok(self.delta.as_ref().expect("delta just computed"))
    }

    fn crates_root(&self) -> Result<PathBuf> {
        let path = &self.opts.crates_root;
        if !path.is_dir() {
            return Err(Error::usage(format!(
                "{} is not a valid crates directory",
                path.display()
            )));
        }
        Ok(path.clone())
    }

    /// Local path for the bundle produced by `pack`.
    fn bundle_path(&self) -> Result<PathBuf> {
        let path = match &self.opts.bundle_path {
            Some(path) => path.clone(),
            None => self.opts.index.join(index::BUNDLE_NAME),
        };
        // Absolute because git operations change the working directory.
        Ok(std::path::absolute(path)?)
    }

    /// Bundle path as recorded in the repo's `origin` remote URL (the
    /// destination for `unpack`).
    fn origin_bundle_path(&mut self) -> Result<PathBuf> {
        let url = self.repo()?.origin_url()?;
        let is_remote = match Url::parse(&url) {
            Ok(parsed) => parsed.scheme().len() > 1,
            Err(_) => false,
        };
        if is_remote {
            return Err(Error::usage(
                "INDEX remote `origin` must have `url` as a local file",
            ));
        }
        let path = PathBuf::from(url);
        if let Some(bundle_path) = &self.opts.bundle_path {
            if std::path::absolute(&path)? != std::path::absolute(bundle_path)?
            {
                return Err(Error::usage(
                    "BUNDLE_PATH must match `url` for INDEX's `origin` remote",
                ));
            }
        }
        Ok(path)
    }

    fn cmd_pull(&mut self) -> Result<()> {
        self.forget_delta();
        self.repo()?.pull()
    }

    fn cmd_mark(&mut self) -> Result<()> {
        self.forget_delta();
        let end = self.opts.end.clone();
        self.repo()?.mark(&end)
    }

    fn cmd_list(&mut self) -> Result<()> {
        for krate in &self.delta()?.added {
            println!("{}", krate.basename());
        }
        Ok(())
    }

    /// Delete crate files for removed `(name, version)` tuples, trimming
    /// any directories left empty.
    fn cmd_prune(&mut self) -> Result<()> {
        let crates_root = self.crates_root()?;
        let config = read_crates_config(&crates_root)?;
        let removed = self.delta()?.removed.clone();
        let mut num_pruned = 0;
        for krate in &removed {
            let rel_path = krate.rel_path(config.prefix);
            let path = crates_root.join(&rel_path);
            if path.is_file() {
                debug!("[prune] {}", krate.basename());
                fs::remove_file(&path)?;
                num_pruned += 1;
            }
            if let Some((parent_rel, _)) = rel_path.rsplit_once('/') {
                util::remove_empty_dirs(&crates_root, parent_rel);
            }
        }
        info!("{num_pruned} pruned crates");
        Ok(())
    }

    async fn process_crates(&mut self, download: bool) -> Result<()> {
        let crates_root = self.crates_root()?;
        let config = read_crates_config(&crates_root)?;
        let krates = self.delta()?.added.clone();
        let template = download.then(|| self.opts.crates_url.clone());
        let assume_ok = self.opts.assume_ok;

        let mut good_log = open_log(self.opts.good_paths_log.as_deref())?;
        let mut bad_log = open_log(self.opts.bad_paths_log.as_deref())?;

        let limiter = self.downloader.limiter();
        let mut tasks = tokio::task::JoinSet::new();
        for krate in krates {
            let path = crates_root.join(krate.rel_path(config.prefix));
            let url = template
                .as_deref()
                .map(|template| download_url(template, &krate));
            let permit = limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::abort("download limiter closed"))?;
            let downloader = Arc::clone(&self.downloader);
            tasks.spawn(async move {
                let _permit = permit;
                let result = async {
                    let expected: HashDigest = krate.cksum.parse()?;
                    match &url {
                        Some(url) => {
                            downloader
                                .fetch_verify_hash(
                                    url, &path, &expected, true, assume_ok,
                                )
                                .await
                        }
                        None => downloader.verify_hash(&path, &expected),
                    }
                }
                .await;
                (path, result)
            });
        }

        let mut num_good = 0;
        let mut num_bad = 0;
        while let Some(joined) = tasks.join_next().await {
            let (path, result) = joined.map_err(|err| {
                Error::abort(format!("download task failed: {err}"))
            })?;
            match result {
                Ok(()) => {
                    num_good += 1;
                    log_path(&mut good_log, &path)?;
                }
                Err(err) => {
                    num_bad += 1;
                    error!("{err}");
                    log_path(&mut bad_log, &path)?;
                }
            }
        }
        info!("{num_bad} bad paths, {num_good} good paths");
        if num_bad > 0 && !self.opts.keep_going {
            return Err(Error::abort(format!("{num_bad} bad paths")));
        }
        Ok(())
    }

    fn cmd_pack(&mut self) -> Result<()> {
        let krates = self.delta()?.added.clone();
        if krates.is_empty() {
            info!("No crates to pack");
            return Ok(());
        }
        let bundle_path = self.bundle_path()?;
        let start = self.start_rev()?;
        let end = self.opts.end.clone();
        self.repo()?
            .bundle_create(&bundle_path, start.as_deref(), &end)?;

        let (num_good, num_bad) = pack_krates(
            &krates,
            &self.crates_root()?,
            Some(&bundle_path),
            &self.opts.archive.clone(),
            self.opts.keep_going,
        )?;
        info!("{num_bad} bad paths, {num_good} good paths");
        Ok(())
    }

    fn cmd_unpack(&mut self) -> Result<()> {
        self.forget_delta();
        let bundle_dest = self.origin_bundle_path()?;
        unpack_krates(
            &self.crates_root()?,
            &bundle_dest,
            &self.opts.archive.clone(),
            self.opts.keep_going,
        )?;
        Ok(())
    }

    fn init_common(&self, origin_location: &str) -> Result<IndexRepo> {
        let index_path = &self.opts.index;
        let crates_root = &self.opts.crates_root;
        if index_path.exists() {
            return Err(Error::usage(format!(
                "index directory {} already exists",
                index_path.display()
            )));
        }
        if crates_root.exists() {
            return Err(Error::usage(format!(
                "crates directory {} already exists",
                crates_root.display()
            )));
        }
        info!("create crates directory at {}", crates_root.display());
        fs::create_dir_all(crates_root)?;
        let config = CratesConfig {
            prefix: self.opts.prefix_style,
            ..CratesConfig::default()
        };
        write_crates_config(crates_root, &config)?;
        if let Err(err) = prevent_mixed_with_case_insensitive(crates_root) {
            fs::remove_dir_all(crates_root)?;
            return Err(err);
        }

        info!("create index repository at {}", index_path.display());
        info!("  remote add origin {origin_location}");
        IndexRepo::init(index_path, origin_location)
    }

    fn cmd_init(&mut self) -> Result<()> {
        let index_url = &self.opts.index_url;
        let is_url = match Url::parse(index_url) {
            Ok(parsed) => parsed.scheme().len() > 1,
            Err(_) => false,
        };
        // Relative local directories in Git remotes are interpreted
        // relative to the .git/ directory; pin them down first.
        let origin_location = if is_url {
            index_url.clone()
        } else {
            std::path::absolute(index_url)?.display().to_string()
        };
        self.repo = Some(self.init_common(&origin_location)?);
        Ok(())
    }

    fn cmd_init_import(&mut self) -> Result<()> {
        let bundle_path =
            std::path::absolute(self.opts.index.join(index::BUNDLE_NAME))?;
        let repo = self.init_common(&bundle_path.display().to_string())?;
        repo.add_bundle_refspecs()?;
        self.repo = Some(repo);
        Ok(())
    }

    fn cmd_config(&mut self) -> Result<()> {
        self.forget_delta();
        let server_url = self.opts.server_url.clone();
        let end = self.opts.end.clone();
        let repo = self.repo()?;
        repo.configure(&server_url)?;
        repo.mark(&end)
    }
}

fn open_log(path: Option<&Path>) -> Result<Option<fs::File>> {
    Ok(match path {
        Some(path) => Some(fs::File::create(path)?),
        None => None,
    })
}

fn log_path(log: &mut Option<fs::File>, path: &Path) -> Result<()> {
    if let Some(log) = log {
        writeln!(log, "{}", path.display())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = CratesConfig::default();
        assert_eq!(config.prefix, PrefixStyle::Lower);
        assert_eq!(config.archive_prefix, PrefixStyle::Mixed);
        let legacy = CratesConfig::legacy();
        assert_eq!(legacy.prefix, PrefixStyle::Mixed);
        assert_eq!(legacy.archive_prefix, PrefixStyle::Mixed);
    }

    #[test]
    fn config_round_trip_and_partial_files() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(
            read_crates_config(root.path()).unwrap(),
            CratesConfig::legacy()
        );

        write_crates_config(root.path(), &CratesConfig::default()).unwrap();
        assert_eq!(
            read_crates_config(root.path()).unwrap(),
            CratesConfig::default()
        );

        fs::write(root.path().join(CONFIG_NAME), "prefix = \"mixed\"\n")
            .unwrap();
        let config = read_crates_config(root.path()).unwrap();
        assert_eq!(config.prefix, PrefixStyle::Mixed);
        assert_eq!(config.archive_prefix, PrefixStyle::Mixed);

        fs::write(root.path().join(CONFIG_NAME), "bogus = \"lower\"\n")
            .unwrap();
        assert!(matches!(
            read_crates_config(root.path()),
            Err(Error::Abort(_))
        ));
    }

    #[test]
    fn mixed_prefix_blocked_on_case_insensitive_share() {
        let root = tempfile::tempdir().unwrap();
        write_crates_config(
            root.path(),
            &CratesConfig {
                prefix: PrefixStyle::Mixed,
                archive_prefix: PrefixStyle::Mixed,
            },
        )
        .unwrap();
        prevent_mixed_with_case_insensitive(root.path()).unwrap();

        // Simulate a case-insensitive filesystem's view of config.toml.
        fs::write(root.path().join("CONFIG.TOML"), "").unwrap();
        assert!(matches!(
            prevent_mixed_with_case_insensitive(root.path()),
            Err(Error::Abort(_))
        ));
    }

    #[test]
    fn name_version_parsing() {
        assert_eq!(
            crate_name_version_from_rel_path("crates/1/a/a-0.1.0.crate"),
            Some(("a".to_owned(), "0.1.0".to_owned()))
        );
        assert_eq!(
            crate_name_version_from_rel_path(
                "crates/se/rd/serde_json/serde_json-1.0.0.crate"
            ),
            Some(("serde_json".to_owned(), "1.0.0".to_owned()))
        );
        // Basename must repeat the containing directory name.
        assert_eq!(
            crate_name_version_from_rel_path("crates/1/a/b-0.1.0.crate"),
            None
        );
        assert_eq!(crate_name_version_from_rel_path("a-0.1.0.crate"), None);
        assert_eq!(
            crate_name_version_from_rel_path("crates/1/a/a-.crate"),
            None
        );
    }

    #[test]
    fn download_url_substitution() {
        let krate = Krate::new("AbCd", "0.1.0", "");
        assert_eq!(
            download_url(CRATES_DEFAULT_URL, &krate),
            "https://static.crates.io/crates/AbCd/AbCd-0.1.0.crate"
        );
        assert_eq!(
            download_url("{prefix}|{lowerprefix}", &krate),
            "Ab/Cd|ab/cd"
        );
    }

    fn versions(strs: &[&str]) -> BTreeSet<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = CrateFilter::new();
        assert!(filter.name_matches("arbitrary"));
        assert_eq!(
            filter.filter_versions("name", &versions(&["1", "2"])),
            versions(&["1", "2"])
        );
    }

    #[test]
    fn filter_exact_name_and_version() {
        let mut filter = CrateFilter::new();
        filter.add("name@1.0.0").unwrap();
        assert!(!filter.name_matches("arbitrary"));
        assert!(filter
            .filter_versions("arbitrary", &versions(&["1", "2"]))
            .is_empty());
        assert!(filter.name_matches("name"));
        assert_eq!(
            filter.filter_versions("name", &versions(&["2", "1.0.0"])),
            versions(&["1.0.0"])
        );

        // A bare name matches all its versions.
        filter.add("name").unwrap();
        assert_eq!(
            filter.filter_versions("name", &versions(&["1", "2", "3"])),
            versions(&["1", "2", "3"])
        );

        filter.add("name2@2.0").unwrap();
        filter.add("name2@2.1").unwrap();
        filter.add("name2@3.7").unwrap();
        assert_eq!(
            filter.filter_versions("name2", &versions(&["1.0", "2.1", "3.5"])),
            versions(&["2.1"])
        );
    }

    #[test]
    fn filter_glob_patterns() {
        let mut filter = CrateFilter::new();
        filter.add("nam*@3.0").unwrap();
        assert!(filter.name_matches("name8"));
        assert_eq!(
            filter.filter_versions("name3", &versions(&["1.0", "3.0"])),
            versions(&["3.0"])
        );

        filter.add("[ab]*[yz]?@[!12]*").unwrap();
        assert!(filter.name_matches("ably1"));
        assert!(!filter.name_matches("ably"));
        assert!(filter.name_matches("buzz!"));
        assert!(!filter.name_matches("cuzz!"));
        assert_eq!(
            filter.filter_versions("ably1", &versions(&["11", "21", "31"])),
            versions(&["31"])
        );
        assert!(filter
            .filter_versions("buzz!", &versions(&["1.0", "1.1"]))
            .is_empty());
    }

    #[test]
    fn filter_bare_version_pattern() {
        let mut filter = CrateFilter::new();
        filter.add("@8").unwrap();
        assert!(filter.name_matches("any-crate"));
        assert_eq!(
            filter.filter_versions("any-crate", &versions(&["8", "9"])),
            versions(&["8"])
        );
    }

    #[test]
    fn filter_names_fold_case() {
        let mut filter = CrateFilter::new();
        filter.add("Inflector").unwrap();
        assert!(filter.name_matches("inflector"));
        assert!(filter.name_matches("Inflector"));
    }
}
