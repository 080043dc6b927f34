use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::crates::CrateFilter;
use crate::error::{Error, Result};
use crate::git::GitCli;
use crate::Krate;

pub const INDEX_NAME: &str = "crates.io-index";

/// Standard location of the index repository below the mirror root.
pub const INDEX_STANDARD_PATH: &str = "git/crates.io-index";

pub const BUNDLE_NAME: &str = "origin.bundle";

/// Archive member name for the packed index bundle.
pub const BUNDLE_PACKED_NAME: &str = "git/crates.io-index/origin.bundle";

const WORKING_BRANCH: &str = "working";
const CONFIG_JSON: &str = "config.json";

/// True for blob paths of the canonical crates-index shape
/// (`1/x`, `2/xx`, `3/x/xxx`, `xx/xx/xxxx+`).
pub fn is_index_blob_path(path: &str) -> bool {
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        ["1", name] => name.chars().count() == 1,
        ["2", name] => name.chars().count() == 2,
        ["3", c0, name] => {
            c0.chars().count() == 1 && name.chars().count() == 3
        }
        [p0, p1, name] => {
            p0.chars().count() == 2
                && p1.chars().count() == 2
                && name.chars().count() >= 4
        }
        _ => false,
    }
}

fn blob_crate_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[derive(Deserialize)]
struct IndexLine {
    name: String,
    vers: String,
    cksum: String,
}

/// Crates recorded in one index blob, keyed by version; later lines win.
fn blob_versions(blob: &[u8]) -> Result<BTreeMap<String, Krate>> {
    let mut versions = BTreeMap::new();
    for line in blob.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let entry: IndexLine = serde_json::from_slice(line)?;
        versions.insert(
            entry.vers.clone(),
            Krate::new(entry.name, entry.vers, entry.cksum),
        );
    }
    Ok(versions)
}

/// Added and removed crate versions between two revisions of the index.
#[derive(Clone, Debug, Default)]
pub struct CrateDelta {
    pub added: Vec<Krate>,
    pub removed: Vec<Krate>,
}

/// Delta for a single index blob: a version is `added` when its
/// `(version, checksum)` pair is new in the end blob, and `removed` when it
/// exists only in the start blob. The filter applies to the union of
/// versions on both sides.
pub fn blob_delta(
    old_blob: &[u8],
    new_blob: &[u8],
    filter: &CrateFilter,
) -> Result<(Vec<Krate>, Vec<Krate>)> {
    let old_versions = blob_versions(old_blob)?;
    let new_versions = blob_versions(new_blob)?;

    let name = new_versions
        .values()
        .chain(old_versions.values())
        .map(|krate| krate.name.clone())
        .next()
        .unwrap_or_default();
    let union: BTreeSet<String> = old_versions
        .keys()
        .chain(new_versions.keys())
        .cloned()
        .collect();
    let keep = filter.filter_versions(&name, &union);

    let added = new_versions
        .values()
        .filter(|krate| {
            keep.contains(&krate.version)
                && old_versions
                    .get(&krate.version)
                    .map(|old| old.cksum != krate.cksum)
                    .unwrap_or(true)
        })
        .cloned()
        .collect();
    let removed = old_versions
        .values()
        .filter(|krate| {
            keep.contains(&krate.version)
                && !new_versions.contains_key(&krate.version)
        })
        .cloned()
        .collect();
    Ok((added, removed))
}

/// A crates.io-index working tree with a persistent local `working` branch.
pub struct IndexRepo {
    path: PathBuf,
    git: GitCli,
}

impl IndexRepo {
    /// Open an existing index repository, probing for a usable `git`.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            return Err(Error::usage(format!(
                "{} is not a valid index directory",
                path.display()
            )));
        }
        let git = GitCli::new(path);
        git.version()?;
        Ok(Self {
            path: path.to_owned(),
            git,
        })
    }

    /// Create a fresh index repository whose HEAD is the unborn `working`
    /// branch tracking `origin/master`.
    pub fn init(path: &Path, origin_url: &str) -> Result<Self> {
        let git = GitCli::init(path)?;
        git.remote_add("origin", origin_url)?;
        git.set_head("refs/heads/working")?;
        git.config_set("branch.working.remote", "origin")?;
        git.config_set("branch.working.merge", "refs/heads/master")?;
        Ok(Self {
            path: path.to_owned(),
            git,
        })
    }

    /// `init` for the import side: origin is the local bundle file, and the
    /// fetch refspecs map the bundle's branches into `origin/*`.
    pub fn init_import(path: &Path, bundle_path: &Path) -> Result<Self> {
        let repo = Self::init(path, &bundle_path.display().to_string())?;
        repo.add_bundle_refspecs()?;
        Ok(repo)
    }

    /// Map the bundle's `bundle/*` branches into `origin/*` on fetch.
    pub fn add_bundle_refspecs(&self) -> Result<()> {
        self.git.config_set(
            "remote.origin.fetch",
            "+refs/heads/*:refs/remotes/origin/*",
        )?;
        self.git.config_add(
            "remote.origin.fetch",
            "+refs/heads/bundle/*:refs/remotes/origin/*",
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn origin_url(&self) -> Result<String> {
        self.git.remote_url("origin")
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        self.git.rev_parse(rev)
    }

    pub fn commit_exists(&self, rev: &str) -> bool {
        self.git.rev_parse(rev).is_ok()
    }

    fn config_json_path(&self) -> PathBuf {
        self.path.join(CONFIG_JSON)
    }

    pub fn read_config_json(&self) -> Result<Option<Vec<u8>>> {
        let path = self.config_json_path();
        if path.is_file() {
            Ok(Some(fs::read(&path)?))
        } else {
            Ok(None)
        }
    }

    /// Write and commit `config.json` when its bytes differ from what is
    /// already present.
    pub fn update_config_json(&self, config: &[u8]) -> Result<()> {
        let old_config = self.read_config_json()?;
        if old_config.as_deref() != Some(config) {
            let path = self.config_json_path();
            debug!("update-config: {}", path.display());
            fs::write(&path, config)?;
            self.git
                .commit_file(CONFIG_JSON, "Apply config.json adjustments")?;
        }
        Ok(())
    }

    /// Rewrite `config.json` to point downloads at `server_url`.
    pub fn configure(&self, server_url: &str) -> Result<()> {
        let mut server_url = server_url.to_owned();
        if !server_url.ends_with('/') {
            server_url.push('/');
        }
        let config = serde_json::json!({
            "dl": format!(
                "{server_url}crates/{{crate}}/{{crate}}-{{version}}.crate"
            ),
            "api": server_url,
        });
        let mut bytes = serde_json::to_vec_pretty(&config)?;
        bytes.push(b'\n');
        self.update_config_json(&bytes)
    }

    /// Migrate a pre-`working` checkout: branch `working` at HEAD (when one
    /// exists) and point HEAD at it.
    fn upgrade_to_working(&self) -> Result<()> {
        let head = self.git.head_branch()?;
        if head.as_deref() == Some(WORKING_BRANCH)
            || self.git.branch_exists(WORKING_BRANCH)
        {
            return Ok(());
        }
        warn!("upgrade index to use \"working\" branch as HEAD");
        if self.commit_exists("HEAD") {
            info!("checkout new \"working\" branch from current HEAD");
            self.git.branch_force(WORKING_BRANCH, "HEAD")?;
        }
        self.git.set_head("refs/heads/working")
    }

    /// Fetch origin and merge `origin/master` into `working`, falling back
    /// to a hard reset when the merge fails. A pre-existing `config.json` is
    /// restored (and committed) afterward either way.
    pub fn pull(&self) -> Result<()> {
        self.git.fetch_origin()?;
        self.git
            .branch_force("origin_master", "remotes/origin/master")?;
        self.upgrade_to_working()?;

        let initial_config = self.read_config_json()?;
        debug!("merge-index: merge origin/master");
        match self
            .git
            .merge("remotes/origin/master", "Merge origin/master")
        {
            Ok(()) => {}
            Err(Error::Git(reason)) => {
                info!("merge-index: merge failed; reconstructing");
                debug!("merge-index: {reason}");
                self.git.reset_hard(None)?;
                self.git.reset_hard(Some("remotes/origin/master"))?;
            }
            Err(err) => return Err(err),
        }
        if let Some(config) = initial_config {
            self.update_config_json(&config)?;
        }
        Ok(())
    }

    /// Force local branches `mark` and `master` to `end`, skipping whichever
    /// is the current HEAD.
    pub fn mark(&self, end: &str) -> Result<()> {
        let head = self.git.head_branch()?;
        for branch in ["mark", "master"] {
            if head.as_deref() == Some(branch) {
                warn!("will not move branch {branch:?} (it is current HEAD)");
            } else {
                info!("move branch {branch:?} to point to {end:?}");
                self.git.branch_force(branch, end)?;
            }
        }
        Ok(())
    }

    /// Create a bundle of `start..end` that always exposes a `master`
    /// branch for the import side.
    pub fn bundle_create(
        &self,
        bundle_path: &Path,
        start: Option<&str>,
        end: &str,
    ) -> Result<()> {
        let bundle_end = if end == "master" {
            end
        } else {
            self.git.branch_force("bundle/master", end)?;
            "bundle/master"
        };
        self.git.bundle_create(bundle_path, start, bundle_end)
    }

    /// Added and removed crate versions between `start` and `end`.
    ///
    /// A `start` of `None` treats the delta as everything present at `end`.
    /// The filter is applied per blob by lowercased crate name before the
    /// blob is read at all.
    pub fn delta(
        &self,
        start: Option<&str>,
        end: &str,
        filter: &CrateFilter,
    ) -> Result<CrateDelta> {
        let end_commit = self.rev_parse(end)?;
        let start_commit = match start {
            Some(start) => Some(self.rev_parse(start)?),
            None => None,
        };

        let paths = match &start_commit {
            Some(start_commit) => {
                self.git.diff_names(start_commit, &end_commit)?
            }
            None => self.git.ls_tree_names(&end_commit)?,
        };

        let mut added: BTreeMap<(String, String), Krate> = BTreeMap::new();
        let mut removed: BTreeMap<(String, String), Krate> = BTreeMap::new();
        for path in paths {
            if !is_index_blob_path(&path) {
                continue;
            }
            if !filter.name_matches(&blob_crate_name(&path).to_lowercase()) {
                continue;
            }
            let old_blob = match &start_commit {
                Some(start_commit) => self
                    .git
                    .cat_blob(start_commit, &path)?
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            let new_blob = self
                .git
                .cat_blob(&end_commit, &path)?
                .unwrap_or_default();
            let (blob_added, blob_removed) =
                blob_delta(&old_blob, &new_blob, filter)?;
            for krate in blob_added {
                added.insert(
                    (krate.name.clone(), krate.version.clone()),
                    krate,
                );
            }
            for krate in blob_removed {
                removed.insert(
                    (krate.name.clone(), krate.version.clone()),
                    krate,
                );
            }
        }
        Ok(CrateDelta {
            added: added.into_values().collect(),
            removed: removed.into_values().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_path_shapes() {
        assert!(is_index_blob_path("1/a"));
        assert!(is_index_blob_path("2/ab"));
        assert!(is_index_blob_path("3/a/abc"));
        assert!(is_index_blob_path("ab/cd/abcd"));
        assert!(is_index_blob_path("ab/cd/abcdefgh"));

        assert!(!is_index_blob_path("config.json"));
        assert!(!is_index_blob_path("1/ab"));
        assert!(!is_index_blob_path("2/a"));
        assert!(!is_index_blob_path("3/ab/abc"));
        assert!(!is_index_blob_path("3/a/ab"));
        assert!(!is_index_blob_path("a/cd/abcd"));
        assert!(!is_index_blob_path("ab/cd/abc"));
        assert!(!is_index_blob_path("ab/cd/ef/abcdef"));
    }

    fn line(name: &str, vers: &str, cksum: &str) -> String {
        format!(
            r#"{{"name":"{name}","vers":"{vers}","cksum":"{cksum}","deps":[],"features":{{}},"yanked":false}}"#
        )
    }

    #[test]
    fn delta_from_empty_start() {
        let new_blob = format!(
            "{}\n{}\n",
            line("foo", "1.0.0", "aa"),
            line("foo", "1.1.0", "bb")
        );
        let (added, removed) =
            blob_delta(b"", new_blob.as_bytes(), &CrateFilter::default())
                .unwrap();
        assert_eq!(added.len(), 2);
        assert!(removed.is_empty());
    }

    #[test]
    fn delta_detects_added_removed_and_republished() {
        let old_blob = format!(
            "{}\n{}\n",
            line("foo", "1.0.0", "aa"),
            line("foo", "1.1.0", "bb")
        );
        let new_blob = format!(
            "{}\n{}\n",
            line("foo", "1.1.0", "b2"),
            line("foo", "1.2.0", "cc")
        );
        let (added, removed) = blob_delta(
            old_blob.as_bytes(),
            new_blob.as_bytes(),
            &CrateFilter::default(),
        )
        .unwrap();
        let added_versions: Vec<&str> =
            added.iter().map(|k| k.version.as_str()).collect();
        assert_eq!(added_versions, vec!["1.1.0", "1.2.0"]);
        let removed_versions: Vec<&str> =
            removed.iter().map(|k| k.version.as_str()).collect();
        assert_eq!(removed_versions, vec!["1.0.0"]);
    }

    #[test]
    fn delta_last_line_wins_per_version() {
        let new_blob = format!(
            "{}\n{}\n",
            line("foo", "1.0.0", "aa"),
            line("foo", "1.0.0", "a2")
        );
        let (added, _) =
            blob_delta(b"", new_blob.as_bytes(), &CrateFilter::default())
                .unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].cksum, "a2");
    }

    #[test]
    fn delta_honors_version_filter() {
        let mut filter = CrateFilter::default();
        filter.add("foo@1.0.0").unwrap();
        let old_blob = line("foo", "1.2.0", "cc");
        let new_blob = format!(
            "{}\n{}\n",
            line("foo", "1.0.0", "aa"),
            line("foo", "1.1.0", "bb")
        );
        let (added, removed) = blob_delta(
            old_blob.as_bytes(),
            new_blob.as_bytes(),
            &filter,
        )
        .unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].version, "1.0.0");
        // 1.2.0 disappeared but is excluded by the filter.
        assert!(removed.is_empty());
    }
}
