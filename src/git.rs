use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::trace;

use crate::error::{Error, Result};

/// Narrow adapter over the `git` executable.
///
/// All commands run with the repository's directory as the working directory
/// and with any inherited `GIT_*` overrides removed so the repo is resolved
/// from that directory alone.
pub struct GitCli {
    work_dir: PathBuf,
}

impl GitCli {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// Initialize a fresh repository at `path`.
    pub fn init(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        let git = Self::new(path);
        git.run(&["init", "--quiet"])?;
        Ok(git)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn output(&self, args: &[&OsStr]) -> Result<Vec<u8>> {
        trace!("git {:?}", args);
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.work_dir)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE")
            .env_remove("GIT_INDEX_FILE")
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::Git(
                    "`git` command not found; Git is required for this \
                     operation"
                        .to_owned(),
                ),
                _ => Error::Git(e.to_string()),
            })?;
        if !output.status.success() {
            return Err(Error::Git(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(output.stdout)
    }

    fn run_os(&self, args: &[&OsStr]) -> Result<String> {
        let stdout = self.output(args)?;
        Ok(String::from_utf8_lossy(&stdout).trim_end().to_owned())
    }

    pub fn run(&self, args: &[&str]) -> Result<String> {
        let args: Vec<&OsStr> = args.iter().map(OsStr::new).collect();
        self.run_os(&args)
    }

    /// Probe that a usable `git` executable exists.
    pub fn version(&self) -> Result<String> {
        self.run(&["--version"])
    }

    /// Resolve `rev` to a commit id; bad references preserve git's reason.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        match self.run(&["rev-parse", "--verify", &spec]) {
            Ok(commit) => Ok(commit),
            Err(Error::Git(reason)) => Err(Error::Git(format!(
                "bad commit requested ({rev:?}): {reason}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Short name of the branch HEAD points at, or `None` when detached.
    pub fn head_branch(&self) -> Result<Option<String>> {
        match self.run(&["symbolic-ref", "--short", "HEAD"]) {
            Ok(name) => Ok(Some(name)),
            Err(Error::Git(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])
        .is_ok()
    }

    /// `git branch --force <name> <target>`.
    pub fn branch_force(&self, name: &str, target: &str) -> Result<()> {
        self.run(&["branch", "--force", name, target])?;
        Ok(())
    }

    pub fn fetch_origin(&self) -> Result<()> {
        self.run(&["fetch", "origin", "--force"])?;
        Ok(())
    }

    pub fn merge(&self, reference: &str, message: &str) -> Result<()> {
        self.run(&["merge", reference, "-m", message])?;
        Ok(())
    }

    pub fn reset_hard(&self, target: Option<&str>) -> Result<()> {
        let mut args = vec!["reset", "--hard", "--quiet"];
        if let Some(target) = target {
            args.push(target);
        }
        self.run(&args)?;
        Ok(())
    }

    /// Stage one file and commit it.
    pub fn commit_file(&self, rel_path: &str, message: &str) -> Result<()> {
        self.run(&["add", rel_path])?;
        self.run(&["commit", "--quiet", "-m", message])?;
        Ok(())
    }

    pub fn bundle_create(
        &self,
        bundle_path: &Path,
        start: Option<&str>,
        end: &str,
    ) -> Result<()> {
        let exclude;
        let mut args: Vec<&OsStr> = vec![
            OsStr::new("bundle"),
            OsStr::new("create"),
            bundle_path.as_os_str(),
        ];
        if let Some(start) = start {
            exclude = format!("^{start}");
            args.push(OsStr::new(&exclude));
        }
        args.push(OsStr::new(end));
        self.run_os(&args)?;
        Ok(())
    }

    /// All blob paths in the tree at `rev`.
    pub fn ls_tree_names(&self, rev: &str) -> Result<Vec<String>> {
        let stdout =
            self.run(&["ls-tree", "-r", "--name-only", "-z", rev])?;
        Ok(stdout
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Paths differing between the trees at `start` and `end`.
    pub fn diff_names(&self, start: &str, end: &str) -> Result<Vec<String>> {
        let stdout = self.run(&["diff", "--name-only", "-z", start, end])?;
        Ok(stdout
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Contents of the blob at `rev:path`, or `None` when the path does not
    /// exist in that tree.
    pub fn cat_blob(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let spec = format!("{rev}:{path}");
        let args: Vec<&OsStr> = vec![
            OsStr::new("cat-file"),
            OsStr::new("blob"),
            OsStr::new(&spec),
        ];
        match self.output(&args) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::Git(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Point HEAD at `reference` (e.g. an unborn branch).
    pub fn set_head(&self, reference: &str) -> Result<()> {
        self.run(&["symbolic-ref", "HEAD", reference])?;
        Ok(())
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["config", key, value])?;
        Ok(())
    }

    pub fn config_add(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["config", "--add", key, value])?;
        Ok(())
    }

    pub fn remote_add(&self, name: &str, url: &str) -> Result<()> {
        self.run(&["remote", "add", name, url])?;
        Ok(())
    }

    pub fn remote_url(&self, name: &str) -> Result<String> {
        self.run(&["remote", "get-url", name])
    }
}
