use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{Error, Result};
use crate::util;

/// Expand the convenience aliases for the common desktop triples.
pub fn expand_target_alias(target: &str) -> &str {
    match target {
        "linux" => "x86_64-unknown-linux-gnu",
        "windows" => "x86_64-pc-windows-msvc",
        "darwin" => "x86_64-apple-darwin",
        _ => target,
    }
}

pub fn target_exe_suffix(target: &str) -> &'static str {
    if target.split('-').any(|part| part == "windows") {
        ".exe"
    } else {
        ""
    }
}

pub fn append_exe_suffix(s: &str, target: &str) -> String {
    format!("{s}{}", target_exe_suffix(target))
}

pub fn verify_commands(commands: &[String], valid: &[&str]) -> Result<()> {
    for command in commands {
        if !valid.contains(&command.as_str()) {
            return Err(Error::usage(format!("invalid COMMAND {command:?}")));
        }
    }
    Ok(())
}

pub fn require_specs(specs: Vec<String>) -> Result<Vec<String>> {
    if specs.is_empty() {
        return Err(Error::usage("missing required SPEC; try --select"));
    }
    Ok(specs)
}

pub fn require_targets(
    targets: Vec<String>,
    default: Option<&str>,
) -> Result<Vec<String>> {
    if targets.is_empty() {
        return match default {
            Some(default) => Ok(vec![default.to_owned()]),
            None => {
                Err(Error::usage("missing required TARGET; try --target"))
            }
        };
    }
    Ok(targets)
}

/// Comma/whitespace-split SPEC values, deduped in order.
pub fn normalize_specs(raw: &[String]) -> Vec<String> {
    util::split_flatten_words(raw)
}

/// Normalized TARGET patterns with aliases expanded.
pub fn normalize_targets(raw: &[String]) -> Vec<String> {
    util::normalize_patterns(raw)
        .iter()
        .map(|target| expand_target_alias(target).to_owned())
        .collect()
}

/// Destination tree plus upstream base URL shared by the toolchain and
/// rustup engines.
pub struct DistContext {
    pub dest: PathBuf,
    pub base_url: String,
}

impl DistContext {
    pub fn new(dest: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            dest: dest.into(),
            base_url: base_url.into(),
        }
    }

    pub fn dest_path(&self, rel_path: &str) -> PathBuf {
        self.dest.join(rel_path)
    }

    pub fn rel_path_is_downloaded(&self, rel_path: &str) -> bool {
        self.dest_path(rel_path).is_file()
    }

    /// Absolute URL for `rel_path` below the base URL. Non-URL bases (plain
    /// local paths) are joined textually.
    pub fn url(&self, rel_path: &str) -> Result<String> {
        let mut base = self.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        match Url::parse(&base) {
            Ok(base_url) => Ok(base_url
                .join(rel_path)
                .map_err(|e| {
                    Error::usage(format!(
                        "cannot join {rel_path:?} to {base:?}: {e}"
                    ))
                })?
                .to_string()),
            Err(_) => Ok(format!("{base}{rel_path}")),
        }
    }
}

/// Record one destination path per batch so shared artifacts (e.g. the
/// target-independent `rust-src` tarball) are processed once.
#[derive(Default)]
pub struct ProcessedPaths(std::collections::HashSet<PathBuf>);

impl ProcessedPaths {
    pub fn first_visit(&mut self, path: &Path) -> bool {
        self.0.insert(path.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_aliases() {
        assert_eq!(expand_target_alias("linux"), "x86_64-unknown-linux-gnu");
        assert_eq!(expand_target_alias("darwin"), "x86_64-apple-darwin");
        assert_eq!(expand_target_alias("windows"), "x86_64-pc-windows-msvc");
        assert_eq!(
            expand_target_alias("riscv64gc-unknown-linux-gnu"),
            "riscv64gc-unknown-linux-gnu"
        );
    }

    #[test]
    fn exe_suffix_for_windows_targets() {
        assert_eq!(target_exe_suffix("x86_64-pc-windows-msvc"), ".exe");
        assert_eq!(target_exe_suffix("x86_64-pc-windows-gnu"), ".exe");
        assert_eq!(target_exe_suffix("x86_64-unknown-linux-gnu"), "");
        assert_eq!(
            append_exe_suffix("archive/1.26.0/x86_64-pc-windows-msvc/rustup-init", "x86_64-pc-windows-msvc"),
            "archive/1.26.0/x86_64-pc-windows-msvc/rustup-init.exe"
        );
    }

    #[test]
    fn url_joining() {
        let ctx = DistContext::new("dist", "https://static.rust-lang.org/dist");
        assert_eq!(
            ctx.url("2020-01-30/channel-rust-stable.toml").unwrap(),
            "https://static.rust-lang.org/dist/2020-01-30/channel-rust-stable.toml"
        );

        let local = DistContext::new("dist", "upstream/dist");
        assert_eq!(
            local.url("channel-rust-stable.toml").unwrap(),
            "upstream/dist/channel-rust-stable.toml"
        );
    }

    #[test]
    fn processed_paths_dedup() {
        let mut processed = ProcessedPaths::default();
        assert!(processed.first_visit(Path::new("dist/a")));
        assert!(!processed.first_visit(Path::new("dist/a")));
        assert!(processed.first_visit(Path::new("dist/b")));
    }
}
