use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::integrity::HashDigest;

pub fn target_matches_any(target: &str, expected_targets: &[String]) -> bool {
    if target == "*" {
        return true;
    }
    expected_targets
        .iter()
        .any(|expected| target == expected || expected == "*")
}

#[derive(Clone, Debug, Deserialize)]
struct TargetDetails {
    available: bool,
    xz_url: Option<String>,
    xz_hash: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct PackageDetails {
    version: Option<String>,
    #[serde(default)]
    target: BTreeMap<String, TargetDetails>,
}

#[derive(Clone, Debug, Deserialize)]
struct ManifestToml {
    date: String,
    pkg: BTreeMap<String, PackageDetails>,
}

/// Classification of a target based on which of its packages are on hand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetType {
    /// Has a `rustc` package for the triple.
    Native,
    /// Has `rust-std` but no `rustc` (cross-compilation support only).
    Cross,
    /// Neither compiler nor standard library.
    Minimal,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetType::Native => "native-target",
            TargetType::Cross => "cross-target",
            TargetType::Minimal => "minimal",
        })
    }
}

/// Flattened `(package, target)` view of one manifest entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Package {
    pub name: String,
    pub target: String,
    pub available: bool,
    xz_url: Option<String>,
    xz_hash: Option<String>,
}

const DIST_PREFIX: &str = "/dist/";

impl Package {
    pub fn has_rel_path(&self) -> bool {
        self.xz_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// Upstream path relative to the dist root, derived from `xz_url`.
    pub fn rel_path(&self) -> Result<String> {
        let url = self.xz_url.as_deref().unwrap_or_default();
        url.find(DIST_PREFIX)
            .map(|index| url[index + DIST_PREFIX.len()..].to_owned())
            .ok_or_else(|| {
                Error::abort(format!(
                    "package {}/{} missing xz_url",
                    self.name, self.target
                ))
            })
    }

    pub fn hash(&self) -> Result<HashDigest> {
        self.xz_hash
            .as_deref()
            .ok_or_else(|| {
                Error::abort(format!(
                    "package {}/{} missing xz_hash",
                    self.name, self.target
                ))
            })?
            .parse()
    }
}

/// Parsed view of a toolchain channel manifest (`channel-rust-*.toml`).
#[derive(Clone, Debug)]
pub struct Manifest {
    raw: ManifestToml,
}

impl Manifest {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(Self {
            raw: toml::from_str(contents)?,
        })
    }

    pub fn from_toml_path(toml_path: &Path) -> Result<Self> {
        if !toml_path.is_file() {
            return Err(Error::MissingFile(toml_path.to_owned()));
        }
        Self::from_toml_str(&std::fs::read_to_string(toml_path)?)
    }

    fn rust_src_version(&self) -> Result<&str> {
        self.raw
            .pkg
            .get("rust-src")
            .and_then(|pkg| pkg.version.as_deref())
            .ok_or_else(|| {
                Error::abort("manifest lacks a rust-src package version")
            })
    }

    /// Channel inferred from the `rust-src` version string, e.g.
    /// `"1.44.0-nightly (42abbd887 2020-04-07)"` is `nightly`.
    pub fn channel(&self) -> Result<&'static str> {
        let version = self.rust_src_version()?;
        Ok(if version.contains("-beta") {
            "beta"
        } else if version.contains("-nightly") {
            "nightly"
        } else {
            "stable"
        })
    }

    /// Bare `X.Y.Z` version, stripped of channel tag and build metadata.
    pub fn version(&self) -> Result<String> {
        let version = self.rust_src_version()?;
        Ok(version
            .split('-')
            .next()
            .unwrap_or_default()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_owned())
    }

    pub fn date(&self) -> &str {
        &self.raw.date
    }

    /// `<channel>-<date>`, e.g. `stable-2020-01-30`.
    pub fn spec(&self) -> Result<String> {
        Ok(format!("{}-{}", self.channel()?, self.date()))
    }

    /// `<spec>(<version>)`, e.g. `stable-2020-01-30(1.41.0)`.
    pub fn ident(&self) -> Result<String> {
        Ok(format!("{}({})", self.spec()?, self.version()?))
    }

    pub fn all_packages(&self) -> Vec<Package> {
        let mut packages = Vec::new();
        for (name, details) in &self.raw.pkg {
            for (target, target_details) in &details.target {
                packages.push(Package {
                    name: name.clone(),
                    target: target.clone(),
                    available: target_details.available,
                    xz_url: target_details.xz_url.clone(),
                    xz_hash: target_details.xz_hash.clone(),
                });
            }
        }
        packages
    }

    /// Available packages, optionally restricted to `targets` and to
    /// packages whose `rel_path` satisfies `present`.
    pub fn available_packages(
        &self,
        targets: Option<&[String]>,
        present: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<Vec<Package>> {
        let all_targets = [String::from("*")];
        let target_list = targets.unwrap_or(&all_targets);
        let mut packages = Vec::new();
        for package in self.all_packages() {
            if !package.available
                || !target_matches_any(&package.target, target_list)
            {
                continue;
            }
            if let Some(present) = present {
                if !present(&package.rel_path()?) {
                    continue;
                }
            }
            packages.push(package);
        }
        Ok(packages)
    }

    pub fn all_targets(&self) -> Vec<String> {
        let mut targets: BTreeSet<String> = self
            .all_packages()
            .into_iter()
            .map(|p| p.target)
            .collect();
        targets.remove("*");
        targets.into_iter().collect()
    }

    pub fn available_targets(
        &self,
        targets: Option<&[String]>,
        present: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<Vec<String>> {
        let mut available: BTreeSet<String> = self
            .available_packages(targets, present)?
            .into_iter()
            .map(|p| p.target)
            .collect();
        available.remove("*");
        Ok(available.into_iter().collect())
    }

    /// Per-target classification of what is on hand.
    ///
    /// A target is reported only when all of its available packages are
    /// present, or when at least one present package has a `rel_path` unique
    /// to the target (i.e. not an artifact shared across targets).
    pub fn available_target_types(
        &self,
        targets: Option<&[String]>,
        present: Option<&dyn Fn(&str) -> bool>,
    ) -> Result<BTreeMap<String, TargetType>> {
        let mut target_packages: HashMap<&str, Vec<&Package>> = HashMap::new();
        let mut rel_path_targets: HashMap<String, HashSet<&str>> =
            HashMap::new();
        let all_available = self.available_packages(None, None)?;
        for package in &all_available {
            target_packages
                .entry(package.target.as_str())
                .or_default()
                .push(package);
            rel_path_targets
                .entry(package.rel_path()?)
                .or_default()
                .insert(package.target.as_str());
        }

        let target_list: Vec<String> = match targets {
            Some(targets) => {
                let mut list = targets.to_vec();
                list.sort();
                list
            }
            None => self.available_targets(None, None)?,
        };

        let mut target_types = BTreeMap::new();
        for target in target_list {
            let Some(packages) = target_packages.get(target.as_str()) else {
                continue;
            };
            let mut have_all_rel_paths = true;
            let mut have_unique_rel_path = false;
            let mut have_rustc = false;
            let mut have_rust_std = false;
            for package in packages {
                let rel_path = package.rel_path()?;
                let is_present =
                    present.map_or(true, |present| present(&rel_path));
                if is_present {
                    match package.name.as_str() {
                        "rustc" => have_rustc = true,
                        "rust-std" => have_rust_std = true,
                        _ => {}
                    }
                    if rel_path_targets[&rel_path].len() == 1 {
                        have_unique_rel_path = true;
                    }
                } else {
                    have_all_rel_paths = false;
                }
            }
            if have_unique_rel_path || have_all_rel_paths {
                let target_type = if have_rustc {
                    TargetType::Native
                } else if have_rust_std {
                    TargetType::Cross
                } else {
                    TargetType::Minimal
                };
                target_types.insert(target, target_type);
            }
        }
        Ok(target_types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX: &str = "x86_64-unknown-linux-gnu";
    const DARWIN: &str = "x86_64-apple-darwin";

    fn sample_manifest() -> Manifest {
        let toml = format!(
            r#"
manifest-version = "2"
date = "2020-01-30"

[pkg.rust-src]
version = "1.41.0 (5e1a79984 2020-01-27)"

[pkg.rust-src.target."*"]
available = true
xz_url = "https://static.rust-lang.org/dist/2020-01-30/rust-src-1.41.0.tar.xz"
xz_hash = "{H}"

[pkg.rustc]
version = "1.41.0 (5e1a79984 2020-01-27)"

[pkg.rustc.target.{LINUX}]
available = true
xz_url = "https://static.rust-lang.org/dist/2020-01-30/rustc-1.41.0-{LINUX}.tar.xz"
xz_hash = "{H}"

[pkg.rust-std]
version = "1.41.0 (5e1a79984 2020-01-27)"

[pkg.rust-std.target.{LINUX}]
available = true
xz_url = "https://static.rust-lang.org/dist/2020-01-30/rust-std-1.41.0-{LINUX}.tar.xz"
xz_hash = "{H}"

[pkg.rust-std.target.{DARWIN}]
available = true
xz_url = "https://static.rust-lang.org/dist/2020-01-30/rust-std-1.41.0-{DARWIN}.tar.xz"
xz_hash = "{H}"

[pkg.rust-std.target.wasm32-unknown-unknown]
available = false
"#,
            LINUX = LINUX,
            DARWIN = DARWIN,
            H = "7b89a56897a1581ca66312468276ee08e6d596a3254128a567c1658c6f733c76",
        );
        Manifest::from_toml_str(&toml).unwrap()
    }

    #[test]
    fn channel_version_date() {
        let manifest = sample_manifest();
        assert_eq!(manifest.channel().unwrap(), "stable");
        assert_eq!(manifest.version().unwrap(), "1.41.0");
        assert_eq!(manifest.date(), "2020-01-30");
        assert_eq!(manifest.spec().unwrap(), "stable-2020-01-30");
        assert_eq!(
            manifest.ident().unwrap(),
            "stable-2020-01-30(1.41.0)"
        );
    }

    #[test]
    fn channel_from_tagged_versions() {
        for (version, channel) in [
            ("1.43.0-beta.5 (934ae7739 2020-04-06)", "beta"),
            ("1.44.0-nightly (42abbd887 2020-04-07)", "nightly"),
            ("1.42.0 (b8cedc004 2020-03-09)", "stable"),
        ] {
            let toml = format!(
                "date = \"2020-04-07\"\n[pkg.rust-src]\nversion = \"{version}\"\n"
            );
            let manifest = Manifest::from_toml_str(&toml).unwrap();
            assert_eq!(manifest.channel().unwrap(), channel);
            assert!(manifest.version().unwrap().starts_with("1.4"));
        }
    }

    #[test]
    fn rel_path_strips_dist_prefix() {
        let manifest = sample_manifest();
        let packages = manifest.available_packages(None, None).unwrap();
        let rustc = packages
            .iter()
            .find(|p| p.name == "rustc")
            .unwrap();
        assert_eq!(
            rustc.rel_path().unwrap(),
            format!("2020-01-30/rustc-1.41.0-{LINUX}.tar.xz")
        );
    }

    #[test]
    fn targets_exclude_wildcard_and_unavailable() {
        let manifest = sample_manifest();
        assert_eq!(
            manifest.all_targets(),
            vec!["wasm32-unknown-unknown", DARWIN, LINUX]
        );
        assert_eq!(
            manifest.available_targets(None, None).unwrap(),
            vec![DARWIN, LINUX]
        );
    }

    #[test]
    fn target_type_classification() {
        let manifest = sample_manifest();
        let types = manifest.available_target_types(None, None).unwrap();
        assert_eq!(types[LINUX], TargetType::Native);
        assert_eq!(types[DARWIN], TargetType::Cross);
    }

    #[test]
    fn target_types_honor_presence() {
        let manifest = sample_manifest();
        // Only the darwin rust-std artifact is on disk.
        let present = |rel_path: &str| rel_path.contains(DARWIN);
        let types = manifest
            .available_target_types(None, Some(&present))
            .unwrap();
        assert_eq!(types.get(DARWIN), Some(&TargetType::Cross));
        assert_eq!(types.get(LINUX), None);
    }

    #[test]
    fn target_matching() {
        let targets = |strs: &[&str]| -> Vec<String> {
            strs.iter().map(|s| s.to_string()).collect()
        };
        assert!(target_matches_any("*", &targets(&[LINUX])));
        assert!(target_matches_any(LINUX, &targets(&["*"])));
        assert!(target_matches_any(LINUX, &targets(&[DARWIN, LINUX])));
        assert!(!target_matches_any(LINUX, &targets(&[DARWIN])));
    }
}
