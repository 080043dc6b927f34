#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

use std::fmt;

pub mod archive;
pub mod crates;
pub mod dist;
pub mod download;
pub mod error;
pub mod git;
pub mod index;
pub mod integrity;
pub mod manifest;
pub mod rustup;
pub mod signature;
pub mod toolchain;
pub mod util;

pub use error::{Error, Result};

/// On-disk directory sharding discipline for crate files.
///
/// `Lower` folds the prefix directories to lowercase; `Mixed` preserves the
/// crate name's original case. The style of a crates root is pinned by its
/// `config.toml` for the lifetime of that root.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PrefixStyle {
    Lower,
    Mixed,
}

impl PrefixStyle {
    pub fn as_config_str(self) -> &'static str {
        match self {
            PrefixStyle::Lower => "lower",
            PrefixStyle::Mixed => "mixed",
        }
    }
}

impl std::str::FromStr for PrefixStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lower" => Ok(PrefixStyle::Lower),
            "mixed" => Ok(PrefixStyle::Mixed),
            _ => Err(Error::usage(format!("invalid prefix style {s:?}"))),
        }
    }
}

impl fmt::Display for PrefixStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_config_str())
    }
}

/// Directory prefix sharding a crate name, e.g. `se/rd` for `serde`.
///
/// Names shorter than four characters use the length-bucket forms `1`, `2`,
/// and `3/<c0>` used by the crates.io index.
pub fn crate_prefix(name: &str, style: PrefixStyle) -> String {
    let prefix = match name.chars().count() {
        0 | 1 => "1".to_owned(),
        2 => "2".to_owned(),
        3 => {
            let c0: String = name.chars().take(1).collect();
            format!("3/{c0}")
        }
        _ => {
            let chars: Vec<char> = name.chars().take(4).collect();
            format!(
                "{}{}/{}{}",
                chars[0], chars[1], chars[2], chars[3]
            )
        }
    };
    match style {
        PrefixStyle::Lower => prefix.to_lowercase(),
        PrefixStyle::Mixed => prefix,
    }
}

pub fn crate_basename(name: &str, version: &str) -> String {
    format!("{name}-{version}.crate")
}

/// Slash-separated path of a crate file below the crates root.
pub fn crate_rel_path(name: &str, version: &str, style: PrefixStyle) -> String {
    format!(
        "{}/{}/{}",
        crate_prefix(name, style),
        name,
        crate_basename(name, version)
    )
}

/// A single published crate version as recorded in the crates.io index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Krate {
    pub name: String,
    pub version: String,
    /// SHA-256 checksum of the `.crate` file, lowercase hex.
    pub cksum: String,
}

impl Krate {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        cksum: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            cksum: cksum.into(),
        }
    }

    /// Identity of this crate within a delta; the checksum is deliberately
    /// excluded so a republished version replaces its predecessor.
    pub fn ident(&self) -> (&str, &str) {
        (&self.name, &self.version)
    }

    pub fn prefix(&self, style: PrefixStyle) -> String {
        crate_prefix(&self.name, style)
    }

    pub fn basename(&self) -> String {
        crate_basename(&self.name, &self.version)
    }

    pub fn rel_path(&self, style: PrefixStyle) -> String {
        crate_rel_path(&self.name, &self.version, style)
    }
}

impl fmt::Display for Krate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_by_name_length() {
        assert_eq!(crate_prefix("a", PrefixStyle::Lower), "1");
        assert_eq!(crate_prefix("a", PrefixStyle::Mixed), "1");
        assert_eq!(crate_prefix("ab", PrefixStyle::Lower), "2");
        assert_eq!(crate_prefix("ab", PrefixStyle::Mixed), "2");
        assert_eq!(crate_prefix("AbC", PrefixStyle::Lower), "3/a");
        assert_eq!(crate_prefix("AbC", PrefixStyle::Mixed), "3/A");
        assert_eq!(crate_prefix("AbCd", PrefixStyle::Lower), "ab/cd");
        assert_eq!(crate_prefix("AbCd", PrefixStyle::Mixed), "Ab/Cd");
        assert_eq!(crate_prefix("serde_json", PrefixStyle::Lower), "se/rd");
    }

    #[test]
    fn lower_prefix_is_lowercased_mixed() {
        for name in ["a", "AB", "AbC", "AbCdEfGh", "Inflector"] {
            assert_eq!(
                crate_prefix(name, PrefixStyle::Lower),
                crate_prefix(name, PrefixStyle::Mixed).to_lowercase()
            );
        }
    }

    #[test]
    fn rel_path_keeps_name_case() {
        assert_eq!(
            crate_rel_path("AbCd", "0.1.0", PrefixStyle::Lower),
            "ab/cd/AbCd/AbCd-0.1.0.crate"
        );
        assert_eq!(
            crate_rel_path("AbCd", "0.1.0", PrefixStyle::Mixed),
            "Ab/Cd/AbCd/AbCd-0.1.0.crate"
        );
    }

    #[test]
    fn krate_display() {
        let krate = Krate::new("serde", "1.0.0", "");
        assert_eq!(krate.to_string(), "serde-1.0.0");
        assert_eq!(krate.basename(), "serde-1.0.0.crate");
    }
}
