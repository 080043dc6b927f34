use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};
use crate::util;

pub const SIG_SUFFIX: &str = ".asc";

pub fn append_sig_suffix(s: &str) -> String {
    format!("{s}{SIG_SUFFIX}")
}

pub fn path_append_sig_suffix(path: &Path) -> PathBuf {
    util::path_append(path, SIG_SUFFIX)
}

/// Verifies detached ASCII-armored signatures by invoking `gpg`.
///
/// The signing key (e.g. the Rust release key) must already be present in the
/// invoking user's keyring.
pub struct Verifier {
    gpg: PathBuf,
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier {
    pub fn new() -> Self {
        Self {
            gpg: PathBuf::from("gpg"),
        }
    }

    /// Fails `MissingFile` if `sig_path` is absent and `Signature` when
    /// verification fails.
    pub fn verify(&self, path: &Path, sig_path: &Path) -> Result<()> {
        if !sig_path.is_file() {
            return Err(Error::MissingFile(sig_path.to_owned()));
        }
        let output = Command::new(&self.gpg)
            .arg("--verify")
            .arg(sig_path)
            .arg(path)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::abort(
                    "`gpg` command not found; GnuPG is required for \
                     signature verification (try --no-signature)",
                ),
                _ => Error::Io(e),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            debug!(
                "gpg --verify failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            let basename = |p: &Path| {
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            };
            Err(Error::Signature {
                name: basename(path),
                sig_name: basename(sig_path),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_helpers() {
        assert_eq!(
            append_sig_suffix("dist/channel-rust-stable.toml"),
            "dist/channel-rust-stable.toml.asc"
        );
        assert_eq!(
            path_append_sig_suffix(Path::new("dist/file.toml")),
            Path::new("dist/file.toml.asc")
        );
    }

    #[test]
    fn missing_signature_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"data").unwrap();
        let verifier = Verifier::new();
        assert!(matches!(
            verifier.verify(&path, &path.with_extension("asc")),
            Err(Error::MissingFile(_))
        ));
    }
}
