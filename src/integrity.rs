use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use ring::digest;

use crate::error::{Error, Result};
use crate::util;

pub const HASH_SUFFIX: &str = ".sha256";

const HEX_LEN: usize = 64;

/// A SHA-256 digest, rendered as 64 lowercase hex characters.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct HashDigest([u8; 32]);

impl HashDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashDigest({self})")
    }
}

impl std::str::FromStr for HashDigest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != HEX_LEN {
            return Err(Error::BadHashText(s.to_owned()));
        }
        let bytes = hex::decode(s)
            .map_err(|_| Error::BadHashText(s.to_owned()))?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);
        Ok(HashDigest(digest))
    }
}

/// SHA-256 over the contents of `path`, streamed in 8 KiB chunks.
pub fn hash_file(path: &Path) -> Result<HashDigest> {
    let mut file = fs::File::open(path)?;
    let mut context = digest::Context::new(&digest::SHA256);
    let mut chunk = [0u8; 8192];
    loop {
        let count = file.read(&mut chunk)?;
        if count == 0 {
            break;
        }
        context.update(&chunk[..count]);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(context.finish().as_ref());
    Ok(HashDigest(out))
}

/// Parse a `sha256sum`-style line.
///
/// Both the text form (`<hash>  <name>`) and the binary form
/// (`<hash> *<name>`) are accepted; a single-space delimiter is not.
pub fn parse_hash_text(hash_text: &str) -> Result<(HashDigest, String)> {
    let bad = || Error::BadHashText(hash_text.to_owned());
    let text = hash_text.strip_suffix('\n').unwrap_or(hash_text);
    if text.len() < HEX_LEN + 2 || !text.is_char_boundary(HEX_LEN) {
        return Err(bad());
    }
    let (hash_part, rest) = text.split_at(HEX_LEN);
    let digest: HashDigest = hash_part.parse().map_err(|_| bad())?;
    let name = rest
        .strip_prefix("  ")
        .or_else(|| rest.strip_prefix(" *"))
        .ok_or_else(bad)?;
    Ok((digest, name.to_owned()))
}

/// Emit the binary (`" *"`) sidecar form.
pub fn format_hash_text(digest: &HashDigest, name: &str) -> String {
    format!("{digest} *{name}\n")
}

pub fn append_hash_suffix(s: &str) -> String {
    format!("{s}{HASH_SUFFIX}")
}

pub fn path_append_hash_suffix(path: &Path) -> PathBuf {
    util::path_append(path, HASH_SUFFIX)
}

pub fn read_hash_file(path: &Path) -> Result<(HashDigest, String)> {
    if !path.is_file() {
        return Err(Error::MissingFile(path.to_owned()));
    }
    parse_hash_text(&fs::read_to_string(path)?)
}

/// Write `<path>.sha256` describing `path`'s expected digest.
pub fn write_hash_file_for(path: &Path, digest: &HashDigest) -> Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let hash_path = path_append_hash_suffix(path);
    fs::write(&hash_path, format_hash_text(digest, &name))?;
    Ok(())
}

/// Fails `MissingFile` if `path` is absent, `Integrity` on digest mismatch.
pub fn verify_hash(path: &Path, expected: &HashDigest) -> Result<()> {
    if !path.exists() {
        return Err(Error::MissingFile(path.to_owned()));
    }
    let actual = hash_file(path)?;
    if actual != *expected {
        return Err(Error::Integrity {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            actual: actual.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(())
}

/// Verify `path` against its sidecar hash file (default `<path>.sha256`).
pub fn verify(path: &Path, hash_path: Option<&Path>) -> Result<()> {
    let default_hash_path;
    let hash_path = match hash_path {
        Some(p) => p,
        None => {
            default_hash_path = path_append_hash_suffix(path);
            &default_hash_path
        }
    };
    let (digest, _name) = read_hash_file(hash_path)?;
    verify_hash(path, &digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HASH: &str =
        "7b89a56897a1581ca66312468276ee08e6d596a3254128a567c1658c6f733c76";
    const SAMPLE_NAME: &str = "channel-rust-stable.toml";

    #[test]
    fn parse_accepts_text_and_binary_forms() {
        for delim in ["  ", " *"] {
            let text = format!("{SAMPLE_HASH}{delim}{SAMPLE_NAME}");
            let (digest, name) = parse_hash_text(&text).unwrap();
            assert_eq!(digest.to_string(), SAMPLE_HASH);
            assert_eq!(name, SAMPLE_NAME);
        }
    }

    #[test]
    fn parse_accepts_trailing_newline() {
        let text = format!("{SAMPLE_HASH} *{SAMPLE_NAME}\n");
        let (digest, name) = parse_hash_text(&text).unwrap();
        assert_eq!(digest.to_string(), SAMPLE_HASH);
        assert_eq!(name, SAMPLE_NAME);
    }

    #[test]
    fn parse_rejects_bad_hashes() {
        let short = &SAMPLE_HASH[..HEX_LEN - 1];
        let cases = [
            format!("{short}  {SAMPLE_NAME}"),
            format!("z{short}  {SAMPLE_NAME}"),
            format!("{SAMPLE_HASH} {SAMPLE_NAME}"),
            SAMPLE_HASH.to_owned(),
        ];
        for case in cases {
            assert!(
                matches!(parse_hash_text(&case), Err(Error::BadHashText(_))),
                "accepted {case:?}"
            );
        }
    }

    #[test]
    fn format_uses_binary_form() {
        let digest: HashDigest = SAMPLE_HASH.parse().unwrap();
        assert_eq!(
            format_hash_text(&digest, SAMPLE_NAME),
            format!("{SAMPLE_HASH} *{SAMPLE_NAME}\n")
        );
    }

    #[test]
    fn digest_parse_accepts_uppercase_renders_lowercase() {
        let digest: HashDigest = SAMPLE_HASH.to_uppercase().parse().unwrap();
        assert_eq!(digest.to_string(), SAMPLE_HASH);
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"payload").unwrap();
        let digest = hash_file(&path).unwrap();
        write_hash_file_for(&path, &digest).unwrap();

        let hash_path = path_append_hash_suffix(&path);
        let (read_digest, name) = read_hash_file(&hash_path).unwrap();
        assert_eq!(read_digest, digest);
        assert_eq!(name, "artifact.bin");
        verify(&path, None).unwrap();
    }

    #[test]
    fn verify_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        fs::write(&path, b"payload").unwrap();
        let digest = hash_file(&path).unwrap();
        write_hash_file_for(&path, &digest).unwrap();

        fs::write(&path, b"tampered").unwrap();
        assert!(matches!(
            verify(&path, None),
            Err(Error::Integrity { .. })
        ));
    }

    #[test]
    fn verify_missing_file_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let digest: HashDigest = SAMPLE_HASH.parse().unwrap();
        assert!(matches!(
            verify_hash(&path, &digest),
            Err(Error::MissingFile(_))
        ));
        fs::write(&path, b"payload").unwrap();
        assert!(matches!(verify(&path, None), Err(Error::MissingFile(_))));
    }
}
