use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::util;
use crate::PrefixStyle;

/// Name of the mandatory first member of every romt archive.
pub const ARCHIVE_FORMAT_NAME: &str = "ARCHIVE_FORMAT";

/// Payload of the `ARCHIVE_FORMAT` member for the given crate prefix style
/// (`"1"` for mixed, `"2"` for lower).
pub fn format_payload(style: PrefixStyle) -> &'static [u8] {
    match style {
        PrefixStyle::Mixed => b"1\n",
        PrefixStyle::Lower => b"2\n",
    }
}

pub fn style_from_format(format: &str) -> Option<PrefixStyle> {
    match format {
        "1" => Some(PrefixStyle::Mixed),
        "2" => Some(PrefixStyle::Lower),
        _ => None,
    }
}

/// Reject archive member names that could escape the extraction root.
pub fn checked_member_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let safe = path.components().all(|component| {
        matches!(component, Component::Normal(_) | Component::CurDir)
    });
    if safe {
        Ok(())
    } else {
        Err(Error::UnexpectedArchiveMember(name.to_owned()))
    }
}

/// Streaming writer for a gzipped tar archive.
///
/// Output goes to a `.tmp` sibling that is renamed into place by
/// [`ArchiveWriter::finish`]; a writer dropped before then removes the
/// partial file.
pub struct ArchiveWriter {
    builder: Option<tar::Builder<GzEncoder<File>>>,
    tmp_path: PathBuf,
    path: PathBuf,
}

impl ArchiveWriter {
    pub fn create(path: &Path, style: PrefixStyle) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        util::make_dirs_for(path)?;
        let tmp_path = util::tmp_path_for(path);
        let file = File::create(&tmp_path)?;
        let mut builder =
            tar::Builder::new(GzEncoder::new(file, Compression::default()));

        let payload = format_payload(style);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder.append_data(&mut header, ARCHIVE_FORMAT_NAME, payload)?;

        Ok(Self {
            builder: Some(builder),
            tmp_path,
            path: path.to_owned(),
        })
    }

    /// Append the file at `src` under the archive name `name`; a missing
    /// source fails `MissingFile`.
    pub fn append_path(&mut self, src: &Path, name: &str) -> Result<()> {
        let builder = self
            .builder
            .as_mut()
            .expect("writer used after finish");
        builder
            .append_path_with_name(src, name)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::MissingFile(src.to_owned())
                }
                _ => Error::Io(err),
            })
    }

    /// Flush the stream and rename the archive into place.
    pub fn finish(mut self) -> Result<()> {
        let builder = self.builder.take().expect("writer already finished");
        let encoder = builder.into_inner()?;
        encoder.finish()?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        // Close the stream before removing any leftover partial file; after
        // a successful finish the tmp path no longer exists.
        drop(self.builder.take());
        if self.tmp_path.is_file() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Streaming reader over a gzipped tar archive.
///
/// Extraction never preserves source ownership, permissions, or timestamps.
pub struct ArchiveReader {
    archive: tar::Archive<GzDecoder<File>>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                Error::MissingFile(path.to_owned())
            }
            _ => Error::Io(err),
        })?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_preserve_permissions(false);
        archive.set_preserve_mtime(false);
        archive.set_unpack_xattrs(false);
        Ok(Self { archive })
    }

    pub fn entries(
        &mut self,
    ) -> Result<tar::Entries<'_, GzDecoder<File>>> {
        Ok(self.archive.entries()?)
    }
}

/// UTF-8 member name of `entry`; non-UTF-8 names are rejected outright.
pub fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let bytes = entry.path_bytes();
    std::str::from_utf8(&bytes)
        .map(str::to_owned)
        .map_err(|_| {
            Error::UnexpectedArchiveMember(
                String::from_utf8_lossy(&bytes).into_owned(),
            )
        })
}

/// Parse the `ARCHIVE_FORMAT` payload from its entry.
pub fn read_format_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
) -> Result<PrefixStyle> {
    let mut contents = Vec::new();
    entry
        .read_to_end(&mut contents)
        .map_err(|_| Error::abort("invalid ARCHIVE_FORMAT (unreadable)"))?;
    let contents = String::from_utf8_lossy(&contents);
    let format = contents.trim();
    style_from_format(format).ok_or_else(|| {
        Error::abort(format!("invalid ARCHIVE_FORMAT {format:?}"))
    })
}

/// Extract `entry` to the explicit destination `dest`, creating parents.
pub fn unpack_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    dest: &Path,
) -> Result<()> {
    util::make_dirs_for(dest)?;
    entry.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_payload_round_trip() {
        for style in [PrefixStyle::Lower, PrefixStyle::Mixed] {
            let payload = format_payload(style);
            let text = std::str::from_utf8(payload).unwrap();
            assert_eq!(style_from_format(text.trim()), Some(style));
        }
        assert_eq!(style_from_format("3"), None);
        assert_eq!(style_from_format(""), None);
    }

    #[test]
    fn member_name_validation() {
        checked_member_name("crates/1/a/a-0.1.0.crate").unwrap();
        checked_member_name("dist/2020-01-30/channel-rust-stable.toml")
            .unwrap();
        assert!(checked_member_name("../evil").is_err());
        assert!(checked_member_name("crates/../../evil").is_err());
        assert!(checked_member_name("/etc/passwd").is_err());
    }

    #[test]
    fn writer_emits_format_first() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("out.tar.gz");
        let payload_path = dir.path().join("file.bin");
        fs::write(&payload_path, b"data").unwrap();

        let mut writer =
            ArchiveWriter::create(&archive_path, PrefixStyle::Lower).unwrap();
        writer
            .append_path(&payload_path, "crates/1/a/a-0.1.0.crate")
            .unwrap();
        writer.finish().unwrap();
        assert!(archive_path.is_file());
        assert!(!util::tmp_path_for(&archive_path).exists());

        let mut reader = ArchiveReader::open(&archive_path).unwrap();
        let mut entries = reader.entries().unwrap();
        let mut first = entries.next().unwrap().unwrap();
        assert_eq!(entry_name(&first).unwrap(), ARCHIVE_FORMAT_NAME);
        assert_eq!(
            read_format_entry(&mut first).unwrap(),
            PrefixStyle::Lower
        );
        let second = entries.next().unwrap().unwrap();
        assert_eq!(
            entry_name(&second).unwrap(),
            "crates/1/a/a-0.1.0.crate"
        );
    }

    #[test]
    fn dropped_writer_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("out.tar.gz");
        let writer =
            ArchiveWriter::create(&archive_path, PrefixStyle::Mixed).unwrap();
        drop(writer);
        assert!(!archive_path.exists());
        assert!(!util::tmp_path_for(&archive_path).exists());
    }

    #[test]
    fn missing_payload_fails_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("out.tar.gz");
        let mut writer =
            ArchiveWriter::create(&archive_path, PrefixStyle::Lower).unwrap();
        let missing = dir.path().join("no-such.crate");
        assert!(matches!(
            writer.append_path(&missing, "crates/1/a/a-0.1.0.crate"),
            Err(Error::MissingFile(_))
        ));
    }
}
