use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// True for `YYYY-MM-DD`.
pub fn is_date(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 10
        && b.iter().enumerate().all(|(i, c)| match i {
            4 | 7 => *c == b'-',
            _ => c.is_ascii_digit(),
        })
}

/// True for `X.Y.Z`.
pub fn is_version(s: &str) -> bool {
    let mut parts = 0;
    for part in s.split('.') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        parts += 1;
    }
    parts == 3
}

/// Numeric sort key for an `X.Y.Z` version string.
pub fn version_sort_key(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

pub fn reverse_sorted_versions(mut versions: Vec<String>) -> Vec<String> {
    versions.sort_by(|a, b| version_sort_key(b).cmp(&version_sort_key(a)));
    versions
}

/// `path` with `suffix` appended to its final component.
pub fn path_append(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Hidden `.{name}.tmp` sibling used for atomic writes.
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

pub fn make_dirs_for(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.is_dir() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Remove empty directories from `root/dir_rel_path` upward, stopping at (and
/// never removing) `root` or at the first non-empty directory.
pub fn remove_empty_dirs(root: &Path, dir_rel_path: &str) {
    let mut parts: Vec<&str> = dir_rel_path
        .split(['/', '\\'])
        .collect();
    if parts.is_empty()
        || parts
            .iter()
            .any(|p| p.is_empty() || *p == "." || *p == "..")
    {
        return;
    }

    while !parts.is_empty() {
        let mut dir_path = root.to_path_buf();
        for part in &parts {
            dir_path.push(part);
        }
        if fs::remove_dir(&dir_path).is_err() {
            return;
        }
        parts.pop();
    }
}

/// Names of the immediate subdirectories of `parent`.
pub fn dir_names(parent: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = fs::read_dir(parent) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    names
}

/// `YYYY-MM-DD` subdirectory names of `parent`, newest first.
pub fn reversed_date_dir_names(parent: &Path) -> Vec<String> {
    let mut dates: Vec<String> = dir_names(parent)
        .into_iter()
        .filter(|name| is_date(name))
        .collect();
    dates.sort_by(|a, b| b.cmp(a));
    dates
}

/// Split `item` at commas or runs of whitespace, retaining duplicates and
/// empty strings.
pub fn split_word(item: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut chars = item.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            parts.push(std::mem::take(&mut cur));
        } else if c.is_whitespace() {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            parts.push(std::mem::take(&mut cur));
        } else {
            cur.push(c);
        }
    }
    parts.push(cur);
    parts
}

/// `split_word` across `words`, flattened with duplicates removed (order
/// preserved).
pub fn split_flatten_words(words: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for word in words {
        for part in split_word(word) {
            if seen.insert(part.clone()) {
                result.push(part);
            }
        }
    }
    result
}

/// `split_flatten_words` with empties removed and the rest sorted.
pub fn split_flatten_normalize_words(words: &[String]) -> Vec<String> {
    let mut result: Vec<String> = split_flatten_words(words)
        .into_iter()
        .filter(|w| !w.is_empty())
        .collect();
    result.sort();
    result
}

/// Normalized patterns, collapsed to `["*"]` when any pattern is `*`.
pub fn normalize_patterns(patterns: &[String]) -> Vec<String> {
    let normalized = split_flatten_normalize_words(patterns);
    if normalized.iter().any(|p| p == "*") {
        return vec!["*".to_owned()];
    }
    normalized
}

/// Recursively copy the tree at `src` to `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            make_dirs_for(&target)?;
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_predicate() {
        assert!(is_date("2020-01-23"));
        assert!(!is_date("2020-01-2"));
        assert!(!is_date("2020-01-234"));
        assert!(!is_date("20-01-23"));
    }

    #[test]
    fn version_predicate() {
        assert!(is_version("1.2.0"));
        assert!(is_version("1.2.3"));
        assert!(!is_version("1.2"));
        assert!(!is_version("a.b.c"));
    }

    #[test]
    fn version_ordering() {
        let versions = vec![
            "1.2.0".to_owned(),
            "1.10.0".to_owned(),
            "1.9.3".to_owned(),
        ];
        assert_eq!(
            reverse_sorted_versions(versions),
            vec!["1.10.0", "1.9.3", "1.2.0"]
        );
    }

    #[test]
    fn word_splitting() {
        assert_eq!(split_word(""), vec![""]);
        assert_eq!(split_word("a"), vec!["a"]);
        assert_eq!(split_word("a,b"), vec!["a", "b"]);
        assert_eq!(split_word("a,"), vec!["a", ""]);
        assert_eq!(split_word(","), vec!["", ""]);
        assert_eq!(split_word("a    b"), vec!["a", "b"]);
    }

    #[test]
    fn word_flattening() {
        let words = |strs: &[&str]| -> Vec<String> {
            strs.iter().map(|s| s.to_string()).collect()
        };
        assert_eq!(split_flatten_words(&words(&[""])), vec![""]);
        assert_eq!(
            split_flatten_words(&words(&["b,a", "b"])),
            vec!["b", "a"]
        );
        assert_eq!(
            split_flatten_words(&words(&[",a", "b    c"])),
            vec!["", "a", "b", "c"]
        );
        assert_eq!(
            split_flatten_normalize_words(&words(&["  c  b,,,a "])),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            split_flatten_normalize_words(&words(&["d,b", "c , a"])),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn pattern_normalization() {
        let words = |strs: &[&str]| -> Vec<String> {
            strs.iter().map(|s| s.to_string()).collect()
        };
        assert_eq!(normalize_patterns(&words(&[""])), Vec::<String>::new());
        assert_eq!(
            normalize_patterns(&words(&["d,b", "c , a"])),
            vec!["a", "b", "c", "d"]
        );
        assert_eq!(normalize_patterns(&words(&["a,*,b"])), vec!["*"]);
    }

    #[test]
    fn tmp_path_naming() {
        assert_eq!(
            tmp_path_for(Path::new("dist/file.tar.xz")),
            Path::new("dist/.file.tar.xz.tmp")
        );
    }

    #[test]
    fn empty_dir_removal_stops_at_root() {
        let root = tempfile::tempdir().unwrap();
        let leaf = root.path().join("3/f/foo");
        fs::create_dir_all(&leaf).unwrap();
        remove_empty_dirs(root.path(), "3/f/foo");
        assert!(!root.path().join("3").exists());
        assert!(root.path().is_dir());
    }

    #[test]
    fn empty_dir_removal_keeps_nonempty() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("3/f/foo")).unwrap();
        fs::write(root.path().join("3/keep.txt"), b"x").unwrap();
        remove_empty_dirs(root.path(), "3/f/foo");
        assert!(!root.path().join("3/f").exists());
        assert!(root.path().join("3").is_dir());
    }

    #[test]
    fn empty_dir_removal_rejects_weird_paths() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("sub")).unwrap();
        remove_empty_dirs(root.path(), "../sub");
        remove_empty_dirs(root.path(), "");
        assert!(root.path().join("sub").is_dir());
    }
}
