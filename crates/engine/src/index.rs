//! Local directory indexing.
//!
//! [`Index`] walks a root directory depth-first and yields one
//! [`IndexedPair`] per relative name, pairing each binary with its pointer
//! file. Hidden entries (leading `.`, which includes partial downloads) and
//! well-known OS artifacts are skipped, as are symbolic links.

use crate::pointer::{binary_name, pointer_path};
use crate::report::ItemFailure;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

/// Thumbnail caches and recycle bins that are never archived.
const OS_ARTIFACTS: &[&str] = &[
    "thumbs.db",
    "ehthumbs.db",
    "desktop.ini",
    "$recycle.bin",
    "system volume information",
    "@eadir",
];

/// Whether a directory entry called `name` is left out of the index.
pub fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || OS_ARTIFACTS.iter().any(|artifact| name.eq_ignore_ascii_case(artifact))
}

/// Whether relative name `name` lies inside directory `dir`.
pub(crate) fn is_below(name: &str, dir: &str) -> bool {
    name.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

/// Which halves of a pair exist locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilePair {
    BinaryOnly,
    PointerOnly,
    Both,
}

impl FilePair {
    pub fn has_binary(self) -> bool {
        matches!(self, Self::BinaryOnly | Self::Both)
    }

    pub fn has_pointer(self) -> bool {
        matches!(self, Self::PointerOnly | Self::Both)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexedPair {
    /// Path relative to the root, `/`-separated, without pointer extension.
    pub relative_name: String,
    /// Where the binary is (or would be).
    pub path: PathBuf,
    pub pair: FilePair,
}

impl IndexedPair {
    pub fn pointer_path(&self) -> PathBuf {
        pointer_path(&self.path)
    }
}

/// Depth-first walk of a local root. Blocking; run it on a blocking thread.
///
/// Unreadable directories and names that are not valid UTF-8 are yielded as
/// [`ItemFailure`]s and the walk carries on.
pub struct Index {
    stack: Vec<(PathBuf, String)>,
    ready: VecDeque<Result<IndexedPair, ItemFailure>>,
}

impl Index {
    pub fn new(root: &Path) -> Self {
        Self {
            stack: vec![(root.to_path_buf(), String::new())],
            ready: VecDeque::new(),
        }
    }

    fn scan_directory(&mut self, dir: &Path, prefix: &str) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                self.ready.push_back(Err(ItemFailure::new(display_name(prefix), format!("cannot list directory: {err}"))));
                return;
            },
        };
        // binary name -> (has binary, has pointer)
        let mut pairs: BTreeMap<String, (bool, bool)> = BTreeMap::new();
        let mut subdirectories = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    self.ready.push_back(Err(ItemFailure::new(display_name(prefix), format!("cannot list directory: {err}"))));
                    continue;
                },
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                let lossy = entry.file_name().to_string_lossy().into_owned();
                self.ready.push_back(Err(ItemFailure::new(join(prefix, &lossy), "file name is not valid UTF-8")));
                continue;
            };
            if is_ignored(&name) {
                tracing::trace!(name = %join(prefix, &name), "Skipping ignored entry");
                continue;
            }
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    self.ready.push_back(Err(ItemFailure::new(join(prefix, &name), err.to_string())));
                    continue;
                },
            };
            if file_type.is_dir() {
                subdirectories.push((entry.path(), join(prefix, &name)));
            } else if file_type.is_file() {
                match binary_name(&name) {
                    Some(binary) => pairs.entry(binary.to_string()).or_default().1 = true,
                    None => pairs.entry(name).or_default().0 = true,
                }
            } else {
                tracing::debug!(name = %join(prefix, &name), "Skipping entry that is not a regular file");
            }
        }
        for (name, (binary, pointer)) in pairs {
            let pair = match (binary, pointer) {
                (true, true) => FilePair::Both,
                (true, false) => FilePair::BinaryOnly,
                (false, _) => FilePair::PointerOnly,
            };
            self.ready.push_back(Ok(IndexedPair {
                path: dir.join(&name),
                relative_name: join(prefix, &name),
                pair,
            }));
        }
        // Reversed so that the stack pops subdirectories in name order.
        subdirectories.sort_by(|a, b| b.1.cmp(&a.1));
        self.stack.extend(subdirectories);
    }
}

impl Iterator for Index {
    type Item = Result<IndexedPair, ItemFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            let (dir, prefix) = self.stack.pop()?;
            self.scan_directory(&dir, &prefix);
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    match prefix.is_empty() {
        true => name.to_string(),
        false => format!("{prefix}/{name}"),
    }
}

fn display_name(prefix: &str) -> &str {
    match prefix.is_empty() {
        true => ".",
        false => prefix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn touch(root: &Path, name: &str) {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, name.as_bytes()).unwrap();
    }

    fn index(root: &Path) -> Vec<(String, FilePair)> {
        Index::new(root).map(|item| item.unwrap()).map(|pair| (pair.relative_name, pair.pair)).collect()
    }

    #[test]
    fn test_pairs_binaries_with_pointers() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "a.txt",
            "a.txt.pointer.arca",
            "b.txt",
            "c.txt.pointer.arca",
            "photos/cat.jpg",
            "photos/2024/dog.jpg.pointer.arca",
        ] {
            touch(dir.path(), name);
        }
        assert_eq!(
            index(dir.path()),
            vec![
                ("a.txt".to_string(), FilePair::Both),
                ("b.txt".to_string(), FilePair::BinaryOnly),
                ("c.txt".to_string(), FilePair::PointerOnly),
                ("photos/cat.jpg".to_string(), FilePair::BinaryOnly),
                ("photos/2024/dog.jpg".to_string(), FilePair::PointerOnly),
            ]
        );
    }

    #[test]
    fn test_skips_hidden_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "keep.txt",
            ".hidden",
            ".git/config",
            "Thumbs.db",
            "photos/desktop.ini",
            "photos/.cat.jpg.arca-partial",
            "@eaDir/thumb.jpg",
        ] {
            touch(dir.path(), name);
        }
        assert_eq!(index(dir.path()), vec![("keep.txt".to_string(), FilePair::BinaryOnly)]);
    }

    #[test]
    fn test_paths_are_absolute() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "docs/a.txt");
        let pair = Index::new(dir.path()).next().unwrap().unwrap();
        assert_eq!(pair.path, dir.path().join("docs").join("a.txt"));
        assert_eq!(pair.pointer_path(), dir.path().join("docs").join("a.txt.pointer.arca"));
    }

    #[test]
    fn test_missing_root_is_an_item_failure() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<_> = Index::new(&dir.path().join("missing")).collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[rstest]
    #[case(".DS_Store", true)]
    #[case("THUMBS.DB", true)]
    #[case("$RECYCLE.BIN", true)]
    #[case("thumbs.db.txt", false)]
    #[case("photo.jpg", false)]
    fn test_is_ignored(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_ignored(name), expected);
    }

    #[rstest]
    #[case("photos/cat.jpg", "photos", true)]
    #[case("photos/2024/cat.jpg", "photos", true)]
    #[case("photos-old/cat.jpg", "photos", false)]
    #[case("photos", "photos", false)]
    fn test_is_below(#[case] name: &str, #[case] dir: &str, #[case] expected: bool) {
        assert_eq!(is_below(name, dir), expected);
    }
}
