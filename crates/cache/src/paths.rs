//! Cache partitions and file naming.
//!
//! Every cached file is named after the resource it holds:
//!
//! ```text
//! <escaped resource id>[.<escaped content hash> | .local][.mounted]
//! ```
//!
//! `.local` replaces the hash for locally modified files, whose server-side
//! hash isn't known yet. Escaping covers `%`, `.` and `/` so the dots above
//! are unambiguous separators.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::path::{Path, PathBuf};

use crate::models::CacheEntry;

/// Stands in for the content hash of locally modified files.
pub const LOCALLY_MODIFIED: &str = "local";
/// Suffix of files exposed to an external consumer.
pub const MOUNTED: &str = "mounted";

const CACHE_FILE_NAME: &AsciiSet = &CONTROLS.add(b'%').add(b'.').add(b'/');

/// Directories below the cache root, by retention class.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Partition {
    /// Persistent storage of the metadata stores; opaque to the cache.
    Meta,
    /// Pinned, dirty or mounted files. Never evicted.
    Persistent,
    /// Everything else. Evictable.
    Tmp,
    /// Downloads initiated from outside the cache.
    TmpDownloads,
    /// Placeholder files for hosted documents.
    TmpDocuments,
}
impl Partition {
    pub const ALL: [Partition; 5] = [Self::Meta, Self::Persistent, Self::Tmp, Self::TmpDownloads, Self::TmpDocuments];

    fn relative(&self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::Persistent => "persistent",
            Self::Tmp => "tmp",
            Self::TmpDownloads => "tmp/downloads",
            Self::TmpDocuments => "tmp/documents",
        }
    }
}

/// Where a cached file came from, which decides its name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheOrigin {
    FromServer,
    LocallyModified,
    Mounted,
}

/// The pieces of a parsed cache file name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheFileName {
    pub resource_id: String,
    /// The content hash, [`LOCALLY_MODIFIED`], or empty.
    pub content_hash: String,
    /// [`MOUNTED`] or empty.
    pub extra: String,
}

pub fn escape(name: &str) -> String {
    utf8_percent_encode(name, CACHE_FILE_NAME).to_string()
}

pub fn unescape(name: &str) -> String {
    percent_decode_str(name).decode_utf8_lossy().into_owned()
}

/// Split a cache file name (or path) back into its parts. Returns `None` for
/// names that can't have been produced by [`CachePaths::file_path`].
pub fn parse_cache_file_name(path: impl AsRef<Path>) -> Option<CacheFileName> {
    let name = path.as_ref().file_name()?.to_str()?;
    let mut parts = name.splitn(3, '.');
    let resource_id = parts.next().filter(|id| !id.is_empty())?;
    Some(CacheFileName {
        resource_id: unescape(resource_id),
        content_hash: parts.next().map(unescape).unwrap_or_default(),
        extra: parts.next().map(unescape).unwrap_or_default(),
    })
}

/// Resolves partitions and file names below a cache root.
#[derive(Clone, Debug)]
pub struct CachePaths {
    root: PathBuf,
}
impl CachePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition(&self, partition: Partition) -> PathBuf {
        self.root.join(partition.relative())
    }

    pub fn is_under_cache_dir(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref().starts_with(&self.root)
    }

    /// Path of a cache file for the given resource, hash, partition and origin.
    pub fn file_path(
        &self,
        resource_id: &str,
        content_hash: &str,
        partition: Partition,
        origin: CacheOrigin,
    ) -> PathBuf {
        let mut name = escape(resource_id);
        let hash = match origin {
            CacheOrigin::LocallyModified => LOCALLY_MODIFIED.to_string(),
            CacheOrigin::FromServer | CacheOrigin::Mounted => escape(content_hash),
        };
        if !hash.is_empty() {
            name.push('.');
            name.push_str(&hash);
        }
        if origin == CacheOrigin::Mounted {
            name.push('.');
            name.push_str(MOUNTED);
        }
        self.partition(partition).join(name)
    }

    /// Where the file of an entry in the given state lives.
    pub fn entry_path(&self, entry: &CacheEntry) -> PathBuf {
        let partition = match entry.is_persistent() {
            true => Partition::Persistent,
            false => Partition::Tmp,
        };
        let mut path = match entry.is_dirty {
            true => self.file_path(&entry.resource_id, "", partition, CacheOrigin::LocallyModified),
            false => self.file_path(&entry.resource_id, &entry.content_hash, partition, CacheOrigin::FromServer),
        };
        if entry.is_mounted {
            let mut name = path.file_name().unwrap_or_default().to_os_string();
            name.push(".");
            name.push(MOUNTED);
            path.set_file_name(name);
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("pdf:a1b2.0123456789abcdef.mounted", "pdf:a1b2", "0123456789abcdef", "mounted")]
    #[case("pdf:a1b2.0123456789abcdef", "pdf:a1b2", "0123456789abcdef", "")]
    #[case("pdf:a1b2", "pdf:a1b2", "", "")]
    #[case("file%3Aa%2Eb.local", "file:a.b", "local", "")]
    fn test_parse_cache_file_name(#[case] name: &str, #[case] id: &str, #[case] hash: &str, #[case] extra: &str) {
        let parsed = parse_cache_file_name(Path::new("/cache/tmp").join(name)).unwrap();
        assert_eq!(parsed.resource_id, id);
        assert_eq!(parsed.content_hash, hash);
        assert_eq!(parsed.extra, extra);
    }

    #[test]
    fn test_parse_rejects_empty_names() {
        assert!(parse_cache_file_name(".hidden").is_none());
        assert!(parse_cache_file_name("/").is_none());
    }

    #[rstest]
    #[case("pdf:a1b2", "pdf:a1b2")]
    #[case("a.b/c%d", "a%2Eb%2Fc%25d")]
    fn test_escape(#[case] raw: &str, #[case] escaped: &str) {
        assert_eq!(escape(raw), escaped);
        assert_eq!(unescape(escaped), raw);
    }

    #[test]
    fn test_file_path() {
        let paths = CachePaths::new("/cache");
        assert_eq!(
            paths.file_path("pdf:1a2b", "abc.def", Partition::Tmp, CacheOrigin::FromServer),
            Path::new("/cache/tmp/pdf:1a2b.abc%2Edef")
        );
        assert_eq!(
            paths.file_path("pdf:1a2b", "abc", Partition::Persistent, CacheOrigin::LocallyModified),
            Path::new("/cache/persistent/pdf:1a2b.local")
        );
        assert_eq!(
            paths.file_path("pdf:1a2b", "abc", Partition::Persistent, CacheOrigin::Mounted),
            Path::new("/cache/persistent/pdf:1a2b.abc.mounted")
        );
        assert_eq!(paths.partition(Partition::TmpDocuments), Path::new("/cache/tmp/documents"));
    }

    #[test]
    fn test_entry_path_follows_flags() {
        let paths = CachePaths::new("/cache");
        let mut entry = CacheEntry { is_present: true, ..CacheEntry::new("id", "h1") };
        assert_eq!(paths.entry_path(&entry), Path::new("/cache/tmp/id.h1"));
        entry.is_pinned = true;
        assert_eq!(paths.entry_path(&entry), Path::new("/cache/persistent/id.h1"));
        entry.is_dirty = true;
        assert_eq!(paths.entry_path(&entry), Path::new("/cache/persistent/id.local"));
        entry.is_mounted = true;
        assert_eq!(paths.entry_path(&entry), Path::new("/cache/persistent/id.local.mounted"));
    }

    #[test]
    fn test_is_under_cache_dir() {
        let paths = CachePaths::new("/cache");
        assert!(paths.is_under_cache_dir("/cache/persistent/id.h1"));
        assert!(!paths.is_under_cache_dir("/cachet/persistent/id.h1"));
    }
}
