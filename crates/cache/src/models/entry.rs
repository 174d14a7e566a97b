/// Lifecycle state of one cached resource.
///
/// Flags only change through [`FileCache`](crate::FileCache) operations. The
/// partition a file lives in is a function of these flags, see
/// [`CacheEntry::is_persistent`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheEntry {
    pub resource_id: String,
    /// Content hash reported by the server for the cached bytes. Meaningless
    /// while the entry is dirty.
    pub content_hash: String,
    /// The file bytes are on disk.
    pub is_present: bool,
    /// Keep available offline; never evicted.
    pub is_pinned: bool,
    /// Locally modified and not yet uploaded.
    pub is_dirty: bool,
    /// Currently exposed to an external consumer.
    pub is_mounted: bool,
}

impl CacheEntry {
    pub fn new(resource_id: impl Into<String>, content_hash: impl Into<String>) -> Self {
        Self { resource_id: resource_id.into(), content_hash: content_hash.into(), ..Self::default() }
    }

    /// Persistent entries live in the persistent partition and are never
    /// evicted.
    pub fn is_persistent(&self) -> bool {
        self.is_pinned || self.is_dirty || self.is_mounted
    }

    /// Whether a lookup by `content_hash` should find this entry.
    ///
    /// Dirty entries match any hash (the server hash of local edits is
    /// unknown), as does an empty query. A pin placed before the hash was
    /// known matches any hash too.
    pub fn matches_hash(&self, content_hash: &str) -> bool {
        self.is_dirty
            || content_hash.is_empty()
            || (self.is_pinned && self.content_hash.is_empty())
            || self.content_hash == content_hash
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct CacheEntryRow {
    pub(crate) resource_id: String,
    pub(crate) content_hash: String,
    pub(crate) is_present: bool,
    pub(crate) is_pinned: bool,
    pub(crate) is_dirty: bool,
    pub(crate) is_mounted: bool,
    pub(crate) is_persistent: bool,
}
impl From<&CacheEntry> for CacheEntryRow {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            resource_id: entry.resource_id.clone(),
            content_hash: entry.content_hash.clone(),
            is_present: entry.is_present,
            is_pinned: entry.is_pinned,
            is_dirty: entry.is_dirty,
            is_mounted: entry.is_mounted,
            is_persistent: entry.is_persistent(),
        }
    }
}
impl From<CacheEntryRow> for CacheEntry {
    fn from(row: CacheEntryRow) -> Self {
        if row.is_persistent != (row.is_pinned || row.is_dirty || row.is_mounted) {
            tracing::warn!(resource_id = %row.resource_id, "Stored persistent flag disagrees with entry state");
        }
        Self {
            resource_id: row.resource_id,
            content_hash: row.content_hash,
            is_present: row.is_present,
            is_pinned: row.is_pinned,
            is_dirty: row.is_dirty,
            is_mounted: row.is_mounted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entry(hash: &str, pinned: bool, dirty: bool) -> CacheEntry {
        CacheEntry { is_pinned: pinned, is_dirty: dirty, is_present: true, ..CacheEntry::new("id", hash) }
    }

    #[rstest]
    #[case(entry("abc", false, false), "abc", true)]
    #[case(entry("abc", false, false), "def", false)]
    #[case(entry("abc", false, false), "", true)]
    #[case(entry("abc", false, true), "def", true)]
    #[case(entry("", true, false), "def", true)]
    #[case(entry("abc", true, false), "def", false)]
    fn test_matches_hash(#[case] entry: CacheEntry, #[case] query: &str, #[case] expected: bool) {
        assert_eq!(entry.matches_hash(query), expected);
    }

    #[rstest]
    #[case(false, false, false, false)]
    #[case(true, false, false, true)]
    #[case(false, true, false, true)]
    #[case(false, false, true, true)]
    fn test_persistent_is_derived(
        #[case] pinned: bool,
        #[case] dirty: bool,
        #[case] mounted: bool,
        #[case] expected: bool,
    ) {
        let entry = CacheEntry { is_pinned: pinned, is_dirty: dirty, is_mounted: mounted, ..CacheEntry::default() };
        assert_eq!(entry.is_persistent(), expected);
        assert_eq!(CacheEntryRow::from(&entry).is_persistent, expected);
    }
}
