use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use time::UtcDateTime;

/// Used when a hosted document doesn't say what kind of document it is.
pub const DEFAULT_DOCUMENT_EXTENSION: &str = ".gdoc";
// DIVISION SLASH, which looks like a slash but isn't a path separator.
const ESCAPED_SLASH: &str = "\u{2215}";

/// One remote object (file or directory).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    /// Globally unique and immutable, assigned by the remote store.
    pub resource_id: String,
    pub parent_resource_id: String,
    /// Display name; not unique among siblings.
    pub title: String,
    /// Path component for this entry, unique among its siblings. Assigned by
    /// the tree when the entry is attached; ignored on input.
    pub base_name: String,
    pub is_directory: bool,
    /// Tombstone marker carried by delta feeds. Never stored in the tree.
    pub deleted: bool,
    /// Empty for directories.
    pub content_hash: String,
    pub size: u64,
    pub last_accessed: UtcDateTime,
    pub last_modified: UtcDateTime,
    /// Directories only: the changestamp as of which this directory's
    /// children are known to be complete.
    pub directory_changestamp: i64,
    pub shared_with_me: bool,
    /// A remote-only document with no downloadable content.
    pub is_hosted_document: bool,
    /// Appended to hosted document names, e.g. `.gsheet`.
    pub document_extension: String,
}

impl Entry {
    fn new(resource_id: impl Into<String>, parent: impl Into<String>, title: impl Into<String>, dir: bool) -> Self {
        Self {
            resource_id: resource_id.into(),
            parent_resource_id: parent.into(),
            title: title.into(),
            base_name: String::new(),
            is_directory: dir,
            deleted: false,
            content_hash: String::new(),
            size: 0,
            last_accessed: UtcDateTime::UNIX_EPOCH,
            last_modified: UtcDateTime::UNIX_EPOCH,
            directory_changestamp: 0,
            shared_with_me: false,
            is_hosted_document: false,
            document_extension: String::new(),
        }
    }

    pub fn file(resource_id: impl Into<String>, parent: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(resource_id, parent, title, false)
    }

    pub fn directory(resource_id: impl Into<String>, parent: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(resource_id, parent, title, true)
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = hash.into();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_last_accessed(mut self, at: UtcDateTime) -> Self {
        self.last_accessed = at;
        self
    }

    pub fn with_last_modified(mut self, at: UtcDateTime) -> Self {
        self.last_modified = at;
        self
    }

    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn with_shared_with_me(mut self, shared: bool) -> Self {
        self.shared_with_me = shared;
        self
    }

    /// Mark this entry as a hosted document. An empty extension falls back to
    /// [`DEFAULT_DOCUMENT_EXTENSION`].
    pub fn with_hosted_document(mut self, extension: impl Into<String>) -> Self {
        self.is_hosted_document = true;
        self.document_extension = extension.into();
        self
    }

    /// The name this entry would like to have in its parent directory before
    /// any disambiguation against siblings.
    pub fn display_name(&self) -> String {
        let mut name = self.title.replace('/', ESCAPED_SLASH);
        if name.is_empty() || name == "." || name == ".." {
            // Not representable as a path component.
            name = name.replace('.', "_");
            name.insert(0, '_');
        }
        if self.is_hosted_document {
            match self.document_extension.is_empty() {
                true => name.push_str(DEFAULT_DOCUMENT_EXTENSION),
                false => name.push_str(&self.document_extension),
            }
        }
        name
    }

    /// Whether two versions of an entry carry the same remote state, ignoring
    /// the tree-assigned base name.
    pub fn same_content(&self, other: &Entry) -> bool {
        self.resource_id == other.resource_id
            && self.parent_resource_id == other.parent_resource_id
            && self.title == other.title
            && self.is_directory == other.is_directory
            && self.deleted == other.deleted
            && self.content_hash == other.content_hash
            && self.size == other.size
            && self.last_accessed == other.last_accessed
            && self.last_modified == other.last_modified
            && self.directory_changestamp == other.directory_changestamp
            && self.shared_with_me == other.shared_with_me
            && self.is_hosted_document == other.is_hosted_document
            && self.document_extension == other.document_extension
    }
}

/// Insert `(n)` before the extension of file names, or at the end of
/// directory names: `notes.txt` becomes `notes (2).txt`.
pub(crate) fn suffixed_name(name: &str, n: usize, is_directory: bool) -> String {
    let split = match is_directory {
        true => None,
        // A leading dot is a hidden file, not an extension.
        false => name.rfind('.').filter(|&i| i > 0),
    };
    match split {
        Some(i) => format!("{} ({n}){}", &name[..i], &name[i..]),
        None => format!("{name} ({n})"),
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub(crate) resource_id: String,
    pub(crate) parent_resource_id: String,
    pub(crate) title: String,
    pub(crate) base_name: String,
    pub(crate) is_directory: bool,
    pub(crate) content_hash: String,
    pub(crate) size: i64,
    pub(crate) last_accessed: i64,
    pub(crate) last_modified: i64,
    pub(crate) directory_changestamp: i64,
    pub(crate) shared_with_me: bool,
    pub(crate) is_hosted_document: bool,
    pub(crate) document_extension: String,
}
impl TryFrom<&Entry> for EntryRow {
    type Error = Error;
    fn try_from(entry: &Entry) -> Result<Self, Self::Error> {
        Ok(Self {
            resource_id: entry.resource_id.clone(),
            parent_resource_id: entry.parent_resource_id.clone(),
            title: entry.title.clone(),
            base_name: entry.base_name.clone(),
            is_directory: entry.is_directory,
            content_hash: entry.content_hash.clone(),
            size: i64::try_from(entry.size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            last_accessed: entry.last_accessed.unix_timestamp(),
            last_modified: entry.last_modified.unix_timestamp(),
            directory_changestamp: entry.directory_changestamp,
            shared_with_me: entry.shared_with_me,
            is_hosted_document: entry.is_hosted_document,
            document_extension: entry.document_extension.clone(),
        })
    }
}
impl TryFrom<EntryRow> for Entry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            resource_id: row.resource_id,
            parent_resource_id: row.parent_resource_id,
            title: row.title,
            base_name: row.base_name,
            is_directory: row.is_directory,
            deleted: false,
            content_hash: row.content_hash,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            last_accessed: UtcDateTime::from_unix_timestamp(row.last_accessed)
                .or_raise(|| ErrorKind::InvalidData("last accessed date"))?,
            last_modified: UtcDateTime::from_unix_timestamp(row.last_modified)
                .or_raise(|| ErrorKind::InvalidData("last modified date"))?,
            directory_changestamp: row.directory_changestamp,
            shared_with_me: row.shared_with_me,
            is_hosted_document: row.is_hosted_document,
            document_extension: row.document_extension,
        })
    }
}
