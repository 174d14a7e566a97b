//! The resource metadata tree.
//!
//! Maps remote resource IDs to entries and resolves entries to and from
//! `/`-separated paths rooted at the grand root (`drive`). Two synthetic
//! directories always exist: the grand root itself and the orphan bucket
//! (`drive/other`), which adopts every entry whose declared parent cannot be
//! resolved. Every stored entry is therefore reachable from the grand root.

use crate::error::{ErrorKind, Result};
use crate::models::{Entry, suffixed_name};
use crate::repo::Repository;
use drivefs_db::Database;
use exn::{OptionExt, ResultExt};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use tracing::instrument;

pub const GRAND_ROOT_ID: &str = "<drive>";
pub const GRAND_ROOT_NAME: &str = "drive";
pub const ORPHAN_BUCKET_ID: &str = "<other>";
pub const ORPHAN_BUCKET_NAME: &str = "other";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// In-memory index over all entries, written through to SQLite.
#[derive(Debug)]
pub struct ResourceMetadata {
    repo: Repository,
    entries: HashMap<String, Entry>,
    /// Directory resource ID to (base name to child resource ID).
    children: HashMap<String, BTreeMap<String, String>>,
    largest_changestamp: i64,
}

impl ResourceMetadata {
    /// Open the metadata database at the given path, creating it if needed.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::connect(path, &MIGRATOR).await.or_raise(|| ErrorKind::Database)?;
        Self::open(&db).await
    }

    /// Open a throwaway in-memory tree.
    pub async fn connect_in_memory() -> Result<Self> {
        let db = Database::connect_in_memory(&MIGRATOR).await.or_raise(|| ErrorKind::Database)?;
        Self::open(&db).await
    }

    /// Load every stored entry and make sure the reserved directories exist.
    #[instrument("loading resource metadata", skip(db))]
    pub async fn open(db: &Database) -> Result<Self> {
        let repo = Repository::from(db);
        let mut tree = Self {
            largest_changestamp: repo.largest_changestamp().await?,
            repo,
            entries: HashMap::new(),
            children: HashMap::new(),
        };
        tree.ensure_reserved().await?;
        let mut loaded = 0;
        for entry in tree.repo.load_all().await? {
            if !is_reserved(&entry.resource_id) {
                tree.index(entry);
                loaded += 1;
            }
        }
        tree.reattach_dangling().await?;
        tracing::debug!(entries = loaded, changestamp = tree.largest_changestamp, "Loaded resource metadata");
        Ok(tree)
    }

    async fn ensure_reserved(&mut self) -> Result<()> {
        let mut grand_root = Entry::directory(GRAND_ROOT_ID, "", GRAND_ROOT_NAME);
        grand_root.base_name = GRAND_ROOT_NAME.to_string();
        let mut orphans = Entry::directory(ORPHAN_BUCKET_ID, GRAND_ROOT_ID, ORPHAN_BUCKET_NAME);
        orphans.base_name = ORPHAN_BUCKET_NAME.to_string();
        self.repo.upsert(&grand_root).await?;
        self.repo.upsert(&orphans).await?;
        self.entries.insert(GRAND_ROOT_ID.to_string(), grand_root);
        self.children.entry(GRAND_ROOT_ID.to_string()).or_default();
        self.index(orphans);
        Ok(())
    }

    /// A database written by an older or crashed process may hold entries
    /// whose parent never made it to disk. File them under the orphan bucket
    /// rather than leaving them unreachable.
    async fn reattach_dangling(&mut self) -> Result<()> {
        let dangling: Vec<String> = self
            .entries
            .values()
            .filter(|e| !is_reserved(&e.resource_id))
            .filter(|e| self.entries.get(&e.parent_resource_id).is_none_or(|p| !p.is_directory))
            .map(|e| e.resource_id.clone())
            .collect();
        for id in dangling {
            tracing::warn!(resource_id = %id, "Stored entry has no parent; moving to orphan bucket");
            if let Some(mut entry) = self.entries.get(&id).cloned() {
                entry.parent_resource_id = ORPHAN_BUCKET_ID.to_string();
                self.refresh(entry).await?;
            }
        }
        Ok(())
    }

    /// Insert into the in-memory maps as-is. The entry's base name must already
    /// be unique within its parent.
    fn index(&mut self, entry: Entry) {
        self.children
            .entry(entry.parent_resource_id.clone())
            .or_default()
            .insert(entry.base_name.clone(), entry.resource_id.clone());
        if entry.is_directory {
            self.children.entry(entry.resource_id.clone()).or_default();
        }
        self.entries.insert(entry.resource_id.clone(), entry);
    }

    fn unindex(&mut self, resource_id: &str) -> Option<Entry> {
        let entry = self.entries.remove(resource_id)?;
        if let Some(siblings) = self.children.get_mut(&entry.parent_resource_id) {
            siblings.remove(&entry.base_name);
        }
        self.children.remove(resource_id);
        Some(entry)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn largest_changestamp(&self) -> i64 {
        self.largest_changestamp
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        // The reserved directories are always present.
        self.entries.len() <= 2
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.entries.contains_key(resource_id)
    }

    /// Iterate over every entry, including the reserved directories.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn get_by_id(&self, resource_id: &str) -> Result<&Entry> {
        self.entries
            .get(resource_id)
            .ok_or_raise(|| ErrorKind::NotFound(resource_id.to_string()))
    }

    /// Resolve a path such as `drive/root/Documents/notes.txt`.
    pub fn get_by_path(&self, path: impl AsRef<Path>) -> Result<&Entry> {
        let path = path.as_ref();
        let not_found = || ErrorKind::NotFound(path.display().to_string());
        let mut components = path.components().filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_str()),
            _ => None,
        });
        match components.next() {
            Some(Some(GRAND_ROOT_NAME)) => {},
            _ => exn::bail!(not_found()),
        }
        let mut current = GRAND_ROOT_ID;
        for name in components {
            let name = name.ok_or_raise(not_found)?;
            current = self
                .children
                .get(current)
                .and_then(|children| children.get(name))
                .map(String::as_str)
                .ok_or_raise(not_found)?;
        }
        self.get_by_id(current)
    }

    /// The path of an entry, or `None` if it isn't in the tree.
    pub fn get_path(&self, resource_id: &str) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut current = self.entries.get(resource_id)?;
        loop {
            names.push(current.base_name.as_str());
            if current.resource_id == GRAND_ROOT_ID {
                break;
            }
            // Bounded walk: a parent chain longer than the tree is a cycle.
            if names.len() > self.entries.len() {
                return None;
            }
            current = self.entries.get(&current.parent_resource_id)?;
        }
        Some(names.into_iter().rev().collect())
    }

    /// List the children of the directory at the given path, sorted by base name.
    pub fn list_children(&self, path: impl AsRef<Path>) -> Result<Vec<&Entry>> {
        let dir = self.get_by_path(path.as_ref())?;
        if !dir.is_directory {
            exn::bail!(ErrorKind::NotADirectory(path.as_ref().display().to_string()));
        }
        Ok(self.children_of(&dir.resource_id).collect())
    }

    pub(crate) fn children_of(&self, resource_id: &str) -> impl Iterator<Item = &Entry> {
        self.children
            .get(resource_id)
            .into_iter()
            .flat_map(|children| children.values())
            .filter_map(|id| self.entries.get(id))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub async fn set_largest_changestamp(&mut self, changestamp: i64) -> Result<()> {
        self.repo.set_largest_changestamp(changestamp).await?;
        self.largest_changestamp = changestamp;
        Ok(())
    }

    /// Add a new entry and return its path.
    ///
    /// An entry whose parent is missing (or isn't a directory) is attached to
    /// the orphan bucket instead.
    #[instrument(level = "debug", skip(self, entry), fields(resource_id = %entry.resource_id))]
    pub async fn add(&mut self, mut entry: Entry) -> Result<PathBuf> {
        if self.entries.contains_key(&entry.resource_id) {
            exn::bail!(ErrorKind::AlreadyExists(entry.resource_id));
        }
        entry.parent_resource_id = self.resolve_parent(&entry.parent_resource_id);
        entry.base_name = self.unique_name(&entry.parent_resource_id, &entry, None);
        entry.deleted = false;
        self.repo.upsert(&entry).await?;
        let id = entry.resource_id.clone();
        self.index(entry);
        self.get_path(&id).ok_or_raise(|| ErrorKind::NotFound(id))
    }

    /// Remove an entry (and everything below it) and return its parent's path.
    #[instrument(level = "debug", skip(self))]
    pub async fn remove(&mut self, resource_id: &str) -> Result<PathBuf> {
        if is_reserved(resource_id) {
            exn::bail!(ErrorKind::InvalidOperation(format!("cannot remove {resource_id}")));
        }
        let entry = self.get_by_id(resource_id)?;
        let parent_path = self
            .get_path(&entry.parent_resource_id)
            .ok_or_raise(|| ErrorKind::NotFound(entry.parent_resource_id.clone()))?;
        let doomed = self.descendants_and_self(resource_id);
        self.repo.delete_many(&doomed).await?;
        for id in doomed.iter().rev() {
            self.unindex(id);
        }
        Ok(parent_path)
    }

    /// Update an existing entry in place and return its (possibly new) path.
    ///
    /// The entry keeps its identity and its children. A changed parent or
    /// title reparents or renames it; a missing parent redirects it to the
    /// orphan bucket. Changing between file and directory, or moving a
    /// directory below itself, is rejected.
    #[instrument(level = "debug", skip(self, entry), fields(resource_id = %entry.resource_id))]
    pub async fn refresh(&mut self, mut entry: Entry) -> Result<PathBuf> {
        if is_reserved(&entry.resource_id) {
            exn::bail!(ErrorKind::InvalidOperation(format!("cannot modify {}", entry.resource_id)));
        }
        let old = self.get_by_id(&entry.resource_id)?;
        if old.is_directory != entry.is_directory {
            exn::bail!(ErrorKind::InvalidOperation(format!(
                "{} cannot change between file and directory",
                entry.resource_id
            )));
        }
        let parent = self.resolve_parent(&entry.parent_resource_id);
        if self.is_descendant_or_self(&parent, &entry.resource_id) {
            exn::bail!(ErrorKind::InvalidOperation(format!(
                "moving {} below {parent} would create a cycle",
                entry.resource_id
            )));
        }
        entry.base_name = match parent == old.parent_resource_id && entry.display_name() == old.display_name() {
            true => old.base_name.clone(),
            false => self.unique_name(&parent, &entry, Some(&entry.resource_id)),
        };
        entry.parent_resource_id = parent;
        entry.deleted = false;
        self.repo.upsert(&entry).await?;
        let id = entry.resource_id.clone();
        // Children stay keyed under this ID, so only the sibling index moves.
        let children = self.children.remove(&id);
        self.unindex(&id);
        self.index(entry);
        if let Some(children) = children {
            self.children.insert(id.clone(), children);
        }
        self.get_path(&id).ok_or_raise(|| ErrorKind::NotFound(id))
    }

    /// Drop every entry apart from the reserved directories.
    #[instrument("resetting resource metadata", skip(self))]
    pub async fn reset(&mut self) -> Result<()> {
        self.repo.reset(&[GRAND_ROOT_ID, ORPHAN_BUCKET_ID]).await?;
        self.entries.retain(|id, _| is_reserved(id));
        self.children.clear();
        self.children.entry(GRAND_ROOT_ID.to_string()).or_default().insert(
            ORPHAN_BUCKET_NAME.to_string(),
            ORPHAN_BUCKET_ID.to_string(),
        );
        self.children.entry(ORPHAN_BUCKET_ID.to_string()).or_default();
        self.largest_changestamp = 0;
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) fn resolve_parent(&self, parent_id: &str) -> String {
        match self.entries.get(parent_id) {
            Some(parent) if parent.is_directory => parent_id.to_string(),
            _ => ORPHAN_BUCKET_ID.to_string(),
        }
    }

    /// First come keeps the bare name, later siblings get ` (2)`, ` (3)`, ...
    fn unique_name(&self, parent_id: &str, entry: &Entry, exclude: Option<&str>) -> String {
        let name = entry.display_name();
        let siblings = self.children.get(parent_id);
        let taken = |candidate: &str| {
            siblings
                .and_then(|s| s.get(candidate))
                .is_some_and(|owner| Some(owner.as_str()) != exclude)
        };
        if !taken(&name) {
            return name;
        }
        let mut n = 2;
        loop {
            let candidate = suffixed_name(&name, n, entry.is_directory);
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn is_descendant_or_self(&self, candidate: &str, ancestor: &str) -> bool {
        let mut current = candidate;
        for _ in 0..=self.entries.len() {
            if current == ancestor {
                return true;
            }
            match self.entries.get(current) {
                Some(entry) if current != GRAND_ROOT_ID => current = &entry.parent_resource_id,
                _ => return false,
            }
        }
        false
    }

    /// Depth-first listing; parents always come before their children.
    fn descendants_and_self(&self, resource_id: &str) -> Vec<String> {
        let mut found = vec![resource_id.to_string()];
        let mut cursor = 0;
        while cursor < found.len() {
            let children: Vec<String> =
                self.children_of(&found[cursor]).map(|child| child.resource_id.clone()).collect();
            found.extend(children);
            cursor += 1;
        }
        found
    }
}

pub fn is_reserved(resource_id: &str) -> bool {
    resource_id == GRAND_ROOT_ID || resource_id == ORPHAN_BUCKET_ID
}
