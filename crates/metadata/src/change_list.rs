//! Applying remote change lists to the resource metadata tree.
//!
//! A *full* change list describes the complete current state of the remote
//! store; a *delta* describes what changed since a given changestamp. Both
//! are flattened into a single map keyed by resource ID (last occurrence
//! wins) and applied parents-first, so a directory created in the same batch
//! as its children always lands before them.
//!
//! Malformed entries (type changes, cyclic parents) are logged and dropped.
//! Only failures of the underlying store abort a batch.

use crate::error::{ErrorKind, Result};
use crate::models::Entry;
use crate::tree::{GRAND_ROOT_ID, ResourceMetadata, is_reserved};
use exn::OptionExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Title given to the "My Drive" root when a full listing doesn't include it.
pub const MY_DRIVE_NAME: &str = "root";

/// Flattened change lists, keyed (and therefore iterated) by resource ID.
pub type EntryMap = BTreeMap<String, Entry>;

/// One batch of entry mutations, stamped with the changestamp it brings the
/// store up to.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeList {
    pub entries: Vec<Entry>,
    pub largest_changestamp: i64,
}

/// Account-level information that accompanies a full listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AboutResource {
    /// Resource ID of the "My Drive" root directory.
    pub root_resource_id: String,
    /// Watermark the full listing is consistent with.
    pub largest_changestamp: i64,
}

/// Flatten change lists into one map; later occurrences of a resource ID
/// replace earlier ones. Also returns the largest changestamp across lists.
pub fn convert_to_map(change_lists: impl IntoIterator<Item = ChangeList>) -> (EntryMap, i64) {
    let mut map = EntryMap::new();
    let mut largest = 0;
    for list in change_lists {
        largest = largest.max(list.largest_changestamp);
        for entry in list.entries {
            map.insert(entry.resource_id.clone(), entry);
        }
    }
    (map, largest)
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Visit {
    InProgress,
    Done,
}

/// Order the map so that every entry comes after its parent (when the parent
/// is part of the same map). Entries that sit on a parent cycle are returned
/// separately and must not be applied.
fn parents_first(map: &EntryMap) -> (Vec<&str>, Vec<&str>) {
    let mut state: HashMap<&str, Visit> = HashMap::with_capacity(map.len());
    let mut order = Vec::with_capacity(map.len());
    let mut cyclic = Vec::new();
    for id in map.keys() {
        let mut chain: Vec<&str> = Vec::new();
        let mut current = id.as_str();
        loop {
            match state.get(current) {
                Some(Visit::Done) => break,
                Some(Visit::InProgress) => {
                    // Everything from the first sighting of `current` onwards loops.
                    if let Some(start) = chain.iter().position(|c| *c == current) {
                        cyclic.extend(chain.drain(start..));
                    }
                    break;
                },
                None => {},
            }
            state.insert(current, Visit::InProgress);
            chain.push(current);
            match map.get(current).and_then(|e| map.get_key_value(&e.parent_resource_id)) {
                Some((parent, _)) => current = parent.as_str(),
                None => break,
            }
        }
        for id in chain.iter().rev() {
            order.push(*id);
        }
        for id in chain.iter().chain(cyclic.iter()) {
            state.insert(*id, Visit::Done);
        }
    }
    (order, cyclic)
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Drop the entry if the error is its own fault; propagate store failures.
fn skip_malformed<T>(result: Result<T>, entry: &Entry) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_entry_error() => {
            tracing::warn!(resource_id = %entry.resource_id, error = %*err, "Dropping inconsistent change entry");
            Ok(None)
        },
        Err(err) => Err(err),
    }
}

/// Applies change lists to a [`ResourceMetadata`]. Holds no state of its own
/// between calls.
pub struct ChangeListProcessor<'a> {
    metadata: &'a mut ResourceMetadata,
}

impl<'a> ChangeListProcessor<'a> {
    pub fn new(metadata: &'a mut ResourceMetadata) -> Self {
        Self { metadata }
    }

    /// Replace the tree with the contents of a full listing.
    ///
    /// The changestamp is taken from `about` rather than from the lists. The
    /// "My Drive" root is always attached directly below the grand root; if
    /// the listing doesn't include it, it's created with a default title.
    #[instrument(
        skip(self, change_lists),
        fields(root = %about.root_resource_id, changestamp = about.largest_changestamp)
    )]
    pub async fn apply_full(&mut self, about: &AboutResource, change_lists: Vec<ChangeList>) -> Result<()> {
        let (mut map, _) = convert_to_map(change_lists);
        self.metadata.reset().await?;

        let mut root = map
            .remove(&about.root_resource_id)
            .unwrap_or_else(|| Entry::directory(&about.root_resource_id, GRAND_ROOT_ID, MY_DRIVE_NAME));
        root.parent_resource_id = GRAND_ROOT_ID.to_string();
        root.is_directory = true;
        root.deleted = false;
        root.directory_changestamp = about.largest_changestamp;
        self.metadata.add(root).await?;

        let (order, cyclic) = parents_first(&map);
        for id in &cyclic {
            tracing::warn!(resource_id = %id, "Dropping entry with cyclic parent chain");
        }
        let mut added = 0usize;
        for id in order {
            let Some(entry) = map.get(id) else { continue };
            // Tombstones in a full listing have nothing to remove. Their
            // children still land (in the orphan bucket).
            if entry.deleted {
                continue;
            }
            let mut entry = entry.clone();
            if entry.is_directory {
                entry.directory_changestamp = about.largest_changestamp;
            }
            let result = self.metadata.add(entry).await;
            if skip_malformed(result, &map[id])?.is_some() {
                added += 1;
            }
        }
        self.metadata.set_largest_changestamp(about.largest_changestamp).await?;
        tracing::info!(entries = added, "Applied full resource list");
        Ok(())
    }

    /// Apply incremental changes and return the directories whose listing
    /// changed.
    ///
    /// Adds and moves land first, parents before children. Removals run
    /// afterwards, so an entry that moves out of a deleted directory in the
    /// same batch keeps its subtree.
    ///
    /// - A deleted entry is removed (with everything below it) and its parent
    ///   reported.
    /// - A moved or renamed entry is updated in place and both its old and new
    ///   parents are reported.
    /// - A new entry is added and its parent reported.
    /// - An entry whose parent is deleted (or itself skipped) in the same
    ///   batch never appears live: it is not added, and if it already exists
    ///   it is removed.
    /// - The watermark only moves forward.
    #[instrument(skip(self, change_lists))]
    pub async fn apply_delta(&mut self, change_lists: Vec<ChangeList>) -> Result<BTreeSet<PathBuf>> {
        let (map, largest) = convert_to_map(change_lists);
        let (order, cyclic) = parents_first(&map);
        for id in &cyclic {
            tracing::warn!(resource_id = %id, "Dropping entry with cyclic parent chain");
        }
        let mut changed = BTreeSet::new();
        let mut skipped: HashSet<&str> = HashSet::new();
        let mut removals: Vec<&Entry> = Vec::new();

        for id in order {
            let Some(entry) = map.get(id) else { continue };
            if entry.deleted {
                removals.push(entry);
                continue;
            }
            let stillborn = map
                .get(&entry.parent_resource_id)
                .is_some_and(|parent| parent.deleted || skipped.contains(parent.resource_id.as_str()));
            if stillborn {
                tracing::debug!(
                    resource_id = %id,
                    parent = %entry.parent_resource_id,
                    "Skipping child of deleted directory"
                );
                skipped.insert(id);
                removals.push(entry);
                continue;
            }

            let mut entry = entry.clone();
            if entry.is_directory && largest > 0 {
                entry.directory_changestamp = largest;
            }
            match self.metadata.get_by_id(id).ok().map(|existing| {
                // Compare against where the entry would actually land.
                let mut resolved = entry.clone();
                resolved.parent_resource_id = self.metadata.resolve_parent(&entry.parent_resource_id);
                existing.same_content(&resolved)
            }) {
                Some(unchanged) => {
                    let old_path = self.metadata.get_path(id);
                    let result = self.metadata.refresh(entry.clone()).await;
                    let Some(new_path) = skip_malformed(result, &entry)? else { continue };
                    match old_path {
                        Some(old_path) if old_path != new_path => {
                            changed.insert(parent_of(&old_path));
                            changed.insert(parent_of(&new_path));
                        },
                        _ if !unchanged => {
                            changed.insert(parent_of(&new_path));
                        },
                        _ => {},
                    }
                },
                None => {
                    let result = self.metadata.add(entry.clone()).await;
                    if let Some(path) = skip_malformed(result, &entry)? {
                        changed.insert(parent_of(&path));
                    }
                },
            }
        }

        for entry in removals {
            // Already gone with a removed ancestor, or never known.
            if !self.metadata.contains(&entry.resource_id) {
                continue;
            }
            if let Some(parent) = skip_malformed(self.metadata.remove(&entry.resource_id).await, entry)? {
                changed.insert(parent);
            }
        }

        if largest > self.metadata.largest_changestamp() {
            self.metadata.set_largest_changestamp(largest).await?;
        }
        tracing::info!(
            entries = map.len(),
            changed = changed.len(),
            changestamp = self.metadata.largest_changestamp(),
            "Applied delta"
        );
        Ok(changed)
    }

    /// Replace the children of one directory with a listing fetched for just
    /// that directory, ahead of a full sync. Returns the directory's path.
    ///
    /// Entries not parented at the directory are ignored. Children missing
    /// from the listing are removed.
    #[instrument(skip(self, change_lists))]
    pub async fn refresh_directory(
        &mut self,
        directory_id: &str,
        changestamp: i64,
        change_lists: Vec<ChangeList>,
    ) -> Result<PathBuf> {
        let mut directory = self.metadata.get_by_id(directory_id)?.clone();
        if !directory.is_directory {
            exn::bail!(ErrorKind::NotADirectory(directory_id.to_string()));
        }
        let (map, _) = convert_to_map(change_lists);

        let stale: Vec<String> = self
            .metadata
            .children_of(directory_id)
            .filter(|child| map.get(&child.resource_id).is_none_or(|e| e.deleted))
            .map(|child| child.resource_id.clone())
            .collect();
        for id in stale {
            self.metadata.remove(&id).await?;
        }

        for entry in map.values().filter(|e| !e.deleted && e.parent_resource_id == directory_id) {
            let result = match self.metadata.contains(&entry.resource_id) {
                true => self.metadata.refresh(entry.clone()).await,
                false => self.metadata.add(entry.clone()).await,
            };
            skip_malformed(result, entry)?;
        }

        if is_reserved(directory_id) {
            return self
                .metadata
                .get_path(directory_id)
                .ok_or_raise(|| ErrorKind::NotFound(directory_id.to_string()));
        }
        directory.directory_changestamp = changestamp;
        self.metadata.refresh(directory).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ORPHAN_BUCKET_ID;
    use rstest::rstest;

    const ROOT: &str = "fake_root";
    const BASE_CHANGESTAMP: i64 = 123;

    fn about() -> AboutResource {
        AboutResource { root_resource_id: ROOT.to_string(), largest_changestamp: BASE_CHANGESTAMP }
    }

    fn base_list() -> ChangeList {
        ChangeList {
            entries: vec![
                Entry::file("file:2_file_resource_id", ROOT, "File 1.txt"),
                Entry::directory("folder:1_folder_resource_id", ROOT, "Directory 1"),
                Entry::file("file:subdirectory_file_1_id", "folder:1_folder_resource_id", "SubDirectory File 1.txt"),
                Entry::directory("folder:sub_dir_folder_2_self_link", ROOT, "Directory 2 excludeDir-test"),
                Entry::directory(
                    "folder:sub_dir_folder_resource_id",
                    "folder:1_folder_resource_id",
                    "Sub Directory Folder",
                ),
                Entry::file("file:1_orphanfile_resource_id", "folder:does_not_exist", "Orphan File 1.txt"),
                Entry::file("document:5_document_resource_id", ROOT, "Document 1 excludeDir-test")
                    .with_hosted_document(""),
            ],
            largest_changestamp: 0,
        }
    }

    async fn fixture() -> ResourceMetadata {
        let mut tree = ResourceMetadata::connect_in_memory().await.unwrap();
        ChangeListProcessor::new(&mut tree).apply_full(&about(), vec![base_list()]).await.unwrap();
        tree
    }

    fn delta(entries: Vec<Entry>, changestamp: i64) -> Vec<ChangeList> {
        vec![ChangeList { entries, largest_changestamp: changestamp }]
    }

    fn paths(items: &[&str]) -> BTreeSet<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_convert_to_map_last_occurrence_wins() {
        let lists = vec![
            ChangeList { entries: vec![Entry::file("a", ROOT, "First")], largest_changestamp: 10 },
            ChangeList {
                entries: vec![Entry::file("a", ROOT, "Second").with_deleted(true), Entry::file("b", ROOT, "B")],
                largest_changestamp: 12,
            },
        ];
        let (map, largest) = convert_to_map(lists);
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"].title, "Second");
        assert!(map["a"].deleted);
        assert_eq!(largest, 12);
    }

    #[test]
    fn test_parents_first_orders_and_detects_cycles() {
        let (map, _) = convert_to_map(delta(
            vec![
                Entry::file("a-child", "z-parent", "Child"),
                Entry::directory("z-parent", ROOT, "Parent"),
                Entry::directory("loop1", "loop2", "Loop 1"),
                Entry::directory("loop2", "loop1", "Loop 2"),
                Entry::file("under-loop", "loop1", "Stranded"),
            ],
            0,
        ));
        let (order, cyclic) = parents_first(&map);
        let position = |id: &str| order.iter().position(|o| *o == id).unwrap();
        assert!(position("z-parent") < position("a-child"));
        assert!(order.contains(&"under-loop"));
        assert!(!order.contains(&"loop1") && !order.contains(&"loop2"));
        assert_eq!(cyclic.len(), 2);
    }

    #[rstest]
    #[case("drive/root", ROOT)]
    #[case("drive/root/File 1.txt", "file:2_file_resource_id")]
    #[case("drive/root/Directory 1", "folder:1_folder_resource_id")]
    #[case("drive/root/Directory 1/SubDirectory File 1.txt", "file:subdirectory_file_1_id")]
    #[case("drive/root/Directory 1/Sub Directory Folder", "folder:sub_dir_folder_resource_id")]
    #[case("drive/root/Document 1 excludeDir-test.gdoc", "document:5_document_resource_id")]
    #[case("drive/other/Orphan File 1.txt", "file:1_orphanfile_resource_id")]
    #[tokio::test]
    async fn test_apply_full(#[case] path: &str, #[case] id: &str) {
        let tree = fixture().await;
        assert_eq!(tree.get_by_path(path).unwrap().resource_id, id);
        assert_eq!(tree.largest_changestamp(), BASE_CHANGESTAMP);
    }

    #[tokio::test]
    async fn test_apply_full_stamps_directories_and_replaces_previous_state() {
        let mut tree = fixture().await;
        let dir = tree.get_by_id("folder:1_folder_resource_id").unwrap();
        assert_eq!(dir.directory_changestamp, BASE_CHANGESTAMP);
        assert_eq!(tree.get_by_id("file:1_orphanfile_resource_id").unwrap().parent_resource_id, ORPHAN_BUCKET_ID);

        let about = AboutResource { root_resource_id: ROOT.to_string(), largest_changestamp: 200 };
        let list = ChangeList { entries: vec![Entry::file("only", ROOT, "Only.txt")], largest_changestamp: 0 };
        ChangeListProcessor::new(&mut tree).apply_full(&about, vec![list]).await.unwrap();
        assert!(!tree.contains("folder:1_folder_resource_id"));
        assert!(tree.get_by_path("drive/root/Only.txt").is_ok());
        assert_eq!(tree.largest_changestamp(), 200);
    }

    #[tokio::test]
    async fn test_delta_file_added_in_new_directory() {
        let mut tree = fixture().await;
        let changes = delta(
            vec![
                Entry::file("document:file_added_in_new_dir_id", "folder:new_folder_resource_id", "File in new dir")
                    .with_hosted_document(""),
                Entry::directory("folder:new_folder_resource_id", ROOT, "New Directory"),
            ],
            16730,
        );
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert_eq!(tree.largest_changestamp(), 16730);
        assert!(tree.get_by_path("drive/root/New Directory/File in new dir.gdoc").is_ok());
        assert_eq!(changed, paths(&["drive/root", "drive/root/New Directory"]));
        let dir = tree.get_by_id("folder:new_folder_resource_id").unwrap();
        assert_eq!(dir.directory_changestamp, 16730);
    }

    #[tokio::test]
    async fn test_delta_dir_moved_reports_old_and_new_parent() {
        let mut tree = fixture().await;
        let changes = delta(
            vec![Entry::directory("folder:1_folder_resource_id", "folder:sub_dir_folder_2_self_link", "Directory 1")],
            16809,
        );
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert!(tree.get_by_path("drive/root/Directory 1").is_err());
        assert!(
            tree.get_by_path("drive/root/Directory 2 excludeDir-test/Directory 1/SubDirectory File 1.txt")
                .is_ok()
        );
        assert_eq!(changed, paths(&["drive/root", "drive/root/Directory 2 excludeDir-test"]));
    }

    #[tokio::test]
    async fn test_delta_file_moved_from_directory_to_root() {
        let mut tree = fixture().await;
        let changes = delta(vec![Entry::file("file:subdirectory_file_1_id", ROOT, "SubDirectory File 1.txt")], 16815);
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert!(tree.get_by_path("drive/root/SubDirectory File 1.txt").is_ok());
        assert_eq!(changed, paths(&["drive/root", "drive/root/Directory 1"]));
    }

    #[tokio::test]
    async fn test_delta_file_deleted_in_directory() {
        let mut tree = fixture().await;
        let changes = delta(
            vec![
                Entry::file("file:subdirectory_file_1_id", "folder:1_folder_resource_id", "SubDirectory File 1.txt")
                    .with_deleted(true),
            ],
            16770,
        );
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert!(!tree.contains("file:subdirectory_file_1_id"));
        assert_eq!(changed, paths(&["drive/root/Directory 1"]));
        assert_eq!(tree.largest_changestamp(), 16770);
    }

    #[tokio::test]
    async fn test_delete_of_unknown_entry_is_noop() {
        let mut tree = fixture().await;
        let changes = delta(vec![Entry::file("file:never_seen", ROOT, "Ghost").with_deleted(true)], 16771);
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_delta_child_of_stillborn_directory_is_skipped() {
        let mut tree = fixture().await;
        let lists = vec![
            ChangeList {
                entries: vec![
                    Entry::directory("folder:new_folder_resource_id", ROOT, "New Directory"),
                    Entry::file(
                        "pdf:file_added_in_deleted_dir_id",
                        "folder:new_folder_resource_id",
                        "new_pdf_file.pdf",
                    ),
                ],
                largest_changestamp: 16729,
            },
            ChangeList {
                entries: vec![
                    Entry::directory("folder:new_folder_resource_id", ROOT, "New Directory").with_deleted(true),
                ],
                largest_changestamp: 16730,
            },
        ];
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(lists).await.unwrap();
        assert_eq!(tree.largest_changestamp(), 16730);
        assert!(!tree.contains("pdf:file_added_in_deleted_dir_id"));
        assert!(tree.get_by_path("drive/root/New Directory/new_pdf_file.pdf").is_err());
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_delta_with_missing_parent_goes_to_orphan_bucket() {
        let mut tree = fixture().await;
        let changes = delta(vec![Entry::file("file:lost", "folder:unknown", "Lost.txt")], 16800);
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes.clone()).await.unwrap();
        assert!(tree.get_by_path("drive/other/Lost.txt").is_ok());
        assert_eq!(changed, paths(&["drive/other"]));

        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert!(changed.is_empty());
        assert!(tree.get_by_path("drive/other/Lost.txt").is_ok());
    }

    #[tokio::test]
    async fn test_delta_move_out_of_deleted_directory_keeps_subtree() {
        let mut tree = ResourceMetadata::connect_in_memory().await.unwrap();
        let full = ChangeList {
            entries: vec![
                Entry::directory("a-dir", ROOT, "A-dir"),
                Entry::directory("s-sub", "a-dir", "S-sub"),
                Entry::file("x", "s-sub", "x.txt"),
            ],
            largest_changestamp: 0,
        };
        ChangeListProcessor::new(&mut tree).apply_full(&about(), vec![full]).await.unwrap();

        let changes = delta(
            vec![
                Entry::directory("s-sub", ROOT, "S-sub"),
                Entry::directory("a-dir", ROOT, "A-dir").with_deleted(true),
            ],
            200,
        );
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert!(!tree.contains("a-dir"));
        assert_eq!(tree.get_path("s-sub").unwrap(), Path::new("drive/root/S-sub"));
        assert_eq!(tree.get_path("x").unwrap(), Path::new("drive/root/S-sub/x.txt"));
        assert_eq!(changed, paths(&["drive/root", "drive/root/A-dir"]));
    }

    #[tokio::test]
    async fn test_delta_existing_entry_moved_into_stillborn_directory_is_removed() {
        let mut tree = fixture().await;
        let lists = vec![
            ChangeList {
                entries: vec![
                    Entry::directory("folder:new_folder_resource_id", ROOT, "New Directory"),
                    Entry::file(
                        "file:subdirectory_file_1_id",
                        "folder:new_folder_resource_id",
                        "SubDirectory File 1.txt",
                    ),
                ],
                largest_changestamp: 16729,
            },
            ChangeList {
                entries: vec![
                    Entry::directory("folder:new_folder_resource_id", ROOT, "New Directory").with_deleted(true),
                ],
                largest_changestamp: 16730,
            },
        ];
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(lists).await.unwrap();
        assert!(!tree.contains("file:subdirectory_file_1_id"));
        assert!(!tree.contains("folder:new_folder_resource_id"));
        assert!(tree.get_by_path("drive/root/Directory 1/SubDirectory File 1.txt").is_err());
        assert_eq!(changed, paths(&["drive/root/Directory 1"]));
    }

    #[rstest]
    #[case::no_lists(vec![])]
    #[case::unstamped(delta(vec![Entry::file("file:new", ROOT, "New.txt")], 0))]
    #[case::older(delta(vec![Entry::file("file:new", ROOT, "New.txt")], 50))]
    #[tokio::test]
    async fn test_delta_never_lowers_watermark(#[case] changes: Vec<ChangeList>) {
        let mut tree = fixture().await;
        ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert_eq!(tree.largest_changestamp(), BASE_CHANGESTAMP);
    }

    #[tokio::test]
    async fn test_delta_drops_malformed_entries_and_continues() {
        let mut tree = fixture().await;
        let changes = delta(
            vec![
                // A file can't turn into a directory.
                Entry::directory("file:2_file_resource_id", ROOT, "File 1.txt"),
                // Moving a directory below its own child is a cycle.
                Entry::directory("folder:1_folder_resource_id", "folder:sub_dir_folder_resource_id", "Directory 1"),
                Entry::file("file:new", ROOT, "New.txt"),
            ],
            16900,
        );
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        assert!(!tree.get_by_id("file:2_file_resource_id").unwrap().is_directory);
        assert!(tree.get_by_path("drive/root/Directory 1/Sub Directory Folder").is_ok());
        assert!(tree.get_by_path("drive/root/New.txt").is_ok());
        assert_eq!(changed, paths(&["drive/root"]));
        assert_eq!(tree.largest_changestamp(), 16900);
    }

    #[tokio::test]
    async fn test_rename_scenario_and_idempotence() {
        let mut tree = ResourceMetadata::connect_in_memory().await.unwrap();
        let about = AboutResource { root_resource_id: "root".to_string(), largest_changestamp: 1 };
        let full = ChangeList {
            entries: vec![
                Entry::directory("root", GRAND_ROOT_ID, "R"),
                Entry::file("f1", "root", "A.txt").with_content_hash("h1"),
            ],
            largest_changestamp: 0,
        };
        ChangeListProcessor::new(&mut tree).apply_full(&about, vec![full]).await.unwrap();
        assert!(tree.get_by_path("drive/R/A.txt").is_ok());

        let rename = || delta(vec![Entry::file("f1", "root", "B.txt").with_content_hash("h1")], 7);
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(rename()).await.unwrap();
        let err = tree.get_by_path("drive/R/A.txt").unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert_eq!(tree.get_by_path("drive/R/B.txt").unwrap().resource_id, "f1");
        assert_eq!(changed, paths(&["drive/R"]));
        assert_eq!(tree.largest_changestamp(), 7);

        // Replaying the same batch changes nothing observable.
        let before: BTreeMap<String, Entry> = tree.iter().map(|e| (e.resource_id.clone(), e.clone())).collect();
        let changed = ChangeListProcessor::new(&mut tree).apply_delta(rename()).await.unwrap();
        let after: BTreeMap<String, Entry> = tree.iter().map(|e| (e.resource_id.clone(), e.clone())).collect();
        assert_eq!(before, after);
        assert!(changed.is_empty());
        assert_eq!(tree.largest_changestamp(), 7);
    }

    #[tokio::test]
    async fn test_every_entry_reaches_the_grand_root() {
        let mut tree = fixture().await;
        let changes = delta(
            vec![
                Entry::directory("folder:sub_dir_folder_2_self_link", "folder:1_folder_resource_id", "Moved"),
                Entry::file("file:x", "folder:sub_dir_folder_2_self_link", "X"),
                Entry::directory("loop-a", "loop-b", "A"),
                Entry::directory("loop-b", "loop-a", "B"),
            ],
            20000,
        );
        ChangeListProcessor::new(&mut tree).apply_delta(changes).await.unwrap();
        for entry in tree.iter() {
            let path = tree.get_path(&entry.resource_id).unwrap();
            assert!(path.starts_with("drive"), "{} is detached", entry.resource_id);
        }
    }

    #[tokio::test]
    async fn test_refresh_directory() {
        let mut tree = fixture().await;
        let listing = ChangeList {
            entries: vec![
                Entry::file("file:fresh", "folder:1_folder_resource_id", "Fresh.txt"),
                Entry::directory(
                    "folder:sub_dir_folder_resource_id",
                    "folder:1_folder_resource_id",
                    "Sub Directory Folder",
                ),
                // Not in this directory; ignored.
                Entry::file("file:elsewhere", ROOT, "Elsewhere.txt"),
            ],
            largest_changestamp: 0,
        };
        let path = ChangeListProcessor::new(&mut tree)
            .refresh_directory("folder:1_folder_resource_id", 500, vec![listing])
            .await
            .unwrap();
        assert_eq!(path, Path::new("drive/root/Directory 1"));
        assert!(tree.get_by_path("drive/root/Directory 1/Fresh.txt").is_ok());
        assert!(!tree.contains("file:subdirectory_file_1_id"));
        assert!(!tree.contains("file:elsewhere"));
        assert_eq!(tree.get_by_id("folder:1_folder_resource_id").unwrap().directory_changestamp, 500);
        // The global watermark is untouched.
        assert_eq!(tree.largest_changestamp(), BASE_CHANGESTAMP);
    }
}
