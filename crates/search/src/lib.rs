//! Fuzzy filename search over the metadata tree.
//!
//! A search walks every entry of a [`ResourceMetadata`] tree, filters it by
//! [`SearchOptions`], matches its base name against the query with
//! [`find_and_highlight`], and keeps the most recently used matches. The
//! content cache is consulted only for offline searches.

pub mod error;
mod highlight;

pub use crate::highlight::find_and_highlight;

use crate::error::{ErrorKind, Result};
use drivefs_cache::FileCache;
use drivefs_metadata::{Entry, GRAND_ROOT_ID, ResourceMetadata};
use exn::ResultExt;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::path::PathBuf;
use time::UtcDateTime;
use tracing::instrument;

/// Default number of results returned by a search.
pub const DEFAULT_MAX_RESULTS: usize = 10;

/// Which entries a search considers.
///
/// `shared_with_me` and `offline` each replace the default filter rather than
/// narrowing it; `shared_with_me` wins if both are set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SearchOptions {
    pub exclude_hosted_documents: bool,
    pub exclude_directories: bool,
    /// Only entries shared with the user.
    pub shared_with_me: bool,
    /// Only hosted documents and files with cached bytes.
    pub offline: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchResult {
    pub path: PathBuf,
    pub entry: Entry,
    /// HTML-escaped base name with the match wrapped in `<b>`. Empty for an
    /// empty query.
    pub highlighted_title: String,
}

/// Orders candidates so that the heap's top is the least recent one.
struct Candidate(SearchResult);
impl Candidate {
    fn recency(&self) -> Reverse<(UtcDateTime, UtcDateTime)> {
        Reverse(recency(&self.0.entry))
    }
}
impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.recency() == other.recency()
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.recency().cmp(&other.recency())
    }
}

fn recency(entry: &Entry) -> (UtcDateTime, UtcDateTime) {
    (entry.last_accessed, entry.last_modified)
}

/// Search the tree for entries whose base name contains `query`, ignoring case
/// and accents. Returns at most `max_results` results, most recently accessed
/// first (then most recently modified).
#[instrument(skip(tree, cache))]
pub async fn search(
    tree: &ResourceMetadata,
    cache: &FileCache,
    query: &str,
    options: SearchOptions,
    max_results: usize,
) -> Result<Vec<SearchResult>> {
    let present = match options.offline && !options.shared_with_me {
        true => present_resources(cache).await?,
        false => HashSet::new(),
    };
    let results = search_entries(tree, &present, query, options, max_results);
    tracing::debug!(results = results.len(), "Searched metadata");
    Ok(results)
}

async fn present_resources(cache: &FileCache) -> Result<HashSet<String>> {
    let entries = cache.entries().await.or_raise(|| ErrorKind::Cache)?;
    Ok(entries.into_iter().filter(|e| e.is_present).map(|e| e.resource_id).collect())
}

fn search_entries(
    tree: &ResourceMetadata,
    present: &HashSet<String>,
    query: &str,
    options: SearchOptions,
    max_results: usize,
) -> Vec<SearchResult> {
    if max_results == 0 {
        return Vec::new();
    }
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(max_results);
    for entry in tree.iter() {
        // Cheap check first: a full heap only takes strictly more recent entries.
        if candidates.len() == max_results
            && candidates.peek().is_some_and(|worst| recency(entry) <= recency(&worst.0.entry))
        {
            continue;
        }
        if !is_eligible(entry, present, options) {
            continue;
        }
        let Some(highlighted_title) = find_and_highlight(&entry.base_name, query) else {
            continue;
        };
        let Some(path) = tree.get_path(&entry.resource_id) else {
            continue;
        };
        if candidates.len() == max_results {
            candidates.pop();
        }
        candidates.push(Candidate(SearchResult { path, entry: entry.clone(), highlighted_title }));
    }
    candidates.into_sorted_vec().into_iter().map(|c| c.0).collect()
}

fn is_eligible(entry: &Entry, present: &HashSet<String>, options: SearchOptions) -> bool {
    if options.exclude_hosted_documents && entry.is_hosted_document {
        return false;
    }
    if options.exclude_directories && entry.is_directory {
        return false;
    }
    if options.shared_with_me {
        return entry.shared_with_me;
    }
    if options.offline {
        return entry.is_hosted_document || present.contains(&entry.resource_id);
    }
    // The grand root and the containers directly below it.
    entry.resource_id != GRAND_ROOT_ID && entry.parent_resource_id != GRAND_ROOT_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivefs_cache::FileOperation;
    use drivefs_metadata::{AboutResource, ChangeList, ChangeListProcessor};
    use rstest::rstest;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        tree: ResourceMetadata,
        cache: FileCache,
    }

    fn at(day: i64) -> UtcDateTime {
        UtcDateTime::from_unix_timestamp(1_704_067_200 + day * 86_400).unwrap()
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = ResourceMetadata::connect_in_memory().await.unwrap();
        let entries = vec![
            Entry::directory("root", "", "root"),
            Entry::directory("dir1", "root", "Directory 1").with_last_accessed(at(3)),
            Entry::file("file1", "dir1", "SubDirectory File 1.txt")
                .with_content_hash("h1")
                .with_last_accessed(at(2)),
            Entry::file("shared", "dir1", "Shared To The Account Owner.txt")
                .with_content_hash("h2")
                .with_shared_with_me(true)
                .with_last_accessed(at(1)),
            Entry::directory("slash", "root", "Slash / in directory").with_last_accessed(at(1)),
            Entry::file("file2", "slash", "Slash SubDir File.txt")
                .with_content_hash("h3")
                .with_last_accessed(at(6)),
            Entry::file("doc1", "root", "Document 1 excludeDir-test")
                .with_hosted_document(".gdoc")
                .with_last_accessed(at(4)),
            Entry::directory("dir2", "root", "Directory 2 excludeDir-test").with_last_accessed(at(5)),
        ];
        let about = AboutResource { root_resource_id: "root".into(), largest_changestamp: 100 };
        ChangeListProcessor::new(&mut tree)
            .apply_full(&about, vec![ChangeList { entries, largest_changestamp: 100 }])
            .await
            .unwrap();

        let mut cache = FileCache::open(dir.path().join("cache"), 0).await.unwrap();
        let src = dir.path().join("bytes");
        tokio::fs::write(&src, "bytes").await.unwrap();
        cache.store("file1", "h1", &src, FileOperation::Copy).await.unwrap();
        Fixture { _dir: dir, tree, cache }
    }

    async fn paths(f: &Fixture, query: &str, options: SearchOptions, max: usize) -> Vec<PathBuf> {
        search(&f.tree, &f.cache, query, options, max)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect()
    }

    #[tokio::test]
    async fn test_zero_matches() {
        let f = fixture().await;
        assert!(paths(&f, "NonExistent", SearchOptions::default(), DEFAULT_MAX_RESULTS).await.is_empty());
    }

    #[tokio::test]
    async fn test_case_insensitive_match() {
        let f = fixture().await;
        let results = search(&f.tree, &f.cache, "subdirectory file 1.txt", SearchOptions::default(), 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, Path::new("drive/root/Directory 1/SubDirectory File 1.txt"));
        assert_eq!(results[0].highlighted_title, "<b>SubDirectory File 1.txt</b>");
    }

    #[tokio::test]
    async fn test_results_ordered_by_recency() {
        let f = fixture().await;
        assert_eq!(
            paths(&f, "SubDir", SearchOptions::default(), 10).await,
            [
                Path::new("drive/root/Slash \u{2215} in directory/Slash SubDir File.txt"),
                Path::new("drive/root/Directory 1/SubDirectory File 1.txt"),
            ]
        );
    }

    #[tokio::test]
    async fn test_at_most_one_result() {
        let f = fixture().await;
        assert_eq!(
            paths(&f, "SubDir", SearchOptions::default(), 1).await,
            [Path::new("drive/root/Slash \u{2215} in directory/Slash SubDir File.txt")]
        );
        assert!(paths(&f, "SubDir", SearchOptions::default(), 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_hosted_documents() {
        let f = fixture().await;
        assert_eq!(
            paths(&f, "Document", SearchOptions::default(), 10).await,
            [Path::new("drive/root/Document 1 excludeDir-test.gdoc")]
        );
        let options = SearchOptions { exclude_hosted_documents: true, ..Default::default() };
        assert!(paths(&f, "Document", options, 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_exclude_directories() {
        let f = fixture().await;
        assert_eq!(
            paths(&f, "excludeDir-test", SearchOptions::default(), 10).await,
            [
                Path::new("drive/root/Directory 2 excludeDir-test"),
                Path::new("drive/root/Document 1 excludeDir-test.gdoc"),
            ]
        );
        let options = SearchOptions { exclude_directories: true, ..Default::default() };
        assert_eq!(
            paths(&f, "excludeDir-test", options, 10).await,
            [Path::new("drive/root/Document 1 excludeDir-test.gdoc")]
        );
    }

    #[tokio::test]
    async fn test_shared_with_me() {
        let f = fixture().await;
        let options = SearchOptions { shared_with_me: true, ..Default::default() };
        assert_eq!(
            paths(&f, "", options, 10).await,
            [Path::new("drive/root/Directory 1/Shared To The Account Owner.txt")]
        );
    }

    #[tokio::test]
    async fn test_offline() {
        let f = fixture().await;
        let options = SearchOptions { offline: true, ..Default::default() };
        assert_eq!(
            paths(&f, "", options, 10).await,
            [
                Path::new("drive/root/Document 1 excludeDir-test.gdoc"),
                Path::new("drive/root/Directory 1/SubDirectory File 1.txt"),
            ]
        );
    }

    #[rstest]
    #[case("drive")]
    #[case("root")]
    #[case("other")]
    #[tokio::test]
    async fn test_reserved_directories_never_match(#[case] query: &str) {
        let f = fixture().await;
        assert!(paths(&f, query, SearchOptions::default(), 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_returns_everything_by_recency() {
        let f = fixture().await;
        let results = search(&f.tree, &f.cache, "", SearchOptions::default(), 100).await.unwrap();
        assert_eq!(results.len(), 7);
        assert!(results.iter().all(|r| r.highlighted_title.is_empty()));
        for pair in results.windows(2) {
            assert!(recency(&pair[0].entry) >= recency(&pair[1].entry));
        }
    }
}
