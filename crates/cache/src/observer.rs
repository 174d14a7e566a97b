/// Receives notifications about cache state changes that other components
/// (sync, UI) care about. All methods default to doing nothing.
pub trait CacheObserver: Send + Sync {
    fn on_cache_pinned(&self, _resource_id: &str, _content_hash: &str) {}
    fn on_cache_unpinned(&self, _resource_id: &str, _content_hash: &str) {}
    /// A dirty file is ready to be uploaded.
    fn on_cache_committed(&self, _resource_id: &str) {}
}
