use async_trait::async_trait;
use bibsync_core::{BibEntry, ConnectionProperties};
use bibsync_shared::{Dialect, RemoteChangeHandler, SharedProcessor, SharedResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Wraps a processor and counts outbound writes. The connection can be
/// marked as lost to exercise the liveness checks.
#[allow(dead_code)]
pub struct InstrumentedProcessor {
    inner: Arc<dyn SharedProcessor>,
    pub inserts: Arc<AtomicUsize>,
    pub updates: Arc<AtomicUsize>,
    pub removes: Arc<AtomicUsize>,
    pub notifications: Arc<AtomicUsize>,
    connected: AtomicBool,
}

#[allow(dead_code)]
impl InstrumentedProcessor {
    pub fn new(inner: Arc<dyn SharedProcessor>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            inserts: Arc::new(AtomicUsize::new(0)),
            updates: Arc::new(AtomicUsize::new(0)),
            removes: Arc::new(AtomicUsize::new(0)),
            notifications: Arc::new(AtomicUsize::new(0)),
            connected: AtomicBool::new(true),
        })
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn notify_count(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    /// Total outbound writes of any kind.
    pub fn write_count(&self) -> usize {
        self.insert_count() + self.update_count() + self.remove_count()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl SharedProcessor for InstrumentedProcessor {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn connection_properties(&self) -> &ConnectionProperties {
        self.inner.connection_properties()
    }

    async fn check_base_integrity(&self) -> SharedResult<bool> {
        self.inner.check_base_integrity().await
    }

    async fn check_for_legacy_schema(&self) -> SharedResult<bool> {
        self.inner.check_for_legacy_schema().await
    }

    async fn setup_shared_database(&self) -> SharedResult<()> {
        self.inner.setup_shared_database().await
    }

    async fn insert_entries(&self, entries: &mut [BibEntry]) -> SharedResult<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_entries(entries).await
    }

    async fn update_entry(&self, entry: &BibEntry) -> SharedResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_entry(entry).await
    }

    async fn remove_entries(&self, entries: &[BibEntry]) -> SharedResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_entries(entries).await
    }

    async fn get_shared_entries(&self) -> SharedResult<Vec<BibEntry>> {
        self.inner.get_shared_entries().await
    }

    async fn get_shared_entries_by_ids(&self, shared_ids: &[i32]) -> SharedResult<Vec<BibEntry>> {
        self.inner.get_shared_entries_by_ids(shared_ids).await
    }

    async fn get_shared_id_version_mapping(&self) -> SharedResult<BTreeMap<i32, i32>> {
        self.inner.get_shared_id_version_mapping().await
    }

    async fn get_shared_metadata(&self) -> SharedResult<BTreeMap<String, String>> {
        self.inner.get_shared_metadata().await
    }

    async fn set_shared_metadata(&self, data: &BTreeMap<String, String>) -> SharedResult<()> {
        self.inner.set_shared_metadata(data).await
    }

    async fn start_notification_listener(
        &self,
        processor_id: &str,
        handler: Weak<dyn RemoteChangeHandler>,
    ) -> SharedResult<()> {
        self.inner
            .start_notification_listener(processor_id, handler)
            .await
    }

    async fn stop_notification_listener(&self) {
        self.inner.stop_notification_listener().await
    }

    async fn notify_clients(&self, processor_id: &str) -> SharedResult<()> {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        self.inner.notify_clients(processor_id).await
    }

    async fn is_connection_valid(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.inner.is_connection_valid().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
