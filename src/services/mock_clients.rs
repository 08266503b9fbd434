//! In-memory store, queue and repository with failure injection, for
//! exercising the ingestion and deletion services.

use super::{
    metadata_repository::{FileRepository, FileTransaction, RepoError, RepoResult},
    object_store::{ObjectStore, StoreError, StoreResult},
    queue_client::{NotificationQueue, QueueError, QueueResult},
};
use crate::models::{
    file_record::FileRecord,
    metadata_record::MetadataRecord,
    notification::{FileNotification, ReceivedMessage},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

fn injected(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("injected {} failure", what))
}

#[derive(Default)]
pub struct MockObjectStore {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    containers: Mutex<HashSet<String>>,
    pub fail_ensure: AtomicBool,
    pub fail_put: AtomicBool,
    pub fail_delete: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockObjectStore {
    pub fn contains(&self, container: &str, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&(container.to_string(), key.to_string()))
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn ensure_container_exists(&self, container: &str) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ensure.load(Ordering::SeqCst) {
            return Err(StoreError::AccessDenied(container.to_string()));
        }
        self.containers.lock().unwrap().insert(container.to_string());
        Ok(())
    }

    async fn put(&self, container: &str, key: &str, body: Bytes) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.containers.lock().unwrap().contains(container) {
            return Err(StoreError::BucketNotFound(container.to_string()));
        }
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StoreError::Io(injected("put")));
        }
        let mut objects = self.objects.lock().unwrap();
        let slot = (container.to_string(), key.to_string());
        if objects.contains_key(&slot) {
            return Err(StoreError::ObjectExists {
                bucket: container.to_string(),
                key: key.to_string(),
            });
        }
        objects.insert(slot, body);
        Ok(())
    }

    async fn get(&self, container: &str, key: &str) -> StoreResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .get(&(container.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::ObjectNotFound {
                bucket: container.to_string(),
                key: key.to_string(),
            })
    }

    async fn delete(&self, container: &str, key: &str) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreError::Io(injected("delete")));
        }
        self.objects
            .lock()
            .unwrap()
            .remove(&(container.to_string(), key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockQueue {
    messages: Mutex<Vec<(String, FileNotification)>>,
    in_flight: Mutex<HashMap<String, String>>,
    receive_counts: Mutex<HashMap<String, i64>>,
    next_id: AtomicUsize,
    pub fail_send: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockQueue {
    pub fn sent(&self) -> Vec<FileNotification> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every unacknowledged delivery visible again.
    pub fn expire_visibility(&self) {
        self.in_flight.lock().unwrap().clear();
    }
}

#[async_trait]
impl NotificationQueue for MockQueue {
    async fn send(&self, message: &FileNotification) -> QueueResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(QueueError::Unresolved("mock".into()));
        }
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.messages
            .lock()
            .unwrap()
            .push((id.clone(), message.clone()));
        Ok(id)
    }

    async fn receive(&self) -> QueueResult<Option<ReceivedMessage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let messages = self.messages.lock().unwrap();
        let mut in_flight = self.in_flight.lock().unwrap();
        let next = messages
            .iter()
            .find(|(id, _)| !in_flight.values().any(|claimed| claimed == id));
        Ok(next.map(|(id, message)| {
            let mut counts = self.receive_counts.lock().unwrap();
            let count = counts.entry(id.clone()).or_insert(0);
            *count += 1;
            let receipt = format!("receipt-{}-{}", id, count);
            in_flight.insert(receipt.clone(), id.clone());
            ReceivedMessage {
                message_id: id.clone(),
                receipt_handle: receipt,
                payload: Some(message.clone()),
                receive_count: *count,
            }
        }))
    }

    async fn acknowledge(&self, receipt_handle: &str) -> QueueResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(id) = self.in_flight.lock().unwrap().remove(receipt_handle) else {
            return Ok(false);
        };
        self.messages.lock().unwrap().retain(|(message_id, _)| *message_id != id);
        Ok(true)
    }

    async fn depth(&self) -> QueueResult<i64> {
        Ok(self.messages.lock().unwrap().len() as i64)
    }
}

#[derive(Default)]
struct RepoState {
    files: HashMap<String, FileRecord>,
    metadata: HashMap<String, MetadataRecord>,
}

#[derive(Default)]
pub struct MockRepository {
    state: Arc<Mutex<RepoState>>,
    pub fail_begin: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_commit: Arc<AtomicBool>,
    pub fail_delete: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockRepository {
    pub fn insert(&self, record: FileRecord) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(record.store_key.clone(), record);
    }

    pub fn contains(&self, store_key: &str) -> bool {
        self.state.lock().unwrap().files.contains_key(store_key)
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().unwrap().files.len()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct MockTransaction {
    state: Arc<Mutex<RepoState>>,
    staged: Vec<FileRecord>,
    fail_commit: Arc<AtomicBool>,
}

#[async_trait]
impl FileTransaction for MockTransaction {
    async fn create_file_record(&mut self, record: &FileRecord) -> RepoResult<()> {
        if self.state.lock().unwrap().files.contains_key(&record.store_key) {
            return Err(RepoError::DuplicateKey(record.store_key.clone()));
        }
        self.staged.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(RepoError::Sqlx(sqlx::Error::PoolClosed));
        }
        let mut state = self.state.lock().unwrap();
        for record in self.staged {
            state.files.insert(record.store_key.clone(), record);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        Ok(())
    }
}

#[async_trait]
impl FileRepository for MockRepository {
    async fn begin(&self) -> RepoResult<Box<dyn FileTransaction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err(RepoError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Ok(Box::new(FailingTransaction));
        }
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
            fail_commit: Arc::clone(&self.fail_commit),
        }))
    }

    async fn find_file(&self, store_key: &str) -> RepoResult<Option<FileRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().files.get(store_key).cloned())
    }

    async fn list_files(&self, owner_id: i64) -> RepoResult<Vec<FileRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut files: Vec<FileRecord> = self
            .state
            .lock()
            .unwrap()
            .files
            .values()
            .filter(|record| record.owner_id == owner_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(files)
    }

    async fn delete_file_record(&self, store_key: &str) -> RepoResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(RepoError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.state.lock().unwrap();
        state.metadata.remove(store_key);
        Ok(state.files.remove(store_key).is_some())
    }

    async fn get_metadata(
        &self,
        store_key: &str,
        owner_id: i64,
    ) -> RepoResult<Option<MetadataRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .unwrap()
            .metadata
            .get(store_key)
            .filter(|meta| meta.owner_id == owner_id)
            .cloned())
    }

    async fn ensure_metadata(&self, store_key: &str, owner_id: i64) -> RepoResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.metadata.contains_key(store_key) {
            return Ok(false);
        }
        state
            .metadata
            .insert(store_key.to_string(), MetadataRecord::shell(store_key, owner_id));
        Ok(true)
    }

    async fn update_metadata(&self, record: &MetadataRecord) -> RepoResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        match state.metadata.get_mut(&record.store_key) {
            Some(existing) if existing.owner_id == record.owner_id => {
                *existing = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> RepoResult<()> {
        Ok(())
    }
}

/// Transaction whose insert always fails.
struct FailingTransaction;

#[async_trait]
impl FileTransaction for FailingTransaction {
    async fn create_file_record(&mut self, _record: &FileRecord) -> RepoResult<()> {
        Err(RepoError::Sqlx(sqlx::Error::PoolTimedOut))
    }

    async fn commit(self: Box<Self>) -> RepoResult<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> RepoResult<()> {
        Ok(())
    }
}
