use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backends::{Destination, DestinationBackend, ObjectStore};
use crate::common::FileKey;

/// 📦 A store that never forgets. Committed objects live in a shared map
/// keyed by relative path, so tests can peek after handing the store away.
///
/// 🔒 `Arc<Mutex<BTreeMap<..>>>` is an existential nesting doll, and yes, it's
/// load-bearing. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    aborted: Arc<Mutex<Vec<String>>>,
    /// 💀 Any object whose path contains this fragment fails on its first write.
    failing_fragment: Option<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 💀 Make writes to matching paths blow up. For error-path tests.
    pub fn failing_writes_to(mut self, path_fragment: impl Into<String>) -> Self {
        self.failing_fragment = Some(path_fragment.into());
        self
    }

    /// 📜 Committed objects, path → bytes.
    pub async fn objects(&self) -> BTreeMap<String, Vec<u8>> {
        self.objects.lock().await.clone()
    }

    pub async fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(path).cloned()
    }

    /// 🗑️ Paths whose uploads were thrown away instead of committed.
    pub async fn aborted(&self) -> Vec<String> {
        self.aborted.lock().await.clone()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn prepare(&self, _table: &str) -> Result<()> {
        // -- ✅ RAM is always there. until it isn't. then we have bigger problems.
        Ok(())
    }

    async fn create(&self, key: &FileKey) -> Result<DestinationBackend> {
        let path = key.relative_path();
        let fail_writes = self
            .failing_fragment
            .as_deref()
            .is_some_and(|fragment| path.contains(fragment));
        Ok(DestinationBackend::InMemory(InMemoryObject {
            path,
            buffer: Vec::new(),
            fail_writes,
            objects: Arc::clone(&self.objects),
            aborted: Arc::clone(&self.aborted),
        }))
    }

    fn describe(&self, key: &FileKey) -> String {
        format!("memory://{}", key.relative_path())
    }
}

/// 📝 One object being written. Invisible to `objects()` until `finish`.
#[derive(Debug)]
pub struct InMemoryObject {
    path: String,
    buffer: Vec<u8>,
    fail_writes: bool,
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    aborted: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Destination for InMemoryObject {
    async fn write_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        if self.fail_writes {
            bail!("💀 injected write failure for {}", self.path);
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.buffer);
        self.objects.lock().await.insert(self.path.clone(), bytes);
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.buffer.clear();
        self.aborted.lock().await.push(self.path.clone());
        Ok(())
    }
}
