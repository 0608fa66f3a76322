//! Typed registry over the object store.
//!
//! One `Registry<R>` per kind. Keys are `/{kind}/{project}/{id}`; the name
//! index `/index/{kind}/name/{project}/{name}` and label indexes
//! `/index/{kind}/label/{k}={v}/{id}` are written in the same transaction as
//! the primary record. Spec writes bump the generation counter, status
//! writes do not; both are CAS on the envelope revision.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::model::{Meta, Resource, labels_match, now_rfc3339};

use super::error::{Result, StoreError};
use super::kv::{Compare, Fence, KvEntry, KvStore, Txn, WatchEvent};

/// How many CAS retries a read-modify-write gets before surfacing Conflict.
const PATCH_RETRIES: usize = 5;

/// Typed event delivered to registry watchers.
#[derive(Debug, Clone)]
pub enum RegistryEvent<R> {
    /// Object created or updated.
    Applied(R),
    /// Object removed from the store.
    Deleted { key: String },
    /// The watch fell behind; consumers must re-list.
    Resync,
}

/// Typed CRUD facade for one kind.
pub struct Registry<R: Resource> {
    kv: Arc<dyn KvStore>,
    /// Fencing token attached to every write; set for controller-held
    /// registries so writes die with the leadership that issued them.
    fence: Option<Fence>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Resource> Clone for Registry<R> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            fence: self.fence.clone(),
            _marker: PhantomData,
        }
    }
}

fn project_segment(project: &str) -> &str {
    if project.is_empty() { "_" } else { project }
}

impl<R: Resource> Registry<R> {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            fence: None,
            _marker: PhantomData,
        }
    }

    /// A copy of this registry whose writes carry `fence`.
    pub fn fenced(&self, fence: Fence) -> Self {
        Self {
            kv: self.kv.clone(),
            fence: Some(fence),
            _marker: PhantomData,
        }
    }

    pub fn primary_key(project: &str, id: &str) -> String {
        format!("/{}/{}/{}", R::KIND, project_segment(project), id)
    }

    pub fn key_of(obj: &R) -> String {
        Self::primary_key(&obj.meta().project_id, &obj.meta().id)
    }

    fn name_key(project: &str, name: &str) -> String {
        format!("/index/{}/name/{}/{}", R::KIND, project_segment(project), name)
    }

    fn label_key(k: &str, v: &str, id: &str) -> String {
        format!("/index/{}/label/{}={}/{}", R::KIND, k, v, id)
    }

    fn kind_prefix() -> String {
        format!("/{}/", R::KIND)
    }

    /// Decode a raw entry; the store revision is authoritative over whatever
    /// revision was serialized into the value.
    pub fn decode(entry: &KvEntry) -> Result<R> {
        let mut obj: R = serde_json::from_slice(&entry.value)
            .map_err(|e| StoreError::Internal(format!("corrupt record {}: {e}", entry.key)))?;
        obj.meta_mut().revision = entry.revision;
        Ok(obj)
    }

    fn encode(obj: &R) -> Result<Vec<u8>> {
        serde_json::to_vec(obj).map_err(|e| StoreError::Internal(format!("encode: {e}")))
    }

    /// Create with a fresh ULID, initial generation, and both indexes.
    pub async fn create(&self, mut obj: R) -> Result<R> {
        obj.meta_mut().id = ulid::Ulid::new().to_string().to_lowercase();
        self.create_inner(obj).await
    }

    /// Create under a caller-chosen id. Projects use this: their id is the
    /// path segment for everything they contain.
    pub async fn create_with_id(&self, obj: R) -> Result<R> {
        if obj.meta().id.is_empty() {
            return Err(StoreError::InvalidArgument("id must be set".to_string()));
        }
        self.create_inner(obj).await
    }

    async fn create_inner(&self, mut obj: R) -> Result<R> {
        obj.validate().map_err(StoreError::InvalidArgument)?;

        let meta = obj.meta_mut();
        meta.created_at = now_rfc3339();
        meta.updated_at = meta.created_at.clone();
        meta.generation = 1;
        meta.revision = 0;
        meta.deleted_at = None;

        let key = Self::key_of(&obj);
        let name_key = Self::name_key(&obj.meta().project_id, &obj.meta().name);

        let mut txn = Txn::new()
            .compare(Compare::NotExists(key.clone()))
            .compare(Compare::NotExists(name_key.clone()))
            .put(key, Self::encode(&obj)?)
            .put(name_key, obj.meta().id.clone().into_bytes());
        for (k, v) in &obj.meta().labels {
            txn = txn.put(Self::label_key(k, v, &obj.meta().id), Vec::new());
        }

        match self.kv.txn(txn, self.fence.as_ref()).await {
            Ok(rev) => {
                obj.meta_mut().revision = rev;
                Ok(obj)
            }
            Err(StoreError::Conflict(_)) => Err(StoreError::AlreadyExists(format!(
                "{} '{}' already exists in project '{}'",
                R::KIND,
                obj.meta().name,
                obj.meta().project_id
            ))),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, mut obj: R, bump_generation: bool) -> Result<R> {
        if bump_generation {
            obj.validate().map_err(StoreError::InvalidArgument)?;
        }
        let expected = obj.meta().revision;
        let key = Self::key_of(&obj);

        // Label diffs need the currently stored copy; the CAS compare below
        // guarantees it is still what we diffed against at commit time.
        let current = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", R::KIND, obj.meta().id)))?;
        let stored = Self::decode(&current)?;

        let meta = obj.meta_mut();
        meta.updated_at = now_rfc3339();
        if bump_generation {
            meta.generation = stored.meta().generation + 1;
        } else {
            meta.generation = stored.meta().generation;
        }
        meta.created_at = stored.meta().created_at.clone();

        let mut txn = Txn::new()
            .compare(Compare::RevisionEquals(key.clone(), expected))
            .put(key, Self::encode(&obj)?);
        for (k, v) in &stored.meta().labels {
            if obj.meta().labels.get(k) != Some(v) {
                txn = txn.delete(Self::label_key(k, v, &obj.meta().id));
            }
        }
        for (k, v) in &obj.meta().labels {
            if stored.meta().labels.get(k) != Some(v) {
                txn = txn.put(Self::label_key(k, v, &obj.meta().id), Vec::new());
            }
        }

        let rev = self.kv.txn(txn, self.fence.as_ref()).await?;
        obj.meta_mut().revision = rev;
        Ok(obj)
    }

    /// CAS write of a spec mutation; bumps the generation counter.
    pub async fn update_spec(&self, obj: R) -> Result<R> {
        self.write(obj, true).await
    }

    /// CAS write of a status mutation; generation is untouched.
    pub async fn update_status(&self, obj: R) -> Result<R> {
        self.write(obj, false).await
    }

    async fn patch_with<F>(&self, project: &str, id: &str, spec_write: bool, f: F) -> Result<R>
    where
        F: Fn(&mut R) -> Result<()>,
    {
        let mut last = StoreError::Conflict("patch retries exhausted".to_string());
        for _ in 0..PATCH_RETRIES {
            let mut obj = self.get(project, id).await?;
            f(&mut obj)?;
            match self.write(obj, spec_write).await {
                Ok(obj) => return Ok(obj),
                Err(StoreError::Conflict(msg)) => {
                    last = StoreError::Conflict(msg);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Read-modify-write of the spec with bounded CAS retry.
    pub async fn patch_spec<F>(&self, project: &str, id: &str, f: F) -> Result<R>
    where
        F: Fn(&mut R) -> Result<()>,
    {
        self.patch_with(project, id, true, f).await
    }

    /// Read-modify-write of the status with bounded CAS retry.
    pub async fn patch_status<F>(&self, project: &str, id: &str, f: F) -> Result<R>
    where
        F: Fn(&mut R) -> Result<()>,
    {
        self.patch_with(project, id, false, f).await
    }

    pub async fn get(&self, project: &str, id: &str) -> Result<R> {
        let key = Self::primary_key(project, id);
        match self.kv.get(&key).await? {
            Some(entry) => Self::decode(&entry),
            None => Err(StoreError::NotFound(format!("{} {}", R::KIND, id))),
        }
    }

    pub async fn try_get(&self, project: &str, id: &str) -> Result<Option<R>> {
        match self.get(project, id).await {
            Ok(obj) => Ok(Some(obj)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch by full primary key (the form work-queue items carry).
    pub async fn get_by_key(&self, key: &str) -> Result<Option<R>> {
        match self.kv.get(key).await? {
            Some(entry) => Ok(Some(Self::decode(&entry)?)),
            None => Ok(None),
        }
    }

    /// Fetch by id alone, scanning the kind prefix. Used where only the id
    /// crosses a boundary (node events, cross-object references).
    pub async fn get_by_id(&self, id: &str) -> Result<Option<R>> {
        let (entries, _) = self.kv.list(&Self::kind_prefix()).await?;
        for entry in entries {
            if entry.key.ends_with(&format!("/{id}")) {
                return Ok(Some(Self::decode(&entry)?));
            }
        }
        Ok(None)
    }

    pub async fn get_by_name(&self, project: &str, name: &str) -> Result<Option<R>> {
        let idx = self.kv.get(&Self::name_key(project, name)).await?;
        match idx {
            Some(entry) => {
                let id = String::from_utf8_lossy(&entry.value).to_string();
                self.try_get(project, &id).await
            }
            None => Ok(None),
        }
    }

    /// List objects, optionally scoped to a project and filtered by a label
    /// selector (every pair must match).
    pub async fn list(
        &self,
        project: Option<&str>,
        selector: Option<&HashMap<String, String>>,
    ) -> Result<Vec<R>> {
        let prefix = match project {
            Some(p) => format!("/{}/{}/", R::KIND, project_segment(p)),
            None => Self::kind_prefix(),
        };
        let (entries, _) = self.kv.list(&prefix).await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            let obj = Self::decode(entry)?;
            if let Some(sel) = selector {
                if !labels_match(&obj.meta().labels, sel) {
                    continue;
                }
            }
            out.push(obj);
        }
        Ok(out)
    }

    /// Mark an object for deletion. The owning controller observes the
    /// marker, tears down external state, then calls [`Registry::remove`].
    pub async fn mark_deleted(&self, project: &str, id: &str) -> Result<R> {
        self.patch_with(project, id, true, |obj| {
            if obj.meta().deleted_at.is_none() {
                obj.meta_mut().deleted_at = Some(now_rfc3339());
            }
            Ok(())
        })
        .await
    }

    /// Remove the object and its index entries from the store.
    pub async fn remove(&self, project: &str, id: &str) -> Result<()> {
        let obj = match self.try_get(project, id).await? {
            Some(obj) => obj,
            None => return Ok(()),
        };
        let mut txn = Txn::new()
            .delete(Self::key_of(&obj))
            .delete(Self::name_key(project, &obj.meta().name));
        for (k, v) in &obj.meta().labels {
            txn = txn.delete(Self::label_key(k, v, id));
        }
        self.kv.txn(txn, self.fence.as_ref()).await?;
        Ok(())
    }

    /// Typed watch over this kind. The pump re-lists on gap signals and
    /// emits `Resync` so consumers can rebuild derived state.
    pub async fn watch(&self) -> Result<mpsc::Receiver<RegistryEvent<R>>> {
        let (tx, rx) = mpsc::channel(64);
        let kv = self.kv.clone();
        let prefix = Self::kind_prefix();

        tokio::spawn(async move {
            let (_, mut from_rev) = match kv.list(&prefix).await {
                Ok(listed) => listed,
                Err(_) => (Vec::new(), 0),
            };
            loop {
                let mut stream = match kv.watch(&prefix, from_rev).await {
                    Ok(s) => s,
                    Err(_) => {
                        if tx.send(RegistryEvent::Resync).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                loop {
                    match stream.recv().await {
                        Some(WatchEvent::Put(entry)) => {
                            from_rev = from_rev.max(entry.revision);
                            if let Ok(obj) = Self::decode(&entry) {
                                if tx.send(RegistryEvent::Applied(obj)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(WatchEvent::Delete { key, revision }) => {
                            from_rev = from_rev.max(revision);
                            if tx.send(RegistryEvent::Deleted { key }).await.is_err() {
                                return;
                            }
                        }
                        Some(WatchEvent::Compacted) | None => {
                            // Gap: re-list to find the resume point, tell the
                            // consumer to rebuild.
                            if let Ok((_, rev)) = kv.list(&prefix).await {
                                from_rev = rev;
                            }
                            if tx.send(RegistryEvent::Resync).await.is_err() {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{VmData, VmSpec};
    use crate::store::mem::MemStore;

    fn vm(name: &str, project: &str) -> VmData {
        let mut vm = VmData::default();
        vm.meta.name = name.to_string();
        vm.meta.project_id = project.to_string();
        vm.spec = VmSpec {
            cpu_cores: 2,
            memory_mib: 2048,
            disks: vec![crate::model::DiskSpec {
                pool_id: Some("pool-1".to_string()),
                size_gib: 10,
                ..Default::default()
            }],
            ..Default::default()
        };
        vm
    }

    fn registry() -> Registry<VmData> {
        Registry::new(Arc::new(MemStore::new()))
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let reg = registry();
        let created = reg.create(vm("web-1", "p1")).await.unwrap();
        assert!(!created.meta.id.is_empty());
        assert_eq!(created.meta.generation, 1);
        assert!(created.meta.revision > 0);

        let fetched = reg.get("p1", &created.meta.id).await.unwrap();
        assert_eq!(fetched.meta.name, "web-1");
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let reg = registry();
        reg.create(vm("web-1", "p1")).await.unwrap();
        let err = reg.create(vm("web-1", "p1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        // Same name in another project is fine.
        reg.create(vm("web-1", "p2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_spec_is_cas_and_bumps_generation() {
        let reg = registry();
        let created = reg.create(vm("web-1", "p1")).await.unwrap();

        let mut a = created.clone();
        a.spec.cpu_cores = 4;
        let updated = reg.update_spec(a).await.unwrap();
        assert_eq!(updated.meta.generation, 2);

        // Writing from the stale copy conflicts.
        let mut b = created;
        b.spec.cpu_cores = 8;
        assert!(matches!(
            reg.update_spec(b).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_status_keeps_generation() {
        let reg = registry();
        let mut obj = reg.create(vm("web-1", "p1")).await.unwrap();
        obj.status.state = crate::model::VmState::Creating;
        let updated = reg.update_status(obj).await.unwrap();
        assert_eq!(updated.meta.generation, 1);
    }

    #[tokio::test]
    async fn test_patch_retries_cas() {
        let reg = registry();
        let created = reg.create(vm("web-1", "p1")).await.unwrap();

        // Interleave a conflicting write; patch must still land.
        let mut other = reg.get("p1", &created.meta.id).await.unwrap();
        other.spec.memory_mib = 4096;
        reg.update_spec(other).await.unwrap();

        let patched = reg
            .patch_status("p1", &created.meta.id, |vm| {
                vm.status.state = crate::model::VmState::Running;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(patched.status.state, crate::model::VmState::Running);
        assert_eq!(patched.spec.memory_mib, 4096);
    }

    #[tokio::test]
    async fn test_get_by_name_and_remove() {
        let reg = registry();
        let created = reg.create(vm("web-1", "p1")).await.unwrap();

        let by_name = reg.get_by_name("p1", "web-1").await.unwrap().unwrap();
        assert_eq!(by_name.meta.id, created.meta.id);

        reg.remove("p1", &created.meta.id).await.unwrap();
        assert!(reg.get_by_name("p1", "web-1").await.unwrap().is_none());

        // Name is free again.
        reg.create(vm("web-1", "p1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_with_label_selector() {
        let reg = registry();
        let mut a = vm("db-1", "p1");
        a.meta.labels.insert("role".to_string(), "db".to_string());
        reg.create(a).await.unwrap();
        reg.create(vm("web-1", "p1")).await.unwrap();

        let mut sel = HashMap::new();
        sel.insert("role".to_string(), "db".to_string());
        let hits = reg.list(Some("p1"), Some(&sel)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta.name, "db-1");
    }

    #[tokio::test]
    async fn test_mark_deleted_sets_marker_once() {
        let reg = registry();
        let created = reg.create(vm("web-1", "p1")).await.unwrap();
        let marked = reg.mark_deleted("p1", &created.meta.id).await.unwrap();
        assert!(marked.meta.deleting());
        let first = marked.meta.deleted_at.clone();

        let again = reg.mark_deleted("p1", &created.meta.id).await.unwrap();
        assert_eq!(again.meta.deleted_at, first);
    }
}
