//! Versioned in-memory object store used by the mock client.
//!
//! Every write bumps a cluster-wide resource version counter. Updates that
//! carry a resource version different from the stored one fail with
//! `Conflict`, mirroring API-server optimistic concurrency.

use crate::error::ClusterError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Key of a stored object: (namespace, name). Cluster-scoped objects use "".
pub(crate) type ObjectKey = (String, String);

#[derive(Clone)]
pub(crate) struct Store<K> {
    kind: &'static str,
    objects: Arc<Mutex<BTreeMap<ObjectKey, K>>>,
    versions: Arc<AtomicU64>,
}

impl<K: Resource + Clone> Store<K> {
    pub(crate) fn new(kind: &'static str, versions: Arc<AtomicU64>) -> Self {
        Self {
            kind,
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            versions,
        }
    }

    fn next_version(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub(crate) fn get(&self, namespace: &str, name: &str) -> Result<K, ClusterError> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("{} {}/{} not found", self.kind, namespace, name)))
    }

    /// Stores a new object, assigning uid, resource version and creation time.
    pub(crate) fn create(&self, namespace: &str, obj: &K) -> Result<K, ClusterError> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidObject(format!("{} has no name", self.kind)))?;
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!(
                "{} {}/{} already exists",
                self.kind, namespace, name
            )));
        }

        let mut stored = obj.clone();
        let meta = stored.meta_mut();
        if !namespace.is_empty() {
            meta.namespace = Some(namespace.to_string());
        }
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(self.next_version());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.generation = Some(1);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    /// Applies `mutate` to the stored object if `resource_version` still matches.
    pub(crate) fn update(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        mutate: impl FnOnce(&mut K),
    ) -> Result<K, ClusterError> {
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = objects.get_mut(&key) else {
            return Err(ClusterError::NotFound(format!("{} {}/{} not found", self.kind, namespace, name)));
        };
        let stale = resource_version.is_some_and(|expected| current.meta().resource_version.as_deref() != Some(expected));
        if stale {
            return Err(ClusterError::Conflict(format!(
                "{} {}/{} has been modified; expected resourceVersion {}",
                self.kind,
                namespace,
                name,
                resource_version.unwrap_or_default()
            )));
        }
        mutate(current);
        current.meta_mut().resource_version = Some(self.next_version());
        Ok(current.clone())
    }

    pub(crate) fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    pub(crate) fn find(&self, namespace: &str, name: &str) -> Option<K> {
        self.get(namespace, name).ok()
    }

    pub(crate) fn list(&self) -> Vec<K> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

/// Equality-only label selector match (`a=b,c=d`).
pub(crate) fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.and_then(|l| l.get(key.trim())).is_some_and(|v| v == value.trim()),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}
