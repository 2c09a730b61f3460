use std::ops::{Deref, DerefMut};

use json_patch::diff;
use kube::ResourceExt;
use serde_json::Value;

use crate::{
    cluster::{ClusterClient, ClusterResource},
    errors::ControllerError,
};

/// Helper construct to track and persist status changes of custom resources.
///
/// The status sub-resource is only replaced if it actually changed, the
/// `resourceVersion` of the latest object is used to avoid overwriting
/// concurrent spec updates.
pub(crate) struct StatusModifications<K: ClusterResource> {
    original: K,
    pub modified: K,
}

impl<K: ClusterResource> Deref for StatusModifications<K> {
    type Target = K;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl<K: ClusterResource> DerefMut for StatusModifications<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

fn status_of<K: ClusterResource>(object: &K) -> Result<Value, ControllerError> {
    let mut value = serde_json::to_value(object)?;
    Ok(value
        .get_mut("status")
        .map(|v| v.take())
        .unwrap_or(Value::Null))
}

impl<K: ClusterResource> StatusModifications<K> {
    pub(crate) fn new(original: K) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    pub(crate) fn status_has_changed(&self) -> Result<bool, ControllerError> {
        let patch = diff(&status_of(&self.original)?, &status_of(&self.modified)?);
        Ok(!patch.0.is_empty())
    }

    pub(crate) async fn replace_status<C: ClusterClient>(
        &mut self,
        cluster: &C,
    ) -> Result<(), ControllerError> {
        if !self.status_has_changed()? {
            return Ok(());
        }
        let namespace = self.modified.namespace().unwrap_or_default();
        let name = self.modified.name_any();
        let latest: K = cluster.get(&namespace, &name).await?;
        self.modified.meta_mut().resource_version = latest.meta().resource_version.clone();
        self.modified = cluster
            .replace_status(&namespace, &name, &self.modified)
            .await?;
        self.original = self.modified.clone();
        Ok(())
    }
}
