use json_patch::diff;
use tokio::time::{Instant, sleep};

use crate::{
    cluster::{ClusterClient, ClusterResource},
    configuration::ResourceTimings,
    errors::{ControllerError, ExtKubeApiError},
};

/// Desired outcome for an existing resource.
pub(crate) enum Desired<K> {
    Apply(K),
    Delete,
    Keep,
}

/// Resource specific part of [`create_or_update`].
pub(crate) trait ApplyStrategy<K: ClusterResource>: Send + Sync {
    fn name(&self) -> String;

    /// The resource to create if it does not exist yet, `None` to not create it.
    fn build(&self) -> Result<Option<K>, ControllerError>;

    /// The desired state derived from the existing resource.
    fn update(&self, existing: &K) -> Result<Desired<K>, ControllerError>;
}

#[derive(Debug)]
pub(crate) enum ApplyOutcome<K> {
    Created(K),
    Updated(K),
    Unchanged(K),
    Deleted,
    Skipped,
}

impl<K> ApplyOutcome<K> {
    pub(crate) fn into_object(self) -> Option<K> {
        match self {
            ApplyOutcome::Created(k) | ApplyOutcome::Updated(k) | ApplyOutcome::Unchanged(k) => {
                Some(k)
            }
            ApplyOutcome::Deleted | ApplyOutcome::Skipped => None,
        }
    }

    pub(crate) fn is_changed(&self) -> bool {
        matches!(self, ApplyOutcome::Created(_) | ApplyOutcome::Updated(_))
    }
}

fn describe<K: ClusterResource>(namespace: &str, name: &str) -> String {
    format!("{} {}/{}", K::kind(&()), namespace, name)
}

/// Get the resource, waiting for it to disappear if it is being deleted.
pub(crate) async fn get_unless_deleting<C: ClusterClient, K: ClusterResource>(
    cluster: &C,
    namespace: &str,
    name: &str,
    timings: &ResourceTimings,
) -> Result<Option<K>, ControllerError> {
    let deadline = Instant::now() + timings.deletion_wait;
    loop {
        match cluster.get::<K>(namespace, name).await {
            Ok(existing) if existing.meta().deletion_timestamp.is_some() => {
                if Instant::now() >= deadline {
                    return Err(ControllerError::Timeout(format!(
                        "timed out waiting for {} to be deleted",
                        describe::<K>(namespace, name)
                    )));
                }
                debug!(
                    "waiting for {} to be deleted",
                    describe::<K>(namespace, name)
                );
                sleep(timings.deletion_poll).await;
            }
            Ok(existing) => return Ok(Some(existing)),
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => {
                return Err(ControllerError::from(e)
                    .context(format!("failed to get {}", describe::<K>(namespace, name))));
            }
        }
    }
}

/// Delete a resource, a resource which does not exist counts as deleted.
pub(crate) async fn delete_if_exists<C: ClusterClient, K: ClusterResource>(
    cluster: &C,
    namespace: &str,
    name: &str,
) -> Result<bool, ControllerError> {
    match cluster.delete::<K>(namespace, name).await {
        Ok(()) => {
            info!("deleted {}", describe::<K>(namespace, name));
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(ControllerError::from(e)
            .context(format!("failed to delete {}", describe::<K>(namespace, name)))),
    }
}

fn has_changed<K: ClusterResource>(existing: &K, desired: &K) -> Result<bool, ControllerError> {
    let patch = diff(&serde_json::to_value(existing)?, &serde_json::to_value(desired)?);
    Ok(!patch.0.is_empty())
}

/// Create the resource or bring the existing one to its desired state.
///
/// Races with other writers are resolved by retrying, `AlreadyExists` on create
/// and `Conflict` on update restart from fetching the latest version until
/// `timings.update_timeout` is exceeded. An update which would not change the
/// resource is not sent.
pub(crate) async fn create_or_update<C, K, S>(
    cluster: &C,
    namespace: &str,
    strategy: &S,
    timings: &ResourceTimings,
) -> Result<ApplyOutcome<K>, ControllerError>
where
    C: ClusterClient,
    K: ClusterResource,
    S: ApplyStrategy<K>,
{
    let name = strategy.name();
    let deadline = Instant::now() + timings.update_timeout;
    let retry_or_timeout = |reason: &str| {
        if Instant::now() >= deadline {
            Err(ControllerError::Timeout(format!(
                "timed out updating resource {}",
                describe::<K>(namespace, &name)
            )))
        } else {
            debug!(
                "{} while applying {}, retrying",
                reason,
                describe::<K>(namespace, &name)
            );
            Ok(())
        }
    };
    loop {
        match get_unless_deleting::<C, K>(cluster, namespace, &name, timings).await? {
            None => {
                let Some(desired) = strategy.build()? else {
                    debug!("not creating {}", describe::<K>(namespace, &name));
                    return Ok(ApplyOutcome::Skipped);
                };
                match cluster.create(namespace, &desired).await {
                    Ok(created) => {
                        info!("created {}", describe::<K>(namespace, &name));
                        return Ok(ApplyOutcome::Created(created));
                    }
                    Err(e) if e.is_already_exists() => retry_or_timeout("already exists")?,
                    Err(e) => {
                        return Err(ControllerError::from(e)
                            .context(format!("failed to create {}", describe::<K>(namespace, &name))));
                    }
                }
            }
            Some(existing) => match strategy.update(&existing)? {
                Desired::Keep => return Ok(ApplyOutcome::Unchanged(existing)),
                Desired::Delete => {
                    delete_if_exists::<C, K>(cluster, namespace, &name).await?;
                    return Ok(ApplyOutcome::Deleted);
                }
                Desired::Apply(mut desired) => {
                    if !has_changed(&existing, &desired)? {
                        debug!("{} is up to date", describe::<K>(namespace, &name));
                        return Ok(ApplyOutcome::Unchanged(existing));
                    }
                    desired.meta_mut().resource_version = existing.meta().resource_version.clone();
                    match cluster.replace(namespace, &name, &desired).await {
                        Ok(updated) => {
                            info!("updated {}", describe::<K>(namespace, &name));
                            return Ok(ApplyOutcome::Updated(updated));
                        }
                        Err(e) if e.is_conflict() => retry_or_timeout("conflict")?,
                        Err(e) => {
                            return Err(ControllerError::from(e).context(format!(
                                "failed to update {}",
                                describe::<K>(namespace, &name)
                            )));
                        }
                    }
                }
            },
        }
    }
}
