//! The Kubernetes resources backing a function.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use futures::{TryStreamExt, stream};
use k8s_openapi::api::{
    apps::v1::Deployment,
    autoscaling::v2::HorizontalPodAutoscaler,
    batch::v1::CronJob,
    core::v1::{ConfigMap, Service},
    networking::v1::Ingress,
};
use kube::api::{ListParams, ObjectMeta};
use nuclio_controller_apis::{
    FUNCTION_NAME_LABEL, FUNCTION_VERSION_LABEL, FunctionState, NuclioFunction,
    NuclioFunctionEvent,
};
use tokio::time::sleep;

use crate::{
    cluster::{ClusterClient, ClusterResource},
    configuration::{Configuration, CronTriggerCreationMode},
    errors::{ControllerError, ResultExt},
    utils::{function_resource_name, label_selector},
};

pub(crate) mod apply;
mod autoscaler;
mod configmap;
mod cronjob;
mod deployment;
mod ingress;
mod readiness;
mod service;

use apply::{create_or_update, delete_if_exists};
use autoscaler::AutoscalerStrategy;
use configmap::ConfigMapStrategy;
use cronjob::{CRON_TRIGGER_NAME_LABEL, CronJobStrategy, cron_jobs_selector};
use deployment::DeploymentStrategy;
use ingress::IngressStrategy;
pub(crate) use service::HTTP_PORT_NAME;
use service::ServiceStrategy;

pub(crate) const CLASS_LABEL: &str = "nuclio.io/class";
pub(crate) const APP_LABEL: &str = "nuclio.io/app";

/// Labels of all resources created for a function.
pub(crate) fn function_labels(function: &NuclioFunction) -> BTreeMap<String, String> {
    let mut labels = function.labels();
    labels.insert(CLASS_LABEL.to_string(), "function".to_string());
    labels.insert(APP_LABEL.to_string(), "functionres".to_string());
    labels.insert(
        FUNCTION_NAME_LABEL.to_string(),
        function.metadata.name.clone().unwrap_or_default(),
    );
    labels.insert(FUNCTION_VERSION_LABEL.to_string(), "latest".to_string());
    labels
}

/// Everything the sub-resources of one function are generated from.
pub(crate) struct FunctionContext<'a> {
    pub function: &'a NuclioFunction,
    pub config: &'a Configuration,
    pub name: String,
    pub namespace: String,
    pub resource_name: String,
    pub labels: BTreeMap<String, String>,
    pub image_pull_secrets: Option<String>,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        function: &'a NuclioFunction,
        config: &'a Configuration,
        image_pull_secrets: Option<&str>,
    ) -> Self {
        let name = function.metadata.name.clone().unwrap_or_default();
        Self {
            function,
            config,
            namespace: function.metadata.namespace.clone().unwrap_or_default(),
            resource_name: function_resource_name(&name),
            labels: function_labels(function),
            image_pull_secrets: function
                .spec
                .image_pull_secrets
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| image_pull_secrets.map(|s| s.to_string())),
            name,
        }
    }

    pub(crate) fn object_meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels.clone()),
            ..Default::default()
        }
    }

    /// Annotations of the function which are propagated to its resources.
    pub(crate) fn annotations(&self) -> BTreeMap<String, String> {
        self.function
            .metadata
            .annotations
            .iter()
            .flatten()
            .filter(|(k, _)| !k.starts_with("kubectl.kubernetes.io/"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn is_scaled_to_zero(&self) -> bool {
        matches!(
            self.function.state(),
            Some(FunctionState::ScaledToZero) | Some(FunctionState::WaitingForScaleResourcesToZero)
        )
    }
}

/// The resources of a function as applied to the cluster.
#[derive(Debug, Default)]
pub(crate) struct ResourceSet {
    pub config_map: Option<ConfigMap>,
    pub service: Option<Service>,
    pub deployment: Option<Deployment>,
    pub autoscaler: Option<HorizontalPodAutoscaler>,
    pub ingress: Option<Ingress>,
    pub cron_jobs: Vec<CronJob>,
}

impl ResourceSet {
    pub(crate) fn service_type(&self) -> Option<&str> {
        self.service
            .as_ref()
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.type_.as_deref())
    }

    /// Node port of the http port of the function service.
    pub(crate) fn http_node_port(&self) -> Option<i32> {
        self.service
            .as_ref()
            .and_then(|s| s.spec.as_ref())
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| {
                ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(HTTP_PORT_NAME))
            })
            .and_then(|p| p.node_port)
    }

    /// `host` + path of every ingress rule, using the first path of each rule.
    pub(crate) fn ingress_urls(&self) -> Vec<String> {
        self.ingress
            .as_ref()
            .and_then(|i| i.spec.as_ref())
            .and_then(|s| s.rules.as_ref())
            .map(|rules| {
                rules
                    .iter()
                    .map(|rule| {
                        let path = rule
                            .http
                            .as_ref()
                            .and_then(|h| h.paths.first())
                            .and_then(|p| p.path.clone())
                            .unwrap_or_else(|| "/".to_string());
                        format!("{}{}", rule.host.as_deref().unwrap_or_default(), path)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Creates, updates, awaits and deletes the resources of functions.
pub(crate) struct FunctionResources<C> {
    cluster: Arc<C>,
    config: Arc<Configuration>,
}

impl<C: ClusterClient> FunctionResources<C> {
    pub(crate) fn new(cluster: Arc<C>, config: Arc<Configuration>) -> Self {
        Self { cluster, config }
    }

    /// Apply all resources of the function, one after the other.
    pub(crate) async fn create_or_update(
        &self,
        function: &NuclioFunction,
        image_pull_secrets: Option<&str>,
    ) -> Result<ResourceSet, ControllerError> {
        let ctx = FunctionContext::new(function, &self.config, image_pull_secrets);
        let cluster = self.cluster.as_ref();
        let timings = &self.config.timings;
        let namespace = ctx.namespace.as_str();
        debug!("applying resources of function {}", function.id());

        let mut resources = ResourceSet {
            config_map: create_or_update(cluster, namespace, &ConfigMapStrategy::new(&ctx), timings)
                .await?
                .into_object(),
            service: create_or_update(cluster, namespace, &ServiceStrategy::new(&ctx), timings)
                .await?
                .into_object(),
            deployment: create_or_update(cluster, namespace, &DeploymentStrategy::new(&ctx), timings)
                .await?
                .into_object(),
            autoscaler: create_or_update(cluster, namespace, &AutoscalerStrategy::new(&ctx), timings)
                .await?
                .into_object(),
            ..Default::default()
        };

        let ingress =
            create_or_update(cluster, namespace, &IngressStrategy::new(&ctx), timings).await?;
        if ingress.is_changed() {
            // the ingress controller needs a moment before serving the new rules
            sleep(timings.ingress_update_grace).await;
        }
        resources.ingress = ingress.into_object();

        if self.config.platform.cron_trigger_creation_mode == CronTriggerCreationMode::Kube {
            resources.cron_jobs = self.apply_cron_jobs(&ctx).await?;
        }
        Ok(resources)
    }

    async fn apply_cron_jobs(&self, ctx: &FunctionContext<'_>) -> Result<Vec<CronJob>, ControllerError> {
        let triggers: Vec<_> = ctx.function.spec.cron_triggers().collect();
        let declared: HashSet<&str> = triggers.iter().map(|(name, _)| name.as_str()).collect();
        self.delete_cron_jobs(&ctx.namespace, &ctx.name, |trigger| {
            !declared.contains(trigger)
        })
        .await?;

        let mut jobs = vec![];
        for (trigger_name, trigger) in triggers {
            let strategy = CronJobStrategy::new(ctx, trigger_name, trigger)?;
            let job = create_or_update(
                self.cluster.as_ref(),
                &ctx.namespace,
                &strategy,
                &self.config.timings,
            )
            .await?;
            jobs.extend(job.into_object());
        }
        Ok(jobs)
    }

    /// Delete the cron jobs of the function whose trigger name matches `stale`.
    async fn delete_cron_jobs(
        &self,
        namespace: &str,
        function_name: &str,
        stale: impl Fn(&str) -> bool,
    ) -> Result<(), ControllerError> {
        let cluster = self.cluster.as_ref();
        let params = ListParams::default().labels(&cron_jobs_selector(function_name));
        let jobs: Vec<CronJob> = cluster
            .list(namespace, &params)
            .await
            .context(format!("failed to list cron jobs of function {}/{}", namespace, function_name))?;
        let names: Vec<String> = jobs
            .into_iter()
            .filter(|job| {
                let trigger = job
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(CRON_TRIGGER_NAME_LABEL))
                    .map(|t| t.as_str())
                    .unwrap_or_default();
                stale(trigger)
            })
            .filter_map(|job| job.metadata.name)
            .collect();
        self.delete_all::<CronJob>(namespace, names).await
    }

    /// Delete the named objects concurrently, stopping at the first failure.
    async fn delete_all<K: ClusterResource>(
        &self,
        namespace: &str,
        names: Vec<String>,
    ) -> Result<(), ControllerError> {
        let cluster = self.cluster.as_ref();
        stream::iter(names.into_iter().map(Ok))
            .try_for_each_concurrent(Some(self.config.resource_concurrency), |name| async move {
                delete_if_exists::<C, K>(cluster, namespace, &name)
                    .await
                    .map(|_| ())
            })
            .await
    }

    /// Delete all resources of a function, resources which do not exist are skipped.
    pub(crate) async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let cluster = self.cluster.as_ref();
        let resource_name = function_resource_name(name);
        delete_if_exists::<C, Ingress>(cluster, namespace, &resource_name).await?;
        delete_if_exists::<C, HorizontalPodAutoscaler>(cluster, namespace, &resource_name).await?;
        delete_if_exists::<C, Service>(cluster, namespace, &resource_name).await?;
        delete_if_exists::<C, Deployment>(cluster, namespace, &resource_name).await?;
        delete_if_exists::<C, ConfigMap>(cluster, namespace, &resource_name).await?;

        let params = ListParams::default().labels(&label_selector(&[(FUNCTION_NAME_LABEL, name)]));
        let events: Vec<NuclioFunctionEvent> = cluster
            .list(namespace, &params)
            .await
            .context(format!("failed to list function events of function {}/{}", namespace, name))?;
        let events = events.into_iter().filter_map(|e| e.metadata.name).collect();
        self.delete_all::<NuclioFunctionEvent>(namespace, events).await?;

        if self.config.platform.cron_trigger_creation_mode == CronTriggerCreationMode::Kube {
            self.delete_cron_jobs(namespace, name, |_| true).await?;
        }
        info!("deleted resources of function {}/{}", namespace, name);
        Ok(())
    }
}
