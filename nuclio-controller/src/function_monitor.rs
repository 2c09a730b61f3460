use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{ResourceExt, api::ListParams};
use nuclio_controller_apis::{FunctionState, NuclioFunction};
use tokio::time::{Instant, interval};

use crate::{
    cluster::ClusterClient,
    configuration::Configuration,
    errors::{ControllerError, ExtKubeApiError},
    status::StatusModifications,
    utils::function_resource_name,
};

pub(crate) const UNHEALTHY_MESSAGE: &str = "Function is not healthy";

/// Whether the deployment serves its function, a deployment without desired replicas always does.
fn is_available(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    if desired <= 0 {
        return true;
    }
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let failed = status.conditions.iter().flatten().any(|c| {
        (c.type_ == "Available" && c.status == "False")
            || c.type_ == "ReplicaFailure"
            || (c.type_ == "Progressing" && c.status == "False")
    });
    !failed && status.available_replicas.unwrap_or(0) >= 1
}

fn is_mid_scale(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let current = deployment
        .status
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0);
    current < desired
}

/// Periodically flips ready functions whose deployment became unavailable to
/// unhealthy, and back once the deployment recovers.
pub(crate) struct FunctionMonitor<C> {
    cluster: Arc<C>,
    config: Arc<Configuration>,
    last_provisioned: Mutex<HashMap<String, Instant>>,
    scaling_since: Mutex<HashMap<String, Instant>>,
}

impl<C: ClusterClient> FunctionMonitor<C> {
    pub(crate) fn new(cluster: Arc<C>, config: Arc<Configuration>) -> Self {
        Self {
            cluster,
            config,
            last_provisioned: Default::default(),
            scaling_since: Default::default(),
        }
    }

    /// Check all functions every monitor interval, never returns.
    pub(crate) async fn run(&self) {
        let period = self.config.function_monitor_interval;
        if period.is_zero() {
            warn!("function monitoring is disabled");
            return futures::future::pending().await;
        }
        info!("starting function monitor with interval {:?}", period);
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.check_functions().await;
        }
    }

    pub(crate) async fn check_functions(&self) {
        let namespace = self.config.list_namespace();
        let functions: Vec<NuclioFunction> =
            match self.cluster.list(namespace, &ListParams::default()).await {
                Ok(functions) => functions,
                Err(e) => {
                    warn!("failed to list functions to monitor: {}", e);
                    return;
                }
            };
        futures::stream::iter(functions)
            .for_each_concurrent(self.config.function_monitor_concurrency, |function| async move {
                if let Err(e) = self.check_function(function).await {
                    warn!("failed to check function status: {}", e);
                }
            })
            .await;
    }

    /// Provisioning functions and functions provisioned within the grace period are not monitored.
    fn provisioned_recently(&self, key: &str, state: FunctionState) -> bool {
        let mut last_provisioned = self
            .last_provisioned
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if state.is_provisioning() {
            last_provisioned.insert(key.to_string(), Instant::now());
            return true;
        }
        if let Some(at) = last_provisioned.get(key) {
            if at.elapsed() < self.config.timings.post_deploy_monitoring_grace {
                return true;
            }
        }
        last_provisioned.remove(key);
        false
    }

    /// A deployment catching up with its desired replicas is tolerated for the scaling grace period.
    fn scaling_within_grace(&self, key: &str, deployment: &Deployment) -> bool {
        let mut scaling_since = self.scaling_since.lock().unwrap_or_else(|e| e.into_inner());
        if !is_mid_scale(deployment) {
            scaling_since.remove(key);
            return false;
        }
        let since = scaling_since
            .entry(key.to_string())
            .or_insert_with(Instant::now);
        since.elapsed() < self.config.timings.scaling_grace
    }

    async fn check_function(&self, function: NuclioFunction) -> Result<(), ControllerError> {
        let key = function.id();
        let Some(state) = function.state() else {
            return Ok(());
        };
        if self.provisioned_recently(&key, state) {
            debug!("function {} is provisioning or was provisioned recently, skipping", key);
            return Ok(());
        }
        if !matches!(state, FunctionState::Ready | FunctionState::Unhealthy) {
            debug!("function {} is {}, skipping", key, state);
            return Ok(());
        }
        if function.spec.disable || function.spec.replicas == Some(0) {
            debug!("function {} is disabled or has no replicas, skipping", key);
            return Ok(());
        }

        let namespace = function.namespace().unwrap_or_default();
        let deployment: Deployment = match self
            .cluster
            .get(&namespace, &function_resource_name(&function.name_any()))
            .await
        {
            Ok(deployment) => deployment,
            Err(e) if e.is_not_found() => {
                warn!("deployment of function {} not found", key);
                return Ok(());
            }
            Err(e) => return Err(ControllerError::from(e)),
        };
        if self.scaling_within_grace(&key, &deployment) {
            debug!("deployment of function {} is scaling, skipping", key);
            return Ok(());
        }

        let available = is_available(&deployment);
        let mut modifications = StatusModifications::new(function);
        let status = modifications.status.get_or_insert_with(Default::default);
        match (state, available) {
            (FunctionState::Ready, false) => {
                status.state = Some(FunctionState::Unhealthy);
                status.message = Some(UNHEALTHY_MESSAGE.to_string());
            }
            (FunctionState::Unhealthy, true) => {
                status.state = Some(FunctionState::Ready);
                status.message = None;
            }
            _ => return Ok(()),
        }
        info!(
            "function {} changed from {} to {}",
            key,
            state,
            if available { "ready" } else { "unhealthy" }
        );
        modifications.replace_status(self.cluster.as_ref()).await
    }
}
