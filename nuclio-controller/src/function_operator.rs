//! Drives functions through their lifecycle states.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::chrono::Utc;
use kube::ResourceExt;
use nuclio_controller_apis::{
    FunctionState, NuclioFunction, NuclioFunctionStatus, ScaleEvent, ScaleToZeroStatus,
};
use tokio::time::Instant;

use crate::{
    cluster::ClusterClient,
    configuration::Configuration,
    errors::{ControllerError, ResultExt},
    functionres::{FunctionResources, ResourceSet},
    status::StatusModifications,
    utils::{function_resource_name, now_rfc3339, parse_rfc3339, validate_qualified_name},
    workqueue::ChangeHandler,
};

/// State and scale event a waiting function ends up in once its resources are available.
fn terminal_state(state: FunctionState) -> Option<(FunctionState, ScaleEvent)> {
    match state {
        FunctionState::WaitingForScaleResourcesToZero => {
            Some((FunctionState::ScaledToZero, ScaleEvent::ScaleToZeroCompleted))
        }
        FunctionState::WaitingForScaleResourcesFromZero => {
            Some((FunctionState::Ready, ScaleEvent::ScaleFromZeroCompleted))
        }
        FunctionState::WaitingForResourceConfiguration => {
            Some((FunctionState::Ready, ScaleEvent::ResourceUpdated))
        }
        _ => None,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Creates and updates the resources of functions in one of the reconcilable states.
pub(crate) struct FunctionOperator<C> {
    cluster: Arc<C>,
    config: Arc<Configuration>,
    resources: FunctionResources<C>,
}

impl<C: ClusterClient> FunctionOperator<C> {
    pub(crate) fn new(cluster: Arc<C>, config: Arc<Configuration>) -> Self {
        Self {
            resources: FunctionResources::new(cluster.clone(), config.clone()),
            cluster,
            config,
        }
    }

    async fn write_status(
        &self,
        function: &NuclioFunction,
        status: NuclioFunctionStatus,
    ) -> Result<(), ControllerError> {
        let mut modifications = StatusModifications::new(function.clone());
        modifications.status = Some(NuclioFunctionStatus {
            logs: function.status.as_ref().and_then(|s| s.logs.clone()),
            ..status
        });
        modifications
            .replace_status(self.cluster.as_ref())
            .await
            .context(format!("failed to update status of function {}", function.id()))
    }

    async fn write_state(
        &self,
        function: &NuclioFunction,
        state: FunctionState,
    ) -> Result<(), ControllerError> {
        self.write_status(
            function,
            NuclioFunctionStatus {
                state: Some(state),
                ..Default::default()
            },
        )
        .await
    }

    /// Record the failure in the function status, a failed write is only logged.
    async fn write_failure(
        &self,
        function: &NuclioFunction,
        state: FunctionState,
        error: &ControllerError,
    ) {
        warn!(
            "function {} failed, setting state {}: {}",
            function.id(),
            state,
            error
        );
        let status = NuclioFunctionStatus {
            state: Some(state),
            message: Some(error.trace(10)),
            ..Default::default()
        };
        if let Err(e) = self.write_status(function, status).await {
            warn!("failed to write error status of function {}: {}", function.id(), e);
        }
    }

    fn in_scale_cooldown(&self, function: &NuclioFunction) -> bool {
        let Some(last_scale) = function
            .status
            .as_ref()
            .and_then(|s| s.scale_to_zero.as_ref())
            .and_then(|s| s.last_scale_event_time.as_deref())
            .and_then(parse_rfc3339)
        else {
            return false;
        };
        let cooldown = k8s_openapi::chrono::Duration::from_std(self.config.timings.scale_cooldown)
            .unwrap_or_else(|_| k8s_openapi::chrono::Duration::zero());
        Utc::now() - last_scale < cooldown
    }

    fn invocation_status(
        &self,
        function: &NuclioFunction,
        resources: &ResourceSet,
        state: FunctionState,
        event: ScaleEvent,
    ) -> NuclioFunctionStatus {
        let http_port = resources.http_node_port();
        let mut external_invocation_urls = vec![];
        if let (Some(port), Some("NodePort")) = (http_port, resources.service_type()) {
            external_invocation_urls.extend(
                self.config
                    .external_ip_addresses
                    .iter()
                    .map(|ip| format!("{}:{}", ip, port)),
            );
        }
        external_invocation_urls.extend(resources.ingress_urls());
        NuclioFunctionStatus {
            state: Some(state),
            http_port,
            internal_invocation_urls: vec![
                function.internal_invocation_url(&function_resource_name(&function.name_any())),
            ],
            external_invocation_urls,
            container_image: function.spec.image.clone(),
            scale_to_zero: Some(ScaleToZeroStatus {
                last_scale_event: event,
                last_scale_event_time: Some(now_rfc3339()),
            }),
            ..Default::default()
        }
    }

    async fn reconcile(&self, function: &NuclioFunction) -> Result<(), ControllerError> {
        let id = function.id();
        if let Err(message) = validate_qualified_name(&function.name_any()) {
            let error = ControllerError::Validation(format!(
                "Function name doesn't conform to k8s naming convention. Errors: {}",
                message
            ));
            self.write_failure(function, FunctionState::Error, &error).await;
            return Err(error);
        }

        let Some(state) = function.state().filter(|s| s.is_reconcilable()) else {
            debug!(
                "function {} is in state {:?}, skipping create/update",
                id,
                function.state()
            );
            return Ok(());
        };

        if function.should_skip_deploy() {
            info!("skipping deploy of function {}", id);
            return self.write_state(function, FunctionState::Imported).await;
        }

        if state == FunctionState::WaitingForResourceConfiguration {
            match function.previous_state() {
                Some(FunctionState::ScaledToZero) => {
                    info!("function {} was scaled to zero before, scaling it to zero", id);
                    return self
                        .write_state(function, FunctionState::WaitingForScaleResourcesToZero)
                        .await;
                }
                Some(FunctionState::Imported) => {
                    info!("function {} was imported before, keeping it imported", id);
                    return self.write_state(function, FunctionState::Imported).await;
                }
                _ => (),
            }
        }

        if matches!(state, FunctionState::Ready | FunctionState::ScaledToZero)
            && self.in_scale_cooldown(function)
        {
            debug!("function {} was scaled recently, skipping create/update", id);
            return Ok(());
        }

        let readiness_timeout = function
            .spec
            .readiness_timeout_seconds(self.config.platform.default_readiness_timeout_seconds());
        debug!(
            "ensuring resources of function {} with readiness timeout {}s",
            id, readiness_timeout
        );
        let since = Utc::now();
        let resources = match self
            .resources
            .create_or_update(function, self.config.image_pull_secrets.as_deref())
            .await
        {
            Ok(resources) => resources,
            Err(e) => {
                let e = e.context("Failed to create/update function");
                self.write_failure(function, FunctionState::Error, &e).await;
                return Err(e);
            }
        };

        if readiness_timeout > 0 {
            let deadline = Instant::now() + Duration::from_secs(readiness_timeout as u64);
            if let Err(failure) = self
                .resources
                .wait_available(function, since, deadline)
                .await
            {
                let e = failure
                    .error
                    .context("Failed to wait for function resources to be available");
                self.write_failure(function, failure.state, &e).await;
                return Err(e);
            }
        }

        if let Some((terminal, event)) = terminal_state(state) {
            let status = self.invocation_status(function, &resources, terminal, event);
            self.write_status(function, status).await?;
            info!("function {} is {}", id, terminal);
        }
        Ok(())
    }
}

#[async_trait]
impl<C: ClusterClient> ChangeHandler<NuclioFunction> for FunctionOperator<C> {
    async fn create_or_update(&self, object: Arc<NuclioFunction>) -> Result<(), ControllerError> {
        let function = object.as_ref();
        match AssertUnwindSafe(self.reconcile(function)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let error = ControllerError::Panic(panic_message(payload))
                    .context("Failed to create/update function");
                error!("reconcile of function {} panicked: {}", function.id(), error.trace(10));
                self.write_failure(function, FunctionState::Error, &error).await;
                Err(error)
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        debug!("deleting function {}/{}", namespace, name);
        self.resources.delete(namespace, name).await
    }
}
