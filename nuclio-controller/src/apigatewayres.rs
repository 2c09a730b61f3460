use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use k8s_openapi::api::networking::v1::Ingress;
use kube::{ResourceExt, api::ListParams};
use nuclio_controller_apis::{
    APIGatewayUpstreamSpec, DEFAULT_HTTP_PORT, DEFAULT_PROJECT_NAME, NuclioAPIGateway,
    PROJECT_NAME_LABEL, UPSTREAM_KIND_NUCLIO_FUNCTION,
};
use tokio::time::sleep;

use crate::{
    cluster::ClusterClient,
    configuration::Configuration,
    errors::{ControllerError, ResultExt},
    ingress::{IngressDefinition, IngressManager, IngressResources},
    utils::{apigateway_ingress_name, function_resource_name},
};

const CANARY_ANNOTATION: &str = "nginx.ingress.kubernetes.io/canary";
const CANARY_WEIGHT_ANNOTATION: &str = "nginx.ingress.kubernetes.io/canary-weight";

fn invalid(message: impl Into<String>) -> ControllerError {
    ControllerError::Validation(message.into())
}

/// Checks of the gateway spec which need no cluster access.
fn validate_spec(gateway: &NuclioAPIGateway) -> Result<(), ControllerError> {
    let upstreams = &gateway.spec.upstreams;
    if upstreams.is_empty() {
        return Err(invalid("One or more upstreams must be provided in spec"));
    }
    if upstreams.len() > 2 {
        return Err(invalid(
            "Received more than 2 upstreams. Currently not supported",
        ));
    }
    if gateway.spec.host.is_empty() {
        return Err(invalid("Host must be provided in spec"));
    }
    let kind = upstreams[0].kind.as_str();
    if kind != UPSTREAM_KIND_NUCLIO_FUNCTION {
        return Err(invalid(format!(
            "Unsupported upstream kind: '{}'. (Currently supporting only nucliofunction)",
            kind
        )));
    }
    if upstreams.iter().any(|u| u.kind != kind) {
        return Err(invalid("All upstreams must be of the same kind"));
    }
    if upstreams.iter().any(|u| u.function_name().is_none()) {
        return Err(invalid("Upstream function name must be provided"));
    }
    split_upstreams(upstreams).map(|_| ())
}

/// Split the upstreams into the primary and the optional canary upstream.
fn split_upstreams(
    upstreams: &[APIGatewayUpstreamSpec],
) -> Result<(&APIGatewayUpstreamSpec, Option<&APIGatewayUpstreamSpec>), ControllerError> {
    match upstreams {
        [single] => {
            if single.percentage() != 0 {
                return Err(invalid(
                    "Percentage must not be set on a single upstream",
                ));
            }
            Ok((single, None))
        }
        [first, second] => {
            let (primary, canary) = match (first.percentage(), second.percentage()) {
                (0, 0) => {
                    return Err(invalid(
                        "Percentage must be set on one of the upstreams (canary)",
                    ));
                }
                (_, 0) => (second, first),
                (0, _) => (first, second),
                _ => {
                    return Err(invalid(
                        "Percentage must be set on only one of the upstreams (canary)",
                    ));
                }
            };
            if !(1..=100).contains(&canary.percentage()) {
                return Err(invalid(
                    "The canary upstream percentage must be between 1 and 100",
                ));
            }
            Ok((primary, Some(canary)))
        }
        _ => Err(invalid(
            "Received more than 2 upstreams. Currently not supported",
        )),
    }
}

/// The ingresses implementing API gateways.
pub(crate) struct APIGatewayResources<C> {
    cluster: Arc<C>,
    config: Arc<Configuration>,
    ingress_manager: IngressManager<C>,
}

impl<C: ClusterClient> APIGatewayResources<C> {
    pub(crate) fn new(cluster: Arc<C>, config: Arc<Configuration>) -> Self {
        Self {
            ingress_manager: IngressManager::new(cluster.clone(), config.clone()),
            cluster,
            config,
        }
    }

    /// No upstream function may be routed to by more than one gateway.
    async fn validate_unique_upstreams(
        &self,
        gateway: &NuclioAPIGateway,
    ) -> Result<(), ControllerError> {
        let namespace = gateway.namespace().unwrap_or_default();
        let name = gateway.name_any();
        let gateways: Vec<NuclioAPIGateway> = self
            .cluster
            .list(&namespace, &ListParams::default())
            .await
            .context("failed to list existing api gateways")?;
        let used: HashSet<&str> = gateways
            .iter()
            .filter(|other| other.name_any() != name)
            .flat_map(|other| other.function_names())
            .collect();
        match gateway.function_names().into_iter().find(|f| used.contains(f)) {
            Some(function) => Err(invalid(format!(
                "Nuclio function '{}' is already being used in another api gateway",
                function
            ))),
            None => Ok(()),
        }
    }

    fn generate(
        &self,
        gateway: &NuclioAPIGateway,
        upstream: &APIGatewayUpstreamSpec,
        canary: bool,
    ) -> Result<IngressResources, ControllerError> {
        let gateway_name = gateway.name_any();
        let path = gateway.spec.path.clone().unwrap_or_default();
        let mut annotations = BTreeMap::new();
        if canary {
            annotations.insert(CANARY_ANNOTATION.to_string(), "true".to_string());
            annotations.insert(
                CANARY_WEIGHT_ANNOTATION.to_string(),
                upstream.percentage().to_string(),
            );
        }
        annotations.extend(upstream.extra_annotations.clone());
        let definition = IngressDefinition {
            name: apigateway_ingress_name(&gateway_name, canary),
            namespace: gateway.namespace().unwrap_or_default(),
            host: gateway.spec.host.clone(),
            path: if path.starts_with('/') {
                path
            } else {
                format!("/{}", path)
            },
            service_name: function_resource_name(upstream.function_name().unwrap_or_default()),
            service_port: DEFAULT_HTTP_PORT,
            authentication_mode: gateway.spec.authentication_mode,
            authentication: gateway.spec.authentication.clone(),
            rewrite_target: upstream.rewrite_target.clone(),
            enable_ssl_redirect: gateway.spec.enable_ssl_redirect,
            annotations,
            project_name: gateway
                .labels()
                .get(PROJECT_NAME_LABEL)
                .filter(|p| !p.is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string()),
            gateway_name,
            ..Default::default()
        };
        self.ingress_manager.generate_resources(&definition)
    }

    /// Validate the gateway and apply its primary and canary ingresses.
    ///
    /// A previous canary ingress is always removed first, so that promoting
    /// or dropping the canary never leaves a stale canary routing traffic.
    pub(crate) async fn create_or_update(
        &self,
        gateway: &mut NuclioAPIGateway,
    ) -> Result<Vec<Ingress>, ControllerError> {
        let status = gateway.status.get_or_insert_with(Default::default);
        status.name = gateway.spec.name.clone();

        validate_spec(gateway).map_err(|e| e.context("api gateway spec validation failed"))?;
        self.validate_unique_upstreams(gateway)
            .await
            .map_err(|e| e.context("api gateway spec validation failed"))?;

        let (primary, canary) = split_upstreams(&gateway.spec.upstreams)?;
        let mut ingresses = vec![self.generate(gateway, primary, false)?];
        if let Some(canary) = canary {
            ingresses.push(self.generate(gateway, canary, true)?);
        }

        let namespace = gateway.namespace().unwrap_or_default();
        let name = gateway.name_any();
        let canary_ingress = apigateway_ingress_name(&name, true);
        if let Err(e) = self
            .ingress_manager
            .delete_by_name(&namespace, &canary_ingress, true)
            .await
        {
            warn!(
                "failed to delete previous canary ingress {}/{}: {}",
                namespace, canary_ingress, e
            );
        }

        let mut applied = vec![];
        for resources in &ingresses {
            let ingress_name = resources.ingress.name_any();
            let ingress = self
                .ingress_manager
                .create_or_update(resources)
                .await
                .context(format!(
                    "failed to create or update ingress {} of api gateway {}",
                    ingress_name,
                    gateway.id()
                ))?;
            applied.extend(ingress);
        }
        Ok(applied)
    }

    /// Give the ingress controller time to pick up the new ingresses.
    pub(crate) async fn wait_available(&self) {
        debug!(
            "waiting {:?} for the ingress controller to stabilize",
            self.config.timings.apigateway_wait
        );
        sleep(self.config.timings.apigateway_wait).await;
    }

    /// Delete both ingresses of the gateway and their auth secrets, failures are logged.
    pub(crate) async fn delete(&self, namespace: &str, name: &str) {
        for canary in [false, true] {
            let ingress = apigateway_ingress_name(name, canary);
            debug!("deleting ingress {}/{} of api gateway", namespace, ingress);
            if let Err(e) = self
                .ingress_manager
                .delete_by_name(namespace, &ingress, true)
                .await
            {
                warn!(
                    "failed to delete ingress {}/{}, continuing: {}",
                    namespace, ingress, e
                );
            }
        }
    }
}
