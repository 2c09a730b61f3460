use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use nuclio_controller_apis::{DEFAULT_HTTP_PORT, DEFAULT_METRICS_PORT};

use super::{
    APP_LABEL, FunctionContext,
    apply::{ApplyStrategy, Desired},
};
use crate::errors::ControllerError;

pub(crate) const HTTP_PORT_NAME: &str = "http";
pub(crate) const METRICS_PORT_NAME: &str = "metrics";
const NODE_PORT: &str = "NodePort";

fn port(name: &str, port: i32, node_port: Option<i32>) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        node_port,
        ..Default::default()
    }
}

pub(crate) struct ServiceStrategy<'a> {
    ctx: &'a FunctionContext<'a>,
}

impl<'a> ServiceStrategy<'a> {
    pub(crate) fn new(ctx: &'a FunctionContext<'a>) -> Self {
        Self { ctx }
    }

    fn service_type(&self) -> String {
        self.ctx
            .function
            .spec
            .resolve_service_type(&self.ctx.config.platform.kube.default_service_type)
    }

    /// Scaled to zero functions are served by the dlx until they are scaled back up.
    fn selector(&self) -> BTreeMap<String, String> {
        if self.ctx.is_scaled_to_zero() {
            BTreeMap::from([(APP_LABEL.to_string(), "dlx".to_string())])
        } else {
            self.ctx.labels.clone()
        }
    }

    fn http_port(&self, service_type: &str) -> ServicePort {
        let requested = self.ctx.function.spec.http_port();
        let node_port = (service_type == NODE_PORT && requested != 0).then_some(requested);
        port(HTTP_PORT_NAME, DEFAULT_HTTP_PORT, node_port)
    }

    fn ensure_platform_ports(&self, ports: &mut Vec<ServicePort>) {
        if self.ctx.config.platform.has_prometheus_pull_sink()
            && !ports
                .iter()
                .any(|p| p.name.as_deref() == Some(METRICS_PORT_NAME))
        {
            ports.push(port(METRICS_PORT_NAME, DEFAULT_METRICS_PORT, None));
        }
    }
}

impl ApplyStrategy<Service> for ServiceStrategy<'_> {
    fn name(&self) -> String {
        self.ctx.resource_name.clone()
    }

    fn build(&self) -> Result<Option<Service>, ControllerError> {
        let service_type = self.service_type();
        let mut ports = vec![self.http_port(&service_type)];
        self.ensure_platform_ports(&mut ports);
        Ok(Some(Service {
            metadata: self.ctx.object_meta(&self.ctx.resource_name),
            spec: Some(ServiceSpec {
                type_: Some(service_type),
                selector: Some(self.selector()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    fn update(&self, existing: &Service) -> Result<Desired<Service>, ControllerError> {
        let service_type = self.service_type();
        let mut desired = existing.clone();
        desired.metadata.labels = Some(self.ctx.labels.clone());
        let spec = desired.spec.get_or_insert_with(Default::default);

        let mut ports = spec.ports.take().unwrap_or_default();
        let existing_node_port = ports
            .iter()
            .find(|p| p.name.as_deref() == Some(HTTP_PORT_NAME))
            .and_then(|p| p.node_port)
            .unwrap_or(0);
        let requested = self.ctx.function.spec.http_port();
        // a node port allocated by the cluster is kept unless the type no longer allows it
        if ports.is_empty()
            || !(existing_node_port != 0 && requested == 0)
            || (existing_node_port != 0 && service_type != NODE_PORT)
        {
            ports = vec![self.http_port(&service_type)];
        }
        self.ensure_platform_ports(&mut ports);

        spec.ports = Some(ports);
        spec.type_ = Some(service_type);
        spec.selector = Some(self.selector());
        Ok(Desired::Apply(desired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configuration::{Configuration, MetricSink},
        functionres::tests::{function, http_trigger},
    };
    use nuclio_controller_apis::{FunctionState, NuclioFunctionStatus};
    use serde_json::json;

    fn port_names(service: &Service) -> Vec<String> {
        service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|p| p.iter().filter_map(|p| p.name.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn ports_follow_platform_metric_sinks() {
        let mut config = Configuration::for_tests();
        let function = function("echo");
        let ctx = FunctionContext::new(&function, &config, None);
        let service = ServiceStrategy::new(&ctx).build().unwrap().unwrap();
        assert_eq!(vec!["http"], port_names(&service));

        config.platform.metrics.sinks.insert(
            "pull".to_string(),
            MetricSink {
                kind: "prometheusPull".to_string(),
            },
        );
        config.platform.metrics.functions = vec!["pull".to_string()];
        let ctx = FunctionContext::new(&function, &config, None);
        let service = ServiceStrategy::new(&ctx).build().unwrap().unwrap();
        assert_eq!(vec!["http", "metrics"], port_names(&service));
        let spec = service.spec.unwrap();
        assert_eq!(Some("ClusterIP"), spec.type_.as_deref());
        assert_eq!(
            Some("echo"),
            spec.selector.unwrap().get("nuclio.io/function-name").map(|v| v.as_str())
        );
    }

    #[test]
    fn node_port_handling() {
        let config = Configuration::for_tests();
        let mut function = function("echo");
        function.spec.triggers.insert(
            "http".to_string(),
            http_trigger(json!({"port": 32001, "serviceType": "NodePort"})),
        );
        let ctx = FunctionContext::new(&function, &config, None);
        let strategy = ServiceStrategy::new(&ctx);
        let service = strategy.build().unwrap().unwrap();
        let http = &service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
        assert_eq!(Some(32001), http.node_port);
        assert_eq!(8080, http.port);

        // an allocated node port survives when no specific port is requested
        let mut allocated = service.clone();
        allocated.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30555);
        let mut function_without_port = function.clone();
        function_without_port.spec.triggers.insert(
            "http".to_string(),
            http_trigger(json!({"serviceType": "NodePort"})),
        );
        let ctx = FunctionContext::new(&function_without_port, &config, None);
        let Desired::Apply(updated) = ServiceStrategy::new(&ctx).update(&allocated).unwrap() else {
            panic!("expected apply");
        };
        assert_eq!(
            Some(30555),
            updated.spec.unwrap().ports.unwrap()[0].node_port
        );

        // switching to ClusterIP drops the node port
        let mut cluster_ip = function.clone();
        cluster_ip.spec.triggers.insert("http".to_string(), http_trigger(json!({})));
        let ctx = FunctionContext::new(&cluster_ip, &config, None);
        let Desired::Apply(updated) = ServiceStrategy::new(&ctx).update(&allocated).unwrap() else {
            panic!("expected apply");
        };
        let spec = updated.spec.unwrap();
        assert_eq!(Some("ClusterIP"), spec.type_.as_deref());
        assert_eq!(None, spec.ports.unwrap()[0].node_port);
    }

    #[test]
    fn scaled_to_zero_selects_dlx() {
        let config = Configuration::for_tests();
        let mut function = function("echo");
        function.status = Some(NuclioFunctionStatus {
            state: Some(FunctionState::WaitingForScaleResourcesToZero),
            ..Default::default()
        });
        let ctx = FunctionContext::new(&function, &config, None);
        let service = ServiceStrategy::new(&ctx).build().unwrap().unwrap();
        assert_eq!(
            BTreeMap::from([("nuclio.io/app".to_string(), "dlx".to_string())]),
            service.spec.unwrap().selector.unwrap()
        );
    }
}
