use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use kube::api::ObjectMeta;
use nuclio_controller_apis::FunctionIngress;

use super::{
    FunctionContext,
    apply::{ApplyStrategy, Desired},
    service::HTTP_PORT_NAME,
};
use crate::{errors::ControllerError, utils::fill_missing};

const CONFIGURATION_SNIPPET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/configuration-snippet";
const DEFAULT_PATH_TYPE: &str = "ImplementationSpecific";

pub(crate) struct IngressStrategy<'a> {
    ctx: &'a FunctionContext<'a>,
}

impl<'a> IngressStrategy<'a> {
    pub(crate) fn new(ctx: &'a FunctionContext<'a>) -> Self {
        Self { ctx }
    }

    fn annotations(&self) -> BTreeMap<String, String> {
        let function = self.ctx.function;
        let platform = &self.ctx.config.platform;
        let mut annotations = function
            .spec
            .http_trigger()
            .map(|t| t.annotations.clone())
            .unwrap_or_default();
        annotations.insert(
            CONFIGURATION_SNIPPET_ANNOTATION.to_string(),
            format!("proxy_set_header X-Nuclio-Target \"{}\";", self.ctx.name),
        );
        if function.is_scale_to_zero_candidate() {
            fill_missing(
                &mut annotations,
                &platform.scale_to_zero.http_trigger_ingress_annotations,
            );
        }
        fill_missing(&mut annotations, &platform.kube.default_http_ingress_annotations);
        annotations
    }

    /// Expand the path templates and ensure a leading `/`.
    fn path(&self, raw: &str) -> String {
        let expanded = raw
            .replace("{{.Name}}", &self.ctx.name)
            .replace("{{.Namespace}}", &self.ctx.namespace)
            .replace("{{.Version}}", "latest");
        if expanded.starts_with('/') {
            expanded
        } else {
            format!("/{}", expanded)
        }
    }

    fn rule(&self, ingress: &FunctionIngress) -> IngressRule {
        let raw_paths = if ingress.paths.is_empty() {
            vec!["/".to_string()]
        } else {
            ingress.paths.clone()
        };
        let paths = raw_paths
            .iter()
            .map(|p| HTTPIngressPath {
                path: Some(self.path(p)),
                path_type: ingress
                    .path_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PATH_TYPE.to_string()),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: self.ctx.resource_name.clone(),
                        port: Some(ServiceBackendPort {
                            name: Some(HTTP_PORT_NAME.to_string()),
                            number: None,
                        }),
                    }),
                    resource: None,
                },
            })
            .collect();
        IngressRule {
            host: Some(ingress.host.clone()).filter(|h| !h.is_empty()),
            http: Some(HTTPIngressRuleValue { paths }),
        }
    }

    fn spec(&self) -> Option<IngressSpec> {
        let ingresses = self.ctx.function.spec.ingresses();
        if ingresses.is_empty() {
            return None;
        }
        let rules = ingresses.iter().map(|i| self.rule(i)).collect();
        let tls: Vec<IngressTLS> = ingresses
            .iter()
            .filter_map(|i| {
                i.secret_name.as_ref().filter(|s| !s.is_empty()).map(|secret| IngressTLS {
                    hosts: Some(vec![i.host.clone()]),
                    secret_name: Some(secret.clone()),
                })
            })
            .collect();
        Some(IngressSpec {
            rules: Some(rules),
            tls: Some(tls).filter(|t| !t.is_empty()),
            ..Default::default()
        })
    }
}

impl ApplyStrategy<Ingress> for IngressStrategy<'_> {
    fn name(&self) -> String {
        self.ctx.resource_name.clone()
    }

    fn build(&self) -> Result<Option<Ingress>, ControllerError> {
        Ok(self.spec().map(|spec| Ingress {
            metadata: ObjectMeta {
                annotations: Some(self.annotations()),
                ..self.ctx.object_meta(&self.ctx.resource_name)
            },
            spec: Some(spec),
            ..Default::default()
        }))
    }

    fn update(&self, existing: &Ingress) -> Result<Desired<Ingress>, ControllerError> {
        let Some(spec) = self.spec() else {
            return Ok(Desired::Delete);
        };
        let mut desired = existing.clone();
        desired.metadata.labels = Some(self.ctx.labels.clone());
        desired.metadata.annotations = Some(self.annotations());
        let ingress_class_name = existing.spec.as_ref().and_then(|s| s.ingress_class_name.clone());
        desired.spec = Some(IngressSpec {
            ingress_class_name,
            ..spec
        });
        Ok(Desired::Apply(desired))
    }
}
