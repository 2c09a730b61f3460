//! Nginx ingresses fronting API gateways, together with their basic-auth secrets.

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{
    ByteString,
    api::{
        core::v1::Secret,
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
    },
};
use kube::api::ObjectMeta;
use nuclio_controller_apis::{
    APIGatewayAuthenticationSpec, AuthenticationMode, PROJECT_NAME_LABEL,
};

use crate::{
    cluster::ClusterClient,
    configuration::Configuration,
    errors::{ControllerError, ExtKubeApiError},
    functionres::{
        APP_LABEL, CLASS_LABEL,
        apply::{ApplyStrategy, Desired, create_or_update, delete_if_exists},
    },
    utils::basic_auth_secret_name,
};

pub(crate) const APIGATEWAY_NAME_LABEL: &str = "nuclio.io/apigateway-name";

const NGINX: &str = "nginx.ingress.kubernetes.io";
const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const AUTH_SECRET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/auth-secret";
const BASIC_AUTH_KEY: &str = "auth";
const PATH_TYPE: &str = "ImplementationSpecific";

const OAUTH2_COOKIE_SNIPPET: &str = r#"auth_request_set $name_upstream_1 $upstream_cookie__oauth2_proxy_1;
access_by_lua_block {
  if ngx.var.name_upstream_1 ~= "" then
    ngx.header["Set-Cookie"] = "_oauth2_proxy_1=" .. ngx.var.name_upstream_1 .. ngx.var.auth_cookie:match("(; .*)")
  end
}"#;

fn nginx(annotation: &str) -> String {
    format!("{}/{}", NGINX, annotation)
}

/// Everything a single gateway ingress is generated from.
#[derive(Clone, Debug, Default)]
pub(crate) struct IngressDefinition {
    pub name: String,
    pub namespace: String,
    pub host: String,
    pub path: String,
    pub service_name: String,
    pub service_port: i32,
    pub authentication_mode: AuthenticationMode,
    pub authentication: Option<APIGatewayAuthenticationSpec>,
    pub rewrite_target: Option<String>,
    pub upstream_vhost: Option<String>,
    pub backend_protocol: Option<String>,
    pub ssl_passthrough: bool,
    /// Overrides the platform default when set.
    pub enable_ssl_redirect: Option<bool>,
    pub proxy_read_timeout: Option<String>,
    pub whitelist_source_range: Option<Vec<String>>,
    pub tls_secret: Option<String>,
    /// Applied last, overriding generated annotations.
    pub annotations: BTreeMap<String, String>,
    pub gateway_name: String,
    pub project_name: String,
}

/// An ingress and the basic-auth secret it refers to, if any.
#[derive(Clone, Debug)]
pub(crate) struct IngressResources {
    pub ingress: Ingress,
    pub basic_auth_secret: Option<Secret>,
}

/// Applies a generated object, replacing the managed parts of an existing one.
struct Generated<'a, K> {
    object: &'a K,
}

impl ApplyStrategy<Ingress> for Generated<'_, Ingress> {
    fn name(&self) -> String {
        self.object.metadata.name.clone().unwrap_or_default()
    }

    fn build(&self) -> Result<Option<Ingress>, ControllerError> {
        Ok(Some(self.object.clone()))
    }

    fn update(&self, existing: &Ingress) -> Result<Desired<Ingress>, ControllerError> {
        let mut desired = existing.clone();
        desired.metadata.labels = self.object.metadata.labels.clone();
        desired.metadata.annotations = self.object.metadata.annotations.clone();
        desired.spec = self.object.spec.clone();
        Ok(Desired::Apply(desired))
    }
}

impl ApplyStrategy<Secret> for Generated<'_, Secret> {
    fn name(&self) -> String {
        self.object.metadata.name.clone().unwrap_or_default()
    }

    fn build(&self) -> Result<Option<Secret>, ControllerError> {
        Ok(Some(self.object.clone()))
    }

    fn update(&self, existing: &Secret) -> Result<Desired<Secret>, ControllerError> {
        let mut desired = existing.clone();
        desired.metadata.labels = self.object.metadata.labels.clone();
        desired.type_ = self.object.type_.clone();
        desired.data = self.object.data.clone();
        Ok(Desired::Apply(desired))
    }
}

pub(crate) struct IngressManager<C> {
    cluster: Arc<C>,
    config: Arc<Configuration>,
}

impl<C: ClusterClient> IngressManager<C> {
    pub(crate) fn new(cluster: Arc<C>, config: Arc<Configuration>) -> Self {
        Self { cluster, config }
    }

    fn labels(definition: &IngressDefinition) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLASS_LABEL.to_string(), "apigateway".to_string()),
            (APP_LABEL.to_string(), "ingress-manager".to_string()),
            (
                APIGATEWAY_NAME_LABEL.to_string(),
                definition.gateway_name.clone(),
            ),
            (PROJECT_NAME_LABEL.to_string(), definition.project_name.clone()),
        ])
    }

    pub(crate) fn generate_resources(
        &self,
        definition: &IngressDefinition,
    ) -> Result<IngressResources, ControllerError> {
        let labels = Self::labels(definition);
        let annotations = self
            .annotations(definition)
            .map_err(|e| e.context("failed to compile ingress annotations"))?;

        let tls_secret = definition
            .tls_secret
            .clone()
            .or_else(|| self.config.platform.ingress_config.tls_secret.clone())
            .filter(|s| !s.is_empty());
        let ingress = Ingress {
            metadata: ObjectMeta {
                name: Some(definition.name.clone()),
                namespace: Some(definition.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(definition.host.clone()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some(definition.path.clone()),
                            path_type: PATH_TYPE.to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: definition.service_name.clone(),
                                    port: Some(ServiceBackendPort {
                                        name: None,
                                        number: Some(definition.service_port),
                                    }),
                                }),
                                resource: None,
                            },
                        }],
                    }),
                }]),
                tls: tls_secret.map(|secret| {
                    vec![IngressTLS {
                        hosts: Some(vec![definition.host.clone()]),
                        secret_name: Some(secret),
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let basic_auth_secret = match (
            definition.authentication_mode,
            definition.authentication.as_ref().and_then(|a| a.basic_auth.as_ref()),
        ) {
            (AuthenticationMode::BasicAuth, Some(basic_auth)) => Some(Secret {
                metadata: ObjectMeta {
                    name: Some(basic_auth_secret_name(&definition.gateway_name)),
                    namespace: Some(definition.namespace.clone()),
                    labels: Some(labels),
                    ..Default::default()
                },
                type_: Some("Opaque".to_string()),
                data: Some(BTreeMap::from([(
                    BASIC_AUTH_KEY.to_string(),
                    // htpasswd line using the plain text scheme understood by nginx
                    ByteString(
                        format!("{}:{{PLAIN}}{}", basic_auth.username, basic_auth.password)
                            .into_bytes(),
                    ),
                )])),
                ..Default::default()
            }),
            _ => None,
        };

        Ok(IngressResources {
            ingress,
            basic_auth_secret,
        })
    }

    fn annotations(
        &self,
        definition: &IngressDefinition,
    ) -> Result<BTreeMap<String, String>, ControllerError> {
        let mut annotations =
            BTreeMap::from([(INGRESS_CLASS_ANNOTATION.to_string(), "nginx".to_string())]);
        for (annotation, value) in [
            ("rewrite-target", &definition.rewrite_target),
            ("upstream-vhost", &definition.upstream_vhost),
            ("backend-protocol", &definition.backend_protocol),
        ] {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                annotations.insert(nginx(annotation), value.clone());
            }
        }

        if definition.ssl_passthrough {
            annotations.insert(nginx("ssl-passthrough"), "true".to_string());
        } else {
            annotations.extend(self.auth_annotations(definition)?);
            annotations.insert(nginx("proxy-body-size"), "0".to_string());
            let ssl_redirect = definition
                .enable_ssl_redirect
                .unwrap_or(self.config.platform.ingress_config.enable_ssl_redirect);
            annotations.insert(nginx("ssl-redirect"), ssl_redirect.to_string());
        }

        if let Some(timeout) = definition.proxy_read_timeout.as_ref().filter(|t| !t.is_empty()) {
            annotations.insert(nginx("proxy-read-timeout"), timeout.clone());
        }
        if let Some(ranges) = &definition.whitelist_source_range {
            annotations.insert(nginx("whitelist-source-range"), ranges.join(","));
        }
        annotations.extend(definition.annotations.clone());
        Ok(annotations)
    }

    fn auth_annotations(
        &self,
        definition: &IngressDefinition,
    ) -> Result<BTreeMap<String, String>, ControllerError> {
        let ingress_config = &self.config.platform.ingress_config;
        match definition.authentication_mode {
            AuthenticationMode::None => Ok(BTreeMap::new()),
            AuthenticationMode::BasicAuth => {
                if definition
                    .authentication
                    .as_ref()
                    .and_then(|a| a.basic_auth.as_ref())
                    .is_none()
                {
                    return Err(ControllerError::Validation(
                        "basic auth spec is missing".to_string(),
                    ));
                }
                Ok(BTreeMap::from([
                    (nginx("auth-type"), "basic".to_string()),
                    (
                        nginx("auth-secret"),
                        basic_auth_secret_name(&definition.gateway_name),
                    ),
                    (nginx("auth-realm"), "Authentication Required".to_string()),
                ]))
            }
            AuthenticationMode::AccessKey => {
                let auth_url = ingress_config
                    .iguazio_auth_url
                    .as_ref()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        ControllerError::Validation("no iguazio auth URL configured".to_string())
                    })?;
                let sign_in_url = ingress_config
                    .iguazio_sign_in_url
                    .as_ref()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        ControllerError::Validation("no iguazio sign in URL configured".to_string())
                    })?;
                Ok(BTreeMap::from([
                    (nginx("auth-method"), "POST".to_string()),
                    (
                        nginx("auth-response-headers"),
                        "X-Remote-User,X-V3io-Session-Key".to_string(),
                    ),
                    (nginx("auth-url"), auth_url.clone()),
                    (nginx("auth-signin"), sign_in_url.clone()),
                    (
                        nginx("configuration-snippet"),
                        "proxy_set_header authorization \"\";".to_string(),
                    ),
                ]))
            }
            AuthenticationMode::OAuth2 => {
                let dex_auth = definition
                    .authentication
                    .as_ref()
                    .and_then(|a| a.dex_auth.as_ref());
                let proxy_url = dex_auth
                    .and_then(|d| d.oauth2_proxy_url.as_ref())
                    .or(ingress_config.oauth2_proxy_url.as_ref())
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        ControllerError::Validation("oauth2 proxy URL is missing".to_string())
                    })?;
                let mut annotations = BTreeMap::from([
                    (nginx("auth-response-headers"), "Authorization".to_string()),
                    (nginx("auth-url"), format!("{}/oauth2/auth", proxy_url)),
                    (
                        nginx("configuration-snippet"),
                        OAUTH2_COOKIE_SNIPPET.to_string(),
                    ),
                ]);
                if dex_auth.is_some_and(|d| d.redirect_unauthorized_to_sign_in) {
                    annotations.insert(
                        nginx("auth-signin"),
                        format!(
                            "{}/oauth2/start?rd=https://$host$escaped_request_uri",
                            proxy_url
                        ),
                    );
                }
                Ok(annotations)
            }
        }
    }

    /// Apply the basic-auth secret, then the ingress referring to it.
    pub(crate) async fn create_or_update(
        &self,
        resources: &IngressResources,
    ) -> Result<Option<Ingress>, ControllerError> {
        let cluster = self.cluster.as_ref();
        let timings = &self.config.timings;
        let namespace = resources.ingress.metadata.namespace.clone().unwrap_or_default();
        if let Some(secret) = &resources.basic_auth_secret {
            create_or_update(cluster, &namespace, &Generated { object: secret }, timings)
                .await
                .map_err(|e| e.context("failed to apply basic auth secret"))?;
        }
        let ingress = create_or_update(
            cluster,
            &namespace,
            &Generated {
                object: &resources.ingress,
            },
            timings,
        )
        .await
        .map_err(|e| e.context("failed to apply ingress"))?;
        Ok(ingress.into_object())
    }

    /// Delete an ingress, and with `delete_auth_secret` the secret named by its
    /// `auth-secret` annotation.
    pub(crate) async fn delete_by_name(
        &self,
        namespace: &str,
        name: &str,
        delete_auth_secret: bool,
    ) -> Result<(), ControllerError> {
        let cluster = self.cluster.as_ref();
        if delete_auth_secret {
            let ingress: Ingress = match cluster.get(namespace, name).await {
                Ok(ingress) => ingress,
                Err(e) if e.is_not_found() => {
                    debug!("ingress {}/{} not found, nothing to delete", namespace, name);
                    return Ok(());
                }
                Err(e) => {
                    return Err(ControllerError::from(e)
                        .context(format!("failed to get ingress {}/{}", namespace, name)));
                }
            };
            let secret_name = ingress
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(AUTH_SECRET_ANNOTATION))
                .filter(|s| !s.is_empty());
            if let Some(secret_name) = secret_name {
                debug!(
                    "deleting auth secret {}/{} of ingress {}",
                    namespace, secret_name, name
                );
                delete_if_exists::<C, Secret>(cluster, namespace, secret_name).await?;
            }
        }
        delete_if_exists::<C, Ingress>(cluster, namespace, name).await?;
        Ok(())
    }
}
