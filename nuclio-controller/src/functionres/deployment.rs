use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1 as apps,
        core::v1::{
            ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
            LocalObjectReference, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
    },
};
use kube::api::ObjectMeta;
use nuclio_controller_apis::{DEFAULT_HTTP_PORT, DEFAULT_METRICS_PORT, FUNCTION_NAME_LABEL};
use serde_json::Value;

use super::{
    FunctionContext,
    apply::{ApplyStrategy, Desired},
    service::{HTTP_PORT_NAME, METRICS_PORT_NAME},
};
use crate::{
    errors::ControllerError,
    utils::{labels_match, merge_missing},
};

const CONTAINER_NAME: &str = "nuclio";
const HEALTH_CHECK_PORT: i32 = 8082;
const DEFAULT_CPU_REQUEST: &str = "25m";
const DEFAULT_IMAGE_PULL_POLICY: &str = "Always";

const PROCESSOR_CONFIG_VOLUME: &str = "processor-config-volume";
const PROCESSOR_CONFIG_PATH: &str = "/etc/nuclio/config/processor";
const PLATFORM_CONFIG_VOLUME: &str = "platform-config-volume";
const PLATFORM_CONFIG_PATH: &str = "/etc/nuclio/config/platform";

const IMAGE_HASH_ANNOTATION: &str = "nuclio.io/image-hash";
const FUNCTION_CONFIG_ANNOTATION: &str = "nuclio.io/function-config";
const CONTROLLER_VERSION_ANNOTATION: &str = "nuclio.io/controller-version";

const ROLLING_UPDATE: &str = "RollingUpdate";
const RECREATE: &str = "Recreate";

fn http_get_probe(port: i32, path: &str, initial_delay: i32, timeout: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            port: IntOrString::Int(port),
            path: Some(path.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        timeout_seconds: Some(timeout),
        period_seconds: Some(period),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn config_map_volume(name: &str, config_map: &str, optional: bool) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            optional: optional.then_some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub(crate) struct DeploymentStrategy<'a> {
    ctx: &'a FunctionContext<'a>,
}

impl<'a> DeploymentStrategy<'a> {
    pub(crate) fn new(ctx: &'a FunctionContext<'a>) -> Self {
        Self { ctx }
    }

    fn pod_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = self.ctx.annotations();
        if let Some(hash) = self.ctx.function.spec.image_hash.as_ref() {
            annotations.insert(IMAGE_HASH_ANNOTATION.to_string(), hash.clone());
        }
        if self.ctx.config.platform.has_prometheus_pull_sink() {
            annotations.insert("prometheus.io/scrape".to_string(), "true".to_string());
            annotations.insert(
                "prometheus.io/port".to_string(),
                DEFAULT_METRICS_PORT.to_string(),
            );
            annotations.insert("prometheus.io/path".to_string(), "/metrics".to_string());
        }
        annotations
    }

    fn deployment_annotations(&self) -> Result<BTreeMap<String, String>, ControllerError> {
        let spec = &self.ctx.function.spec;
        let mut annotations = self.ctx.annotations();
        if let Some(description) = spec.description.as_ref().filter(|d| !d.is_empty()) {
            annotations.insert("description".to_string(), description.clone());
        }
        annotations.insert(
            FUNCTION_CONFIG_ANNOTATION.to_string(),
            serde_json::to_string(spec)?,
        );
        annotations.insert(
            CONTROLLER_VERSION_ANNOTATION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        Ok(annotations)
    }

    fn env(&self) -> Vec<EnvVar> {
        let mut env = self.ctx.function.spec.env.clone().unwrap_or_default();
        env.push(env_var("NUCLIO_FUNCTION_NAME", &self.ctx.name));
        env.push(env_var("NUCLIO_FUNCTION_VERSION", "latest"));
        env.push(EnvVar {
            name: "NUCLIO_FUNCTION_INSTANCE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        env
    }

    fn resources(&self) -> ResourceRequirements {
        let mut resources = self.ctx.function.spec.resources.clone().unwrap_or_default();
        if resources.requests.as_ref().is_none_or(|r| r.is_empty()) {
            resources.requests = Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity(DEFAULT_CPU_REQUEST.to_string()),
            )]));
        }
        resources
    }

    fn ports(&self) -> Vec<ContainerPort> {
        let mut ports = vec![ContainerPort {
            name: Some(HTTP_PORT_NAME.to_string()),
            container_port: DEFAULT_HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }];
        if self.ctx.config.platform.has_prometheus_pull_sink() {
            ports.push(ContainerPort {
                name: Some(METRICS_PORT_NAME.to_string()),
                container_port: DEFAULT_METRICS_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
        ports
    }

    /// Volumes and their mounts, deduplicated and ordered by volume name.
    fn volumes(&self) -> (Vec<Volume>, Vec<VolumeMount>) {
        let mut volumes = BTreeMap::new();
        let mut mounts = BTreeMap::new();
        for function_volume in &self.ctx.function.spec.volumes {
            let name = &function_volume.volume.name;
            if function_volume.volume.host_path.is_some() {
                warn!(
                    "ignoring hostPath volume {} of function {}/{}",
                    name, self.ctx.namespace, self.ctx.name
                );
                continue;
            }
            volumes
                .entry(name.clone())
                .or_insert_with(|| function_volume.volume.clone());
            mounts
                .entry(name.clone())
                .or_insert_with(|| function_volume.volume_mount.clone());
        }
        volumes.insert(
            PROCESSOR_CONFIG_VOLUME.to_string(),
            config_map_volume(PROCESSOR_CONFIG_VOLUME, &self.ctx.resource_name, false),
        );
        mounts.insert(
            PROCESSOR_CONFIG_VOLUME.to_string(),
            volume_mount(PROCESSOR_CONFIG_VOLUME, PROCESSOR_CONFIG_PATH),
        );
        volumes.insert(
            PLATFORM_CONFIG_VOLUME.to_string(),
            config_map_volume(
                PLATFORM_CONFIG_VOLUME,
                &self.ctx.config.platform.platform_configuration_name,
                true,
            ),
        );
        mounts.insert(
            PLATFORM_CONFIG_VOLUME.to_string(),
            volume_mount(PLATFORM_CONFIG_VOLUME, PLATFORM_CONFIG_PATH),
        );
        (volumes.into_values().collect(), mounts.into_values().collect())
    }

    fn pod_template(&self) -> PodTemplateSpec {
        let spec = &self.ctx.function.spec;
        let (volumes, volume_mounts) = self.volumes();
        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: spec.image.clone(),
            image_pull_policy: Some(
                spec.image_pull_policy
                    .clone()
                    .unwrap_or_else(|| DEFAULT_IMAGE_PULL_POLICY.to_string()),
            ),
            resources: Some(self.resources()),
            env: Some(self.env()),
            ports: Some(self.ports()),
            readiness_probe: Some(http_get_probe(DEFAULT_HTTP_PORT, "/ready", 1, 1, 1)),
            liveness_probe: Some(http_get_probe(HEALTH_CHECK_PORT, "/live", 10, 3, 5)),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        };
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                name: Some(self.ctx.resource_name.clone()),
                namespace: Some(self.ctx.namespace.clone()),
                labels: Some(self.ctx.labels.clone()),
                annotations: Some(self.pod_annotations()),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                init_containers: spec.init_containers.clone().filter(|c| !c.is_empty()),
                volumes: Some(volumes),
                image_pull_secrets: self
                    .ctx
                    .image_pull_secrets
                    .as_ref()
                    .map(|name| vec![LocalObjectReference { name: name.clone() }]),
                service_account_name: spec.service_account.clone().filter(|s| !s.is_empty()),
                security_context: spec.security_context.clone(),
                affinity: spec.affinity.clone(),
                node_selector: spec.node_selector.clone(),
                node_name: spec.node_name.clone(),
                tolerations: spec.tolerations.clone(),
                priority_class_name: spec.priority_class_name.clone(),
                preemption_policy: spec.preemption_policy.clone(),
                host_ipc: spec.host_ipc,
                ..Default::default()
            }),
        }
    }

    /// Deployment overlays of the platform configurations matching the function labels.
    ///
    /// Selectors see the labels of the generated resources, including the function name.
    fn overlays(&self) -> impl Iterator<Item = &Value> {
        let labels = &self.ctx.labels;
        self.ctx
            .config
            .platform
            .function_augmented_configs
            .iter()
            .filter(move |c| labels_match(&c.label_selector.match_labels, labels))
            .filter_map(|c| c.kubernetes.deployment.as_ref())
    }

    /// The deployment as generated from the function, ignoring what exists in the cluster.
    fn desired(&self) -> Result<apps::Deployment, ControllerError> {
        let function = self.ctx.function;
        let deployment = apps::Deployment {
            metadata: ObjectMeta {
                annotations: Some(self.deployment_annotations()?),
                ..self.ctx.object_meta(&self.ctx.resource_name)
            },
            spec: Some(apps::DeploymentSpec {
                replicas: Some(
                    function
                        .computed_replicas()
                        .unwrap_or_else(|| function.computed_min_replicas().max(1)),
                ),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        FUNCTION_NAME_LABEL.to_string(),
                        self.ctx.name.clone(),
                    )])),
                    ..Default::default()
                },
                template: self.pod_template(),
                strategy: function.spec.deployment_strategy.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut value = serde_json::to_value(&deployment)?;
        for overlay in self.overlays() {
            merge_missing(&mut value, overlay);
        }
        let mut deployment: apps::Deployment = serde_json::from_value(value)?;

        if let Some(spec) = deployment.spec.as_mut() {
            if spec.strategy.is_none() {
                let type_ = if function.spec.positive_gpu_resource_limit() {
                    RECREATE
                } else {
                    ROLLING_UPDATE
                };
                spec.strategy = Some(apps::DeploymentStrategy {
                    type_: Some(type_.to_string()),
                    rolling_update: None,
                });
            }
        }
        Ok(deployment)
    }
}

impl ApplyStrategy<apps::Deployment> for DeploymentStrategy<'_> {
    fn name(&self) -> String {
        self.ctx.resource_name.clone()
    }

    fn build(&self) -> Result<Option<apps::Deployment>, ControllerError> {
        Ok(Some(self.desired()?))
    }

    fn update(
        &self,
        existing: &apps::Deployment,
    ) -> Result<Desired<apps::Deployment>, ControllerError> {
        let function = self.ctx.function;
        let desired = self.desired()?;
        let mut updated = existing.clone();
        updated.metadata.labels = desired.metadata.labels;
        updated.metadata.annotations = desired.metadata.annotations;

        let Some(desired_spec) = desired.spec else {
            return Ok(Desired::Keep);
        };
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.replicas = match function.computed_replicas() {
            Some(replicas) => Some(replicas),
            None => {
                // leave the autoscaler in charge, within the configured bounds
                let min = function.computed_min_replicas();
                let max = function.computed_max_replicas().max(min);
                spec.replicas.map(|r| r.clamp(min, max))
            }
        };
        spec.template = desired_spec.template;
        spec.strategy = desired_spec.strategy;
        if desired_spec.min_ready_seconds.is_some() {
            spec.min_ready_seconds = desired_spec.min_ready_seconds;
        }
        if desired_spec.progress_deadline_seconds.is_some() {
            spec.progress_deadline_seconds = desired_spec.progress_deadline_seconds;
        }
        if desired_spec.revision_history_limit.is_some() {
            spec.revision_history_limit = desired_spec.revision_history_limit;
        }
        Ok(Desired::Apply(updated))
    }
}
