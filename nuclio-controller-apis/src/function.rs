use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::DeploymentStrategy,
    autoscaling::v2::MetricSpec,
    core::v1::{
        Affinity, Container, EnvVar, PodSecurityContext, ResourceRequirements, Toleration, Volume,
        VolumeMount,
    },
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    DEFAULT_HTTP_PORT, GPU_RESOURCE_NAME, PREVIOUS_STATE_ANNOTATION, SKIP_DEPLOY_ANNOTATION,
};

/// Lifecycle state of a [`NuclioFunction`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum FunctionState {
    #[serde(rename = "waitingForBuild")]
    WaitingForBuild,
    #[serde(rename = "building")]
    Building,
    #[serde(rename = "waitingForResourceConfiguration")]
    WaitingForResourceConfiguration,
    #[serde(rename = "waitingForScaleResourceFromZero")]
    WaitingForScaleResourcesFromZero,
    #[serde(rename = "waitingForScaleResourceToZero")]
    WaitingForScaleResourcesToZero,
    #[serde(rename = "configuringResources")]
    ConfiguringResources,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "unhealthy")]
    Unhealthy,
    #[serde(rename = "scaledToZero")]
    ScaledToZero,
    #[serde(rename = "imported")]
    Imported,
}

impl FunctionState {
    /// A provisioned function is in a terminal state, no provisioning step is pending.
    pub fn is_provisioned(&self) -> bool {
        matches!(
            self,
            FunctionState::Ready
                | FunctionState::Error
                | FunctionState::Unhealthy
                | FunctionState::ScaledToZero
                | FunctionState::Imported
        )
    }

    pub fn is_provisioning(&self) -> bool {
        !self.is_provisioned()
    }

    /// States the function operator acts upon, every other state is left untouched.
    pub fn is_reconcilable(&self) -> bool {
        matches!(
            self,
            FunctionState::WaitingForResourceConfiguration
                | FunctionState::WaitingForScaleResourcesFromZero
                | FunctionState::WaitingForScaleResourcesToZero
                | FunctionState::Ready
                | FunctionState::ScaledToZero
        )
    }

    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            FunctionState::WaitingForResourceConfiguration
                | FunctionState::WaitingForScaleResourcesFromZero
                | FunctionState::WaitingForScaleResourcesToZero
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionState::WaitingForBuild => "waitingForBuild",
            FunctionState::Building => "building",
            FunctionState::WaitingForResourceConfiguration => "waitingForResourceConfiguration",
            FunctionState::WaitingForScaleResourcesFromZero => "waitingForScaleResourceFromZero",
            FunctionState::WaitingForScaleResourcesToZero => "waitingForScaleResourceToZero",
            FunctionState::ConfiguringResources => "configuringResources",
            FunctionState::Ready => "ready",
            FunctionState::Error => "error",
            FunctionState::Unhealthy => "unhealthy",
            FunctionState::ScaledToZero => "scaledToZero",
            FunctionState::Imported => "imported",
        }
    }
}

impl std::fmt::Display for FunctionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scale events recorded in [`ScaleToZeroStatus`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ScaleEvent {
    #[serde(rename = "resourceUpdated")]
    ResourceUpdated,
    #[serde(rename = "scaleFromZeroStarted")]
    ScaleFromZeroStarted,
    #[serde(rename = "scaleFromZeroCompleted")]
    ScaleFromZeroCompleted,
    #[serde(rename = "scaleToZeroStarted")]
    ScaleToZeroStarted,
    #[serde(rename = "scaleToZeroCompleted")]
    ScaleToZeroCompleted,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ScaleToZeroStatus {
    #[serde(rename = "lastScaleEvent")]
    pub last_scale_event: ScaleEvent,
    /// RFC 3339 timestamp of the last scale event.
    #[serde(rename = "lastScaleEventTime", skip_serializing_if = "Option::is_none")]
    pub last_scale_event_time: Option<String>,
}

/// A trigger of a function, the `attributes` are trigger-kind specific.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl Trigger {
    pub fn is_http(&self) -> bool {
        self.kind == "http"
    }

    pub fn is_cron(&self) -> bool {
        self.kind == "cron"
    }

    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }
}

/// Ingress declared through the `ingresses` attribute of an http trigger.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionIngress {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// A user volume together with its mount in the function container.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionVolume {
    pub volume: Volume,
    pub volume_mount: VolumeMount,
}

/// Desired state of a serverless function.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "nuclio.io",
    version = "v1beta1",
    kind = "NuclioFunction",
    derive = "PartialEq",
    derive = "Default",
    status = "NuclioFunctionStatus",
    shortname = "nufn",
    namespaced,
    printcolumn = r#"{
        "name":"State",
        "type": "string",
        "jsonPath": ".status.state",
        "description": "The lifecycle state of the function."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct NuclioFunctionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    /// Target CPU utilization percentage for the autoscaler.
    #[serde(
        default,
        rename = "targetCPU",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_cpu: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub triggers: BTreeMap<String, Trigger>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<FunctionVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_containers: Option<Vec<Container>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_timeout_seconds: Option<i64>,
    /// Wait the full readiness timeout instead of failing fast on unschedulable
    /// or crash looping pods.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wait_readiness_timeout_before_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preemption_policy: Option<String>,
    #[serde(default, rename = "hostIPC", skip_serializing_if = "Option::is_none")]
    pub host_ipc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_strategy: Option<DeploymentStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_scaling_metric_specs: Option<Vec<MetricSpec>>,
}

/// Observed state of a [`NuclioFunction`], written by the controller only.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NuclioFunctionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FunctionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Deployment logs, carried over whenever the status is rewritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_to_zero: Option<ScaleToZeroStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_gateways: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal_invocation_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_invocation_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
}

impl NuclioFunctionSpec {
    /// The first enabled http trigger, ordered by trigger name.
    pub fn http_trigger(&self) -> Option<&Trigger> {
        self.triggers.values().find(|t| t.is_http() && !t.disabled)
    }

    pub fn cron_triggers(&self) -> impl Iterator<Item = (&String, &Trigger)> {
        self.triggers.iter().filter(|(_, t)| t.is_cron())
    }

    /// The port requested by the http trigger, `0` if none was requested.
    pub fn http_port(&self) -> i32 {
        self.http_trigger()
            .and_then(|t| t.attributes.get("port"))
            .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .map(|v| v as i32)
            .unwrap_or(0)
    }

    /// Ingresses declared by the http trigger, ordered by their key.
    pub fn ingresses(&self) -> Vec<FunctionIngress> {
        let Some(ingresses) = self
            .http_trigger()
            .and_then(|t| t.attributes.get("ingresses"))
            .and_then(|v| v.as_object())
        else {
            return vec![];
        };
        let mut keys: Vec<&String> = ingresses.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|k| serde_json::from_value(ingresses[k].clone()).ok())
            .collect()
    }

    /// Service type requested by the http trigger or the spec, else `default`.
    pub fn resolve_service_type(&self, default: &str) -> String {
        self.http_trigger()
            .and_then(|t| t.attribute_str("serviceType"))
            .filter(|v| !v.is_empty())
            .or(self.service_type.as_deref().filter(|v| !v.is_empty()))
            .unwrap_or(default)
            .to_string()
    }

    pub fn positive_gpu_resource_limit(&self) -> bool {
        self.resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|l| l.get(GPU_RESOURCE_NAME))
            .and_then(|q| q.0.parse::<f64>().ok())
            .map(|v| v > 0.0)
            .unwrap_or(false)
    }

    pub fn readiness_timeout_seconds(&self, default: i64) -> i64 {
        self.readiness_timeout_seconds.unwrap_or(default)
    }
}

impl NuclioFunction {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn state(&self) -> Option<FunctionState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(name))
            .map(|v| v.as_str())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.metadata.labels.clone().unwrap_or_default()
    }

    /// Whether deployment was explicitly skipped through the `skip-deploy` annotation.
    pub fn should_skip_deploy(&self) -> bool {
        self.annotation(SKIP_DEPLOY_ANNOTATION)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// State recorded by export/import flows before the function was re-created.
    pub fn previous_state(&self) -> Option<FunctionState> {
        self.annotation(PREVIOUS_STATE_ANNOTATION)
            .and_then(|v| serde_json::from_value(Value::String(v.to_string())).ok())
    }

    fn is_scaled_or_scaling_to_zero(&self) -> bool {
        matches!(
            self.state(),
            Some(FunctionState::ScaledToZero)
                | Some(FunctionState::WaitingForScaleResourcesToZero)
                | Some(FunctionState::Imported)
        )
    }

    /// Replicas the deployment must run, `None` leaves the current count as-is
    /// so that the autoscaler stays in charge.
    pub fn computed_replicas(&self) -> Option<i32> {
        if self.spec.disable || self.is_scaled_or_scaling_to_zero() {
            return Some(0);
        }
        if let Some(replicas) = self.spec.replicas {
            return Some(replicas.max(0));
        }
        match self.state() {
            Some(FunctionState::WaitingForResourceConfiguration)
            | Some(FunctionState::WaitingForScaleResourcesFromZero) => {
                Some(self.computed_min_replicas().max(1))
            }
            _ => None,
        }
    }

    pub fn computed_min_replicas(&self) -> i32 {
        self.spec
            .replicas
            .or(self.spec.min_replicas)
            .unwrap_or(1)
            .max(0)
    }

    pub fn computed_max_replicas(&self) -> i32 {
        self.spec
            .replicas
            .or(self.spec.max_replicas)
            .or(self.spec.min_replicas)
            .unwrap_or(1)
            .max(0)
    }

    /// A function that may be scaled to zero and back by an external scaler.
    pub fn is_scale_to_zero_candidate(&self) -> bool {
        !self.spec.disable
            && self.state() != Some(FunctionState::Imported)
            && self.computed_min_replicas() == 0
            && self.computed_max_replicas() > 0
    }

    pub fn internal_invocation_url(&self, service_name: &str) -> String {
        format!(
            "{}.{}.svc.cluster.local:{}",
            service_name,
            self.metadata.namespace.as_deref().unwrap_or("default"),
            DEFAULT_HTTP_PORT
        )
    }
}
