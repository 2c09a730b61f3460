use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

/// Default location of the platform configuration file.
const PLATFORM_CONFIG_PATH: &str = "/etc/nuclio/config/platform/platform.yaml";

pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var(name) {
        Some(v) => v
            .parse()
            .with_context(|| format!("invalid value '{}' for environment variable {}", v, name)),
        None => Ok(default),
    }
}

fn env_seconds(name: &str, default: u64) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(env_parse(name, default)?))
}

/// How cron triggers are implemented.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) enum CronTriggerCreationMode {
    /// The processor runs the schedule itself.
    #[default]
    #[serde(rename = "processor")]
    Processor,
    /// One Kubernetes CronJob per cron trigger invokes the function over HTTP.
    #[serde(rename = "kube")]
    Kube,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct KubeConfiguration {
    pub default_service_type: String,
    #[serde(rename = "defaultHTTPIngressAnnotations")]
    pub default_http_ingress_annotations: BTreeMap<String, String>,
    pub default_function_readiness_timeout_seconds: i64,
}

impl Default for KubeConfiguration {
    fn default() -> Self {
        Self {
            default_service_type: "ClusterIP".to_string(),
            default_http_ingress_annotations: Default::default(),
            default_function_readiness_timeout_seconds: 120,
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct IngressConfiguration {
    #[serde(rename = "enableSSLRedirect")]
    pub enable_ssl_redirect: bool,
    pub tls_secret: Option<String>,
    #[serde(rename = "oauth2ProxyURL")]
    pub oauth2_proxy_url: Option<String>,
    #[serde(rename = "iguazioAuthURL")]
    pub iguazio_auth_url: Option<String>,
    #[serde(rename = "iguazioSignInURL")]
    pub iguazio_sign_in_url: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ScaleToZeroConfiguration {
    pub http_trigger_ingress_annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct AutoScaleConfiguration {
    pub metric_name: Option<String>,
    pub target_value: Option<String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub(crate) struct MetricSink {
    pub kind: String,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub(crate) struct MetricsConfiguration {
    pub sinks: BTreeMap<String, MetricSink>,
    /// Names of the sinks functions report to.
    pub functions: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub(crate) struct AugmentedKubernetesConfig {
    /// Partial apps/v1 Deployment merged into the generated deployment.
    pub deployment: Option<Value>,
}

/// Platform provided configuration applied to all functions with matching labels.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct FunctionAugmentedConfig {
    pub label_selector: LabelSelector,
    pub kubernetes: AugmentedKubernetesConfig,
}

/// Contents of the platform configuration file.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct PlatformConfiguration {
    pub kube: KubeConfiguration,
    pub ingress_config: IngressConfiguration,
    pub scale_to_zero: ScaleToZeroConfiguration,
    pub auto_scale: AutoScaleConfiguration,
    pub metrics: MetricsConfiguration,
    pub function_augmented_configs: Vec<FunctionAugmentedConfig>,
    pub cron_trigger_creation_mode: CronTriggerCreationMode,
    /// Name of the config map holding the platform configuration, mounted into function pods.
    pub platform_configuration_name: String,
}

impl Default for PlatformConfiguration {
    fn default() -> Self {
        Self {
            kube: Default::default(),
            ingress_config: Default::default(),
            scale_to_zero: Default::default(),
            auto_scale: Default::default(),
            metrics: Default::default(),
            function_augmented_configs: Default::default(),
            cron_trigger_creation_mode: Default::default(),
            platform_configuration_name: "nuclio-platform-config".to_string(),
        }
    }
}

impl PlatformConfiguration {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Default::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Load the platform configuration, a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(
                "platform configuration {} not found, using defaults",
                path.display()
            );
            return Ok(Default::default());
        }
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Kinds of the metric sinks functions report to.
    pub fn function_metric_sink_kinds(&self) -> Vec<&str> {
        self.metrics
            .functions
            .iter()
            .filter_map(|name| self.metrics.sinks.get(name))
            .map(|sink| sink.kind.as_str())
            .collect()
    }

    pub fn has_prometheus_pull_sink(&self) -> bool {
        self.function_metric_sink_kinds()
            .iter()
            .any(|k| *k == "prometheusPull")
    }

    pub fn default_readiness_timeout_seconds(&self) -> i64 {
        self.kube.default_function_readiness_timeout_seconds
    }
}

/// Durations of all waits and retries.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ResourceTimings {
    /// Overall deadline of a single create-or-update, including conflict retries.
    pub update_timeout: Duration,
    /// How long to wait for a resource marked for deletion to disappear.
    pub deletion_wait: Duration,
    pub deletion_poll: Duration,
    /// Grace period given to the cluster autoscaler before judging unschedulable pods.
    pub node_scale_up_grace: Duration,
    /// Pause after ingress changes to let the ingress controller pick them up.
    pub ingress_update_grace: Duration,
    /// How long the ingress may lag behind the deployment before failing.
    pub ingress_readiness_timeout: Duration,
    pub probe_initial_interval: Duration,
    pub probe_max_interval: Duration,
    pub fast_poll_interval: Duration,
    /// Pods created this long before the readiness wait started are still considered.
    pub pod_creation_slack: Duration,
    pub scale_cooldown: Duration,
    pub post_deploy_monitoring_grace: Duration,
    pub scaling_grace: Duration,
    pub apigateway_wait: Duration,
}

impl Default for ResourceTimings {
    fn default() -> Self {
        Self {
            update_timeout: Duration::from_secs(120),
            deletion_wait: Duration::from_secs(60),
            deletion_poll: Duration::from_secs(1),
            node_scale_up_grace: Duration::from_secs(15),
            ingress_update_grace: Duration::from_secs(5),
            ingress_readiness_timeout: Duration::from_secs(150),
            probe_initial_interval: Duration::from_millis(250),
            probe_max_interval: Duration::from_secs(2),
            fast_poll_interval: Duration::from_millis(50),
            pod_creation_slack: Duration::from_secs(2),
            scale_cooldown: Duration::from_secs(60),
            post_deploy_monitoring_grace: Duration::from_secs(60),
            scaling_grace: Duration::from_secs(60),
            apigateway_wait: Duration::from_secs(4),
        }
    }
}

#[cfg(test)]
impl ResourceTimings {
    /// Millisecond timings for tests.
    pub(crate) fn fast() -> Self {
        Self {
            update_timeout: Duration::from_secs(5),
            deletion_wait: Duration::from_millis(20),
            deletion_poll: Duration::from_millis(2),
            node_scale_up_grace: Duration::from_millis(100),
            ingress_update_grace: Duration::ZERO,
            ingress_readiness_timeout: Duration::from_millis(100),
            probe_initial_interval: Duration::from_millis(5),
            probe_max_interval: Duration::from_millis(20),
            fast_poll_interval: Duration::from_millis(5),
            pod_creation_slack: Duration::from_secs(2),
            scale_cooldown: Duration::from_millis(200),
            post_deploy_monitoring_grace: Duration::from_millis(200),
            scaling_grace: Duration::from_millis(200),
            apigateway_wait: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RateLimiterConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            max_retries: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Configuration {
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    pub image_pull_secrets: Option<String>,
    pub external_ip_addresses: Vec<String>,
    pub function_operator_workers: usize,
    pub apigateway_operator_workers: usize,
    pub resync_interval: Duration,
    /// Zero disables the function monitor.
    pub function_monitor_interval: Duration,
    pub function_monitor_concurrency: usize,
    /// Upper bound of concurrent requests issued for the resources of one function.
    pub resource_concurrency: usize,
    pub cron_job_image: String,
    pub cron_job_image_pull_policy: String,
    pub platform: PlatformConfiguration,
    pub timings: ResourceTimings,
    pub rate_limiter: RateLimiterConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            namespace: None,
            image_pull_secrets: None,
            external_ip_addresses: vec![],
            function_operator_workers: 4,
            apigateway_operator_workers: 2,
            resync_interval: Duration::from_secs(300),
            function_monitor_interval: Duration::from_secs(180),
            function_monitor_concurrency: 10,
            resource_concurrency: 8,
            cron_job_image: "appropriate/curl:latest".to_string(),
            cron_job_image_pull_policy: "IfNotPresent".to_string(),
            platform: Default::default(),
            timings: Default::default(),
            rate_limiter: Default::default(),
        }
    }
}

impl Configuration {
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            timings: ResourceTimings::fast(),
            rate_limiter: RateLimiterConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                max_retries: 3,
            },
            ..Default::default()
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let namespace = env_var("WATCH_NAMESPACE").filter(|ns| ns != "*");
        match &namespace {
            Some(ns) => info!("Controller is only watching resources in namespace {}", ns),
            None => info!("Controller is watching resources in all namespaces"),
        }
        let external_ip_addresses = env_var("NUCLIO_CONTROLLER_EXTERNAL_IP_ADDRESSES")
            .map(|v| {
                v.split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let platform_config_path = env_var("NUCLIO_PLATFORM_CONFIG_PATH")
            .unwrap_or_else(|| PLATFORM_CONFIG_PATH.to_string());
        Ok(Self {
            namespace,
            image_pull_secrets: env_var("NUCLIO_CONTROLLER_IMAGE_PULL_SECRETS"),
            external_ip_addresses,
            function_operator_workers: env_parse(
                "NUCLIO_CONTROLLER_FUNCTION_OPERATOR_NUM_WORKERS",
                defaults.function_operator_workers,
            )?,
            apigateway_operator_workers: env_parse(
                "NUCLIO_CONTROLLER_APIGATEWAY_OPERATOR_NUM_WORKERS",
                defaults.apigateway_operator_workers,
            )?,
            resync_interval: env_seconds(
                "NUCLIO_CONTROLLER_RESYNC_INTERVAL",
                defaults.resync_interval.as_secs(),
            )?,
            function_monitor_interval: env_seconds(
                "NUCLIO_CONTROLLER_FUNCTION_MONITOR_INTERVAL",
                defaults.function_monitor_interval.as_secs(),
            )?,
            function_monitor_concurrency: defaults.function_monitor_concurrency,
            resource_concurrency: env_parse(
                "NUCLIO_CONTROLLER_RESOURCE_CONCURRENCY",
                defaults.resource_concurrency,
            )?
            .max(1),
            cron_job_image: env_var("NUCLIO_CONTROLLER_CRON_TRIGGER_CRON_JOB_IMAGE_NAME")
                .unwrap_or(defaults.cron_job_image),
            cron_job_image_pull_policy: env_var(
                "NUCLIO_CONTROLLER_CRON_TRIGGER_CRON_JOB_IMAGE_PULL_POLICY",
            )
            .unwrap_or(defaults.cron_job_image_pull_policy),
            platform: PlatformConfiguration::load(Path::new(&platform_config_path))?,
            timings: defaults.timings,
            rate_limiter: defaults.rate_limiter,
        })
    }

    /// Namespace argument for list calls, empty for all namespaces.
    pub fn list_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}
