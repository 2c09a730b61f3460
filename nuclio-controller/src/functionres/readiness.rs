use std::collections::{HashMap, HashSet};

use futures::{StreamExt, TryStreamExt, stream};
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Event, Pod},
        networking::v1::Ingress,
    },
    chrono::{DateTime, Utc},
};
use kube::api::ListParams;
use nuclio_controller_apis::{FUNCTION_NAME_LABEL, NuclioFunction};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout_at};

use super::FunctionResources;
use crate::{
    cluster::ClusterClient,
    configuration::ResourceTimings,
    errors::{ExtKubeApiError, ReadinessFailure},
    utils::{function_resource_name, label_selector},
};

const CLUSTER_AUTOSCALER: &str = "cluster-autoscaler";
const TRIGGERED_SCALE_UP: &str = "TriggeredScaleUp";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadinessPhase {
    AwaitingInitContainers,
    AwaitingDeployment,
    AwaitingIngress,
    Available,
}

/// State of a single readiness wait.
struct ReadinessWait<'a, C> {
    cluster: &'a C,
    timings: &'a ResourceTimings,
    namespace: String,
    name: String,
    resource_name: String,
    /// Pods created before this instant belong to an earlier rollout.
    pods_since: DateTime<Utc>,
    fail_fast: bool,
    concurrency: usize,
    init_containers: usize,
    has_ingress: bool,
    phase: ReadinessPhase,
    deployment_ready_at: Option<Instant>,
    /// Start of the current cluster autoscaler grace period of each unschedulable pod.
    scale_up_grace: HashMap<String, Instant>,
}

fn is_crash_looping(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .filter_map(|s| s.state.as_ref().and_then(|s| s.waiting.as_ref()))
        .any(|w| w.reason.as_deref() == Some("CrashLoopBackOff"))
}

fn is_unschedulable(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Pending")
        && status.conditions.iter().flatten().any(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        })
}

fn is_from_cluster_autoscaler(event: &Event) -> bool {
    event.reporting_component.as_deref() == Some(CLUSTER_AUTOSCALER)
        || event
            .source
            .as_ref()
            .and_then(|s| s.component.as_deref())
            == Some(CLUSTER_AUTOSCALER)
}

impl<C: ClusterClient> ReadinessWait<'_, C> {
    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn pods(&self) -> Vec<Pod> {
        let params =
            ListParams::default().labels(&label_selector(&[(FUNCTION_NAME_LABEL, &self.name)]));
        match self.cluster.list::<Pod>(&self.namespace, &params).await {
            Ok(pods) => pods
                .into_iter()
                .filter(|p| {
                    p.metadata
                        .creation_timestamp
                        .as_ref()
                        .is_none_or(|t| t.0 >= self.pods_since)
                })
                .collect(),
            Err(e) => {
                debug!("failed to list pods of function {}: {}", self.describe(), e);
                vec![]
            }
        }
    }

    async fn deployment(&self) -> Option<Deployment> {
        match self
            .cluster
            .get::<Deployment>(&self.namespace, &self.resource_name)
            .await
        {
            Ok(deployment) => Some(deployment),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                debug!("failed to get deployment of function {}: {}", self.describe(), e);
                None
            }
        }
    }

    async fn init_containers_completed(&self) -> Result<bool, ReadinessFailure> {
        if self.init_containers == 0 {
            return Ok(true);
        }
        let Some(deployment) = self.deployment().await else {
            return Ok(false);
        };
        let expected = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1)
            .max(0) as usize;
        let pods = self.pods().await;
        if pods.len() < expected {
            return Ok(false);
        }
        let mut completed = true;
        for pod in &pods {
            let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
            let restart_never = pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref())
                == Some("Never");
            let statuses = pod
                .status
                .as_ref()
                .and_then(|s| s.init_container_statuses.clone())
                .unwrap_or_default();
            if statuses.len() < self.init_containers {
                completed = false;
            }
            for status in &statuses {
                match status.state.as_ref().and_then(|s| s.terminated.as_ref()) {
                    Some(terminated) if terminated.exit_code == 0 => {}
                    Some(terminated) if restart_never => {
                        return Err(ReadinessFailure::unhealthy(format!(
                            "init container {} of pod {} failed with exit code {}",
                            status.name, pod_name, terminated.exit_code
                        )));
                    }
                    _ => completed = false,
                }
            }
        }
        Ok(completed)
    }

    async fn deployment_ready(&self) -> bool {
        let Some(status) = self.deployment().await.and_then(|d| d.status) else {
            return false;
        };
        let available = status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == "Available" && c.status == "True");
        available && status.unavailable_replicas.unwrap_or(0) == 0
    }

    async fn ingress_ready(&self) -> bool {
        if !self.has_ingress {
            return true;
        }
        match self
            .cluster
            .get::<Ingress>(&self.namespace, &self.resource_name)
            .await
        {
            Ok(ingress) => ingress
                .status
                .and_then(|s| s.load_balancer)
                .and_then(|lb| lb.ingress)
                .unwrap_or_default()
                .iter()
                .any(|i| {
                    i.ip.as_deref().is_some_and(|ip| !ip.is_empty())
                        || i.hostname.as_deref().is_some_and(|h| !h.is_empty())
                }),
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                debug!("failed to get ingress of function {}: {}", self.describe(), e);
                false
            }
        }
    }

    /// Verdict of the cluster autoscaler on an unschedulable pod whose grace period passed.
    ///
    /// Returns the pod name if a scale up was triggered for it.
    async fn check_scale_up(&self, pod_name: String) -> Result<Option<String>, ReadinessFailure> {
        let params =
            ListParams::default().fields(&format!("involvedObject.name={}", pod_name));
        let events = match self.cluster.list::<Event>(&self.namespace, &params).await {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    "failed to list events of pod {}/{}: {}",
                    self.namespace, pod_name, e
                );
                return Ok(None);
            }
        };
        let verdict = events
            .iter()
            .filter(|e| e.involved_object.name.as_deref() == Some(pod_name.as_str()))
            .filter(|e| is_from_cluster_autoscaler(e))
            .max_by_key(|e| {
                e.last_timestamp
                    .as_ref()
                    .or(e.first_timestamp.as_ref())
                    .map(|t| t.0)
                    .or(e.metadata.creation_timestamp.as_ref().map(|t| t.0))
            })
            .and_then(|e| e.reason.clone());
        match verdict.as_deref() {
            Some(TRIGGERED_SCALE_UP) => {
                info!(
                    "cluster autoscaler is scaling up for pod {}/{} of function {}",
                    self.namespace,
                    pod_name,
                    self.describe()
                );
                Ok(Some(pod_name))
            }
            _ => Err(ReadinessFailure::unhealthy(format!(
                "pod {} of function {} is unschedulable",
                pod_name,
                self.describe()
            ))),
        }
    }

    /// Fail on pods which will not become ready.
    ///
    /// Unschedulable pods get a grace period for the cluster autoscaler, after which its
    /// verdict is checked. A triggered scale up starts another grace period.
    async fn fail_fast_on_pods(&mut self) -> Result<(), ReadinessFailure> {
        let pods = self.pods().await;
        let now = Instant::now();
        let mut unschedulable = HashSet::new();
        let mut due = vec![];
        for pod in &pods {
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            if is_crash_looping(pod) {
                return Err(ReadinessFailure::error(format!(
                    "pod {} of function {} is in CrashLoopBackOff",
                    pod_name,
                    self.describe()
                )));
            }
            if is_unschedulable(pod) {
                let started = *self.scale_up_grace.entry(pod_name.clone()).or_insert(now);
                if now.duration_since(started) >= self.timings.node_scale_up_grace {
                    due.push(pod_name.clone());
                }
                unschedulable.insert(pod_name);
            }
        }
        self.scale_up_grace
            .retain(|pod_name, _| unschedulable.contains(pod_name));
        if due.is_empty() {
            return Ok(());
        }
        let scaling_up: Vec<Option<String>> = stream::iter(due)
            .map(|pod_name| self.check_scale_up(pod_name))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        let now = Instant::now();
        for pod_name in scaling_up.into_iter().flatten() {
            self.scale_up_grace.insert(pod_name, now);
        }
        Ok(())
    }

    /// Whether the deployment and, if any, the ingress are ready.
    async fn ready(&self) -> bool {
        self.deployment_ready().await && self.ingress_ready().await
    }

    /// Advance through as many phases as possible.
    async fn probe(&mut self) -> Result<(), ReadinessFailure> {
        if self.phase == ReadinessPhase::AwaitingInitContainers {
            if !self.init_containers_completed().await? {
                return Ok(());
            }
            debug!("init containers of function {} completed", self.describe());
            self.phase = ReadinessPhase::AwaitingDeployment;
        }
        if self.phase == ReadinessPhase::AwaitingDeployment {
            if !self.deployment_ready().await {
                if self.fail_fast {
                    self.fail_fast_on_pods().await?;
                }
                return Ok(());
            }
            debug!("deployment of function {} is available", self.describe());
            self.deployment_ready_at = Some(Instant::now());
            self.phase = ReadinessPhase::AwaitingIngress;
        }
        if self.phase == ReadinessPhase::AwaitingIngress {
            if self.ingress_ready().await {
                self.phase = ReadinessPhase::Available;
            } else if self.fail_fast
                && self
                    .deployment_ready_at
                    .is_some_and(|at| at.elapsed() > self.timings.ingress_readiness_timeout)
            {
                return Err(ReadinessFailure::error(format!(
                    "ingress of function {} did not become ready within {:?}",
                    self.describe(),
                    self.timings.ingress_readiness_timeout
                )));
            }
        }
        Ok(())
    }

    /// Outcome once the deadline passed, which is a success only if everything became ready.
    async fn deadline_reached(&mut self) -> Result<(), ReadinessFailure> {
        if self.phase != ReadinessPhase::Available && self.ready().await {
            self.phase = ReadinessPhase::Available;
        }
        if self.phase == ReadinessPhase::Available {
            return Ok(());
        }
        Err(ReadinessFailure::unhealthy(format!(
            "timed out waiting for function {} to become available ({:?})",
            self.describe(),
            self.phase
        )))
    }
}

impl<C: ClusterClient> FunctionResources<C> {
    /// Wait until the function's deployment and ingress are available.
    ///
    /// Only pods created after `since` are considered. Fails early on pods that
    /// can never become ready, unless the function asks to wait for the full
    /// readiness timeout.
    pub(crate) async fn wait_available(
        &self,
        function: &NuclioFunction,
        since: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<(), ReadinessFailure> {
        let timings = &self.config.timings;
        let name = function.metadata.name.clone().unwrap_or_default();
        let pod_creation_slack = k8s_openapi::chrono::Duration::from_std(timings.pod_creation_slack)
            .unwrap_or_else(|_| k8s_openapi::chrono::Duration::zero());
        let init_containers = function
            .spec
            .init_containers
            .as_ref()
            .map(|c| c.len())
            .unwrap_or(0);
        let mut wait = ReadinessWait {
            cluster: self.cluster.as_ref(),
            timings,
            namespace: function.metadata.namespace.clone().unwrap_or_default(),
            resource_name: function_resource_name(&name),
            name,
            pods_since: since - pod_creation_slack,
            fail_fast: !function.spec.wait_readiness_timeout_before_failure,
            concurrency: self.config.resource_concurrency.max(1),
            init_containers,
            has_ingress: !function.spec.ingresses().is_empty(),
            phase: if init_containers > 0 {
                ReadinessPhase::AwaitingInitContainers
            } else {
                ReadinessPhase::AwaitingDeployment
            },
            deployment_ready_at: None,
            scale_up_grace: HashMap::new(),
        };
        info!("waiting for function {} to become available", wait.describe());

        let mut probe_interval = timings.probe_initial_interval;
        let mut next_probe = Instant::now();
        let mut fast_poll = interval(timings.fast_poll_interval);
        fast_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if wait.phase == ReadinessPhase::Available {
                info!("function {} is available", wait.describe());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return wait.deadline_reached().await;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = sleep_until(next_probe) => {
                    // a probe cut short by the deadline is judged by deadline_reached
                    if let Ok(Err(failure)) = timeout_at(deadline, wait.probe()).await {
                        return Err(failure);
                    }
                    probe_interval = (probe_interval * 2).min(timings.probe_max_interval);
                    next_probe = Instant::now() + probe_interval;
                }
                _ = fast_poll.tick() => {
                    // between probes, return as soon as everything is ready
                    if timeout_at(deadline, wait.ready()).await.unwrap_or(false) {
                        wait.phase = ReadinessPhase::Available;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::fake::FakeCluster,
        configuration::Configuration,
        functionres::tests::{function, http_trigger},
    };
    use k8s_openapi::api::{
        apps::v1::{DeploymentCondition, DeploymentStatus},
        core::v1::{
            ContainerState, ContainerStateWaiting, ContainerStatus, EventSource,
            ObjectReference, PodCondition, PodStatus,
        },
        networking::v1::{IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus},
    };
    use kube::api::ObjectMeta;
    use nuclio_controller_apis::FunctionState;
    use serde_json::json;
    use std::{sync::Arc, time::Duration};

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("ns".to_string()),
            labels: Some([(FUNCTION_NAME_LABEL.to_string(), "echo".to_string())].into()),
            ..Default::default()
        }
    }

    fn deployment(available: bool) -> Deployment {
        Deployment {
            metadata: meta("nuclio-echo"),
            status: Some(DeploymentStatus {
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: if available { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                unavailable_replicas: if available { None } else { Some(1) },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn crash_looping_pod() -> Pod {
        Pod {
            metadata: meta("nuclio-echo-abc"),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "nuclio".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("CrashLoopBackOff".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn unschedulable_pod() -> Pod {
        Pod {
            metadata: meta("nuclio-echo-xyz"),
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn autoscaler_event(reason: &str) -> Event {
        Event {
            metadata: meta("nuclio-echo-xyz.1"),
            involved_object: ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some("nuclio-echo-xyz".to_string()),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            source: Some(EventSource {
                component: Some("cluster-autoscaler".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn resources(fake: &Arc<FakeCluster>) -> FunctionResources<FakeCluster> {
        FunctionResources::new(fake.clone(), Arc::new(Configuration::for_tests()))
    }

    async fn wait(
        fake: &Arc<FakeCluster>,
        function: &NuclioFunction,
        timeout: Duration,
    ) -> (Result<(), ReadinessFailure>, Duration) {
        let started = Instant::now();
        let result = resources(fake)
            .wait_available(function, Utc::now(), started + timeout)
            .await;
        (result, started.elapsed())
    }

    #[tokio::test]
    async fn available_deployment() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert(deployment(true));
        let (result, elapsed) = wait(&fake, &function("echo"), Duration::from_secs(5)).await;
        assert!(result.is_ok());
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn deadline_without_fail_fast_reason() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert(deployment(false));
        let (result, elapsed) = wait(&fake, &function("echo"), Duration::from_millis(100)).await;
        let failure = result.unwrap_err();
        assert_eq!(FunctionState::Unhealthy, failure.state);
        assert!(failure.error.to_string().contains("timed out"));
        assert!(elapsed >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn crash_loop_fails_fast() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert(deployment(false));
        fake.insert(crash_looping_pod());
        let (result, elapsed) = wait(&fake, &function("echo"), Duration::from_secs(5)).await;
        let failure = result.unwrap_err();
        assert_eq!(FunctionState::Error, failure.state);
        assert!(failure.error.to_string().contains("CrashLoopBackOff"));
        assert!(elapsed < Duration::from_secs(1));

        // unless the function asks to wait for the whole timeout
        let mut patient = function("echo");
        patient.spec.wait_readiness_timeout_before_failure = true;
        let (result, _) = wait(&fake, &patient, Duration::from_millis(100)).await;
        assert_eq!(FunctionState::Unhealthy, result.unwrap_err().state);
    }

    #[tokio::test]
    async fn triggered_scale_up_keeps_waiting() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert(deployment(false));
        fake.insert(unschedulable_pod());
        fake.insert(autoscaler_event("TriggeredScaleUp"));
        let (result, elapsed) = wait(&fake, &function("echo"), Duration::from_millis(500)).await;
        let failure = result.unwrap_err();
        assert_eq!(FunctionState::Unhealthy, failure.state);
        assert!(failure.error.to_string().contains("timed out"));
        assert!(elapsed >= Duration::from_millis(500));
        // the verdict is checked again after every grace period
        let event_lists = fake
            .calls()
            .into_iter()
            .filter(|c| c == "list Event ns")
            .count();
        assert!(event_lists >= 2, "{} event lists", event_lists);
    }

    #[tokio::test]
    async fn scale_up_verdict_is_rechecked() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert(deployment(false));
        fake.insert(unschedulable_pod());
        fake.insert(autoscaler_event("TriggeredScaleUp"));
        let flip = {
            let fake = fake.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                fake.mutate::<Event>("ns", "nuclio-echo-xyz.1", |event| {
                    event.reason = Some("NotTriggerScaleUp".to_string());
                });
            })
        };
        let (result, elapsed) = wait(&fake, &function("echo"), Duration::from_secs(3)).await;
        flip.await.unwrap();
        let failure = result.unwrap_err();
        assert_eq!(FunctionState::Unhealthy, failure.state);
        assert!(failure.error.to_string().contains("is unschedulable"));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn late_availability_is_noticed_between_probes() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert(deployment(false));
        let mut config = Configuration::for_tests();
        config.timings.probe_initial_interval = Duration::from_secs(2);
        config.timings.probe_max_interval = Duration::from_secs(2);
        config.timings.fast_poll_interval = Duration::from_millis(50);
        let resources = FunctionResources::new(fake.clone(), Arc::new(config));
        let flip = {
            let fake = fake.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                fake.mutate::<Deployment>("ns", "nuclio-echo", |d| *d = deployment(true));
            })
        };
        let started = Instant::now();
        let result = resources
            .wait_available(&function("echo"), Utc::now(), started + Duration::from_secs(5))
            .await;
        flip.await.unwrap();
        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn scale_up_checks_are_bounded() {
        let fake = Arc::new(FakeCluster::new());
        fake.insert(deployment(false));
        for i in 0..4 {
            let pod_name = format!("nuclio-echo-{}", i);
            let mut pod = unschedulable_pod();
            pod.metadata.name = Some(pod_name.clone());
            fake.insert(pod);
            let mut event = autoscaler_event("TriggeredScaleUp");
            event.metadata.name = Some(format!("{}.1", pod_name));
            event.involved_object.name = Some(pod_name);
            fake.insert(event);
        }
        fake.delay::<Event>("list", Duration::from_millis(100));
        let issued = Arc::new(std::sync::Mutex::new(vec![]));
        let observed = issued.clone();
        fake.on_call::<Event>("list", move |_| observed.lock().unwrap().push(Instant::now()));
        let mut config = Configuration::for_tests();
        config.resource_concurrency = 2;
        let resources = FunctionResources::new(fake.clone(), Arc::new(config));
        let started = Instant::now();
        let result = resources
            .wait_available(&function("echo"), Utc::now(), started + Duration::from_millis(600))
            .await;
        assert!(result.unwrap_err().error.to_string().contains("timed out"));
        let issued = issued.lock().unwrap();
        assert!(issued.len() >= 4, "{} event lists", issued.len());
        // the third check waits for one of the first two
        assert!(issued[2].duration_since(issued[0]) >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn ingress_must_follow_deployment() {
        let fake = Arc::new(FakeCluster::new());
        let mut function = function("echo");
        function.spec.triggers.insert(
            "http".to_string(),
            http_trigger(json!({"ingresses": {"0": {"host": "echo.example.com"}}})),
        );
        fake.insert(deployment(true));
        fake.insert(Ingress {
            metadata: meta("nuclio-echo"),
            ..Default::default()
        });
        let (result, elapsed) = wait(&fake, &function, Duration::from_secs(5)).await;
        let failure = result.unwrap_err();
        assert_eq!(FunctionState::Error, failure.state);
        assert!(elapsed >= Duration::from_millis(100));

        fake.mutate::<Ingress>("ns", "nuclio-echo", |ingress| {
            ingress.status = Some(IngressStatus {
                load_balancer: Some(IngressLoadBalancerStatus {
                    ingress: Some(vec![IngressLoadBalancerIngress {
                        ip: Some("10.0.0.1".to_string()),
                        ..Default::default()
                    }]),
                }),
            });
        });
        let (result, _) = wait(&fake, &function, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }
}
