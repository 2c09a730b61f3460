use std::collections::BTreeMap;

use k8s_openapi::api::{
    batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec},
    core::v1::{Container, PodSpec, PodTemplateSpec},
};
use kube::api::ObjectMeta;
use nuclio_controller_apis::{DEFAULT_HTTP_PORT, FUNCTION_NAME_LABEL, Trigger};
use serde_json::Value;

use super::{
    FunctionContext,
    apply::{ApplyStrategy, Desired},
};
use crate::{
    errors::ControllerError,
    utils::{cron_job_name, label_selector, title_case},
};

pub(crate) const COMPONENT_LABEL: &str = "nuclio.io/component";
pub(crate) const CRON_TRIGGER_COMPONENT: &str = "cron-trigger";
pub(crate) const CRON_TRIGGER_NAME_LABEL: &str = "nuclio.io/function-cron-trigger-name";
const CRON_JOB_POD_LABEL: &str = "nuclio.io/function-cron-job-pod";
const CONTAINER_NAME: &str = "function-invocator";
const EVENT_BODY_PATH: &str = "/tmp/eventbody.out";
const DEFAULT_JOB_BACKOFF_LIMIT: i32 = 2;

/// Selector of all cron jobs created for a function.
pub(crate) fn cron_jobs_selector(function_name: &str) -> String {
    label_selector(&[
        (COMPONENT_LABEL, CRON_TRIGGER_COMPONENT),
        (FUNCTION_NAME_LABEL, function_name),
    ])
}

/// Kubernetes cron schedule of a trigger, `interval` becomes an `@every` schedule
/// and a leading seconds field is dropped.
fn schedule(trigger_name: &str, trigger: &Trigger) -> Result<String, ControllerError> {
    if let Some(schedule) = trigger.attribute_str("schedule").filter(|s| !s.trim().is_empty()) {
        if schedule.trim().starts_with('@') {
            return Ok(schedule.trim().to_string());
        }
        let fields: Vec<&str> = schedule.split_whitespace().collect();
        return match fields.len() {
            5 => Ok(fields.join(" ")),
            6 => Ok(fields[1..].join(" ")),
            _ => Err(ControllerError::Validation(format!(
                "unexpected schedule '{}' of cron trigger {}",
                schedule, trigger_name
            ))),
        };
    }
    if let Some(interval) = trigger.attribute_str("interval").filter(|s| !s.trim().is_empty()) {
        return Ok(format!("@every {}", interval.trim()));
    }
    Err(ControllerError::Validation(format!(
        "cron trigger {} must define either a schedule or an interval",
        trigger_name
    )))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Quote for `/bin/sh`, wrapping in single quotes.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// The shell command invoking the function over HTTP.
fn invocation_command(ctx: &FunctionContext, trigger: &Trigger) -> Result<String, ControllerError> {
    let event = trigger.attributes.get("event");
    let mut headers = String::new();
    if let Some(event_headers) = event.and_then(|e| e.get("headers")).and_then(|h| h.as_object()) {
        for (name, value) in event_headers {
            headers.push_str(&format!(
                " --header \"{}: {}\"",
                name,
                value_to_string(value)
            ));
        }
    }
    headers.push_str(" --header \"x-nuclio-invoke-trigger: cron\"");
    let curl = format!(
        "curl --silent{} {}:{} --retry 10 --retry-delay 1 --retry-max-time 10 --retry-connrefused",
        headers, ctx.resource_name, DEFAULT_HTTP_PORT
    );

    let body = match event.and_then(|e| e.get("body")) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(body)) => match serde_json::from_str::<Value>(body) {
            Ok(json) => serde_json::to_string(&json)?,
            Err(_) => body.clone(),
        },
        Some(other) => serde_json::to_string(other)?,
    };
    if body.is_empty() {
        return Ok(curl);
    }
    Ok(format!(
        "echo {} > {} && {} --data '@{}'",
        shell_quote(&body),
        EVENT_BODY_PATH,
        curl,
        EVENT_BODY_PATH
    ))
}

fn job_backoff_limit(trigger: &Trigger) -> i32 {
    trigger
        .attributes
        .get("jobBackoffLimit")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .map(|v| v as i32)
        .unwrap_or(DEFAULT_JOB_BACKOFF_LIMIT)
}

/// The cron job of a single cron trigger.
pub(crate) struct CronJobStrategy {
    job: CronJob,
}

impl CronJobStrategy {
    pub(crate) fn new(
        ctx: &FunctionContext,
        trigger_name: &str,
        trigger: &Trigger,
    ) -> Result<Self, ControllerError> {
        let mut labels = ctx.labels.clone();
        labels.insert(COMPONENT_LABEL.to_string(), CRON_TRIGGER_COMPONENT.to_string());
        labels.insert(CRON_TRIGGER_NAME_LABEL.to_string(), trigger_name.to_string());
        let concurrency_policy = trigger
            .attribute_str("concurrencyPolicy")
            .filter(|p| !p.is_empty())
            .map(title_case)
            .unwrap_or_else(|| "Forbid".to_string());
        let config = ctx.config;

        let pod_spec = PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(config.cron_job_image.clone()),
                image_pull_policy: Some(config.cron_job_image_pull_policy.clone()),
                args: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    invocation_command(ctx, trigger)?,
                ]),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        };
        let job = CronJob {
            metadata: ObjectMeta {
                labels: Some(labels),
                ..ctx.object_meta(&cron_job_name(&ctx.name, trigger_name))
            },
            spec: Some(CronJobSpec {
                schedule: schedule(trigger_name, trigger)?,
                concurrency_policy: Some(concurrency_policy),
                successful_jobs_history_limit: Some(1),
                failed_jobs_history_limit: Some(1),
                suspend: Some(ctx.function.spec.disable || trigger.disabled),
                job_template: JobTemplateSpec {
                    metadata: None,
                    spec: Some(JobSpec {
                        backoff_limit: Some(job_backoff_limit(trigger)),
                        template: PodTemplateSpec {
                            metadata: Some(ObjectMeta {
                                labels: Some(BTreeMap::from([(
                                    CRON_JOB_POD_LABEL.to_string(),
                                    "true".to_string(),
                                )])),
                                ..Default::default()
                            }),
                            spec: Some(pod_spec),
                        },
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        Ok(Self { job })
    }
}

impl ApplyStrategy<CronJob> for CronJobStrategy {
    fn name(&self) -> String {
        self.job.metadata.name.clone().unwrap_or_default()
    }

    fn build(&self) -> Result<Option<CronJob>, ControllerError> {
        Ok(Some(self.job.clone()))
    }

    fn update(&self, existing: &CronJob) -> Result<Desired<CronJob>, ControllerError> {
        let mut desired = existing.clone();
        desired.metadata.labels = self.job.metadata.labels.clone();
        desired.spec = self.job.spec.clone();
        Ok(Desired::Apply(desired))
    }
}
