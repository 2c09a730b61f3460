use std::collections::BTreeMap;

use k8s_openapi::chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

pub(crate) fn metric_name(name: &str) -> String {
    format!("nuclio_controller_{}", name)
}

/// Name shared by the deployment, service, config map, autoscaler and ingress of a function.
pub(crate) fn function_resource_name(function_name: &str) -> String {
    format!("nuclio-{}", function_name)
}

pub(crate) fn cron_job_name(function_name: &str, trigger_name: &str) -> String {
    let raw = format!("nuclio-{}-{}", function_name, trigger_name).to_lowercase();
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    // cron jobs append an 11 character suffix to the jobs they spawn
    name.truncate(52);
    name.trim_end_matches('-').to_string()
}

pub(crate) fn apigateway_ingress_name(gateway_name: &str, canary: bool) -> String {
    if canary {
        format!("nuclio-agw-{}-canary", gateway_name)
    } else {
        format!("nuclio-agw-{}", gateway_name)
    }
}

pub(crate) fn basic_auth_secret_name(gateway_name: &str) -> String {
    format!("{}-basic-auth", gateway_name)
}

pub(crate) fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

pub(crate) fn split_key(key: &str) -> (String, String) {
    match key.split_once('/') {
        Some((ns, name)) => (ns.to_string(), name.to_string()),
        None => (String::new(), key.to_string()),
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Validate a Kubernetes qualified name, e.g. `my-function` or `example.com/my-function`.
pub(crate) fn validate_qualified_name(value: &str) -> Result<(), String> {
    let (prefix, name) = match value.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, value),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 || !is_dns_subdomain(prefix) {
            return Err(format!(
                "prefix part of '{}' must be a DNS subdomain",
                value
            ));
        }
    }
    if name.is_empty() {
        return Err(format!("name part of '{}' must be non-empty", value));
    }
    if name.len() > 63 {
        return Err(format!(
            "name part of '{}' must be no more than 63 characters",
            value
        ));
    }
    let bytes = name.as_bytes();
    let alnum = |c: u8| c.is_ascii_alphanumeric();
    let valid = alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes
            .iter()
            .all(|&c| alnum(c) || c == b'-' || c == b'_' || c == b'.');
    if !valid {
        return Err(format!(
            "name part of '{}' must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character",
            value
        ));
    }
    Ok(())
}

fn is_dns_subdomain(value: &str) -> bool {
    value.split('.').all(|label| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= 63
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes
                .iter()
                .all(|&c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-')
    })
}

/// Render a label selector in the `k=v,...` form accepted by list calls.
pub(crate) fn label_selector(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<String>>()
        .join(",")
}

/// Whether all `selector` entries are present in `labels`.
pub(crate) fn labels_match(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Insert entries of `defaults` which are not yet present in `target`.
pub(crate) fn fill_missing(target: &mut BTreeMap<String, String>, defaults: &BTreeMap<String, String>) {
    for (k, v) in defaults {
        target.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Structurally merge `overlay` into `target`, keeping values already set in `target`.
pub(crate) fn merge_missing(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (k, v) in overlay {
                match target.get_mut(k) {
                    Some(existing) if !existing.is_null() => merge_missing(existing, v),
                    _ => {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (target, overlay) => {
            if target.is_null() {
                *target = overlay.clone();
            }
        }
    }
}

/// Title case a single word, e.g. `forbid` becomes `Forbid`.
pub(crate) fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}
