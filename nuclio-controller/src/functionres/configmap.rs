use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use nuclio_controller_apis::NuclioFunctionSpec;
use serde::Serialize;

use super::{
    FunctionContext,
    apply::{ApplyStrategy, Desired},
};
use crate::errors::ControllerError;

pub(crate) const PROCESSOR_CONFIG_KEY: &str = "processor.yaml";

#[derive(Serialize)]
struct ProcessorMetadata<'a> {
    name: &'a str,
    namespace: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ProcessorConfiguration<'a> {
    metadata: ProcessorMetadata<'a>,
    spec: &'a NuclioFunctionSpec,
}

/// The processor configuration read by the function pods on startup.
pub(crate) fn processor_configuration(ctx: &FunctionContext) -> Result<String, ControllerError> {
    let configuration = ProcessorConfiguration {
        metadata: ProcessorMetadata {
            name: &ctx.name,
            namespace: &ctx.namespace,
            labels: &ctx.labels,
            annotations: ctx.annotations(),
        },
        spec: &ctx.function.spec,
    };
    Ok(serde_yaml::to_string(&configuration)?)
}

pub(crate) struct ConfigMapStrategy<'a> {
    ctx: &'a FunctionContext<'a>,
}

impl<'a> ConfigMapStrategy<'a> {
    pub(crate) fn new(ctx: &'a FunctionContext<'a>) -> Self {
        Self { ctx }
    }

    fn data(&self) -> Result<BTreeMap<String, String>, ControllerError> {
        Ok(BTreeMap::from([(
            PROCESSOR_CONFIG_KEY.to_string(),
            processor_configuration(self.ctx)?,
        )]))
    }
}

impl ApplyStrategy<ConfigMap> for ConfigMapStrategy<'_> {
    fn name(&self) -> String {
        self.ctx.resource_name.clone()
    }

    fn build(&self) -> Result<Option<ConfigMap>, ControllerError> {
        Ok(Some(ConfigMap {
            metadata: self.ctx.object_meta(&self.ctx.resource_name),
            data: Some(self.data()?),
            ..Default::default()
        }))
    }

    fn update(&self, existing: &ConfigMap) -> Result<Desired<ConfigMap>, ControllerError> {
        let mut desired = existing.clone();
        desired.metadata.labels = Some(self.ctx.labels.clone());
        desired.data = Some(self.data()?);
        Ok(Desired::Apply(desired))
    }
}
