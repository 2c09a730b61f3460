use k8s_openapi::{
    api::autoscaling::v2::{
        CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
        MetricIdentifier, MetricSpec, MetricTarget, PodsMetricSource, ResourceMetricSource,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use nuclio_controller_apis::GPU_RESOURCE_NAME;

use super::{
    FunctionContext,
    apply::{ApplyStrategy, Desired},
};
use crate::errors::ControllerError;

const DEFAULT_TARGET_CPU: i32 = 75;

/// Metrics which are compute resources of the pod rather than custom pod metrics.
const RESOURCE_METRICS: [&str; 5] = [
    "cpu",
    "memory",
    "ephemeral-storage",
    "storage",
    GPU_RESOURCE_NAME,
];

pub(crate) struct AutoscalerStrategy<'a> {
    ctx: &'a FunctionContext<'a>,
}

impl<'a> AutoscalerStrategy<'a> {
    pub(crate) fn new(ctx: &'a FunctionContext<'a>) -> Self {
        Self { ctx }
    }

    fn bounds(&self) -> (i32, i32) {
        let function = self.ctx.function;
        (
            function.computed_min_replicas().max(1),
            function.computed_max_replicas().max(1),
        )
    }

    fn metrics(&self) -> Vec<MetricSpec> {
        let spec = &self.ctx.function.spec;
        if let Some(custom) = spec
            .custom_scaling_metric_specs
            .as_ref()
            .filter(|m| !m.is_empty())
        {
            return custom.clone();
        }

        let auto_scale = &self.ctx.config.platform.auto_scale;
        if let (Some(name), Some(target)) = (
            auto_scale.metric_name.as_ref().filter(|n| !n.is_empty()),
            auto_scale.target_value.as_ref().filter(|t| !t.is_empty()),
        ) {
            let target = MetricTarget {
                type_: "AverageValue".to_string(),
                average_value: Some(Quantity(target.clone())),
                ..Default::default()
            };
            return if RESOURCE_METRICS.contains(&name.as_str()) {
                vec![MetricSpec {
                    type_: "Resource".to_string(),
                    resource: Some(ResourceMetricSource {
                        name: name.clone(),
                        target,
                    }),
                    ..Default::default()
                }]
            } else {
                vec![MetricSpec {
                    type_: "Pods".to_string(),
                    pods: Some(PodsMetricSource {
                        metric: MetricIdentifier {
                            name: name.clone(),
                            selector: None,
                        },
                        target,
                    }),
                    ..Default::default()
                }]
            };
        }

        vec![MetricSpec {
            type_: "Resource".to_string(),
            resource: Some(ResourceMetricSource {
                name: "cpu".to_string(),
                target: MetricTarget {
                    type_: "Utilization".to_string(),
                    average_utilization: Some(spec.target_cpu.unwrap_or(DEFAULT_TARGET_CPU)),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }]
    }

    fn spec(&self, min: i32, max: i32) -> HorizontalPodAutoscalerSpec {
        HorizontalPodAutoscalerSpec {
            min_replicas: Some(min),
            max_replicas: max,
            metrics: Some(self.metrics()),
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: self.ctx.resource_name.clone(),
            },
            behavior: None,
        }
    }
}

impl ApplyStrategy<HorizontalPodAutoscaler> for AutoscalerStrategy<'_> {
    fn name(&self) -> String {
        self.ctx.resource_name.clone()
    }

    fn build(&self) -> Result<Option<HorizontalPodAutoscaler>, ControllerError> {
        let (min, max) = self.bounds();
        if min == max {
            return Ok(None);
        }
        Ok(Some(HorizontalPodAutoscaler {
            metadata: self.ctx.object_meta(&self.ctx.resource_name),
            spec: Some(self.spec(min, max)),
            ..Default::default()
        }))
    }

    fn update(
        &self,
        existing: &HorizontalPodAutoscaler,
    ) -> Result<Desired<HorizontalPodAutoscaler>, ControllerError> {
        let (min, max) = self.bounds();
        if min == max {
            return Ok(Desired::Delete);
        }
        let mut desired = existing.clone();
        desired.metadata.labels = Some(self.ctx.labels.clone());
        let behavior = existing.spec.as_ref().and_then(|s| s.behavior.clone());
        desired.spec = Some(HorizontalPodAutoscalerSpec {
            behavior,
            ..self.spec(min, max)
        });
        Ok(Desired::Apply(desired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{configuration::Configuration, functionres::tests::function};

    fn metric(function: &nuclio_controller_apis::NuclioFunction, config: &Configuration) -> MetricSpec {
        let ctx = FunctionContext::new(function, config, None);
        let hpa = AutoscalerStrategy::new(&ctx).build().unwrap().unwrap();
        hpa.spec.unwrap().metrics.unwrap().remove(0)
    }

    #[test]
    fn not_created_for_fixed_replicas() {
        let config = Configuration::for_tests();
        let mut function = function("echo");
        function.spec.replicas = Some(2);
        let ctx = FunctionContext::new(&function, &config, None);
        let strategy = AutoscalerStrategy::new(&ctx);
        assert!(strategy.build().unwrap().is_none());
        assert!(matches!(
            strategy.update(&HorizontalPodAutoscaler::default()).unwrap(),
            Desired::Delete
        ));
    }

    #[test]
    fn metric_precedence() {
        let mut config = Configuration::for_tests();
        let mut function = function("echo");
        function.spec.min_replicas = Some(1);
        function.spec.max_replicas = Some(5);

        let cpu = metric(&function, &config);
        assert_eq!("Resource", cpu.type_);
        let resource = cpu.resource.unwrap();
        assert_eq!("cpu", resource.name);
        assert_eq!(Some(75), resource.target.average_utilization);

        config.platform.auto_scale.metric_name = Some("memory".to_string());
        config.platform.auto_scale.target_value = Some("512Mi".to_string());
        let memory = metric(&function, &config);
        assert_eq!("Resource", memory.type_);
        assert_eq!(
            Some(Quantity("512Mi".to_string())),
            memory.resource.unwrap().target.average_value
        );

        config.platform.auto_scale.metric_name = Some("nuclio_processor_inflight".to_string());
        let pods = metric(&function, &config);
        assert_eq!("Pods", pods.type_);
        assert_eq!("nuclio_processor_inflight", pods.pods.unwrap().metric.name);

        function.spec.custom_scaling_metric_specs = Some(vec![MetricSpec {
            type_: "External".to_string(),
            ..Default::default()
        }]);
        assert_eq!("External", metric(&function, &config).type_);
    }
}
