use std::sync::Arc;

use nuclio_controller_apis::{NuclioAPIGateway, NuclioFunction};

use crate::{
    apigateway_operator::APIGatewayOperator,
    cluster::ClusterClient,
    configuration::Configuration,
    function_monitor::FunctionMonitor,
    function_operator::FunctionOperator,
    workqueue::{ListWatcher, WorkQueueReconciler},
};

/// Runs the function and API gateway operators together with the function monitor.
pub(crate) struct NuclioController<C> {
    cluster: Arc<C>,
    config: Arc<Configuration>,
}

impl<C: ClusterClient> NuclioController<C> {
    pub fn new(cluster: Arc<C>, config: Arc<Configuration>) -> Self {
        Self { cluster, config }
    }

    /// Run until one of the operators stops, dropping the future stops all of them.
    pub async fn start<F, G>(self, function_watcher: F, gateway_watcher: G)
    where
        F: ListWatcher<NuclioFunction>,
        G: ListWatcher<NuclioAPIGateway>,
    {
        let config = self.config.as_ref();
        let function_operator = WorkQueueReconciler::new(
            "function_operator",
            Arc::new(FunctionOperator::new(self.cluster.clone(), self.config.clone())),
            config.function_operator_workers,
            config.resync_interval,
            config.rate_limiter.clone(),
        );
        let apigateway_operator = WorkQueueReconciler::new(
            "apigateway_operator",
            Arc::new(APIGatewayOperator::new(self.cluster.clone(), self.config.clone())),
            config.apigateway_operator_workers,
            config.resync_interval,
            config.rate_limiter.clone(),
        );
        let monitor = FunctionMonitor::new(self.cluster.clone(), self.config.clone());
        info!("starting controller");
        tokio::select! {
            _ = function_operator.run(function_watcher) => (),
            _ = apigateway_operator.run(gateway_watcher) => (),
            _ = monitor.run() => (),
        }
        info!("controller stopped");
    }
}
