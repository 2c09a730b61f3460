use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use nuclio_controller_apis::{
    APIGatewayState, DEFAULT_PROJECT_NAME, NuclioAPIGateway, PROJECT_NAME_LABEL,
};

use crate::{
    apigatewayres::APIGatewayResources,
    cluster::ClusterClient,
    configuration::Configuration,
    errors::{ControllerError, ResultExt},
    status::StatusModifications,
    utils::validate_qualified_name,
    workqueue::ChangeHandler,
};

/// Provisions the ingresses of API gateways waiting for provisioning.
pub(crate) struct APIGatewayOperator<C> {
    cluster: Arc<C>,
    resources: APIGatewayResources<C>,
}

impl<C: ClusterClient> APIGatewayOperator<C> {
    pub(crate) fn new(cluster: Arc<C>, config: Arc<Configuration>) -> Self {
        Self {
            resources: APIGatewayResources::new(cluster.clone(), config),
            cluster,
        }
    }

    async fn provision(
        &self,
        gateway: &mut StatusModifications<NuclioAPIGateway>,
    ) -> Result<(), ControllerError> {
        validate_qualified_name(&gateway.name_any()).map_err(ControllerError::Validation)?;
        self.resources.create_or_update(gateway).await?;
        Ok(())
    }

    async fn write_error(
        &self,
        gateway: &mut StatusModifications<NuclioAPIGateway>,
        error: &ControllerError,
    ) {
        let status = gateway.status.get_or_insert_with(Default::default);
        status.state = APIGatewayState::Error;
        status.last_error = Some(error.trace(10));
        if let Err(e) = gateway.replace_status(self.cluster.as_ref()).await {
            warn!(
                "failed to write error status of api gateway {}: {}",
                gateway.id(),
                e
            );
        }
    }
}

#[async_trait]
impl<C: ClusterClient> ChangeHandler<NuclioAPIGateway> for APIGatewayOperator<C> {
    async fn create_or_update(&self, object: Arc<NuclioAPIGateway>) -> Result<(), ControllerError> {
        let state = object.state();
        if !matches!(
            state,
            APIGatewayState::None | APIGatewayState::WaitingForProvisioning
        ) {
            debug!(
                "api gateway {} is in state {:?}, nothing to do",
                object.id(),
                state
            );
            return Ok(());
        }
        info!("provisioning api gateway {}", object.id());

        let mut gateway = StatusModifications::new(object.as_ref().clone());
        let project = gateway
            .labels()
            .get(PROJECT_NAME_LABEL)
            .filter(|p| !p.is_empty())
            .is_some();
        if !project {
            gateway
                .labels_mut()
                .insert(PROJECT_NAME_LABEL.to_string(), DEFAULT_PROJECT_NAME.to_string());
        }
        let description = gateway.spec.description.clone();
        gateway.status.get_or_insert_with(Default::default).description = description;

        if let Err(e) = self.provision(&mut gateway).await {
            error!("failed to provision api gateway {}: {}", gateway.id(), e);
            self.write_error(&mut gateway, &e).await;
            return Err(e.context(format!("failed to provision api gateway {}", gateway.id())));
        }

        self.resources.wait_available().await;
        let status = gateway.status.get_or_insert_with(Default::default);
        status.state = APIGatewayState::Ready;
        status.last_error = None;
        gateway
            .replace_status(self.cluster.as_ref())
            .await
            .context(format!("failed to update status of api gateway {}", object.id()))?;
        info!("api gateway {} is ready", object.id());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        info!("deleting api gateway {}/{}", namespace, name);
        self.resources.delete(namespace, name).await;
        Ok(())
    }
}
