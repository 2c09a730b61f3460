#[macro_use]
extern crate log;

use std::{net::SocketAddr, sync::Arc};

use kube::{Api, Client};
use nuclio_controller_apis::{NuclioAPIGateway, NuclioFunction};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus_exporter::start_prometheus_metrics_server;

mod apigateway_operator;
mod apigatewayres;
mod cluster;
mod configuration;
mod controller;
mod errors;
mod function_monitor;
mod function_operator;
mod functionres;
mod ingress;
mod prometheus_exporter;
mod status;
mod utils;
mod workqueue;

use cluster::KubeCluster;
use configuration::{Configuration, env_var};
use controller::NuclioController;

/// The K8s field manager name.
const MANAGER: &'static str = "nuclio-controller";

fn namespaced_or_all<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a rustls crypto provider was already installed");
    }
    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr: SocketAddr = format!("{}:{}", metrics_addr, metrics_port).parse()?;

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    global::set_meter_provider(SdkMeterProvider::builder().with_reader(exporter).build());
    let metrics_server = start_prometheus_metrics_server(metrics_addr, registry);

    let configuration = Arc::new(Configuration::from_env()?);
    let client = Client::try_default().await?;
    let namespace = configuration.namespace.as_deref();
    let functions: Api<NuclioFunction> = namespaced_or_all(&client, namespace);
    let gateways: Api<NuclioAPIGateway> = namespaced_or_all(&client, namespace);
    let controller = NuclioController::new(Arc::new(KubeCluster::new(client)), configuration);
    info!("start controllers ...");
    tokio::select! {
        _ = controller.start(functions, gateways) => (),
        result = metrics_server => result?,
    };
    Ok(())
}
