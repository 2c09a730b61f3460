use kube::CustomResourceExt;
use nuclio_controller_apis::{NuclioAPIGateway, NuclioFunction, NuclioFunctionEvent};
use serde_yaml;

pub fn main() {
    for crd in [
        NuclioFunction::crd(),
        NuclioAPIGateway::crd(),
        NuclioFunctionEvent::crd(),
    ] {
        println!("---\n{}", serde_yaml::to_string(&crd).unwrap());
    }
}
