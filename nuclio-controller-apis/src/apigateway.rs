use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Upstream kind routing to a [`crate::NuclioFunction`].
pub const UPSTREAM_KIND_NUCLIO_FUNCTION: &str = "nucliofunction";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum APIGatewayState {
    #[serde(rename = "")]
    None,
    #[serde(rename = "waitingForProvisioning")]
    WaitingForProvisioning,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "error")]
    Error,
}

impl Default for APIGatewayState {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum AuthenticationMode {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "basicAuth")]
    BasicAuth,
    #[serde(rename = "accessKey")]
    AccessKey,
    #[serde(rename = "oauth2")]
    OAuth2,
}

impl Default for AuthenticationMode {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DexAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2_proxy_url: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub redirect_unauthorized_to_sign_in: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct APIGatewayAuthenticationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dex_auth: Option<DexAuth>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct NuclioFunctionRef {
    pub name: String,
}

/// A traffic target of an API gateway.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct APIGatewayUpstreamSpec {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nucliofunction: Option<NuclioFunctionRef>,
    /// Share of traffic routed to this upstream, set on the canary upstream only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_annotations: BTreeMap<String, String>,
}

impl APIGatewayUpstreamSpec {
    pub fn function_name(&self) -> Option<&str> {
        self.nucliofunction
            .as_ref()
            .map(|f| f.name.as_str())
            .filter(|n| !n.is_empty())
    }

    pub fn percentage(&self) -> i32 {
        self.percentage.unwrap_or(0)
    }
}

/// HTTP entry point routing a host and path to one or two functions.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "nuclio.io",
    version = "v1beta1",
    kind = "NuclioAPIGateway",
    derive = "PartialEq",
    derive = "Default",
    status = "NuclioAPIGatewayStatus",
    shortname = "nuapigw",
    namespaced,
    printcolumn = r#"{
        "name":"State",
        "type": "string",
        "jsonPath": ".status.state",
        "description": "The provisioning state of the API gateway."
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct NuclioAPIGatewaySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub authentication_mode: AuthenticationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<APIGatewayAuthenticationSpec>,
    #[serde(default)]
    pub upstreams: Vec<APIGatewayUpstreamSpec>,
    /// Overrides the platform wide SSL redirect default.
    #[serde(
        default,
        rename = "enableSSLRedirect",
        skip_serializing_if = "Option::is_none"
    )]
    pub enable_ssl_redirect: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NuclioAPIGatewayStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub state: APIGatewayState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl NuclioAPIGateway {
    pub fn id(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or(""),
            self.metadata.name.as_deref().unwrap_or(""),
        )
    }

    pub fn state(&self) -> APIGatewayState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Names of all functions referenced by the upstreams.
    pub fn function_names(&self) -> Vec<&str> {
        self.spec
            .upstreams
            .iter()
            .filter_map(|u| u.function_name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serialization() {
        assert_eq!(r#""""#, serde_json::to_string(&APIGatewayState::None).unwrap());
        assert_eq!(
            APIGatewayState::WaitingForProvisioning,
            serde_json::from_str(r#""waitingForProvisioning""#).unwrap()
        );
        let status: NuclioAPIGatewayStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(APIGatewayState::None, status.state);
    }

    #[test]
    fn spec_deserialization() {
        let spec: NuclioAPIGatewaySpec = serde_json::from_str(
            r#"{
                "host": "gw.example.com",
                "authenticationMode": "basicAuth",
                "authentication": {"basicAuth": {"username": "u", "password": "p"}},
                "upstreams": [
                    {"kind": "nucliofunction", "nucliofunction": {"name": "a"}},
                    {"kind": "nucliofunction", "nucliofunction": {"name": "b"}, "percentage": 30}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(AuthenticationMode::BasicAuth, spec.authentication_mode);
        assert_eq!(0, spec.upstreams[0].percentage());
        assert_eq!(30, spec.upstreams[1].percentage());
        let gw = NuclioAPIGateway::new("gw", spec);
        assert_eq!(vec!["a", "b"], gw.function_names());
        assert_eq!(APIGatewayState::None, gw.state());
    }
}
