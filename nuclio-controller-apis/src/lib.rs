mod apigateway;
mod function;
mod functionevent;

pub use apigateway::*;
pub use function::*;
pub use functionevent::*;

pub const API_GROUP: &str = "nuclio.io";

/// Port every function processor listens on for HTTP invocations.
pub const DEFAULT_HTTP_PORT: i32 = 8080;

/// Port of the processor's prometheus pull endpoint.
pub const DEFAULT_METRICS_PORT: i32 = 8090;

pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

pub const SKIP_DEPLOY_ANNOTATION: &str = "skip-deploy";

pub const PREVIOUS_STATE_ANNOTATION: &str = "nuclio.io/previous-state";

pub const FUNCTION_NAME_LABEL: &str = "nuclio.io/function-name";

pub const FUNCTION_VERSION_LABEL: &str = "nuclio.io/function-version";

pub const PROJECT_NAME_LABEL: &str = "nuclio.io/project-name";

pub const DEFAULT_PROJECT_NAME: &str = "default";
