use nuclio_controller_apis::FunctionState;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_already_exists(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }

    fn is_already_exists(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => true,
            _ => false,
        }
    }
}

impl ExtKubeApiError for ControllerError {
    fn is_not_found(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_not_found(),
            ControllerError::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            ControllerError::Context { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    fn is_already_exists(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_already_exists(),
            ControllerError::Context { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// YAML serialization errors
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Invalid function or API gateway specification, retrying will not help.
    #[error("{0}")]
    Validation(String),
    /// A wait or update exceeded its deadline.
    #[error("{0}")]
    Timeout(String),
    /// The function's resources exist, but did not become healthy.
    #[error("{0}")]
    Unhealthy(String),
    /// A reconcile panicked.
    #[error("panic: {0}")]
    Panic(String),
    /// An error with additional context, forming a chain of causes.
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<ControllerError>,
    },
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::Validation(_) | ControllerError::Panic(_) => false,
            ControllerError::Context { source, .. } => source.is_temporary(),
            _ => true,
        }
    }

    pub(crate) fn context(self, context: impl Into<String>) -> Self {
        ControllerError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Render the chain of causes, outermost first, limited to `depth` entries.
    pub(crate) fn trace(&self, depth: usize) -> String {
        let mut lines: Vec<String> = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(e) = current {
            if lines.len() >= depth {
                break;
            }
            lines.push(e.to_string());
            current = e.source();
        }
        lines.join("\n")
    }
}

/// Failure of the readiness wait, carrying the state the function ends up in.
#[derive(Debug)]
pub(crate) struct ReadinessFailure {
    pub error: ControllerError,
    pub state: FunctionState,
}

impl ReadinessFailure {
    pub(crate) fn new(error: ControllerError, state: FunctionState) -> Self {
        Self { error, state }
    }

    pub(crate) fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(
            ControllerError::Unhealthy(message.into()),
            FunctionState::Unhealthy,
        )
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self::new(
            ControllerError::Unhealthy(message.into()),
            FunctionState::Error,
        )
    }
}

pub(crate) trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, ControllerError>;
}

impl<T, E: Into<ControllerError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, ControllerError> {
        self.map_err(|e| e.into().context(context))
    }
}
