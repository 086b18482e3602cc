use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("invalid argument for {operator}: {message}")]
    InvalidArgument { operator: String, message: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("stage {index} ({stage}) failed: {source}")]
    Stage {
        index: usize,
        stage: String,
        #[source]
        source: Box<Error>,
    },

    #[error("source error: {0}")]
    Source(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("no script host is configured")]
    ScriptUnavailable,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn argument(operator: &str, message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            operator: operator.to_string(),
            message: message.into(),
        }
    }

    /// Wrap an error with the index and name of the stage that raised it.
    /// Errors already carrying a stage location are left untouched.
    pub(crate) fn at_stage(self, index: usize, stage: &str) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                index,
                stage: stage.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Stable error code surfaced to scripted callers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidPipeline(_) => "cortex.invalidArgument.pipeline",
            Error::UnknownStage(_) => "cortex.invalidArgument.unknownStage",
            Error::UnknownOperator(_) => "cortex.invalidArgument.unknownOperator",
            Error::InvalidArgument { .. } => "cortex.invalidArgument.operator",
            Error::InvalidPath(_) => "cortex.invalidArgument.path",
            Error::Stage { source, .. } => source.code(),
            Error::Source(_) => "cortex.error.source",
            Error::Script(_) => "cortex.error.script",
            Error::ScriptUnavailable => "cortex.unsupportedOperation.script",
            Error::InvalidConfig(_) => "cortex.invalidArgument.config",
            Error::Json(_) => "cortex.invalidArgument.json",
        }
    }

    /// Index of the failing stage, when known.
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            Error::Stage { index, .. } => Some(*index),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
