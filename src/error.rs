use thiserror::Error;

/// Error types for `cimon` operations.
///
/// The first five variants are the recoverable kinds the monitoring layers
/// absorb or consolidate; everything else cancels sibling tasks and
/// propagates to the top level.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown repository URL: {0}")]
    UnknownRepositoryUrl(String),

    #[error("unknown git reference: {0}")]
    UnknownGitReference(String),

    #[error("unknown pipeline URL: {0}")]
    UnknownPipelineUrl(String),

    #[error("pipeline to save is older than the pipeline in cache")]
    ObsoleteBuild,

    #[error("operation canceled")]
    Canceled,

    #[error("provider {id}: {source}")]
    Provider {
        id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("git repository error: {0}")]
    Repository(String),

    #[error("no step matching {0}")]
    NoSuchStep(String),

    #[error("step nesting exceeds {0} levels")]
    NestingTooDeep(usize),

    #[error("{provider} API returned status {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Attribute an error to a provider instance. The consolidation kinds
    /// and cancellation pass through verbatim so the broadcast layers can
    /// still match on them.
    pub fn with_provider(self, id: &str) -> Error {
        match self {
            Error::UnknownRepositoryUrl(_)
            | Error::UnknownGitReference(_)
            | Error::UnknownPipelineUrl(_)
            | Error::ObsoleteBuild
            | Error::Canceled => self,
            other => Error::Provider {
                id: id.to_owned(),
                source: Box::new(other),
            },
        }
    }
}

/// Result type alias using `Error` as the error type.
pub type Result<T> = std::result::Result<T, Error>;
