use thiserror::Error;

/// Errors raised while constructing a dispatcher from its configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unrecognized runner mode: {0}")]
    UnknownMode(String),

    #[error("unrecognized runner policy: {0}")]
    UnknownPolicy(String),

    #[error("cacheModel=true is not supported under runner_mode=task: each task run gets an ephemeral model instance by design")]
    CacheWithTaskMode,

    #[error("n_runners must be at least 1")]
    ZeroRunners,
}

/// Errors raised by the object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reference not found: {0}")]
    NotFound(String),

    #[error("wait timed out before any reference became ready")]
    WaitTimeout,
}

/// Errors raised while dispatching a request through the runner pool or
/// pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("runner pool exhausted: no worker became available for tenant {tenant}")]
    Exhausted { tenant: String },

    #[error("stage {stage} failed: {source}")]
    StageFailure {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors raised by the network server front-end.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Top-level error type, composing every subsystem's error enum.
#[derive(Debug, Error)]
pub enum InferdError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = InferdError> = std::result::Result<T, E>;
