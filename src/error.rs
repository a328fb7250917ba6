//! Error types - Resolution, startup, teardown and configuration failures

use std::path::PathBuf;

use thiserror::Error;

use crate::isolation::ContextId;

/// A bundle or its main entry point could not be determined
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("bundle {path:?} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("cannot read manifest {path:?}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed manifest {path:?}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("dependency {dependency:?} of bundle {bundle:?} does not exist")]
    MissingDependency { bundle: PathBuf, dependency: PathBuf },

    #[error("no entry point declared or found in bundle {bundle:?}")]
    NoEntryPoint { bundle: PathBuf },

    #[error("bundle {bundle:?} has more than one entry point candidate: {candidates:?}")]
    AmbiguousEntryPoint {
        bundle: PathBuf,
        candidates: Vec<String>,
    },

    #[error("cannot scan {path:?} for entry points")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot determine host resources")]
    HostResources(#[source] std::io::Error),
}

/// The application runner could not bring the application up
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("entry point '{entry_point}' is not visible from context {context}")]
    EntryPointNotFound {
        entry_point: String,
        context: ContextId,
    },

    #[error("context {0} has already been released")]
    ContextReleased(ContextId),

    #[error("cannot spawn startup worker")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("startup worker panicked: {0}")]
    Panicked(String),

    #[error("application failed to start")]
    Failed(#[source] anyhow::Error),
}

/// Close, release or purge failed while tearing an instance down
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("application close failed")]
    Close(#[source] anyhow::Error),

    #[error("context {context} is still active on {active} thread(s)")]
    ContextBusy { context: ContextId, active: usize },

    #[error("static state purge failed: {0}")]
    Purge(String),
}

/// A process-wide static slot or registry rejected an operation
#[derive(Debug, Error)]
pub enum StaticsError {
    #[error("slot '{slot}' is already installed by context {owner}")]
    AlreadyInstalled { slot: String, owner: ContextId },

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// Why a launch attempt settled in `Failed`
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("cannot resolve bundle")]
    Resolve(#[from] ResolveError),

    #[error("cannot start application")]
    Startup(#[from] StartupError),
}

/// Caller-facing failures of the facades
#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("not a valid bundle location: {0:?}")]
    InvalidBundle(PathBuf),

    #[error("cannot determine host resources")]
    HostResources(#[from] ResolveError),

    #[error("blocking deploy task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Settings could not be loaded
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Render an error and every source below it on one line
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
