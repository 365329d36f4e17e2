//! Bootstrap failures: which stage failed, and why. Every one of these ends the process.

use std::fmt;
use std::time::Duration;

/// Bootstrap stage, in the order the flows run them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    State,
    NetworkDefinition,
    Identity,
    Login,
    Follower,
    Connectivity,
    Contact,
    Channel,
    Listener,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "config",
            Stage::State => "state",
            Stage::NetworkDefinition => "network definition",
            Stage::Identity => "identity",
            Stage::Login => "login",
            Stage::Follower => "network follower",
            Stage::Connectivity => "connectivity",
            Stage::Contact => "contact",
            Stage::Channel => "channel",
            Stage::Listener => "listener",
        };
        f.write_str(name)
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("{stage} failed: {source}")]
    Fatal {
        stage: Stage,
        #[source]
        source: Cause,
    },
    /// The network never reported healthy within the wait.
    #[error("timeout on starting network follower after {0:?}")]
    Timeout(Duration),
}

impl BootstrapError {
    pub fn fatal(stage: Stage, source: impl Into<Cause>) -> Self {
        BootstrapError::Fatal {
            stage,
            source: source.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            BootstrapError::Fatal { stage, .. } => *stage,
            BootstrapError::Timeout(_) => Stage::Connectivity,
        }
    }
}

/// `map_err` adapter: tag any error with the stage it came from.
pub fn at<E>(stage: Stage) -> impl FnOnce(E) -> BootstrapError
where
    E: Into<Cause>,
{
    move |e| BootstrapError::fatal(stage, e)
}
