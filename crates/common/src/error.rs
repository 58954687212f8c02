/// Per-token failure taxonomy. Every variant is fatal for one token's run and
/// never for the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Missing supply figure, bad table identifier, invalid ladder.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Holder count/page or supply read failed.
    #[error("fetch failed: {0}")]
    TransientFetch(String),
    /// League table read, delete or insert failed.
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::TransientFetch(_) => "transient_fetch",
            Self::Persistence(_) => "persistence",
        }
    }

    pub fn fetch(what: &str, err: &anyhow::Error) -> Self {
        Self::TransientFetch(format!("{what}: {err:#}"))
    }

    pub fn persistence(what: &str, err: &anyhow::Error) -> Self {
        Self::Persistence(format!("{what}: {err:#}"))
    }
}
