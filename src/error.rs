use std::path::PathBuf;

use thiserror::Error;

/// Errors that change how a run proceeds. Anything else raised inside a worker is
/// treated as a per-restaurant fetch failure.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("city not found: {city}")]
    CityNotFound { city: String },

    #[error("dedup store unavailable")]
    StoreUnavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error("merge aborted at {}; data for restaurant {restaurant:?} may be incomplete", path.display())]
    Merge {
        path: PathBuf,
        restaurant: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl HarvestError {
    pub fn store(source: impl Into<anyhow::Error>) -> Self {
        Self::StoreUnavailable {
            source: source.into(),
        }
    }

    /// Fatal errors stop scheduling and abort the whole batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Cancelled)
    }
}

pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HarvestError>()
        .is_some_and(HarvestError::is_fatal)
}
