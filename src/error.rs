use std::path::PathBuf;
use thiserror::Error;

/// Typed failures for both pipelines. Stages consume named inputs and fail
/// fast when one is absent or invalid instead of falling through with
/// undefined state.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' is missing required input: {input}")]
    MissingInput { stage: &'static str, input: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("archive {archive:?} has no entry '{entry}'")]
    MissingArchiveEntry { archive: PathBuf, entry: String },

    #[error("malformed DBF table: {0}")]
    Dbf(String),

    #[error(
        "chlorophyll aggregate is not unique on (id, year, month): \
         {duplicates} duplicated key(s), left join would fan out"
    )]
    JoinKeyNotUnique { duplicates: usize },

    #[error("cross-validation fold {fold} failed")]
    Fold {
        fold: usize,
        #[source]
        source: anyhow::Error,
    },
}
