use std::io;
use thiserror::Error;

/// Error type for the design pipeline.
///
/// `InvalidTargetSize` and `OracleFailure` are fatal for a single target
/// only; the batch driver decides (explicitly) whether to skip and continue.
#[derive(Debug, Error)]
pub enum DesignError {
    #[error(
        "target {chrom}:{start}-{end} spans {span} bp but must be shorter than \
         amplicon_max - 2*primer_min = {max_span} bp"
    )]
    InvalidTargetSize {
        chrom: String,
        start: i64,
        end: i64,
        span: i64,
        max_span: i64,
    },

    #[error("malformed feature {chrom}:{start}-{stop} (stop before start)")]
    MalformedFeature { chrom: String, start: i64, stop: i64 },

    #[error("primer design oracle failed: {0}")]
    OracleFailure(String),

    #[error("melting-curve service failed: {0}")]
    MeltService(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<DesignError> for io::Error {
    fn from(e: DesignError) -> io::Error {
        match e {
            DesignError::Io(inner) => inner,
            other => io::Error::other(other.to_string()),
        }
    }
}
