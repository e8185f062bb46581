pub mod api;
pub mod config;
pub mod decompose;
pub mod materialize;
pub mod models;
pub mod overpass;
pub mod pipeline;
pub mod query;
pub mod region;
pub mod report;
pub mod schema;
pub mod sink;

#[doc(hidden)]
pub mod test_support;

pub use models::*;

/// Common result type used for configuration and file handling
pub type Result<T> = anyhow::Result<T>;

/// Failures that terminate a whole query run.
///
/// Problems local to a single element or attribute are reported through
/// [`report::ElementFailure`] and [`report::FieldFailure`] instead and never
/// surface here.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum OverpassError {
    #[error("no administrative boundary found for region '{name}'")]
    RegionNotFound { name: String },

    #[error("geocoding service unavailable: {0}")]
    GeocodingUnavailable(String),

    #[error("Overpass service unavailable (status {status:?}): {body}")]
    QueryServiceUnavailable { status: Option<u16>, body: String },

    #[error("malformed Overpass response ({reason}): {body}")]
    MalformedResponse { reason: String, body: String },

    #[error("Overpass returned no elements for the query")]
    EmptyResultSet,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("feature sink error: {0}")]
    Sink(String),
}
