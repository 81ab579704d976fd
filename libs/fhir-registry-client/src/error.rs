//! Error types for the registry client.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Registry client errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Package not found: {name}@{range}")]
    PackageNotFound { name: String, range: String },

    #[error("Reference {moniker} cannot be served by {server}")]
    MisroutedReference { moniker: String, server: String },

    #[error("Invalid listing for {name} from {server}: {message}")]
    InvalidListing {
        name: String,
        server: String,
        message: String,
    },

    #[error("Unparseable version '{version}' in listing for {name}")]
    InvalidVersion { name: String, version: String },

    #[error("Unparseable version range '{range}': {message}")]
    InvalidRange { range: String, message: String },

    #[error("Registry {server} answered {status} for {url}")]
    Registry {
        server: String,
        url: String,
        status: u16,
    },

    #[error("Version count mismatch for {name}: listing has {listed}, resolved {resolved}")]
    VersionCountMismatch {
        name: String,
        listed: usize,
        resolved: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Package error: {0}")]
    Package(#[from] cuprum_package::PackageError),
}

impl Error {
    /// Transport-shaped errors mean "this server cannot answer right now";
    /// the resolver falls through to the next source on them.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Registry { .. })
    }
}
