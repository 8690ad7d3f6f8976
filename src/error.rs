use std::{path::PathBuf, time::Duration};

/// Raised when report bytes are not a recognizable Nmap XML document.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("report is empty")]
    Empty,
    #[error("report is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("xml syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("unexpected root element <{0}>, expected <nmaprun>")]
    UnexpectedRoot(String),
    #[error("report has no root element")]
    MissingRoot,
    #[error("failed decoding report: {0}")]
    Decode(#[from] quick_xml::DeError),
}

/// A single host that could not be turned into a storable record.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("host has no address")]
    MissingAddress,
    #[error("`{0}` is not an IP address")]
    InvalidAddress(String),
    #[error("failed serializing raw report for {address}: {source}")]
    RawReport {
        address: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed preparing storage directory {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage operation did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("storage worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed report: {0}")]
    MalformedReport(#[from] ReportError),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
}
