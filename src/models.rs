use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Textual output of a probe, owned by either a port or a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub title: String,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub number: u16,
    pub protocol: String,
    pub state: String,
    pub service: String,
    pub scripts: Vec<Script>,
}

/// Candidate host produced by the mapper; not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHost {
    pub address: String,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub raw_report: Vec<u8>,
    pub ports: Vec<Port>,
    pub host_scripts: Vec<Script>,
}

/// A persisted host. Collections are only populated up to the requested [`HostDepth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub id: i64,
    pub address: String,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub raw_report: Vec<u8>,
    pub batch_id: String,
    pub ingested_at: DateTime<Utc>,
    pub ports: Vec<Port>,
    pub host_scripts: Vec<Script>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostDepth {
    Address,
    Ports,
    PortScripts,
    Full,
}

impl HostDepth {
    pub fn loads_ports(self) -> bool {
        self >= Self::Ports
    }

    pub fn loads_port_scripts(self) -> bool {
        self >= Self::PortScripts
    }

    pub fn loads_host_scripts(self) -> bool {
        self == Self::Full
    }
}

/// Full host detail as served to callers. Unknown addresses produce the default (empty) document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostDocument {
    pub address: String,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub batch_id: Option<String>,
    pub ingested_at: Option<DateTime<Utc>>,
    pub ports: Vec<Port>,
    pub host_scripts: Vec<Script>,
    pub raw: Value,
}

impl From<Host> for HostDocument {
    fn from(host: Host) -> Self {
        let raw = match serde_json::from_slice(&host.raw_report) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(address = %host.address, "Stored raw report is not valid JSON: {err}");
                Value::Null
            }
        };
        Self {
            address: host.address,
            name: host.name,
            comment: host.comment,
            batch_id: Some(host.batch_id),
            ingested_at: Some(host.ingested_at),
            ports: host.ports,
            host_scripts: host.host_scripts,
            raw,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortScripts {
    pub number: u16,
    pub scripts: Vec<Script>,
}
