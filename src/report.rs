//! Nmap XML report decoding.
//!
//! Only the parts of a `<host>` that ingestion cares about are decoded; the
//! decoded [`ParsedHost`] is also what gets archived as the raw report blob,
//! so it derives `Serialize` with plain field names.

use quick_xml::{events::Event, Reader};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ReportError;

const ROOT_ELEMENT: &str = "nmaprun";

#[derive(Debug, Default, Deserialize)]
struct NmapRun {
    #[serde(default, rename = "host")]
    hosts: Vec<ParsedHost>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedHost {
    #[serde(default, alias = "@starttime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(default, alias = "@endtime", skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default, alias = "@comment")]
    pub comment: String,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default, alias = "address")]
    pub addresses: Vec<Address>,
    #[serde(default, deserialize_with = "hostname_list")]
    pub hostnames: Vec<Hostname>,
    #[serde(default, deserialize_with = "port_list")]
    pub ports: Vec<ParsedPort>,
    #[serde(default, alias = "hostscript", deserialize_with = "script_list")]
    pub host_scripts: Vec<ScriptResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    #[serde(default, alias = "@state")]
    pub state: String,
    #[serde(default, alias = "@reason")]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default, alias = "@addr")]
    pub addr: String,
    #[serde(default, alias = "@addrtype")]
    pub addr_type: String,
    #[serde(default, alias = "@vendor", skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hostname {
    #[serde(default, alias = "@name")]
    pub name: String,
    #[serde(default, alias = "@type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPort {
    #[serde(default, alias = "@protocol")]
    pub protocol: String,
    #[serde(alias = "@portid")]
    pub port_id: u16,
    #[serde(default)]
    pub state: PortState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(default, alias = "script")]
    pub scripts: Vec<ScriptResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortState {
    #[serde(default, alias = "@state")]
    pub state: String,
    #[serde(default, alias = "@reason")]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default, alias = "@name")]
    pub name: String,
    #[serde(default, alias = "@product", skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, alias = "@version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, alias = "@extrainfo", skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptResult {
    #[serde(default, alias = "@id")]
    pub id: String,
    #[serde(default, alias = "@output")]
    pub output: String,
}

impl ParsedHost {
    pub fn is_up(&self) -> bool {
        self.status.state.eq_ignore_ascii_case("up")
    }

    pub fn primary_address(&self) -> Option<&str> {
        self.addresses
            .first()
            .map(|a| a.addr.trim())
            .filter(|a| !a.is_empty())
    }

    pub fn primary_name(&self) -> Option<&str> {
        self.hostnames
            .first()
            .map(|h| h.name.trim())
            .filter(|n| !n.is_empty())
    }

    /// Down hosts and hosts without an address carry no identity to store.
    pub fn is_addressable(&self) -> bool {
        self.is_up() && self.primary_address().is_some()
    }
}

/// Decodes every `<host>` of an Nmap XML report, in document order.
pub fn parse_report(bytes: &[u8]) -> Result<Vec<ParsedHost>, ReportError> {
    let xml = std::str::from_utf8(bytes)?;
    if xml.trim().is_empty() {
        return Err(ReportError::Empty);
    }

    let root = root_element(xml)?;
    if root != ROOT_ELEMENT {
        return Err(ReportError::UnexpectedRoot(root));
    }

    let run: NmapRun = quick_xml::de::from_str(xml)?;
    Ok(run.hosts)
}

fn root_element(xml: &str) -> Result<String, ReportError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Event::Eof => return Err(ReportError::MissingRoot),
            _ => {}
        }
    }
}

fn hostname_list<'de, D>(deserializer: D) -> Result<Vec<Hostname>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Hostnames {
        #[serde(default, rename = "hostname")]
        entries: Vec<Hostname>,
    }

    Ok(Hostnames::deserialize(deserializer)?.entries)
}

fn port_list<'de, D>(deserializer: D) -> Result<Vec<ParsedPort>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Ports {
        #[serde(default, rename = "port")]
        entries: Vec<ParsedPort>,
    }

    Ok(Ports::deserialize(deserializer)?.entries)
}

fn script_list<'de, D>(deserializer: D) -> Result<Vec<ScriptResult>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Scripts {
        #[serde(default, rename = "script")]
        entries: Vec<ScriptResult>,
    }

    Ok(Scripts::deserialize(deserializer)?.entries)
}
