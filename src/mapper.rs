use std::net::IpAddr;

use crate::{
    error::MappingError,
    models::{NewHost, Port, Script},
    report::{ParsedHost, ScriptResult},
};

/// Canonical text form of an address: parsed IPs print lowercase and compressed,
/// anything else is only trimmed.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| trimmed.to_string())
}

pub fn map_host(parsed: &ParsedHost) -> Result<NewHost, MappingError> {
    let raw_address = parsed.primary_address().ok_or(MappingError::MissingAddress)?;
    let address = raw_address
        .parse::<IpAddr>()
        .map_err(|_| MappingError::InvalidAddress(raw_address.to_string()))?
        .to_string();

    let raw_report = serde_json::to_vec(parsed).map_err(|source| MappingError::RawReport {
        address: address.clone(),
        source,
    })?;

    let ports = parsed
        .ports
        .iter()
        .map(|port| Port {
            number: port.port_id,
            protocol: port.protocol.clone(),
            state: port.state.state.clone(),
            service: port
                .service
                .as_ref()
                .map(|s| s.name.clone())
                .unwrap_or_default(),
            scripts: port.scripts.iter().map(map_script).collect(),
        })
        .collect();

    Ok(NewHost {
        address,
        name: parsed.primary_name().map(ToString::to_string),
        comment: Some(parsed.comment.trim())
            .filter(|c| !c.is_empty())
            .map(ToString::to_string),
        raw_report,
        ports,
        host_scripts: parsed.host_scripts.iter().map(map_script).collect(),
    })
}

fn map_script(script: &ScriptResult) -> Script {
    Script {
        title: script.id.clone(),
        output: script.output.clone(),
    }
}
