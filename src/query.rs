use crate::{
    error::StoreError,
    mapper::normalize_address,
    models::{HostDepth, HostDocument, PortScripts},
    store::HostStore,
};

/// Read-only views over stored hosts. Unknown addresses yield empty results.
#[derive(Debug, Clone)]
pub struct QueryService {
    store: HostStore,
}

impl QueryService {
    pub fn new(store: HostStore) -> Self {
        Self { store }
    }

    pub fn host_document(&self, address: &str) -> Result<HostDocument, StoreError> {
        Ok(self
            .store
            .get(&normalize_address(address), HostDepth::Full)?
            .map(HostDocument::from)
            .unwrap_or_default())
    }

    pub fn port_numbers(&self, address: &str) -> Result<Vec<u16>, StoreError> {
        Ok(self
            .store
            .get(&normalize_address(address), HostDepth::Ports)?
            .map(|host| host.ports.iter().map(|p| p.number).collect())
            .unwrap_or_default())
    }

    pub fn port_scripts(&self, address: &str) -> Result<Vec<PortScripts>, StoreError> {
        Ok(self
            .store
            .get(&normalize_address(address), HostDepth::PortScripts)?
            .map(|host| {
                host.ports
                    .into_iter()
                    .map(|port| PortScripts {
                        number: port.number,
                        scripts: port.scripts,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn addresses(&self) -> Result<Vec<String>, StoreError> {
        self.store.list_addresses()
    }

    pub fn addresses_with_open_port(&self, port: u16) -> Result<Vec<String>, StoreError> {
        self.store.find_addresses_by_open_port(port)
    }

    pub fn host_count(&self) -> Result<u64, StoreError> {
        self.store.count_hosts()
    }
}
