//! High-level appliance operations.
//! Discovery merged with the cloud appliance list, and status or settings
//! access by address or appliance id through a registry of shared clients.

use crate::cloud::{ApplianceInfo, CloudSession};
use crate::command::{ApplianceFamily, ApplianceState};
use crate::device::ApplianceClient;
use crate::error::{MideaError, Result};
use crate::scanner::{DiscoveryResult, Scanner};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Which appliance an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Address(IpAddr),
    Id(u64),
}

/// How to authenticate against the appliance.
#[derive(Debug, Clone)]
pub enum Auth {
    /// LAN token and key, no cloud involved.
    Token { token: String, key: String },
    /// Cloud session providing tokens and the relay.
    Cloud(Arc<CloudSession>),
}

impl Auth {
    fn cloud(&self) -> Option<Arc<CloudSession>> {
        match self {
            Auth::Cloud(cloud) => Some(cloud.clone()),
            Auth::Token { .. } => None,
        }
    }
}

/// An appliance found on the LAN, in the cloud account, or both.
#[derive(Debug, Clone)]
pub struct FoundAppliance {
    pub id: u64,
    pub name: String,
    pub family: ApplianceFamily,
    /// Present when the appliance answered the LAN scan.
    pub discovery: Option<DiscoveryResult>,
    pub client: Arc<ApplianceClient>,
}

/// Entry point for discovery and per appliance access.
///
/// Clients are kept per appliance id so repeated calls share one LAN
/// connection and one order counter.
pub struct Manager {
    scanner: Scanner,
    networks: Vec<String>,
    registry: RwLock<HashMap<u64, Arc<ApplianceClient>>>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            scanner: Scanner::new(),
            networks: Vec::new(),
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_scanner(mut self, scanner: Scanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// Networks scanned when an appliance is looked up by id.
    pub fn with_networks<S: AsRef<str>>(mut self, networks: &[S]) -> Self {
        self.networks = networks.iter().map(|n| n.as_ref().to_string()).collect();
        self
    }

    /// Scans `networks` and merges the result with the cloud account.
    ///
    /// Appliances registered in the cloud but silent on the LAN are
    /// returned as relay-only clients.
    pub async fn find_appliances<S: AsRef<str>>(
        &self,
        cloud: Option<Arc<CloudSession>>,
        networks: &[S],
    ) -> Result<Vec<FoundAppliance>> {
        let known = match &cloud {
            Some(cloud) => cloud.list_appliances(false).await?,
            None => Vec::new(),
        };
        let scanned = self.scanner.scan(networks).await?;

        let mut found: Vec<FoundAppliance> = Vec::new();
        for result in scanned {
            let Some(family) = result.family() else {
                debug!(
                    "Skipping unsupported appliance {} (type {:#04x})",
                    result.id, result.appliance_type
                );
                continue;
            };
            let info = known.iter().find(|a| a.appliance_id() == Some(result.id));
            if cloud.is_some() && info.is_none() {
                warn!(
                    "Found an appliance that is not registered to the account: {}",
                    result.id
                );
            }
            let client = self
                .register(self.client_for(&result, family, cloud.clone(), None)?)
                .await;
            info!("Found appliance {} at {}", result.id, result.address);
            found.push(FoundAppliance {
                id: result.id,
                name: info.map(|a| a.name.clone()).unwrap_or_default(),
                family,
                discovery: Some(result),
                client,
            });
        }

        if let Some(cloud) = &cloud {
            for info in &known {
                let (Some(id), Some(family)) = (info.appliance_id(), family_of(info)) else {
                    continue;
                };
                if found.iter().any(|f| f.id == id) {
                    continue;
                }
                warn!("Unable to discover registered appliance {} on the LAN", id);
                let client = ApplianceClient::builder(id, family)
                    .with_cloud(cloud.clone())
                    .build()?;
                let client = self.register(client).await;
                found.push(FoundAppliance {
                    id,
                    name: info.name.clone(),
                    family,
                    discovery: None,
                    client,
                });
            }
        }

        found.sort_by_key(|f| f.id);
        info!("Found {} appliance(s)", found.len());
        Ok(found)
    }

    /// Reads the state of one appliance.
    pub async fn appliance_state(&self, target: &Target, auth: &Auth) -> Result<ApplianceState> {
        self.resolve(target, auth).await?.query().await
    }

    /// Applies `name=value` changes to one appliance and returns its new state.
    pub async fn set_appliance_state(
        &self,
        target: &Target,
        auth: &Auth,
        changes: &[(&str, &str)],
    ) -> Result<ApplianceState> {
        self.resolve(target, auth).await?.set_named(changes).await
    }

    pub async fn get(&self, id: u64) -> Option<Arc<ApplianceClient>> {
        self.registry.read().await.get(&id).cloned()
    }

    /// Drops the shared client for `id`, closing its LAN connection.
    pub async fn remove(&self, id: u64) {
        let removed = self.registry.write().await.remove(&id);
        if let Some(client) = removed {
            client.disconnect().await;
            info!("Appliance {} removed from registry", id);
        }
    }

    pub async fn list(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.registry.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Shares `client`, unless a client for the same id and address is
    /// already registered; that one is kept with its connection and order
    /// counter.
    async fn register(&self, client: ApplianceClient) -> Arc<ApplianceClient> {
        let mut registry = self.registry.write().await;
        if let Some(existing) = registry.get(&client.id())
            && existing.address() == client.address()
        {
            return existing.clone();
        }
        let client = Arc::new(client);
        registry.insert(client.id(), client.clone());
        client
    }

    async fn registered(&self, target: &Target) -> Option<Arc<ApplianceClient>> {
        let registry = self.registry.read().await;
        match target {
            Target::Id(id) => registry.get(id).cloned(),
            Target::Address(ip) => registry
                .values()
                .find(|c| c.address().is_some_and(|a| a.ip() == *ip))
                .cloned(),
        }
    }

    fn client_for(
        &self,
        result: &DiscoveryResult,
        family: ApplianceFamily,
        cloud: Option<Arc<CloudSession>>,
        auth: Option<&Auth>,
    ) -> Result<ApplianceClient> {
        let mut builder = ApplianceClient::builder(result.id, family)
            .with_address(result.address)
            .with_port(result.port);
        if let Some(Auth::Token { token, key }) = auth {
            builder = builder.with_token(token, key);
        }
        if let Some(cloud) = cloud {
            builder = builder.with_cloud(cloud);
        }
        builder.build()
    }

    async fn resolve(&self, target: &Target, auth: &Auth) -> Result<Arc<ApplianceClient>> {
        if let Some(client) = self.registered(target).await {
            debug!("Appliance {} borrowed from registry", client.id());
            return Ok(client);
        }

        let scan_targets: Vec<String> = match target {
            Target::Address(ip) => vec![ip.to_string()],
            Target::Id(_) => self.networks.clone(),
        };
        let discovered = match self.scanner.scan(&scan_targets).await {
            Ok(results) => results.into_iter().find(|r| match target {
                Target::Address(ip) => r.address == *ip,
                Target::Id(id) => r.id == *id,
            }),
            Err(e) => {
                debug!("Scan for {:?} failed: {}", target, e);
                None
            }
        };

        let client = match discovered {
            Some(result) => {
                let family = result.family().ok_or_else(|| {
                    MideaError::InvalidHeader(format!(
                        "unsupported appliance type {:#04x}",
                        result.appliance_type
                    ))
                })?;
                self.client_for(&result, family, auth.cloud(), Some(auth))?
            }
            None => self.relay_only(target, auth).await?,
        };
        Ok(self.register(client).await)
    }

    /// Client for an appliance that only the cloud knows about.
    async fn relay_only(&self, target: &Target, auth: &Auth) -> Result<ApplianceClient> {
        let (Target::Id(id), Auth::Cloud(cloud)) = (target, auth) else {
            return Err(MideaError::DeviceNotFound(match target {
                Target::Address(ip) => ip.to_string(),
                Target::Id(id) => id.to_string(),
            }));
        };
        let appliances = cloud.list_appliances(false).await?;
        let info = appliances
            .iter()
            .find(|a| a.appliance_id() == Some(*id))
            .ok_or_else(|| MideaError::DeviceNotFound(id.to_string()))?;
        let family = family_of(info).ok_or_else(|| {
            MideaError::InvalidHeader(format!("unsupported appliance type '{}'", info.kind))
        })?;
        debug!("Appliance {} not on the LAN, using cloud relay", id);
        ApplianceClient::builder(*id, family)
            .with_cloud(cloud.clone())
            .build()
    }
}

fn family_of(info: &ApplianceInfo) -> Option<ApplianceFamily> {
    info.type_byte()
        .and_then(|b| ApplianceFamily::try_from(b).ok())
}
