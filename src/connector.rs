use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::config::ConnectorSettings;
use crate::normalize::{NormalizeError, Normalizer};
use crate::types::{Credentials, DeviceRecord, RawDeviceRecord};
use crate::{eltex, juniper};

/// Underlying reason a device could not be queried.
#[derive(Debug, thiserror::Error)]
pub enum CollectionCause {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("authentication rejected for user '{0}'")]
    Auth(String),
    #[error("unexpected device output: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
#[error("collecting interfaces from {host} failed")]
pub struct CollectionError {
    pub(crate) host: IpAddr,
    #[source]
    pub(crate) cause: CollectionCause,
}

/// Queries a live device for its raw interface table.
pub trait Collector {
    type Raw;

    fn collect(
        &self,
        host: IpAddr,
        credentials: &Credentials,
    ) -> Result<RawDeviceRecord<Self::Raw>, CollectionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Collection(#[from] CollectionError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

/// Vendor-independent entry point used by the reconciler.
pub trait Connector {
    fn interfaces(
        &self,
        host: IpAddr,
        credentials: &Credentials,
    ) -> Result<DeviceRecord, ConnectorError>;
}

/// Pairs a vendor collector with the normalizer for its raw rows.
pub struct VendorConnector<C, N> {
    collector: C,
    normalizer: N,
}

impl<C, N> VendorConnector<C, N> {
    pub fn new(collector: C, normalizer: N) -> Self {
        VendorConnector {
            collector,
            normalizer,
        }
    }
}

impl<C, N> Connector for VendorConnector<C, N>
where
    C: Collector,
    N: Normalizer<Raw = C::Raw>,
{
    fn interfaces(
        &self,
        host: IpAddr,
        credentials: &Credentials,
    ) -> Result<DeviceRecord, ConnectorError> {
        let raw = self.collector.collect(host, credentials)?;
        Ok(self.normalizer.normalize(raw)?)
    }
}

type Constructor = Box<dyn Fn(&ConnectorSettings) -> Box<dyn Connector>>;

/// Connector constructors keyed by the inventory's connector kind.
pub struct Registry {
    constructors: BTreeMap<String, Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every built-in vendor.
    pub fn with_defaults() -> Self {
        let mut registry = Registry::new();
        registry.register(eltex::KIND, eltex::connector);
        registry.register(juniper::KIND, juniper::connector);
        registry
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&ConnectorSettings) -> Box<dyn Connector> + 'static,
    {
        self.constructors.insert(registry_key(kind), Box::new(constructor));
    }

    pub fn build(&self, kind: &str, settings: &ConnectorSettings) -> Option<Box<dyn Connector>> {
        self.constructors
            .get(&registry_key(kind))
            .map(|constructor| constructor(settings))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

fn registry_key(kind: &str) -> String {
    kind.trim().to_lowercase()
}
