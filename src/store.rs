use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::{InterfaceCreate, InterfaceUpdate};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rejected by the inventory store: {0}")]
    Conflict(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("more than one device is named '{0}'")]
    Ambiguous(String),
}

/// Store-side identifier of a device.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct DeviceHandle(pub(crate) u64);

/// A field value as the store reports it. Choice fields come back as
/// `{"value": .., "label": ..}`; only `value` takes part in comparisons.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum StoreValue {
    Labeled { value: Value, label: Value },
    Scalar(Value),
}

impl StoreValue {
    pub fn value(&self) -> &Value {
        match self {
            StoreValue::Labeled { value, .. } => value,
            StoreValue::Scalar(value) => value,
        }
    }

    pub fn matches(&self, other: &Value) -> bool {
        self.value() == other
    }
}

/// An interface as currently recorded by the store.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StoreInterface {
    pub(crate) id: u64,
    pub(crate) name: String,
    #[serde(flatten)]
    pub(crate) fields: BTreeMap<String, StoreValue>,
}

/// System of record for device interfaces.
pub trait InventoryStore {
    fn find_device(&self, hostname: &str) -> Result<Option<DeviceHandle>, StoreError>;

    fn list_interfaces(&self, device: DeviceHandle) -> Result<Vec<StoreInterface>, StoreError>;

    fn create_interface(&self, interface: &InterfaceCreate) -> Result<(), StoreError>;

    fn update_interface(&self, interface: &InterfaceUpdate) -> Result<(), StoreError>;
}
