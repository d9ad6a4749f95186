use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::normalize::match_key;
use crate::store::{DeviceHandle, StoreInterface};
use crate::types::{CanonicalInterface, DeviceRecord};

/// Full record for an interface the store does not know yet.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InterfaceCreate {
    #[serde(flatten)]
    pub(crate) interface: CanonicalInterface,
    pub(crate) device: u64,
}

/// Partial record for a known interface: its name plus every field whose
/// stored value differs.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InterfaceUpdate {
    pub(crate) id: u64,
    pub(crate) name: String,
    #[serde(flatten)]
    pub(crate) changes: Map<String, Value>,
}

impl InterfaceUpdate {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Create(InterfaceCreate),
    Update(InterfaceUpdate),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DeviceChangeSet {
    pub(crate) hostname: String,
    pub(crate) create_interfaces: Vec<InterfaceCreate>,
    pub(crate) update_interfaces: Vec<InterfaceUpdate>,
}

impl DeviceChangeSet {
    pub fn is_empty(&self) -> bool {
        self.create_interfaces.is_empty() && self.update_interfaces.is_empty()
    }
}

/// Changes for the whole fleet, in inventory order. Devices with nothing to
/// do are never part of it.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct FleetChangeSet {
    pub(crate) devices: Vec<DeviceChangeSet>,
}

impl FleetChangeSet {
    pub fn from_devices<I>(devices: I) -> Self
    where
        I: IntoIterator<Item = DeviceChangeSet>,
    {
        FleetChangeSet {
            devices: devices.into_iter().filter(|d| !d.is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of (creates, updates) across all devices.
    pub fn counts(&self) -> (usize, usize) {
        self.devices.iter().fold((0, 0), |(creates, updates), d| {
            (
                creates + d.create_interfaces.len(),
                updates + d.update_interfaces.len(),
            )
        })
    }
}

/// The comparable fields of `interface`, everything but the name, in
/// rendering order. Absent optional fields are left out.
fn field_values(interface: &CanonicalInterface) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("type".into(), Value::from(interface.interface_type.as_str()));
    if let Some(mode) = interface.mode {
        fields.insert("mode".into(), Value::from(mode.as_str()));
    }
    fields.insert("enabled".into(), Value::from(interface.enabled));
    if let Some(description) = &interface.description {
        fields.insert("description".into(), Value::from(description.as_str()));
    }
    if let Some(mtu) = interface.mtu {
        fields.insert("mtu".into(), Value::from(mtu));
    }
    fields
}

fn pending_update(interface: &CanonicalInterface, current: &StoreInterface) -> InterfaceUpdate {
    let changes = field_values(interface)
        .into_iter()
        .filter(|(field, value)| {
            current
                .fields
                .get(field)
                .map_or(true, |stored| !stored.matches(value))
        })
        .collect();

    InterfaceUpdate {
        id: current.id,
        name: interface.name.clone(),
        changes,
    }
}

/// Classify every interface of `record`, in record order, as a create or an
/// update against the store's `current` interfaces of the same device.
/// Updates may be no-ops at this stage.
pub fn classify(
    record: &DeviceRecord,
    device: DeviceHandle,
    current: &[StoreInterface],
) -> Vec<Classification> {
    let mut by_name: HashMap<String, &StoreInterface> = HashMap::with_capacity(current.len());
    for interface in current {
        by_name.entry(match_key(&interface.name)).or_insert(interface);
    }

    record
        .interfaces
        .iter()
        .map(|interface| match by_name.get(&match_key(&interface.name)) {
            Some(stored) => Classification::Update(pending_update(interface, stored)),
            None => Classification::Create(InterfaceCreate {
                interface: interface.clone(),
                device: device.0,
            }),
        })
        .collect()
}

/// Changes needed to bring the store in line with `record`, with no-op
/// updates suppressed.
pub fn diff_device(
    record: &DeviceRecord,
    device: DeviceHandle,
    current: &[StoreInterface],
) -> DeviceChangeSet {
    let mut changes = DeviceChangeSet {
        hostname: record.hostname.clone(),
        create_interfaces: Vec::new(),
        update_interfaces: Vec::new(),
    };

    for classification in classify(record, device, current) {
        match classification {
            Classification::Create(create) => changes.create_interfaces.push(create),
            Classification::Update(update) if update.is_noop() => {}
            Classification::Update(update) => changes.update_interfaces.push(update),
        }
    }

    changes
}
