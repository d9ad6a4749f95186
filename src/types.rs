use std::fmt;

use serde::{Deserialize, Serialize};

/// Interface media types understood by the inventory store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceType {
    #[serde(rename = "virtual")]
    Virtual,
    #[serde(rename = "1000base-t")]
    Gigabit,
    #[serde(rename = "10gbase-x-sfpp")]
    TenGigSfpp,
    #[serde(rename = "25gbase-x-sfp28")]
    TwentyFiveGigSfp28,
    #[serde(rename = "100gbase-x-qsfp28")]
    HundredGigQsfp28,
    #[serde(rename = "lag")]
    Lag,
    #[serde(rename = "other")]
    Other,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Virtual => "virtual",
            InterfaceType::Gigabit => "1000base-t",
            InterfaceType::TenGigSfpp => "10gbase-x-sfpp",
            InterfaceType::TwentyFiveGigSfp28 => "25gbase-x-sfp28",
            InterfaceType::HundredGigQsfp28 => "100gbase-x-qsfp28",
            InterfaceType::Lag => "lag",
            InterfaceType::Other => "other",
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 802.1Q mode of a switch port.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceMode {
    Access,
    Tagged,
}

impl InterfaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceMode::Access => "access",
            InterfaceMode::Tagged => "tagged",
        }
    }
}

/// Vendor-agnostic interface, the unit the diff engine and the store work with.
///
/// Field order is the order fields appear in rendered change sets.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CanonicalInterface {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) interface_type: InterfaceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub(crate) mode: Option<InterfaceMode>,
    pub(crate) enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub(crate) mtu: Option<u32>,
}

/// Normalized interfaces of one device, in collector order.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[cfg_attr(test, derive(PartialEq))]
pub struct DeviceRecord {
    pub(crate) hostname: String,
    pub(crate) interfaces: Vec<CanonicalInterface>,
}

/// Collector output before normalization. `T` is the vendor's raw row type.
#[derive(Debug, Clone)]
pub struct RawDeviceRecord<T> {
    pub(crate) hostname: String,
    pub(crate) interfaces: Vec<T>,
}

/// Operator credentials used to log into devices.
#[derive(Clone)]
pub struct Credentials {
    pub(crate) username: String,
    pub(crate) password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
