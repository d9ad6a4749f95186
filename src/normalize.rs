use std::collections::HashSet;

use crate::types::{CanonicalInterface, DeviceRecord, InterfaceMode, InterfaceType, RawDeviceRecord};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum NormalizeError {
    #[error("device '{hostname}' reported an interface without a name")]
    EmptyName { hostname: String },
    #[error("device '{hostname}' reported interface '{name}' more than once")]
    DuplicateName { hostname: String, name: String },
}

/// Pure mapping from a vendor's raw interface table to canonical interfaces.
pub trait Normalizer {
    type Raw;

    fn normalize(&self, raw: RawDeviceRecord<Self::Raw>) -> Result<DeviceRecord, NormalizeError>;
}

/// Per-normalizer filtering rules.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizePolicy {
    /// Skip interfaces that are down and carry no description.
    pub(crate) drop_disabled_undescribed: bool,
}

/// Maps interface name prefixes, optionally narrowed by the reported speed, to a media type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TypeRule {
    pub(crate) prefixes: &'static [&'static str],
    pub(crate) speed: Option<&'static str>,
    pub(crate) interface_type: InterfaceType,
}

impl TypeRule {
    pub(crate) const fn prefix(
        prefixes: &'static [&'static str],
        interface_type: InterfaceType,
    ) -> Self {
        TypeRule {
            prefixes,
            speed: None,
            interface_type,
        }
    }

    pub(crate) const fn speed(
        prefixes: &'static [&'static str],
        speed: &'static str,
        interface_type: InterfaceType,
    ) -> Self {
        TypeRule {
            prefixes,
            speed: Some(speed),
            interface_type,
        }
    }

    fn matches_name(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| name.starts_with(prefix))
    }
}

/// Pick the media type for `name`.
///
/// Rules that also match the reported speed win over prefix-only rules; within
/// each group the first matching rule wins. Unmatched names are `other`.
pub(crate) fn classify_type(rules: &[TypeRule], name: &str, speed: Option<&str>) -> InterfaceType {
    let name = name.to_lowercase();
    let speed = speed.map(str::trim).filter(|s| !s.is_empty());

    let by_speed = speed.and_then(|speed| {
        rules.iter().find(|rule| {
            rule.matches_name(&name)
                && rule.speed.is_some_and(|s| s.eq_ignore_ascii_case(speed))
        })
    });

    by_speed
        .or_else(|| {
            rules
                .iter()
                .find(|rule| rule.speed.is_none() && rule.matches_name(&name))
        })
        .map(|rule| rule.interface_type)
        .unwrap_or(InterfaceType::Other)
}

pub(crate) fn classify_mode(port_mode: &str) -> Option<InterfaceMode> {
    let port_mode = port_mode.trim();
    if port_mode.starts_with("Access") {
        Some(InterfaceMode::Access)
    } else if port_mode.starts_with("Trunk") {
        Some(InterfaceMode::Tagged)
    } else {
        None
    }
}

/// Numeric MTU or nothing; values such as `Unlimited` are dropped.
pub(crate) fn parse_mtu(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|mtu| mtu.trim().parse::<u32>().ok())
}

/// Names match ignoring case and whitespace, so `Gi 1/1` is `gi1/1`.
pub(crate) fn match_key(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Apply `policy` to the converted interfaces and enforce names that are
/// unique under [`match_key`].
pub(crate) fn finish(
    hostname: String,
    interfaces: Vec<CanonicalInterface>,
    policy: &NormalizePolicy,
) -> Result<DeviceRecord, NormalizeError> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(interfaces.len());

    for interface in interfaces {
        let key = match_key(&interface.name);
        if key.is_empty() {
            return Err(NormalizeError::EmptyName { hostname });
        }

        let undescribed = interface
            .description
            .as_deref()
            .map_or(true, |d| d.trim().is_empty());
        if policy.drop_disabled_undescribed && !interface.enabled && undescribed {
            continue;
        }

        if !seen.insert(key) {
            return Err(NormalizeError::DuplicateName {
                hostname,
                name: interface.name,
            });
        }
        kept.push(interface);
    }

    Ok(DeviceRecord {
        hostname,
        interfaces: kept,
    })
}
