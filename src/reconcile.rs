use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use log::{info, warn};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;

use crate::config::{Config, ConfigError, InventoryEntry};
use crate::connector::{Connector, ConnectorError, Registry};
use crate::diff::{diff_device, DeviceChangeSet, FleetChangeSet};
use crate::store::{InventoryStore, StoreError};
use crate::types::Credentials;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("device '{hostname}' is not present in the inventory store")]
    Lookup { hostname: String },
    #[error("inventory store request for '{hostname}' failed")]
    Store {
        hostname: String,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    /// Errors that only concern one device and may be skipped on request.
    fn is_device_local(&self) -> bool {
        matches!(
            self,
            ReconcileError::Connector(ConnectorError::Collection(_)) | ReconcileError::Lookup { .. }
        )
    }
}

/// An inventory row bound to the connector that serves it.
pub struct Target {
    pub(crate) ip: IpAddr,
    pub(crate) kind: String,
    pub(crate) connector: Box<dyn Connector>,
}

/// Bind every inventory row to a connector before any device is contacted.
pub fn resolve_inventory(
    registry: &Registry,
    entries: &[InventoryEntry],
    config: &Config,
) -> Result<Vec<Target>, ConfigError> {
    entries
        .iter()
        .map(|entry| {
            let settings = config.connector_settings(&entry.connector);
            let connector = registry.build(&entry.connector, &settings).ok_or_else(|| {
                ConfigError::UnknownConnector {
                    kind: entry.connector.clone(),
                    ip: entry.ip,
                }
            })?;

            Ok(Target {
                ip: entry.ip,
                kind: entry.connector.clone(),
                connector,
            })
        })
        .collect()
}

/// Fleet changes computed by a dry run, plus the devices that were skipped.
#[derive(Debug, Default)]
pub struct Plan {
    pub(crate) changes: FleetChangeSet,
    pub(crate) skipped: Vec<IpAddr>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
}

/// Result of one remote write.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Outcome {
    pub(crate) hostname: String,
    pub(crate) interface: String,
    pub(crate) action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

#[derive(Serialize, Debug, Default, PartialEq)]
pub struct ApplyReport {
    pub(crate) outcomes: Vec<Outcome>,
}

impl ApplyReport {
    fn count(&self, action: Action) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action == action && o.error.is_none())
            .count()
    }

    pub fn created(&self) -> usize {
        self.count(Action::Create)
    }

    pub fn updated(&self) -> usize {
        self.count(Action::Update)
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }

    fn record(
        &mut self,
        hostname: &str,
        interface: &str,
        action: Action,
        result: Result<(), StoreError>,
    ) {
        let error = result.err().map(|err| {
            warn!("{hostname}: {action:?} of interface {interface} failed: {err}");
            err.to_string()
        });

        self.outcomes.push(Outcome {
            hostname: hostname.to_string(),
            interface: interface.to_string(),
            action,
            error,
        });
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created {}, updated {}, failed {}",
            self.created(),
            self.updated(),
            self.failed()
        )
    }
}

pub struct Reconciler<'a> {
    store: &'a dyn InventoryStore,
    continue_on_error: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn InventoryStore, continue_on_error: bool) -> Self {
        Reconciler {
            store,
            continue_on_error,
        }
    }

    /// Collect, normalize and diff every target in inventory order. Nothing
    /// is written to the store.
    pub fn plan(&self, targets: &[Target], credentials: &Credentials) -> Result<Plan, ReconcileError> {
        let mut devices = Vec::with_capacity(targets.len());
        let mut skipped = Vec::new();

        for target in targets {
            info!("Collecting interfaces from {} ({})", target.ip, target.kind);
            match self.plan_device(target, credentials) {
                Ok(changes) => devices.push(changes),
                Err(err) if self.continue_on_error && err.is_device_local() => {
                    warn!("Skipping {}: {:#}", target.ip, anyhow::Error::new(err));
                    skipped.push(target.ip);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Plan {
            changes: FleetChangeSet::from_devices(devices),
            skipped,
        })
    }

    pub fn plan_device(
        &self,
        target: &Target,
        credentials: &Credentials,
    ) -> Result<DeviceChangeSet, ReconcileError> {
        let record = target.connector.interfaces(target.ip, credentials)?;
        let hostname = &record.hostname;
        let store_error = |source| ReconcileError::Store {
            hostname: hostname.clone(),
            source,
        };

        let device = self
            .store
            .find_device(hostname)
            .map_err(store_error)?
            .ok_or_else(|| ReconcileError::Lookup {
                hostname: hostname.clone(),
            })?;
        let current = self.store.list_interfaces(device).map_err(store_error)?;

        Ok(diff_device(&record, device, &current))
    }

    /// Write `changes` to the store, creates before updates for each device.
    /// A rejected write is reported and the rest still run.
    pub fn apply(&self, changes: &FleetChangeSet) -> ApplyReport {
        let mut report = ApplyReport::default();

        for device in &changes.devices {
            let hostname = &device.hostname;
            for create in &device.create_interfaces {
                let name = &create.interface.name;
                let result = self.store.create_interface(create);
                report.record(hostname, name, Action::Create, result);
            }
            for update in &device.update_interfaces {
                let result = self.store.update_interface(update);
                report.record(hostname, &update.name, Action::Update, result);
            }
            info!("Applied changes for {hostname}");
        }

        report
    }

    /// Apply only when there is something to do and `confirm` agrees.
    pub fn apply_if_confirmed<F>(&self, changes: &FleetChangeSet, confirm: F) -> Option<ApplyReport>
    where
        F: FnOnce(&FleetChangeSet) -> bool,
    {
        if changes.is_empty() || !confirm(changes) {
            return None;
        }

        Some(self.apply(changes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Json,
    Yaml,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            other => Err(format!("unsupported output format '{other}'")),
        }
    }
}

/// Render the fleet change set for operator review.
pub fn render(changes: &FleetChangeSet, format: OutputFormat) -> Result<String, anyhow::Error> {
    match format {
        OutputFormat::Json => {
            let mut out = Vec::new();
            let formatter = PrettyFormatter::with_indent(b"    ");
            let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
            changes.serialize(&mut serializer)?;
            Ok(String::from_utf8(out)?)
        }
        OutputFormat::Yaml => Ok(serde_yaml::to_string(changes)?),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::net::{IpAddr, Ipv4Addr};

    use serde_json::json;

    use crate::config::{Config, ConfigError, InventoryEntry};
    use crate::connector::fake::StaticCollector;
    use crate::connector::{ConnectorError, Registry, VendorConnector};
    use crate::diff::FleetChangeSet;
    use crate::eltex::{EltexInterface, EltexNormalizer};
    use crate::reconcile::{
        render, resolve_inventory, Action, OutputFormat, ReconcileError, Reconciler, Target,
    };
    use crate::store::memory::MemoryStore;
    use crate::types::{Credentials, RawDeviceRecord};

    fn credentials() -> Credentials {
        Credentials {
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    fn port(name: &str, port_mode: &str, protocol: &str, description: &str) -> EltexInterface {
        EltexInterface {
            interface: name.to_string(),
            port_mode: port_mode.to_string(),
            protocol: protocol.to_string(),
            description: description.to_string(),
        }
    }

    fn target(last: u8, hostname: &str, interfaces: Option<Vec<EltexInterface>>) -> Target {
        let record = interfaces.map(|interfaces| RawDeviceRecord {
            hostname: hostname.to_string(),
            interfaces,
        });

        Target {
            ip: ip(last),
            kind: "eltex".to_string(),
            connector: Box::new(VendorConnector::new(
                StaticCollector { record },
                EltexNormalizer::default(),
            )),
        }
    }

    fn sw1() -> Target {
        target(1, "sw1", Some(vec![port("1", "Access (10)", "up", " uplink ")]))
    }

    fn sw2() -> Target {
        target(
            2,
            "sw2",
            Some(vec![
                port("gi1/0/1", "Trunk", "Up", "server-01"),
                port("gi1/0/2", "Trunk", "Up", "server-02"),
                port("gi1/0/3", "Access (1)", "Down", ""),
            ]),
        )
    }

    #[test]
    fn end_to_end_plan_against_empty_store() -> Result<(), anyhow::Error> {
        let store = MemoryStore::default().with_device("sw1", 7);
        let plan = Reconciler::new(&store, false).plan(&[sw1()], &credentials())?;

        assert!(plan.skipped.is_empty());
        assert_eq!(
            serde_json::to_value(&plan.changes)?,
            json!([{
                "hostname": "sw1",
                "create_interfaces": [{
                    "name": "vlan1",
                    "type": "virtual",
                    "mode": "access",
                    "enabled": true,
                    "description": "uplink",
                    "device": 7,
                }],
                "update_interfaces": [],
            }])
        );
        assert_eq!(store.writes(), 0);

        Ok(())
    }

    #[test]
    fn partial_updates_for_drifted_interfaces() -> Result<(), anyhow::Error> {
        let store = MemoryStore::default()
            .with_device("sw2", 9)
            .with_interface(
                9,
                json!({
                    "id": 30,
                    "name": "GI1/0/1",
                    "type": {"value": "1000base-t", "label": "1000BASE-T (1GE)"},
                    "mode": {"value": "tagged", "label": "Tagged"},
                    "enabled": false,
                    "description": "server-01",
                }),
            );

        let plan = Reconciler::new(&store, false).plan(&[sw2()], &credentials())?;

        assert_eq!(
            serde_json::to_value(&plan.changes.devices[0].update_interfaces)?,
            json!([{"id": 30, "name": "gi1/0/1", "enabled": true}])
        );
        let created: Vec<&str> = plan.changes.devices[0]
            .create_interfaces
            .iter()
            .map(|c| c.interface.name.as_str())
            .collect();
        assert_eq!(created, ["gi1/0/2"]);

        Ok(())
    }

    #[test]
    fn apply_then_replan_is_empty() -> Result<(), anyhow::Error> {
        let store = MemoryStore::default()
            .with_device("sw1", 7)
            .with_device("sw2", 9)
            .with_interface(
                9,
                json!({
                    "id": 30,
                    "name": "gi1/0/1",
                    "type": {"value": "1000base-t", "label": "1000BASE-T (1GE)"},
                    "mode": null,
                    "enabled": true,
                    "description": "old",
                }),
            );
        let reconciler = Reconciler::new(&store, false);
        let targets = [sw1(), sw2()];

        let plan = reconciler.plan(&targets, &credentials())?;
        let report = reconciler.apply(&plan.changes);
        assert_eq!(report.to_string(), "created 2, updated 1, failed 0");

        let replan = reconciler.plan(&targets, &credentials())?;
        assert!(replan.changes.is_empty());
        assert!(reconciler
            .apply_if_confirmed(&replan.changes, |_| panic!("nothing to confirm"))
            .is_none());

        Ok(())
    }

    #[test]
    fn rejected_writes_do_not_stop_the_batch() -> Result<(), anyhow::Error> {
        let store = MemoryStore::default()
            .with_device("sw2", 9)
            .rejecting("gi1/0/1");
        let reconciler = Reconciler::new(&store, false);

        let plan = reconciler.plan(&[sw2()], &credentials())?;
        let report = reconciler.apply(&plan.changes);

        assert_eq!((report.created(), report.updated(), report.failed()), (1, 0, 1));
        let failed = &report.outcomes[0];
        assert_eq!(failed.interface, "gi1/0/1");
        assert_eq!(failed.action, Action::Create);
        assert!(failed.error.as_deref().is_some_and(|e| e.contains("invalid payload")));
        assert_eq!(store.created.borrow()[0].interface.name, "gi1/0/2");

        Ok(())
    }

    #[test]
    fn declined_confirmation_writes_nothing() -> Result<(), anyhow::Error> {
        let store = MemoryStore::default().with_device("sw1", 7);
        let reconciler = Reconciler::new(&store, false);
        let plan = reconciler.plan(&[sw1()], &credentials())?;
        let asked = Cell::new(false);

        let report = reconciler.apply_if_confirmed(&plan.changes, |changes| {
            asked.set(true);
            assert_eq!(changes.counts(), (1, 0));
            false
        });

        assert!(asked.get());
        assert!(report.is_none());
        assert_eq!(store.writes(), 0);

        Ok(())
    }

    #[test]
    fn unknown_device_is_fatal_by_default() {
        let store = MemoryStore::default().with_device("sw2", 9);
        let err = Reconciler::new(&store, false)
            .plan(&[sw1(), sw2()], &credentials())
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Lookup { ref hostname } if hostname == "sw1"));
    }

    #[test]
    fn collection_failure_is_fatal_by_default() {
        let store = MemoryStore::default().with_device("sw2", 9);
        let err = Reconciler::new(&store, false)
            .plan(&[target(5, "down", None), sw2()], &credentials())
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::Connector(ConnectorError::Collection(ref e)) if e.host == ip(5)
        ));
    }

    #[test]
    fn continue_on_error_skips_failing_devices() -> Result<(), anyhow::Error> {
        let store = MemoryStore::default().with_device("sw2", 9);
        let plan = Reconciler::new(&store, true).plan(
            &[target(5, "down", None), sw1(), sw2()],
            &credentials(),
        )?;

        assert_eq!(plan.skipped, [ip(5), ip(1)]);
        assert_eq!(plan.changes.devices.len(), 1);
        assert_eq!(plan.changes.devices[0].hostname, "sw2");

        Ok(())
    }

    #[test]
    fn resolve_inventory_rejects_unknown_connector() -> Result<(), anyhow::Error> {
        let config = Config::from_yaml("netbox:\n  address: http://nb\n  token: t\n", None)?;
        let registry = Registry::with_defaults();
        let mut entries = vec![
            InventoryEntry {
                ip: ip(1),
                connector: "eltex".to_string(),
            },
            InventoryEntry {
                ip: ip(2),
                connector: "juniper".to_string(),
            },
        ];

        let targets = resolve_inventory(&registry, &entries, &config)?;
        let kinds: Vec<&str> = targets.iter().map(|t| t.kind.as_str()).collect();
        assert_eq!(kinds, ["eltex", "juniper"]);

        entries.push(InventoryEntry {
            ip: ip(3),
            connector: "cisco".to_string(),
        });
        assert_eq!(
            resolve_inventory(&registry, &entries, &config).err(),
            Some(ConfigError::UnknownConnector {
                kind: "cisco".to_string(),
                ip: ip(3),
            })
        );

        Ok(())
    }

    #[test]
    fn render_json_with_four_space_indent() -> Result<(), anyhow::Error> {
        let store = MemoryStore::default().with_device("sw1", 7);
        let plan = Reconciler::new(&store, false).plan(&[sw1()], &credentials())?;

        let expected = r#"[
    {
        "hostname": "sw1",
        "create_interfaces": [
            {
                "name": "vlan1",
                "type": "virtual",
                "mode": "access",
                "enabled": true,
                "description": "uplink",
                "device": 7
            }
        ],
        "update_interfaces": []
    }
]"#;
        assert_eq!(render(&plan.changes, OutputFormat::Json)?, expected);

        let yaml = render(&plan.changes, OutputFormat::Yaml)?;
        assert!(yaml.starts_with("- hostname: sw1\n"));
        assert!(yaml.contains("name: vlan1"));

        Ok(())
    }

    #[test]
    fn output_format_names() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("yaml".parse::<OutputFormat>(), Ok(OutputFormat::Yaml));
        assert!("xml".parse::<OutputFormat>().is_err());
        assert_eq!(
            render(&FleetChangeSet::default(), OutputFormat::Json).ok().as_deref(),
            Some("[]")
        );
    }
}
