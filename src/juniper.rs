use std::io::Write;
use std::net::IpAddr;
use std::time::Duration;

use log::{debug, info};
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event};
use quick_xml::Reader;
use ssh2::Channel;

use crate::config::ConnectorSettings;
use crate::connector::{CollectionCause, CollectionError, Collector, Connector, VendorConnector};
use crate::normalize::{
    classify_type, finish, parse_mtu, NormalizeError, NormalizePolicy, Normalizer, TypeRule,
};
use crate::ssh;
use crate::types::{CanonicalInterface, Credentials, DeviceRecord, InterfaceType, RawDeviceRecord};

pub(crate) const KIND: &str = "juniper";

const DEFAULT_PORT: u16 = 830;

/// NETCONF 1.0 end-of-message marker.
const DELIMITER: &str = "]]>]]>";
const CLIENT_HELLO: &str = r#"<?xml version="1.0" encoding="UTF-8"?><hello xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><capabilities><capability>urn:ietf:params:netconf:base:1.0</capability></capabilities></hello>"#;
const GET_SYSTEM_INFORMATION: &str = r#"<rpc message-id="1"><get-system-information/></rpc>"#;
const GET_INTERFACE_INFORMATION: &str =
    r#"<rpc message-id="2"><get-interface-information><media/></get-interface-information></rpc>"#;
const CLOSE_SESSION: &str = r#"<rpc message-id="3"><close-session/></rpc>"#;

/// Interface families worth syncing; everything else (pfe, vme, gr, ...) is internal.
const INCLUDED_PREFIXES: [&str; 8] = ["irb", "lo", "em", "re", "ge", "xe", "et", "ae"];

const PHYSICAL: &[&str] = &["ge", "xe", "et"];

const TYPE_RULES: [TypeRule; 10] = [
    TypeRule::speed(PHYSICAL, "1000mbps", InterfaceType::Gigabit),
    TypeRule::speed(PHYSICAL, "1Gbps", InterfaceType::Gigabit),
    TypeRule::speed(PHYSICAL, "10Gbps", InterfaceType::TenGigSfpp),
    TypeRule::speed(PHYSICAL, "25Gbps", InterfaceType::TwentyFiveGigSfp28),
    TypeRule::speed(PHYSICAL, "100Gbps", InterfaceType::HundredGigQsfp28),
    TypeRule::prefix(&["irb", "lo"], InterfaceType::Virtual),
    TypeRule::prefix(&["em", "re", "ge"], InterfaceType::Gigabit),
    TypeRule::prefix(&["xe"], InterfaceType::TenGigSfpp),
    TypeRule::prefix(&["et"], InterfaceType::TwentyFiveGigSfp28),
    TypeRule::prefix(&["ae"], InterfaceType::Lag),
];

/// A `physical-interface` entry of `get-interface-information`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JuniperPort {
    pub(crate) name: String,
    pub(crate) admin: String,
    pub(crate) description: Option<String>,
    pub(crate) mtu: Option<String>,
    pub(crate) speed: Option<String>,
}

impl JuniperPort {
    fn set(&mut self, field: &str, value: &str) {
        match field {
            "name" => self.name = value.to_string(),
            "admin-status" => self.admin = value.to_string(),
            "description" => self.description = Some(value.to_string()),
            "mtu" => self.mtu = Some(value.to_string()),
            "speed" => self.speed = Some(value.to_string()),
            _ => {}
        }
    }
}

pub(crate) fn connector(settings: &ConnectorSettings) -> Box<dyn Connector> {
    let policy = NormalizePolicy {
        drop_disabled_undescribed: settings.drop_disabled_undescribed.unwrap_or(false),
    };

    Box::new(VendorConnector::new(
        JuniperCollector {
            port: settings.port.unwrap_or(DEFAULT_PORT),
            timeout: settings.timeout(),
        },
        JuniperNormalizer::new(policy),
    ))
}

#[derive(Debug, Clone, Copy)]
pub struct JuniperNormalizer {
    policy: NormalizePolicy,
}

impl JuniperNormalizer {
    pub fn new(policy: NormalizePolicy) -> Self {
        JuniperNormalizer { policy }
    }
}

impl Default for JuniperNormalizer {
    fn default() -> Self {
        JuniperNormalizer::new(NormalizePolicy {
            drop_disabled_undescribed: false,
        })
    }
}

impl Normalizer for JuniperNormalizer {
    type Raw = JuniperPort;

    fn normalize(&self, raw: RawDeviceRecord<JuniperPort>) -> Result<DeviceRecord, NormalizeError> {
        let interfaces = raw
            .interfaces
            .into_iter()
            .filter(|port| {
                INCLUDED_PREFIXES
                    .iter()
                    .any(|prefix| port.name.starts_with(prefix))
            })
            .map(|port| {
                let interface_type = classify_type(&TYPE_RULES, &port.name, port.speed.as_deref());
                // No MTU for loopbacks.
                let mtu = if port.name.starts_with("lo") {
                    None
                } else {
                    parse_mtu(port.mtu.as_deref())
                };

                CanonicalInterface {
                    name: port.name,
                    interface_type,
                    mode: None,
                    enabled: port.admin.eq_ignore_ascii_case("up"),
                    description: port.description.map(|d| d.trim().to_string()),
                    mtu,
                }
            })
            .collect();

        finish(raw.hostname, interfaces, &self.policy)
    }
}

pub struct JuniperCollector {
    port: u16,
    timeout: Duration,
}

impl Collector for JuniperCollector {
    type Raw = JuniperPort;

    fn collect(
        &self,
        host: IpAddr,
        credentials: &Credentials,
    ) -> Result<RawDeviceRecord<JuniperPort>, CollectionError> {
        info!("Connect to {host}");
        let record = self
            .query(host, credentials)
            .map_err(|cause| CollectionError { host, cause })?;
        info!("Connection to {host} successfully closed");

        Ok(record)
    }
}

impl JuniperCollector {
    fn query(
        &self,
        host: IpAddr,
        credentials: &Credentials,
    ) -> Result<RawDeviceRecord<JuniperPort>, CollectionCause> {
        let session = ssh::open_session(host, self.port, self.timeout, credentials)?;
        let mut channel = session.channel_session()?;
        channel.subsystem("netconf")?;

        read_message(&mut channel)?;
        send_message(&mut channel, CLIENT_HELLO)?;

        let system = rpc(&mut channel, GET_SYSTEM_INFORMATION)?;
        let hostname = element_text(&system, "host-name")
            .map_err(CollectionCause::Protocol)?
            .ok_or_else(|| CollectionCause::Protocol("reply carries no host-name".to_string()))?;
        debug!("Logged into '{hostname}' at {host}");

        let reply = rpc(&mut channel, GET_INTERFACE_INFORMATION)?;
        let interfaces = parse_interface_information(&reply).map_err(CollectionCause::Protocol)?;

        if let Err(err) = send_message(&mut channel, CLOSE_SESSION) {
            debug!("Closing NETCONF session to {host} failed: {err}");
        }
        if let Err(err) = channel.close() {
            debug!("Closing channel to {host} failed: {err}");
        }

        Ok(RawDeviceRecord {
            hostname,
            interfaces,
        })
    }
}

fn send_message(channel: &mut Channel, message: &str) -> std::io::Result<()> {
    channel.write_all(message.as_bytes())?;
    channel.write_all(DELIMITER.as_bytes())?;
    channel.flush()
}

fn read_message(channel: &mut Channel) -> Result<String, CollectionCause> {
    let received = ssh::read_until(channel, |data| {
        data.trim_ascii_end().ends_with(DELIMITER.as_bytes())
    })?;

    Ok(strip_delimiter(&String::from_utf8_lossy(&received)))
}

fn strip_delimiter(message: &str) -> String {
    message
        .trim_end()
        .trim_end_matches(DELIMITER)
        .trim()
        .to_string()
}

fn rpc(channel: &mut Channel, request: &str) -> Result<String, CollectionCause> {
    debug!("Sending {request}");
    send_message(channel, request)?;

    let reply = read_message(channel)?;
    match rpc_error(&reply) {
        Some(message) => Err(CollectionCause::Protocol(format!("RPC failed: {message}"))),
        None => Ok(reply),
    }
}

fn rpc_error(reply: &str) -> Option<String> {
    if !reply.contains("rpc-error") {
        return None;
    }

    Some(
        element_text(reply, "error-message")
            .ok()
            .flatten()
            .unwrap_or_else(|| "unknown error".to_string()),
    )
}

/// Text behind a `&...;` reference. Unknown named entities expand to nothing.
fn reference_text(reference: &BytesRef) -> Result<String, String> {
    if let Some(c) = reference
        .resolve_char_ref()
        .map_err(|err| format!("invalid character reference: {err}"))?
    {
        return Ok(c.to_string());
    }

    let name = reference.decode().map_err(|err| err.to_string())?;
    Ok(resolve_predefined_entity(&name)
        .unwrap_or_default()
        .to_string())
}

/// Trimmed text of the first `tag` element, ignoring namespaces.
fn element_text(xml: &str, tag: &str) -> Result<Option<String>, String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == tag.as_bytes() => inside = true,
            Ok(Event::Text(t)) if inside => text.push_str(&String::from_utf8_lossy(&t)),
            Ok(Event::GeneralRef(r)) if inside => text.push_str(&reference_text(&r)?),
            Ok(Event::End(e)) if inside && e.local_name().as_ref() == tag.as_bytes() => {
                return Ok(Some(text.trim().to_string()));
            }
            Ok(Event::Eof) => return Ok(None),
            Err(err) => {
                return Err(format!(
                    "invalid XML at position {}: {err}",
                    reader.buffer_position()
                ))
            }
            _ => {}
        }
    }
}

/// Collect the direct children of every `physical-interface`; nested
/// `logical-interface` entries are ignored.
pub(crate) fn parse_interface_information(xml: &str) -> Result<Vec<JuniperPort>, String> {
    const PORT: &str = "physical-interface";

    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut current: Option<JuniperPort> = None;
    let mut ports = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == PORT {
                    current = Some(JuniperPort::default());
                }
                path.push(name);
                text.clear();
            }
            Ok(Event::Empty(e)) => {
                if path.last().is_some_and(|p| p == PORT) {
                    if let Some(port) = current.as_mut() {
                        port.set(&String::from_utf8_lossy(e.local_name().as_ref()), "");
                    }
                }
            }
            Ok(Event::Text(t)) => text.push_str(&String::from_utf8_lossy(&t)),
            Ok(Event::CData(t)) => text.push_str(&String::from_utf8_lossy(&t)),
            Ok(Event::GeneralRef(r)) => text.push_str(&reference_text(&r)?),
            Ok(Event::End(_)) => {
                let name = path.pop().unwrap_or_default();
                if name == PORT {
                    ports.extend(current.take());
                } else if path.last().is_some_and(|p| p == PORT) {
                    if let Some(port) = current.as_mut() {
                        port.set(&name, text.trim());
                    }
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(format!(
                    "invalid XML at position {}: {err}",
                    reader.buffer_position()
                ))
            }
            _ => {}
        }
    }

    Ok(ports)
}
