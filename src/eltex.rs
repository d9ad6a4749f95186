use std::io::Write;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use log::{debug, info};
use regex::Regex;
use ssh2::Channel;

use crate::config::ConnectorSettings;
use crate::connector::{CollectionCause, CollectionError, Collector, Connector, VendorConnector};
use crate::normalize::{
    classify_mode, classify_type, finish, NormalizeError, NormalizePolicy, Normalizer, TypeRule,
};
use crate::ssh;
use crate::types::{CanonicalInterface, Credentials, DeviceRecord, InterfaceType, RawDeviceRecord};

pub(crate) const KIND: &str = "eltex";

const DEFAULT_PORT: u16 = 22;

/// Sent before the interface query so the output is neither wrapped nor paged.
const SESSION_COMMANDS: [&str; 3] = [
    "terminal width 0",
    "terminal datadump",
    "set cli pagination off",
];
const SHOW_COMMAND: &str = "show interfaces description";

const TYPE_RULES: [TypeRule; 5] = [
    TypeRule::prefix(&["vlan"], InterfaceType::Virtual),
    TypeRule::prefix(&["l"], InterfaceType::Virtual),
    TypeRule::prefix(&["g"], InterfaceType::Gigabit),
    TypeRule::prefix(&["t"], InterfaceType::TenGigSfpp),
    TypeRule::prefix(&["p"], InterfaceType::Lag),
];

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid ANSI escape pattern")
});
static PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.+#$").expect("valid prompt pattern"));

/// One row of `show interfaces description`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EltexInterface {
    pub(crate) interface: String,
    pub(crate) port_mode: String,
    pub(crate) protocol: String,
    pub(crate) description: String,
}

pub(crate) fn connector(settings: &ConnectorSettings) -> Box<dyn Connector> {
    let policy = NormalizePolicy {
        drop_disabled_undescribed: settings.drop_disabled_undescribed.unwrap_or(true),
    };

    Box::new(VendorConnector::new(
        EltexCollector {
            port: settings.port.unwrap_or(DEFAULT_PORT),
            timeout: settings.timeout(),
        },
        EltexNormalizer::new(policy),
    ))
}

#[derive(Debug, Clone, Copy)]
pub struct EltexNormalizer {
    policy: NormalizePolicy,
}

impl EltexNormalizer {
    pub fn new(policy: NormalizePolicy) -> Self {
        EltexNormalizer { policy }
    }
}

impl Default for EltexNormalizer {
    fn default() -> Self {
        EltexNormalizer::new(NormalizePolicy {
            drop_disabled_undescribed: true,
        })
    }
}

impl Normalizer for EltexNormalizer {
    type Raw = EltexInterface;

    fn normalize(
        &self,
        raw: RawDeviceRecord<EltexInterface>,
    ) -> Result<DeviceRecord, NormalizeError> {
        let interfaces = raw
            .interfaces
            .into_iter()
            .map(|row| {
                let name = vlan_name(row.interface.trim());
                let interface_type = classify_type(&TYPE_RULES, &name, None);

                CanonicalInterface {
                    name,
                    interface_type,
                    mode: classify_mode(&row.port_mode),
                    enabled: row.protocol.trim().eq_ignore_ascii_case("up"),
                    description: Some(row.description.trim().to_string()),
                    mtu: None,
                }
            })
            .collect();

        finish(raw.hostname, interfaces, &self.policy)
    }
}

/// VLAN interfaces are listed by bare id, e.g. `100` becomes `vlan100`.
fn vlan_name(name: &str) -> String {
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("vlan{name}")
    } else {
        name.to_string()
    }
}

pub struct EltexCollector {
    port: u16,
    timeout: Duration,
}

impl Collector for EltexCollector {
    type Raw = EltexInterface;

    fn collect(
        &self,
        host: IpAddr,
        credentials: &Credentials,
    ) -> Result<RawDeviceRecord<EltexInterface>, CollectionError> {
        info!("Connect to {host}");
        let record = self
            .query(host, credentials)
            .map_err(|cause| CollectionError { host, cause })?;
        info!("Connection to {host} successfully closed");

        Ok(record)
    }
}

impl EltexCollector {
    fn query(
        &self,
        host: IpAddr,
        credentials: &Credentials,
    ) -> Result<RawDeviceRecord<EltexInterface>, CollectionCause> {
        let session = ssh::open_session(host, self.port, self.timeout, credentials)?;
        let mut channel = session.channel_session()?;
        channel.request_pty("vt100", None, None)?;
        channel.shell()?;

        let banner = read_prompt(&mut channel)?;
        let hostname = prompt_hostname(&banner)
            .ok_or_else(|| CollectionCause::Protocol("no CLI prompt received".to_string()))?;
        debug!("Logged into '{hostname}' at {host}");

        for command in SESSION_COMMANDS {
            run_command(&mut channel, command)?;
        }
        let output = run_command(&mut channel, SHOW_COMMAND)?;

        if let Err(err) = channel.close() {
            debug!("Closing channel to {host} failed: {err}");
        }

        Ok(RawDeviceRecord {
            hostname,
            interfaces: parse_interfaces_description(&output),
        })
    }
}

fn run_command(channel: &mut Channel, command: &str) -> Result<String, CollectionCause> {
    debug!("Sending '{command}'");
    channel.write_all(format!("{command}\n").as_bytes())?;

    let output = read_prompt(channel)?;
    Ok(command_output(&output, command))
}

fn read_prompt(channel: &mut Channel) -> Result<String, CollectionCause> {
    let received = ssh::read_until(channel, ends_with_prompt)?;
    Ok(String::from_utf8_lossy(&received).into_owned())
}

fn clean(output: &str) -> String {
    ANSI_ESCAPE.replace_all(output, "").replace('\r', "")
}

fn ends_with_prompt(received: &[u8]) -> bool {
    let text = clean(&String::from_utf8_lossy(received));
    text.trim_end()
        .lines()
        .last()
        .is_some_and(|line| PROMPT.is_match(line))
}

/// Hostname shown in the trailing `hostname#` prompt.
fn prompt_hostname(output: &str) -> Option<String> {
    let text = clean(output);
    let prompt = text.trim_end().lines().last()?.trim();
    let hostname = prompt.strip_suffix('#')?.trim();

    (!hostname.is_empty()).then(|| hostname.to_string())
}

/// Strip the command echo and the trailing prompt from a command's output.
fn command_output(output: &str, command: &str) -> String {
    let text = clean(output);
    let mut lines: Vec<&str> = text.trim_end().lines().collect();

    if lines.last().is_some_and(|line| PROMPT.is_match(line)) {
        lines.pop();
    }
    if lines.first().is_some_and(|line| line.trim_end().ends_with(command)) {
        lines.remove(0);
    }

    lines.join("\n")
}

/// Column a table header maps to.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Column {
    Interface,
    PortMode,
    Protocol,
    Description,
    Ignored,
}

fn header_column(index: usize, header: &str) -> Column {
    if index == 0 {
        return Column::Interface;
    }

    match header.to_lowercase().as_str() {
        "link" | "oper" | "protocol" | "link status" => Column::Protocol,
        "description" => Column::Description,
        h if h.contains("mode") => Column::PortMode,
        _ => Column::Ignored,
    }
}

fn is_separator(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && line.contains('-') && line.chars().all(|c| c == '-' || c == ' ')
}

/// Start offsets (in chars) of every dash run in a separator line.
fn column_starts(separator: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut previous = ' ';
    for (index, c) in separator.chars().enumerate() {
        if c == '-' && previous != '-' {
            starts.push(index);
        }
        previous = c;
    }
    starts
}

/// Split a fixed-width row; each cell runs up to the next column start and
/// the last one to the end of the line.
fn split_row(line: &str, starts: &[usize]) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();

    starts
        .iter()
        .enumerate()
        .map(|(index, &start)| {
            let end = starts.get(index + 1).copied().unwrap_or(chars.len());
            let start = start.min(chars.len());
            let end = end.clamp(start, chars.len());
            chars[start..end].iter().collect::<String>().trim().to_string()
        })
        .collect()
}

/// Parse every table of `show interfaces description` output.
///
/// A dashed separator line defines the columns of the header above it; rows
/// follow until a blank line or the next header. Continuation rows (empty
/// first column) are skipped.
pub(crate) fn parse_interfaces_description(output: &str) -> Vec<EltexInterface> {
    let lines: Vec<&str> = output.lines().map(|l| l.trim_end_matches('\r')).collect();
    let mut interfaces = Vec::new();

    let mut index = 1;
    while index < lines.len() {
        if !is_separator(lines[index]) {
            index += 1;
            continue;
        }

        let starts = column_starts(lines[index]);
        let columns: Vec<Column> = split_row(lines[index - 1], &starts)
            .iter()
            .enumerate()
            .map(|(i, header)| header_column(i, header))
            .collect();
        let has_protocol = columns.contains(&Column::Protocol);

        index += 1;
        while index < lines.len() && !lines[index].trim().is_empty() {
            if lines.get(index + 1).is_some_and(|next| is_separator(next)) {
                break;
            }

            let cells = split_row(lines[index], &starts);
            index += 1;

            if !has_protocol || cells.first().map_or(true, |c| c.is_empty()) {
                continue;
            }

            let mut row = EltexInterface::default();
            for (column, cell) in columns.iter().zip(cells) {
                match column {
                    Column::Interface => row.interface = cell,
                    Column::PortMode => row.port_mode = cell,
                    Column::Protocol => row.protocol = cell,
                    Column::Description => row.description = cell,
                    Column::Ignored => {}
                }
            }
            interfaces.push(row);
        }
    }

    interfaces
}
