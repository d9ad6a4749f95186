use std::io::{self, BufRead, Write};

use anyhow::Context;
use log::{debug, error, info, LevelFilter};

use config::{read_inventory, Config};
use connector::Registry;
use netbox::NetboxClient;
use reconcile::{render, resolve_inventory, OutputFormat, Reconciler};
use types::Credentials;

mod config;
mod connector;
mod diff;
mod eltex;
mod juniper;
mod netbox;
mod normalize;
mod reconcile;
mod ssh;
mod store;
mod types;

const APP_NAME: &str = "nbi";

const SUB_CMD_DIFF: &str = "diff";
const SUB_CMD_SYNC: &str = "sync";

const USERNAME_ENV: &str = "NBI_USERNAME";
const PASSWORD_ENV: &str = "NBI_PASSWORD";

fn common_args(cmd: clap::Command) -> clap::Command {
    cmd.arg(
        clap::Arg::new("CONFIG")
            .long("config")
            .default_value("nbi.yaml")
            .help("YAML file with the NetBox connection and connector settings"),
    )
    .arg(
        clap::Arg::new("INVENTORY")
            .long("inventory")
            .default_value("inventory.csv")
            .help("CSV file listing devices as 'ip,connector' rows"),
    )
    .arg(
        clap::Arg::new("USERNAME")
            .long("username")
            .help("Device login (falls back to NBI_USERNAME, then a prompt)"),
    )
    .arg(
        clap::Arg::new("FORMAT")
            .long("format")
            .default_value("json")
            .value_parser(["json", "yaml"])
            .help("Rendering of the change set"),
    )
    .arg(
        clap::Arg::new("LOG-LEVEL")
            .long("log-level")
            .value_parser(["error", "warn", "info", "debug", "trace"])
            .help("Log level, overrides the config file [default: warn]"),
    )
    .arg(
        clap::Arg::new("VERBOSE")
            .long("verbose")
            .action(clap::ArgAction::SetTrue)
            .help("Enables DEBUG log level"),
    )
}

fn main() {
    let app = clap::Command::new(APP_NAME)
        .version(clap::crate_version!())
        .about("Reconcile device interfaces with NetBox")
        .subcommand_required(true)
        .subcommand(common_args(
            clap::Command::new(SUB_CMD_DIFF)
                .about("Show the interface changes NetBox needs, without writing them"),
        ))
        .subcommand(common_args(
            clap::Command::new(SUB_CMD_SYNC)
                .about("Show the interface changes and apply them to NetBox after confirmation")
                .arg(
                    clap::Arg::new("YES")
                        .long("yes")
                        .action(clap::ArgAction::SetTrue)
                        .help("Apply without asking for confirmation"),
                ),
        ));

    let matches = app.get_matches();

    let (cmd, apply) = match matches.subcommand() {
        Some((SUB_CMD_DIFF, cmd)) => (cmd, false),
        Some((SUB_CMD_SYNC, cmd)) => (cmd, true),
        _ => unreachable!("Unrecognized subcommand"),
    };

    if let Err(err) = run(cmd, apply) {
        error!("Reconciliation failed: {err:#}");
        std::process::exit(1)
    }
}

fn run(cmd: &clap::ArgMatches, apply: bool) -> Result<(), anyhow::Error> {
    let config_path = cmd
        .get_one::<String>("CONFIG")
        .expect("--config has a default");
    let inventory_path = cmd
        .get_one::<String>("INVENTORY")
        .expect("--inventory has a default");
    let format: OutputFormat = cmd
        .get_one::<String>("FORMAT")
        .expect("--format has a default")
        .parse()
        .map_err(anyhow::Error::msg)?;

    // A broken config is still reported, at the command line log level.
    let config = Config::load(config_path);
    setup_logger(cmd, config.as_ref().ok().and_then(Config::log_level));
    let config = config?;

    let registry = Registry::with_defaults();
    debug!(
        "Known connectors: {}",
        registry.kinds().collect::<Vec<_>>().join(", ")
    );
    let inventory = read_inventory(inventory_path)?;
    let targets = resolve_inventory(&registry, &inventory, &config)?;
    info!("Loaded {} devices from {inventory_path}", targets.len());

    let mut terminal = Stdio;
    let credentials = credentials(
        cmd.get_one::<String>("USERNAME"),
        |name| std::env::var(name).ok(),
        &mut terminal,
    )?;
    let store = NetboxClient::new(&config.netbox).context("Creating NetBox client")?;
    let reconciler = Reconciler::new(&store, config.continue_on_error);

    let plan = reconciler.plan(&targets, &credentials)?;
    let (creates, updates) = plan.changes.counts();
    info!("{creates} interfaces to create, {updates} to update");
    println!("Actions: {}", render(&plan.changes, format)?);
    if !plan.skipped.is_empty() {
        let skipped: Vec<String> = plan.skipped.iter().map(ToString::to_string).collect();
        println!("Skipped: {}", skipped.join(", "));
    }

    if !apply {
        return Ok(());
    }
    if plan.changes.is_empty() {
        println!("Nothing to do");
        return Ok(());
    }

    let assume_yes = cmd.get_flag("YES");
    let report = reconciler.apply_if_confirmed(&plan.changes, |_| {
        assume_yes || confirm(&mut terminal, "Add interfaces to Netbox? Y/N: ")
    });
    match report {
        Some(report) => println!("{report}"),
        None => println!("Aborted"),
    }

    Ok(())
}

fn setup_logger(matches: &clap::ArgMatches, configured: Option<LevelFilter>) {
    let level = if matches.get_flag("VERBOSE") {
        LevelFilter::Debug
    } else {
        matches
            .get_one::<String>("LOG-LEVEL")
            .and_then(|level| level.parse().ok())
            .or(configured)
            .unwrap_or(LevelFilter::Warn)
    };

    let mut log_builder = env_logger::Builder::new();
    log_builder.filter(None, level);
    log_builder.init();
}

/// Interactive input used when neither flags nor environment provide a value.
trait Terminal {
    fn read_line(&mut self, message: &str) -> io::Result<String>;

    /// Like `read_line`, without echoing the input.
    fn read_password(&mut self, message: &str) -> io::Result<String>;
}

struct Stdio;

impl Terminal for Stdio {
    fn read_line(&mut self, message: &str) -> io::Result<String> {
        print!("{message}");
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_password(&mut self, message: &str) -> io::Result<String> {
        rpassword::prompt_password(message)
    }
}

fn credentials<E, T>(
    username: Option<&String>,
    env: E,
    terminal: &mut T,
) -> Result<Credentials, anyhow::Error>
where
    E: Fn(&str) -> Option<String>,
    T: Terminal,
{
    let username = match username {
        Some(username) => username.clone(),
        None => match env(USERNAME_ENV).filter(|u| !u.is_empty()) {
            Some(username) => username,
            None => terminal.read_line("login: ").context("Reading login")?,
        },
    };
    let password = match env(PASSWORD_ENV).filter(|p| !p.is_empty()) {
        Some(password) => password,
        None => terminal
            .read_password("password: ")
            .context("Reading password")?,
    };

    Ok(Credentials { username, password })
}

fn confirm(terminal: &mut impl Terminal, message: &str) -> bool {
    terminal
        .read_line(message)
        .is_ok_and(|answer| answer.trim().eq_ignore_ascii_case("y"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;

    use crate::{confirm, credentials, Terminal, PASSWORD_ENV, USERNAME_ENV};

    /// Replays canned answers and records which prompts were shown.
    #[derive(Default)]
    struct ScriptedTerminal {
        answers: Vec<String>,
        lines: Vec<String>,
        passwords: Vec<String>,
    }

    impl ScriptedTerminal {
        fn answering(answers: &[&str]) -> Self {
            ScriptedTerminal {
                answers: answers.iter().rev().map(|a| a.to_string()).collect(),
                ..Default::default()
            }
        }

        fn next(&mut self) -> io::Result<String> {
            self.answers
                .pop()
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
        }
    }

    impl Terminal for ScriptedTerminal {
        fn read_line(&mut self, message: &str) -> io::Result<String> {
            self.lines.push(message.to_string());
            self.next()
        }

        fn read_password(&mut self, message: &str) -> io::Result<String> {
            self.passwords.push(message.to_string());
            self.next()
        }
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn password_prompt_does_not_echo() -> Result<(), anyhow::Error> {
        let mut terminal = ScriptedTerminal::answering(&["admin", "secret"]);

        let prompted = credentials(None, env(&[]), &mut terminal)?;

        assert_eq!(prompted.username, "admin");
        assert_eq!(prompted.password, "secret");
        assert_eq!(terminal.lines, ["login: "]);
        assert_eq!(terminal.passwords, ["password: "]);

        Ok(())
    }

    #[test]
    fn flag_and_environment_skip_prompts() -> Result<(), anyhow::Error> {
        let mut terminal = ScriptedTerminal::default();
        let flag = "netops".to_string();

        let from_flag = credentials(
            Some(&flag),
            env(&[(USERNAME_ENV, "ignored"), (PASSWORD_ENV, "secret")]),
            &mut terminal,
        )?;
        assert_eq!(from_flag.username, "netops");
        assert_eq!(from_flag.password, "secret");

        let from_env = credentials(
            None,
            env(&[(USERNAME_ENV, "operator"), (PASSWORD_ENV, "secret")]),
            &mut terminal,
        )?;
        assert_eq!(from_env.username, "operator");

        assert!(terminal.lines.is_empty());
        assert!(terminal.passwords.is_empty());

        Ok(())
    }

    #[test]
    fn confirmation_accepts_only_yes() {
        let mut terminal = ScriptedTerminal::answering(&["Y", " y ", "n", "yes"]);

        assert!(confirm(&mut terminal, "Apply? "));
        assert!(confirm(&mut terminal, "Apply? "));
        assert!(!confirm(&mut terminal, "Apply? "));
        assert!(!confirm(&mut terminal, "Apply? "));
        assert!(!confirm(&mut terminal, "Apply? "));
    }
}
