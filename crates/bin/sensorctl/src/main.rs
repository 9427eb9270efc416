//! # sensorctl: control client for sensord
//!
//! Talks to the daemon over its control socket: runs device commands,
//! queries status, switches reading on and off, and streams events.
//!
//! Every request goes to the whole device group unless `--name` picks one
//! sensor. The exit status is non-zero when any addressed sensor did not
//! confirm its command.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sensord_adapter_ipc::IpcClient;
use sensord_domain::command::{Command, CommandKind, CommandResult};
use sensord_domain::error::ValidationError;
use sensord_domain::sensor::{SensorKind, SensorStatus};

/// Length of one latency unit.
const LATENCY_UNIT_MS: u32 = 25;

#[derive(Debug, Parser)]
#[command(name = "sensorctl", version, about = "Control a running sensord daemon")]
struct Cli {
    /// Path of the daemon's control socket.
    #[arg(long, env = "SENSORD_SOCKET", default_value = "/run/sensord/api.sock")]
    socket: PathBuf,
    #[command(subcommand)]
    group: Group,
}

#[derive(Debug, Subcommand)]
enum Group {
    /// SEN0395 mmWave presence radars.
    Sen0395 {
        /// Address one sensor instead of the whole group.
        #[arg(long, global = true)]
        name: Option<String>,
        #[command(subcommand)]
        action: RadarAction,
    },
    /// SEN0311 ultrasonic distance sensors.
    Sen0311 {
        /// Address one sensor instead of the whole group.
        #[arg(long, global = true)]
        name: Option<String>,
        #[command(subcommand)]
        action: DistanceAction,
    },
    /// Print events as they are published, until interrupted.
    Events,
    /// Check that the daemon answers.
    Ping,
}

#[derive(Debug, Subcommand)]
enum RadarAction {
    /// Start scanning.
    Start,
    /// Stop scanning.
    Stop,
    /// Reboot the device.
    Reset,
    /// Detection and disappearance delays, in 25 ms units.
    Latency { detection: i64, disappearance: i64 },
    /// Detection range as start/end pairs, in 15 cm units.
    Detrange {
        #[arg(required = true, num_args = 2..)]
        bounds: Vec<i64>,
    },
    /// Sensitivity level from 0 to 9.
    Sensitivity { level: i64 },
    /// Show the daemon's view of the sensors.
    Status,
    /// Process samples again.
    Enable,
    /// Ignore samples.
    Disable,
}

impl RadarAction {
    fn command(&self) -> Result<Command, ValidationError> {
        let (kind, args) = match self {
            Self::Start => (CommandKind::Start, Vec::new()),
            Self::Stop => (CommandKind::Stop, Vec::new()),
            Self::Reset => (CommandKind::Reset, Vec::new()),
            Self::Latency {
                detection,
                disappearance,
            } => (CommandKind::ConfigureLatency, vec![*detection, *disappearance]),
            Self::Detrange { bounds } => (CommandKind::ConfigureRange, bounds.clone()),
            Self::Sensitivity { level } => (CommandKind::ConfigureSensitivity, vec![*level]),
            Self::Status => (CommandKind::QueryStatus, Vec::new()),
            Self::Enable => (CommandKind::Enable, Vec::new()),
            Self::Disable => (CommandKind::Disable, Vec::new()),
        };
        Command::from_args(kind, &args)
    }
}

#[derive(Debug, Subcommand)]
enum DistanceAction {
    /// Show the daemon's view of the sensors.
    Status,
    /// Process samples again.
    Enable,
    /// Ignore samples.
    Disable,
}

impl DistanceAction {
    fn command(&self) -> Command {
        match self {
            Self::Status => Command::Status,
            Self::Enable => Command::Enable,
            Self::Disable => Command::Disable,
        }
    }
}

#[derive(Debug, Default, PartialEq, Serialize)]
struct Params {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<CommandKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Results {
    results: Vec<CommandResult>,
}

#[derive(Debug, Deserialize)]
struct Statuses {
    statuses: Vec<SensorStatus>,
}

/// Method name and params that apply `command` to a device group.
fn request(kind: SensorKind, name: Option<String>, command: &Command) -> (String, Params) {
    let (action, params) = match command {
        Command::Status => (
            "status",
            Params {
                name,
                ..Params::default()
            },
        ),
        Command::Enable | Command::Disable => (
            "reading",
            Params {
                name,
                enabled: Some(*command == Command::Enable),
                ..Params::default()
            },
        ),
        _ => (
            if command.is_config() {
                "configure"
            } else {
                "command"
            },
            Params {
                name,
                command: Some(command.kind()),
                args: command.args(),
                ..Params::default()
            },
        ),
    };
    (format!("{kind}.{action}"), params)
}

/// Human units of a configuration command, echoed before it is sent.
fn describe(command: &Command) -> Option<String> {
    match command {
        Command::Latency {
            detection,
            disappearance,
        } => Some(format!(
            "latency: detection {} ms, disappearance {} ms",
            u32::from(*detection) * LATENCY_UNIT_MS,
            u32::from(*disappearance) * LATENCY_UNIT_MS,
        )),
        Command::DetectionRange(segments) => {
            let ranges: Vec<String> = segments
                .iter()
                .map(|segment| {
                    let (start, end) = segment.as_cm();
                    format!("{start}-{end} cm")
                })
                .collect();
            Some(format!("detection range: {}", ranges.join(", ")))
        }
        _ => None,
    }
}

async fn run(
    mut client: IpcClient,
    kind: SensorKind,
    name: Option<String>,
    command: &Command,
) -> anyhow::Result<()> {
    if let Some(text) = describe(command) {
        println!("{text}");
    }
    let (method, params) = request(kind, name, command);
    let result = client.call(&method, serde_json::to_value(&params)?).await?;

    if command.is_local() {
        let Statuses { statuses } = serde_json::from_value(result)?;
        for status in &statuses {
            print_status(status);
        }
        return Ok(());
    }

    let Results { results } = serde_json::from_value(result)?;
    for result in &results {
        println!("{}: {}", result.sensor_id, result.outcome);
        for line in result.outcome.lines() {
            println!("    {line}");
        }
    }
    let failed = results
        .iter()
        .filter(|result| !result.outcome.is_confirmed())
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} sensors did not confirm {command}", results.len());
    }
    Ok(())
}

fn print_status(status: &SensorStatus) {
    let mut line = format!(
        "{}: {} enabled={} presence={}",
        status.sensor_id, status.lifecycle, status.enabled, status.presence
    );
    if let Some(distance) = status.distance_cm {
        line.push_str(&format!(" distance={distance:.1}cm"));
    }
    if let Some(pending) = status.pending_command {
        line.push_str(&format!(" pending={pending}"));
    }
    println!("{line}");
}

async fn stream_events(client: IpcClient) -> anyhow::Result<()> {
    let mut events = client.subscribe().await?;
    loop {
        tokio::select! {
            event = events.next_event() => match event? {
                Some(event) => println!("{}", event.to_json()?),
                None => return Ok(()),
            },
            interrupted = tokio::signal::ctrl_c() => {
                interrupted?;
                return Ok(());
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut client = IpcClient::connect(&cli.socket)
        .await
        .with_context(|| format!("is sensord running on {}?", cli.socket.display()))?;

    match cli.group {
        Group::Ping => {
            client.call("ping", Value::Null).await?;
            println!("pong");
            Ok(())
        }
        Group::Events => stream_events(client).await,
        Group::Sen0395 { name, action } => {
            let command = action.command()?;
            run(client, SensorKind::Sen0395, name, &command).await
        }
        Group::Sen0311 { name, action } => {
            run(client, SensorKind::Sen0311, name, &action.command()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sensorctl").chain(args.iter().copied())).unwrap()
    }

    fn radar(cli: Cli) -> (Option<String>, Command) {
        match cli.group {
            Group::Sen0395 { name, action } => (name, action.command().unwrap()),
            other => panic!("unexpected group {other:?}"),
        }
    }

    #[test]
    fn should_route_start_to_command_method() {
        let (name, command) = radar(parse(&["sen0395", "start"]));
        let (method, params) = request(SensorKind::Sen0395, name, &command);
        assert_eq!(method, "sen0395.command");
        assert_eq!(serde_json::to_value(&params).unwrap(), json!({"command": "start"}));
    }

    #[test]
    fn should_route_latency_to_configure_with_name() {
        let (name, command) = radar(parse(&["sen0395", "latency", "4", "8", "--name", "desk"]));
        let (method, params) = request(SensorKind::Sen0395, name, &command);
        assert_eq!(method, "sen0395.configure");
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"name": "desk", "command": "latency", "args": [4, 8]})
        );
        assert_eq!(
            describe(&command).unwrap(),
            "latency: detection 100 ms, disappearance 200 ms"
        );
    }

    #[test]
    fn should_describe_detection_range_in_centimetres() {
        let (_, command) = radar(parse(&["sen0395", "detrange", "0", "10", "20", "30"]));
        assert_eq!(
            describe(&command).unwrap(),
            "detection range: 0-150 cm, 300-450 cm"
        );
    }

    #[test]
    fn should_route_reading_toggle() {
        let cli = parse(&["sen0311", "disable", "--name", "hall"]);
        let Group::Sen0311 { name, action } = cli.group else {
            panic!("unexpected group");
        };
        let (method, params) = request(SensorKind::Sen0311, name, &action.command());
        assert_eq!(method, "sen0311.reading");
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"name": "hall", "enabled": false})
        );
    }

    #[test]
    fn should_route_status_without_command() {
        let (name, command) = radar(parse(&["sen0395", "status"]));
        let (method, params) = request(SensorKind::Sen0395, name, &command);
        assert_eq!(method, "sen0395.status");
        assert_eq!(params, Params::default());
    }

    #[test]
    fn should_reject_out_of_range_sensitivity() {
        let cli = parse(&["sen0395", "sensitivity", "12"]);
        let Group::Sen0395 { action, .. } = cli.group else {
            panic!("unexpected group");
        };
        assert!(action.command().is_err());
    }

    #[test]
    fn should_reject_unknown_distance_action() {
        assert!(Cli::try_parse_from(["sensorctl", "sen0311", "start"]).is_err());
    }

    #[test]
    fn should_override_socket_path() {
        let cli = parse(&["--socket", "/tmp/sensord.sock", "ping"]);
        assert_eq!(cli.socket, PathBuf::from("/tmp/sensord.sock"));
        assert!(matches!(cli.group, Group::Ping));
    }
}
