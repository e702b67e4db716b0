// Copyright (c) 2026 Meshsim
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! System controller utility (spec.md §4.8/§6): joins the mesh, publishes
//! the `WorkflowConfiguration` naming the required participants, tracks
//! system state as participants report in, and issues cluster-wide or
//! per-participant commands read from stdin.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use meshsim::config::{HttpConfig, LoggerConfig, NodeConfig, RegistryEndpoint};
use meshsim::ids::participant_id;
use meshsim::monitor::{ParticipantStatus as MonitorStatus, SystemController, SystemMonitor};
use meshsim::monitoring::{http, Metrics};
use meshsim::networking::{ConnectionEvent, ConnectionManager, ReceiverKey, CONTROL_MSG_TYPE, CONTROL_NETWORK};
use meshsim::wire::{Acceptor, CommandKind, ControlMessage, EndpointAddress, PeerInfo, ProtocolVersion, WorkflowConfiguration};

/// Issues cluster-wide and per-participant lifecycle commands and tracks
/// the aggregate system state of a running mesh.
#[derive(Parser, Debug)]
#[command(name = "meshsim-systemctl", version, about)]
struct Args {
    /// Registry URI to connect to.
    #[arg(long, default_value = "silkit://localhost:8500")]
    connect_uri: String,

    /// This controller's own participant name.
    #[arg(long, default_value = "SystemController")]
    name: String,

    /// Optional `.yaml`/`.yml`/`.json`/`.toml` configuration file; only
    /// `middleware.registryUri`, `healthCheck.*`, and `logger.*` are
    /// consulted (spec.md §6).
    #[arg(long)]
    configuration: Option<String>,

    /// Names of the participants required for the system to reach
    /// `Running` (the workflow configuration this controller publishes).
    #[arg(required = true)]
    participants: Vec<String>,
}

enum PendingLink {
    Outbound(String, TcpStream),
    Inbound(TcpStream),
}

/// Dial one peer's first acceptor in the background and hand the resulting
/// stream back to the main loop via `link_tx`.
fn spawn_peer_dial(peer: PeerInfo, link_tx: mpsc::UnboundedSender<PendingLink>) {
    let Some(peer_acceptor) = peer.acceptors.first() else {
        tracing::warn!(peer = %peer.name, "peer advertised no acceptors, will rely on relay");
        return;
    };
    let addr = format!("{}:{}", peer_acceptor.host, peer_acceptor.port);
    let peer_name = peer.name.clone();
    tokio::spawn(async move {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let _ = link_tx.send(PendingLink::Outbound(peer_name, stream));
            }
            Err(e) => tracing::warn!(peer = %peer_name, error = %e, "direct connect failed, will fall back to relay"),
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut registry_uri = args.connect_uri.clone();
    let mut logger = LoggerConfig::default();

    if let Some(path) = &args.configuration {
        let cfg = match NodeConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return ExitCode::from(2);
            }
        };
        registry_uri = cfg.middleware.registry_uri;
        logger = cfg.logger;
    }

    let endpoint = match RegistryEndpoint::parse(&registry_uri) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("invalid --connect-uri: {e}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(&logger.level)).with_target(false).init();

    let metrics = match Metrics::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialise metrics");
            return ExitCode::from(3);
        }
    };
    let http_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve(&HttpConfig::default(), http_metrics).await {
            tracing::error!(error = %e, "HTTP observability surface exited");
        }
    });

    if let Err(e) = run(endpoint, args.name, args.participants, metrics).await {
        tracing::error!(error = %e, "systemctl exited with an error");
        return ExitCode::from(3);
    }
    ExitCode::SUCCESS
}

async fn run(endpoint: RegistryEndpoint, name: String, required: Vec<String>, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    let id = participant_id(&name);
    tracing::info!(controller = %name, id, "starting");

    let acceptor = TcpListener::bind("127.0.0.1:0").await?;
    let acceptor_addr = acceptor.local_addr()?;

    let mut conn = ConnectionManager::new(name.clone(), id);
    let control_key = ReceiverKey { network_name: CONTROL_NETWORK.into(), msg_type_name: CONTROL_MSG_TYPE.into() };
    conn.register_receiver(CONTROL_NETWORK, CONTROL_MSG_TYPE);

    let acceptors = vec![Acceptor { host: acceptor_addr.ip().to_string(), port: acceptor_addr.port() }];
    let known_peers = match endpoint {
        RegistryEndpoint::Tcp(host_port) => {
            let stream = TcpStream::connect(&host_port).await?;
            conn.join_registry(stream, acceptors).await?
        }
        #[cfg(unix)]
        RegistryEndpoint::Local(path) => {
            let stream = tokio::net::UnixStream::connect(&path).await?;
            conn.join_registry(stream, acceptors).await?
        }
        #[cfg(not(unix))]
        RegistryEndpoint::Local(path) => {
            return Err(anyhow::anyhow!("local:// endpoints ({path}) require a unix target"));
        }
    };

    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<PendingLink>();
    for peer in &known_peers {
        spawn_peer_dial(peer.clone(), link_tx.clone());
    }
    {
        let link_tx = link_tx.clone();
        tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok((stream, _addr)) => {
                        let _ = link_tx.send(PendingLink::Inbound(stream));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "peer-link acceptor error");
                        break;
                    }
                }
            }
        });
    }

    let mut monitor = SystemMonitor::new();
    monitor.set_required_participants(required.clone());
    monitor.on_system_state_change(|state| tracing::info!(system_state = %state, "system state changed"));

    let wf = ControlMessage::WorkflowConfiguration(WorkflowConfiguration { names: required });
    let from = EndpointAddress { participant: id, endpoint: 1 };
    conn.send_broadcast(from, &control_key, wf.to_payload(ProtocolVersion::CURRENT));

    print_help();
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shutdown_signal = std::pin::pin!(tokio::signal::ctrl_c());
    let mut stdin_closed = false;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_signal => {
                tracing::info!("ctrl-c received, exiting");
                break;
            }

            Some(pending) = link_rx.recv() => {
                let established = match pending {
                    PendingLink::Outbound(peer_name, stream) => conn.establish_link(&peer_name, stream).await.map(|_| peer_name),
                    PendingLink::Inbound(stream) => conn.accept_link(stream).await,
                };
                match established {
                    Ok(peer_name) => {
                        tracing::info!(peer = %peer_name, "peer-link established");
                        metrics.peers_connected.set(conn.peer_count() as i64);
                    }
                    Err(e) => tracing::warn!(error = %e, "peer-link handshake failed"),
                }
            }

            event = conn.next_event() => {
                match event {
                    Some(ConnectionEvent::Message(msg)) if msg.receiver_idx == 1 => {
                        if let Ok(ControlMessage::ParticipantStatus(status)) = ControlMessage::from_payload(ProtocolVersion::CURRENT, &msg.payload) {
                            monitor.receive_participant_status(
                                &status.name,
                                MonitorStatus {
                                    state: state_from_wire(status.state),
                                    reason: status.reason,
                                    enter_time: status.enter_time,
                                    refresh_time: status.refresh_time,
                                },
                            );
                            metrics.system_state_changes_total.inc();
                        }
                    }
                    Some(ConnectionEvent::Message(_)) | Some(ConnectionEvent::ServiceAnnouncement(_, _)) => {}
                    Some(ConnectionEvent::PeerLost(peer)) => {
                        tracing::warn!(peer = %peer, "peer lost");
                        conn.mark_relay_only(peer);
                        metrics.peer_lost_total.inc();
                    }
                    Some(ConnectionEvent::KnownParticipantsUpdated(peers)) => {
                        for peer in peers {
                            if peer.name == name || conn.peer_names().any(|p| p == peer.name) {
                                continue;
                            }
                            tracing::info!(peer = %peer.name, "newly-joined peer discovered, dialing");
                            spawn_peer_dial(peer, link_tx.clone());
                        }
                    }
                    None => break,
                }
            }

            line = stdin_lines.next_line(), if !stdin_closed => {
                match line {
                    Ok(Some(line)) => {
                        if !dispatch_command(&line, &mut conn, &monitor) {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("stdin closed, no further commands can be issued");
                        stdin_closed = true;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading stdin");
                        stdin_closed = true;
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_help() {
    println!("meshsim-systemctl ready. Commands: run | stop | pause | continue | shutdown | restart | abort");
    println!("                          participant <name> <run|stop|pause|continue|shutdown|restart|abort>");
    println!("                          status | quit");
}

/// Parses and applies one stdin command line. Returns `false` to request
/// the controller exit (e.g. `quit`).
fn dispatch_command(line: &str, conn: &mut ConnectionManager, monitor: &SystemMonitor) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["quit"] | ["exit"] => return false,
        ["status"] => {
            println!("system state: {}", monitor.system_state());
            for name in monitor.required_participants() {
                match monitor.participant_status(name) {
                    Some(s) => println!("  {name}: {}", s.state),
                    None => println!("  {name}: (not yet reported)"),
                }
            }
        }
        [cmd] => match command_kind(cmd) {
            Some(kind) => {
                SystemController::new(conn).system_command(kind);
            }
            None => eprintln!("unrecognised command: {cmd}"),
        },
        ["participant", name, cmd] => match command_kind(cmd) {
            Some(kind) => {
                let target = participant_id(name);
                SystemController::new(conn).participant_command(target, kind);
            }
            None => eprintln!("unrecognised command: {cmd}"),
        },
        _ => eprintln!("unrecognised input: {line:?}"),
    }
    true
}

fn command_kind(s: &str) -> Option<CommandKind> {
    Some(match s {
        "run" => CommandKind::Run,
        "stop" => CommandKind::Stop,
        "pause" => CommandKind::Pause,
        "continue" => CommandKind::Continue,
        "shutdown" => CommandKind::Shutdown,
        "restart" => CommandKind::Restart,
        "abort" => CommandKind::AbortSimulation,
        _ => return None,
    })
}

fn state_from_wire(tag: u8) -> meshsim::lifecycle::ParticipantState {
    use meshsim::lifecycle::ParticipantState::*;
    match tag {
        0 => Invalid,
        1 => ServicesCreated,
        2 => CommunicationInitializing,
        3 => CommunicationInitialized,
        4 => ReadyToRun,
        5 => Running,
        6 => Paused,
        7 => Stopping,
        8 => Stopped,
        9 => ShuttingDown,
        10 => Shutdown,
        11 => Error,
        _ => Aborting,
    }
}
