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

//! Example/test participant harness (spec.md §4.4/§4.7/§4.9): joins the
//! registry, establishes the mesh, drives the lifecycle state graph, and
//! (if `participant.isSynchronized`) steps virtual time. This binary has
//! no bus controllers of its own; it exists to exercise and demonstrate
//! the coordination plane end to end.

use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use meshsim::config::{NodeConfig, RegistryEndpoint};
use meshsim::ids::participant_id;
use meshsim::lifecycle::{Handlers, LifecycleService, ParticipantState};
use meshsim::monitor::{ParticipantStatus as MonitorStatus, SystemMonitor};
use meshsim::monitoring::{http, Metrics};
use meshsim::networking::{
    ConnectionEvent, ConnectionManager, DataSubscriber, PublisherAnnouncement, ReceiverKey, ServiceDiscovery,
    SubscriberSpec, CONTROL_MSG_TYPE, CONTROL_NETWORK,
};
use meshsim::timesync::{TimeSyncEngine, WaitOutcome};
use meshsim::watchdog::Watchdog;
use meshsim::wire::{
    Acceptor, CommandKind, ControlMessage, EndpointAddress, Frame, NextSimTask, PeerInfo, ProtocolVersion, ServiceDescriptor,
    ServiceType,
};

/// Runs one participant: joins the registry, links up with its peers, and
/// drives its lifecycle and (if synchronised) its virtual clock.
#[derive(Parser, Debug)]
#[command(name = "meshsim-participant", version, about)]
struct Args {
    /// Path to a `.yaml`/`.yml`/`.json`/`.toml` participant configuration
    /// file (spec.md §6).
    #[arg(long)]
    configuration: String,

    /// Override `participant.name` from the configuration file.
    #[arg(long)]
    name: Option<String>,

    /// Local address the peer-link acceptor binds to.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen_addr: String,
}

fn now_ns() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

enum PendingLink {
    Outbound(String, TcpStream),
    Inbound(TcpStream),
}

/// Dial one peer's first acceptor in the background and hand the resulting
/// stream back to the main loop via `link_tx`. Connect failures are logged
/// and otherwise dropped; a peer that never answers just never links up.
fn spawn_peer_dial(peer: PeerInfo, link_tx: mpsc::UnboundedSender<PendingLink>) {
    tokio::spawn(async move {
        let Some(acceptor) = peer.acceptors.first() else {
            tracing::warn!(peer = %peer.name, "peer has no advertised acceptors, cannot dial");
            return;
        };
        let addr = format!("{}:{}", acceptor.host, acceptor.port);
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let _ = link_tx.send(PendingLink::Outbound(peer.name, stream));
            }
            Err(e) => tracing::warn!(peer = %peer.name, %addr, error = %e, "failed to dial peer"),
        }
    });
}

/// Derive a data-publisher announcement from a remote service descriptor,
/// bridging the service-discovery layer into the pub/sub matcher. Only
/// `DataPublisher` descriptors carry a topic; anything else isn't a
/// publisher and is ignored here.
fn publisher_from_descriptor(d: &ServiceDescriptor) -> Option<PublisherAnnouncement> {
    if d.service_type != ServiceType::DataPublisher {
        return None;
    }
    let topic = d.supplemental.get("topic").cloned()?;
    let media_type = d.supplemental.get("mediaType").cloned().unwrap_or_default();
    let labels = d
        .supplemental
        .iter()
        .filter(|(k, _)| k.as_str() != "topic" && k.as_str() != "mediaType")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some(PublisherAnnouncement { uuid: Uuid::from_u128(d.service_id as u128), topic, media_type, labels })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match NodeConfig::load(&args.configuration) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(name) = args.name {
        config.participant.name = name;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logger.level))
        .with_target(false)
        .init();

    if let Err(e) = run(config, &args.listen_addr).await {
        tracing::error!(error = %e, "participant exited with an error");
        return ExitCode::from(3);
    }
    ExitCode::SUCCESS
}

async fn run(config: NodeConfig, listen_addr: &str) -> anyhow::Result<()> {
    let name = config.participant.name.clone();
    let id = participant_id(&name);
    tracing::info!(participant = %name, id, "starting");

    let metrics = Arc::new(Metrics::new()?);
    let http_metrics = metrics.clone();
    let http_config = config.http.clone();
    tokio::spawn(async move {
        if let Err(e) = http::serve(&http_config, http_metrics).await {
            tracing::error!(error = %e, "HTTP observability surface exited");
        }
    });

    let acceptor = TcpListener::bind(listen_addr).await?;
    let acceptor_addr = acceptor.local_addr()?;
    tracing::info!(%acceptor_addr, "peer-link acceptor bound");

    let mut conn = ConnectionManager::new(name.clone(), id);
    let control_key = ReceiverKey { network_name: CONTROL_NETWORK.into(), msg_type_name: CONTROL_MSG_TYPE.into() };
    conn.register_receiver(CONTROL_NETWORK, CONTROL_MSG_TYPE);

    let endpoint = RegistryEndpoint::parse(&config.middleware.registry_uri)?;
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
    metrics.peers_connected.set(0);

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

    let coordinated_start = config.participant.coordinated_start;
    let coordinated_stop = config.participant.coordinated_stop;
    let handlers = Handlers::default();
    let (mut lifecycle, mut final_state_rx) = LifecycleService::new(name.clone(), coordinated_start, coordinated_stop, handlers);

    let mut monitor = SystemMonitor::new();
    monitor.set_required_participants(known_peers.iter().map(|p| p.name.clone()).chain(std::iter::once(name.clone())).collect());

    let mut sync_engine = if config.participant.is_synchronized {
        let peers: Vec<String> = known_peers.iter().map(|p| p.name.clone()).collect();
        Some(TimeSyncEngine::new(config.participant.step_duration_ns, peers))
    } else {
        None
    };

    let watchdog = Watchdog::new(&config.health_check);

    let subscribers = Arc::new(Mutex::new(
        config
            .participant
            .subscriptions
            .iter()
            .map(|s| DataSubscriber::new(SubscriberSpec { topic: s.topic.clone(), media_type: s.media_type.clone(), labels: s.labels.clone() }))
            .collect::<Vec<_>>(),
    ));
    let mut discovery = ServiceDiscovery::new();
    {
        let subscribers = subscribers.clone();
        discovery.on_event(move |event| {
            let Some(publisher) = publisher_from_descriptor(&event.descriptor) else { return };
            let mut subscribers = subscribers.lock().unwrap();
            for sub in subscribers.iter_mut() {
                if event.is_created {
                    if sub.observe_publisher(publisher.clone()).is_some() {
                        tracing::info!(topic = %publisher.topic, publisher = %publisher.uuid, "data subscriber matched publisher");
                    }
                } else if sub.remove_publisher(publisher.uuid) {
                    tracing::info!(topic = %publisher.topic, publisher = %publisher.uuid, "data subscriber lost publisher");
                }
            }
        });
    }
    let own_services = [
        ServiceDescriptor {
            participant_name: name.clone(),
            network_name: CONTROL_NETWORK.to_string(),
            service_name: "Lifecycle".to_string(),
            service_type: ServiceType::Lifecycle,
            service_id: 1,
            supplemental: Default::default(),
        },
        ServiceDescriptor {
            participant_name: name.clone(),
            network_name: CONTROL_NETWORK.to_string(),
            service_name: "SystemMonitor".to_string(),
            service_type: ServiceType::SystemMonitor,
            service_id: 2,
            supplemental: Default::default(),
        },
    ];
    for descriptor in own_services {
        discovery.local_service_created(descriptor);
    }
    if sync_engine.is_some() {
        discovery.local_service_created(ServiceDescriptor {
            participant_name: name.clone(),
            network_name: CONTROL_NETWORK.to_string(),
            service_name: "TimeSync".to_string(),
            service_type: ServiceType::TimeSync,
            service_id: 3,
            supplemental: Default::default(),
        });
    }

    lifecycle.start()?;
    lifecycle.announcements_sent()?;

    let mut status_interval = tokio::time::interval(Duration::from_secs(1));
    let mut remaining_peers = known_peers.len();
    if remaining_peers == 0 {
        lifecycle.all_peers_connected()?;
        lifecycle.wait_comm_ready().await?;
    }

    let mut shutdown_signal = std::pin::pin!(tokio::signal::ctrl_c());
    let mut shutdown_requested = false;

    loop {
        if lifecycle.state().is_terminal() {
            break;
        }
        if shutdown_requested {
            try_advance_shutdown(&mut lifecycle)?;
        }

        tokio::select! {
            biased;

            _ = &mut shutdown_signal, if !shutdown_requested => {
                tracing::info!("ctrl-c received, stopping");
                shutdown_requested = true;
                try_advance_shutdown(&mut lifecycle)?;
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
                        conn.broadcast_frame(Frame::AnnounceServices(discovery.local_announcement()));
                        remaining_peers = remaining_peers.saturating_sub(1);
                        if remaining_peers == 0 && lifecycle.state() == ParticipantState::CommunicationInitializing {
                            lifecycle.all_peers_connected()?;
                            lifecycle.wait_comm_ready().await?;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "peer-link handshake failed"),
                }
            }

            event = conn.next_event() => {
                match event {
                    Some(ConnectionEvent::Message(msg)) if msg.receiver_idx == 1 => {
                        match ControlMessage::from_payload(ProtocolVersion::CURRENT, &msg.payload) {
                            Ok(ControlMessage::SystemCommand(cmd)) => apply_command(&mut lifecycle, cmd.kind),
                            Ok(ControlMessage::ParticipantCommand(cmd)) if cmd.target == id => {
                                apply_command(&mut lifecycle, cmd.kind)
                            }
                            Ok(ControlMessage::ParticipantCommand(_)) => {}
                            Ok(ControlMessage::ParticipantStatus(status)) => {
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
                            Ok(ControlMessage::NextSimTask(task)) => {
                                if let Some(engine) = sync_engine.as_mut() {
                                    engine.receive_peer_task(&msg.from_peer, task);
                                    metrics.sync_tokens_received_total.inc();
                                }
                            }
                            Ok(ControlMessage::WorkflowConfiguration(wf)) => monitor.set_required_participants(wf.names),
                            Ok(ControlMessage::ServiceDiscoveryEvent(event)) => discovery.receive_event(&msg.from_peer, event),
                            Err(e) => tracing::warn!(error = %e, "malformed control message, dropping"),
                        }
                    }
                    Some(ConnectionEvent::Message(_)) => {}
                    Some(ConnectionEvent::ServiceAnnouncement(peer, ann)) => discovery.receive_announcement(&peer, ann),
                    Some(ConnectionEvent::PeerLost(peer)) => {
                        tracing::warn!(peer = %peer, "peer lost");
                        discovery.remove_peer(&peer);
                        conn.mark_relay_only(peer);
                        metrics.peer_lost_total.inc();
                        metrics.peers_connected.set(conn.peer_count() as i64);
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

            _ = status_interval.tick() => {
                let status = ControlMessage::ParticipantStatus(meshsim::wire::ParticipantStatus {
                    name: name.clone(),
                    state: lifecycle.state().to_wire(),
                    reason: String::new(),
                    enter_time: now_ns(),
                    refresh_time: now_ns(),
                });
                let payload = status.to_payload(ProtocolVersion::CURRENT);
                conn.send_broadcast(EndpointAddress { participant: id, endpoint: 1 }, &control_key, payload);
            }

            _ = async {}, if lifecycle.state() == ParticipantState::Running && sync_engine.is_some() => {
                let engine = sync_engine.as_mut().unwrap();
                match engine.wait_for_step().await {
                    WaitOutcome::Ready => {
                        let guard = watchdog.start_step();
                        let token = engine.advance();
                        match guard.finish() {
                            Some(meshsim::watchdog::Breach::Soft) => metrics.watchdog_soft_breaches_total.inc(),
                            Some(meshsim::watchdog::Breach::Hard) => metrics.watchdog_hard_breaches_total.inc(),
                            None => {}
                        }
                        metrics.sync_virtual_time_ns.set(engine.now());
                        broadcast_token(&conn, &control_key, id, token, &metrics);
                    }
                    WaitOutcome::Aborted => {}
                }
            }
        }
    }

    if let Ok(final_state) = final_state_rx.try_recv() {
        tracing::info!(final_state = %final_state, "lifecycle future resolved");
    }
    Ok(())
}

/// Drives a requested-but-not-yet-reachable shutdown forward once the
/// lifecycle state allows it. A no-op while still initialising.
fn try_advance_shutdown(lifecycle: &mut LifecycleService) -> anyhow::Result<()> {
    if lifecycle.state() == ParticipantState::Running || lifecycle.state() == ParticipantState::Paused {
        lifecycle.stop()?;
    }
    if lifecycle.state() == ParticipantState::Stopped {
        lifecycle.shutdown()?;
    }
    Ok(())
}

fn broadcast_token(conn: &ConnectionManager, key: &ReceiverKey, id: u64, token: NextSimTask, metrics: &Metrics) {
    let msg = ControlMessage::NextSimTask(token);
    let payload = msg.to_payload(ProtocolVersion::CURRENT);
    conn.send_broadcast(EndpointAddress { participant: id, endpoint: 1 }, key, payload);
    metrics.sync_tokens_sent_total.inc();
}

/// Applies one cluster command. Rejected (invalid) transitions are logged
/// and counted (spec.md §7) rather than treated as fatal: a stray `Run`
/// racing an uncoordinated self-start is expected, not an error.
fn apply_command(lifecycle: &mut LifecycleService, kind: CommandKind) {
    let result = match kind {
        CommandKind::Run => lifecycle.run().map(|_| ()).map_err(|e| e.to_string()),
        CommandKind::Pause => lifecycle.pause().map(|_| ()).map_err(|e| e.to_string()),
        CommandKind::Continue => lifecycle.continue_().map(|_| ()).map_err(|e| e.to_string()),
        CommandKind::Stop => lifecycle.stop().map(|_| ()).map_err(|e| e.to_string()),
        CommandKind::Shutdown => lifecycle.shutdown().map(|_| ()).map_err(|e| e.to_string()),
        CommandKind::Restart => lifecycle.restart().map(|_| ()).map_err(|e| e.to_string()),
        CommandKind::AbortSimulation => lifecycle.abort().map(|_| ()).map_err(|e| e.to_string()),
    };
    if let Err(reason) = result {
        tracing::warn!(command = ?kind, error = %reason, "command rejected by lifecycle state graph");
    }
}

fn state_from_wire(tag: u8) -> ParticipantState {
    use ParticipantState::*;
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
