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

//! Per-participant connection manager (spec.md §4.4): joins the registry,
//! establishes direct peer-links, maintains each link's receiver index
//! table, and dispatches inbound messages.
//!
//! Index 0 is reserved and never assigned to a real receiver, mirroring the
//! registry message-kind convention of reserving `Invalid = 0`.

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::monitor::ControlSender;
use crate::wire::{
    Acceptor, CommandKind, ControlMessage, EndpointAddress, Frame, FrameCodec, KnownParticipants,
    MsgSubscriber, ParticipantAnnouncement, ParticipantAnnouncementReply, ParticipantCommand,
    PeerInfo, PeerMessage, ProtocolVersion, RegistryFrame, RegistryMsgHeader, RelayFrame,
    Status, SystemCommand,
};

use super::transport::{spawn_link_framed, LinkEvent, PeerLinkHandle, TransportError};

/// Pseudo-peer name under which the registry connection itself is kept in
/// the link table, so relay fallback (spec.md §4.3 point 4) can reuse the
/// same outbound queue as a direct peer-link.
const REGISTRY_LINK: &str = "__registry__";

/// Receiver key under which control-plane traffic (commands, status
/// publications, workflow configuration, sync tokens) travels, shared by
/// every participant and the system controller so they agree on the
/// channel without a handshake-time negotiation of its own (spec.md §4.8).
pub const CONTROL_NETWORK: &str = "__control__";
/// See [`CONTROL_NETWORK`].
pub const CONTROL_MSG_TYPE: &str = "ControlMessage";

fn control_key() -> ReceiverKey {
    ReceiverKey { network_name: CONTROL_NETWORK.to_string(), msg_type_name: CONTROL_MSG_TYPE.to_string() }
}

/// Errors raised while joining a peer directly (spec.md §4.4 join
/// protocol), distinct from registry join failures.
#[derive(Debug, Error)]
pub enum PeerJoinError {
    /// I/O failure establishing or negotiating the link.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Codec/handshake failure.
    #[error("codec error: {0}")]
    Codec(#[from] crate::wire::CodecError),
    /// No overlapping protocol version.
    #[error("protocol version mismatch with peer")]
    VersionMismatch,
}

/// A local receiver this participant can dispatch `PeerMessage` payloads
/// to, keyed by `(network_name, msg_type_name)` until a link assigns it an
/// index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReceiverKey {
    /// Bus/network name.
    pub network_name: String,
    /// Logical message type name.
    pub msg_type_name: String,
}

/// Per-link receiver index table: this participant's own local receivers
/// in slot order (index = position + 1, since index 0 is reserved), and
/// the remote peer's table learned during the handshake.
struct LinkTables {
    handle: PeerLinkHandle,
    remote: Vec<MsgSubscriber>,
}

impl LinkTables {
    fn remote_index_for(&self, key: &ReceiverKey) -> Option<u64> {
        self.remote
            .iter()
            .find(|s| s.network_name == key.network_name && s.msg_type_name == key.msg_type_name)
            .map(|s| s.receiver_idx)
    }
}

/// Connects to the registry, establishes direct peer-links, and routes
/// broadcast/targeted sends and inbound dispatch (spec.md §4.4).
pub struct ConnectionManager {
    participant_name: String,
    participant_id: u64,
    local_receivers: Vec<ReceiverKey>,
    links: HashMap<String, LinkTables>,
    /// Peers whose direct link was lost but whose entry in `links` is kept
    /// around for its receiver table; sends to these names are wrapped in a
    /// `RelayFrame` and routed through the registry connection instead.
    relay_targets: std::collections::HashSet<String>,
    dispatch_tx: mpsc::UnboundedSender<(String, LinkEvent)>,
    dispatch_rx: mpsc::UnboundedReceiver<(String, LinkEvent)>,
}

/// One dispatched inbound message, handed to the caller's event loop.
pub struct DispatchedMessage {
    /// Name of the peer that sent this message.
    pub from_peer: String,
    /// The local receiver index it targets.
    pub receiver_idx: u64,
    /// Sender's endpoint address (for self-delivery suppression upstream
    /// and routing diagnostics).
    pub endpoint_address: EndpointAddress,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

/// One event surfaced by [`ConnectionManager::next_event`].
pub enum ConnectionEvent {
    /// A `PeerMessage` was dispatched to a known local receiver index.
    Message(DispatchedMessage),
    /// A `Frame::AnnounceServices` arrived from a peer.
    ServiceAnnouncement(String, crate::wire::ServiceAnnouncement),
    /// A peer-link was lost (spec.md §4.2 failure model).
    PeerLost(String),
    /// The registry pushed a fresh `KnownParticipants` list after the
    /// initial join (spec.md §4.3 point 3: a later join/leave broadcasts the
    /// updated roster to every already-connected participant). Callers
    /// should attempt a direct link to any name not already in
    /// [`ConnectionManager::peer_names`].
    KnownParticipantsUpdated(Vec<PeerInfo>),
}

impl ConnectionManager {
    /// Construct an empty connection manager for a participant that has
    /// already derived its id.
    pub fn new(participant_name: impl Into<String>, participant_id: u64) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Self {
            participant_name: participant_name.into(),
            participant_id,
            local_receivers: Vec::new(),
            links: HashMap::new(),
            relay_targets: std::collections::HashSet::new(),
            dispatch_tx,
            dispatch_rx,
        }
    }

    /// Register a local receiver, returning its process-local index
    /// (starting at 1; index 0 is reserved).
    pub fn register_receiver(&mut self, network_name: impl Into<String>, msg_type_name: impl Into<String>) -> u64 {
        self.local_receivers.push(ReceiverKey { network_name: network_name.into(), msg_type_name: msg_type_name.into() });
        self.local_receivers.len() as u64
    }

    fn local_subscriber_table(&self) -> Vec<MsgSubscriber> {
        self.local_receivers
            .iter()
            .enumerate()
            .map(|(i, k)| MsgSubscriber {
                receiver_idx: (i + 1) as u64,
                network_name: k.network_name.clone(),
                msg_type_name: k.msg_type_name.clone(),
                msg_version: 0,
            })
            .collect()
    }

    /// Establish a direct link to `peer` over an already-connected stream,
    /// exchanging `ParticipantAnnouncement`/`ParticipantAnnouncementReply`
    /// so both sides learn each other's receiver index table before any
    /// simulation traffic flows (spec.md §4.4 receiver index table).
    pub async fn establish_link<S>(&mut self, peer_name: &str, stream: S) -> Result<(), PeerJoinError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, FrameCodec::new(ProtocolVersion::CURRENT));

        send_announcement(&mut framed, &self.participant_name, self.participant_id, vec![]).await?;
        let their_ann = recv_announcement(&mut framed).await?;
        let negotiated = ProtocolVersion::negotiate(ProtocolVersion::CURRENT, their_ann.header.version)
            .ok_or(PeerJoinError::VersionMismatch)?;
        framed.codec_mut().set_version(negotiated);

        send_reply(&mut framed, negotiated, self.local_subscriber_table()).await?;
        let their_reply = recv_reply(&mut framed).await?;
        if their_reply.status != Status::Success {
            return Err(PeerJoinError::VersionMismatch);
        }

        let handle = spawn_link_framed(peer_name.to_string(), framed, self.dispatch_tx.clone());
        self.links.insert(peer_name.to_string(), LinkTables { handle, remote: their_reply.subscribers });
        self.relay_targets.remove(peer_name);
        Ok(())
    }

    /// Accept a direct link from a peer that dialed us. The peer's name is
    /// learned from its `ParticipantAnnouncement`, not assumed by the
    /// caller, since an acceptor cannot know who is connecting until the
    /// handshake runs; returns that name on success.
    pub async fn accept_link<S>(&mut self, stream: S) -> Result<String, PeerJoinError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, FrameCodec::new(ProtocolVersion::CURRENT));

        let their_ann = recv_announcement(&mut framed).await?;
        let negotiated = ProtocolVersion::negotiate(ProtocolVersion::CURRENT, their_ann.header.version)
            .ok_or(PeerJoinError::VersionMismatch)?;
        framed.codec_mut().set_version(negotiated);

        send_announcement(&mut framed, &self.participant_name, self.participant_id, vec![]).await?;
        send_reply(&mut framed, negotiated, self.local_subscriber_table()).await?;
        let their_reply = recv_reply(&mut framed).await?;
        if their_reply.status != Status::Success {
            return Err(PeerJoinError::VersionMismatch);
        }

        let peer_name = their_ann.peer_info.name;
        let handle = spawn_link_framed(peer_name.clone(), framed, self.dispatch_tx.clone());
        self.links.insert(peer_name.clone(), LinkTables { handle, remote: their_reply.subscribers });
        self.relay_targets.remove(&peer_name);
        Ok(peer_name)
    }

    /// Join the registry (spec.md §4.3): send a `ParticipantAnnouncement`,
    /// await the `ParticipantAnnouncementReply` and the `KnownParticipants`
    /// push that follows it, and keep the connection open under
    /// [`REGISTRY_LINK`] so later relay fallback (point 4 of that section)
    /// can reuse it.
    pub async fn join_registry<S>(&mut self, stream: S, acceptors: Vec<Acceptor>) -> Result<Vec<PeerInfo>, PeerJoinError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, FrameCodec::new(ProtocolVersion::CURRENT));
        send_announcement(&mut framed, &self.participant_name, self.participant_id, acceptors).await?;
        let reply = recv_reply(&mut framed).await?;
        if reply.status != Status::Success {
            return Err(PeerJoinError::VersionMismatch);
        }
        framed.codec_mut().set_version(reply.header.version);
        let known = recv_known_participants(&mut framed).await?;

        let handle = spawn_link_framed(REGISTRY_LINK.to_string(), framed, self.dispatch_tx.clone());
        self.links.insert(REGISTRY_LINK.to_string(), LinkTables { handle, remote: vec![] });
        Ok(known.peers)
    }

    /// Mark a previously-linked `peer` as reachable only by relaying
    /// through the registry connection (spec.md §4.3 point 4), reusing the
    /// receiver table learned during its original handshake. Call this
    /// after observing [`ConnectionEvent::PeerLost`] for a peer you do not
    /// intend to reconnect to directly.
    pub fn mark_relay_only(&mut self, peer_name: impl Into<String>) {
        self.relay_targets.insert(peer_name.into());
    }

    fn send_relayed(&self, to: &str, frame: Frame) -> bool {
        let Some(registry) = self.links.get(REGISTRY_LINK) else {
            tracing::warn!(peer = to, "no registry link available to relay through");
            return false;
        };
        let mut payload = bytes::BytesMut::new();
        crate::wire::WireEncode::encode(&frame, ProtocolVersion::CURRENT, &mut payload);
        let relay = Frame::Relay(RelayFrame { from: self.participant_name.clone(), to: to.to_string(), payload: payload.to_vec() });
        registry.handle.send(relay)
    }

    /// Number of established direct peer-links (excludes the registry
    /// connection itself).
    pub fn peer_count(&self) -> usize {
        self.links.keys().filter(|k| k.as_str() != REGISTRY_LINK).count()
    }

    /// Names of every established peer-link (excludes the registry
    /// connection itself).
    pub fn peer_names(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(|s| s.as_str()).filter(|k| *k != REGISTRY_LINK)
    }

    /// Broadcast a message to every peer whose receiver table contains
    /// `key` (spec.md §4.4 send API). Peers reachable only via relay
    /// (spec.md §4.3 point 4) still receive it, wrapped in a `RelayFrame`.
    pub fn send_broadcast(&self, from: EndpointAddress, key: &ReceiverKey, payload: Vec<u8>) {
        for (peer, link) in &self.links {
            if peer == REGISTRY_LINK {
                continue;
            }
            if let Some(idx) = link.remote_index_for(key) {
                let msg = PeerMessage { receiver_idx: idx, endpoint_address: from, payload: payload.clone() };
                let sent = if self.relay_targets.contains(peer) {
                    self.send_relayed(peer, Frame::Peer(msg))
                } else {
                    link.handle.send(Frame::Peer(msg))
                };
                if !sent {
                    tracing::warn!(peer = %peer, "broadcast send failed, link closed");
                }
            }
        }
    }

    /// Send a message to exactly one named peer. Fails silently (logged)
    /// rather than falling back to broadcast if the peer is unknown or
    /// does not have a matching receiver (spec.md §9: the targeted-send
    /// Open Question is fixed forward, never silently broadcasting).
    pub fn send_targeted(&self, peer_name: &str, from: EndpointAddress, key: &ReceiverKey, payload: Vec<u8>) {
        let Some(link) = self.links.get(peer_name) else {
            tracing::warn!(peer = peer_name, "targeted send to unknown peer dropped");
            return;
        };
        let Some(idx) = link.remote_index_for(key) else {
            tracing::warn!(peer = peer_name, network = %key.network_name, msg_type = %key.msg_type_name, "targeted peer has no matching receiver, dropped");
            return;
        };
        let msg = PeerMessage { receiver_idx: idx, endpoint_address: from, payload };
        let sent = if self.relay_targets.contains(peer_name) {
            self.send_relayed(peer_name, Frame::Peer(msg))
        } else {
            link.handle.send(Frame::Peer(msg))
        };
        if !sent {
            tracing::warn!(peer = peer_name, "targeted send failed, link closed");
        }
    }

    /// Broadcast a raw frame verbatim to every established peer-link (used
    /// for `AnnounceServices` and control-plane frames that are not routed
    /// through the receiver index table).
    pub fn broadcast_frame(&self, frame: Frame) {
        for link in self.links.values() {
            if !link.handle.send(frame.clone()) {
                tracing::warn!(peer = %link.handle.peer_name(), "frame broadcast failed, link closed");
            }
        }
    }

    /// Drain the next dispatched event. Messages from a single peer are
    /// dispatched in receive order; across peers no ordering is guaranteed
    /// (spec.md §5 dispatch ordering).
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        loop {
            let (peer, event) = self.dispatch_rx.recv().await?;
            match event {
                LinkEvent::Frame(Frame::Peer(msg)) => {
                    return Some(ConnectionEvent::Message(DispatchedMessage {
                        from_peer: peer,
                        receiver_idx: msg.receiver_idx,
                        endpoint_address: msg.endpoint_address,
                        payload: msg.payload,
                    }));
                }
                LinkEvent::Frame(Frame::AnnounceServices(ann)) => {
                    return Some(ConnectionEvent::ServiceAnnouncement(peer, ann));
                }
                LinkEvent::Frame(Frame::Registry(RegistryFrame::KnownParticipants(known))) if peer == REGISTRY_LINK => {
                    return Some(ConnectionEvent::KnownParticipantsUpdated(known.peers));
                }
                LinkEvent::Frame(Frame::Relay(relay)) => {
                    let mut buf = bytes::Bytes::from(relay.payload);
                    match <Frame as crate::wire::WireDecode>::decode(ProtocolVersion::CURRENT, &mut buf) {
                        Ok(Frame::Peer(msg)) => {
                            return Some(ConnectionEvent::Message(DispatchedMessage {
                                from_peer: relay.from,
                                receiver_idx: msg.receiver_idx,
                                endpoint_address: msg.endpoint_address,
                                payload: msg.payload,
                            }));
                        }
                        Ok(Frame::AnnounceServices(ann)) => {
                            return Some(ConnectionEvent::ServiceAnnouncement(relay.from, ann));
                        }
                        Ok(other) => {
                            tracing::debug!(from = %relay.from, frame = ?other, "unhandled relayed frame kind");
                        }
                        Err(err) => {
                            tracing::warn!(from = %relay.from, error = %err, "malformed relayed frame, dropping");
                        }
                    }
                }
                LinkEvent::Frame(other) => {
                    tracing::debug!(peer = %peer, frame = ?other, "unhandled frame kind on peer-link");
                }
                LinkEvent::Closed(err) => {
                    if let Some(TransportError::Codec(e)) = &err {
                        tracing::warn!(peer = %peer, error = %e, "peer-link closed on codec error");
                    }
                    if peer == REGISTRY_LINK {
                        self.links.remove(&peer);
                    } else {
                        // Keep the entry (and its learned receiver table) so the
                        // caller can fall back to relay via `mark_relay_only`
                        // without re-running the handshake (spec.md §4.3 point 4).
                        // A later `establish_link`/`accept_link` overwrites it with
                        // a fresh, live handle.
                        return Some(ConnectionEvent::PeerLost(peer));
                    }
                }
            }
        }
    }
}

/// Lets a [`crate::monitor::SystemController`] drive a live mesh: both
/// command kinds are broadcast over [`CONTROL_NETWORK`] and carry their
/// own target, so participants (spec.md §4.7's command handling) filter a
/// `ParticipantCommand` addressed to someone else themselves rather than
/// this manager routing it to one link.
impl ControlSender for ConnectionManager {
    fn broadcast_system_command(&mut self, kind: CommandKind) {
        let payload = ControlMessage::SystemCommand(SystemCommand { kind }).to_payload(ProtocolVersion::CURRENT);
        let from = EndpointAddress { participant: self.participant_id, endpoint: 0 };
        self.send_broadcast(from, &control_key(), payload);
    }

    fn send_participant_command(&mut self, target: u64, kind: CommandKind) {
        let payload =
            ControlMessage::ParticipantCommand(ParticipantCommand { target, kind }).to_payload(ProtocolVersion::CURRENT);
        let from = EndpointAddress { participant: self.participant_id, endpoint: 0 };
        self.send_broadcast(from, &control_key(), payload);
    }
}

async fn send_announcement<S>(
    framed: &mut Framed<S, FrameCodec>,
    name: &str,
    id: u64,
    acceptors: Vec<Acceptor>,
) -> Result<(), crate::wire::CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures::SinkExt;
    let frame = Frame::Registry(RegistryFrame::ParticipantAnnouncement(ParticipantAnnouncement {
        header: RegistryMsgHeader::default(),
        peer_info: PeerInfo { name: name.to_string(), id, acceptors },
    }));
    framed.send(frame).await
}

async fn recv_announcement<S>(
    framed: &mut Framed<S, FrameCodec>,
) -> Result<ParticipantAnnouncement, crate::wire::CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures::StreamExt;
    match framed.next().await {
        Some(Ok(Frame::Registry(RegistryFrame::ParticipantAnnouncement(ann)))) => Ok(ann),
        Some(Ok(_)) => Err(crate::wire::CodecError::BadTag(0xFF)),
        Some(Err(e)) => Err(e),
        None => Err(crate::wire::CodecError::Truncated),
    }
}

async fn send_reply<S>(
    framed: &mut Framed<S, FrameCodec>,
    version: ProtocolVersion,
    subscribers: Vec<MsgSubscriber>,
) -> Result<(), crate::wire::CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures::SinkExt;
    let frame = Frame::Registry(RegistryFrame::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
        header: RegistryMsgHeader { version },
        status: Status::Success,
        subscribers,
    }));
    framed.send(frame).await
}

async fn recv_reply<S>(
    framed: &mut Framed<S, FrameCodec>,
) -> Result<ParticipantAnnouncementReply, crate::wire::CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures::StreamExt;
    match framed.next().await {
        Some(Ok(Frame::Registry(RegistryFrame::ParticipantAnnouncementReply(reply)))) => Ok(reply),
        Some(Ok(_)) => Err(crate::wire::CodecError::BadTag(0xFF)),
        Some(Err(e)) => Err(e),
        None => Err(crate::wire::CodecError::Truncated),
    }
}

async fn recv_known_participants<S>(
    framed: &mut Framed<S, FrameCodec>,
) -> Result<KnownParticipants, crate::wire::CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures::StreamExt;
    match framed.next().await {
        Some(Ok(Frame::Registry(RegistryFrame::KnownParticipants(known)))) => Ok(known),
        Some(Ok(_)) => Err(crate::wire::CodecError::BadTag(0xFF)),
        Some(Err(e)) => Err(e),
        None => Err(crate::wire::CodecError::Truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn establish_link_exchanges_receiver_tables() {
        let (client, server) = tokio::io::duplex(8192);

        let mut a = ConnectionManager::new("A", 1);
        a.register_receiver("CAN1", "FrameEvent");
        let mut b = ConnectionManager::new("B", 2);
        b.register_receiver("CAN1", "FrameEvent");
        b.register_receiver("LIN1", "FrameResponse");

        let (a_res, b_res) = tokio::join!(a.establish_link("B", client), b.accept_link(server));
        a_res.expect("a links");
        b_res.expect("b links");

        assert_eq!(a.peer_count(), 1);
        assert_eq!(b.peer_count(), 1);

        let key = ReceiverKey { network_name: "CAN1".into(), msg_type_name: "FrameEvent".into() };
        let from = EndpointAddress { participant: 1, endpoint: 1 };
        a.send_broadcast(from, &key, vec![9, 9]);

        match b.next_event().await.expect("event") {
            ConnectionEvent::Message(m) => {
                assert_eq!(m.from_peer, "A");
                assert_eq!(m.payload, vec![9, 9]);
                assert_eq!(m.receiver_idx, 1);
            }
            _ => panic!("expected message"),
        }
    }

    #[tokio::test]
    async fn targeted_send_to_unmatched_peer_is_dropped_not_broadcast() {
        let (client, server) = tokio::io::duplex(8192);
        let mut a = ConnectionManager::new("A", 1);
        let mut b = ConnectionManager::new("B", 2);
        let (a_res, b_res) = tokio::join!(a.establish_link("B", client), b.accept_link(server));
        a_res.unwrap();
        b_res.unwrap();

        let key = ReceiverKey { network_name: "CAN1".into(), msg_type_name: "FrameEvent".into() };
        let from = EndpointAddress { participant: 1, endpoint: 1 };
        a.send_targeted("B", from, &key, vec![1]);

        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), b.next_event()).await;
        assert!(timed_out.is_err(), "no matching receiver means nothing should be dispatched");
    }

    #[tokio::test]
    async fn join_registry_learns_previously_joined_participants() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(super::super::registry::run(listener));

        let mut a = ConnectionManager::new("A", 1);
        let stream_a = tokio::net::TcpStream::connect(addr).await.expect("connect a");
        let known_to_a = a.join_registry(stream_a, vec![]).await.expect("a joins");
        assert!(known_to_a.is_empty());

        let mut b = ConnectionManager::new("B", 2);
        let stream_b = tokio::net::TcpStream::connect(addr).await.expect("connect b");
        let known_to_b = b.join_registry(stream_b, vec![]).await.expect("b joins");
        assert_eq!(known_to_b.len(), 1);
        assert_eq!(known_to_b[0].name, "A");
    }

    #[tokio::test]
    async fn later_joiner_is_surfaced_to_an_already_connected_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(super::super::registry::run(listener));

        let mut a = ConnectionManager::new("A", 1);
        let stream_a = tokio::net::TcpStream::connect(addr).await.expect("connect a");
        a.join_registry(stream_a, vec![]).await.expect("a joins");

        let mut b = ConnectionManager::new("B", 2);
        let stream_b = tokio::net::TcpStream::connect(addr).await.expect("connect b");
        b.join_registry(stream_b, vec![]).await.expect("b joins");

        match a.next_event().await.expect("a learns of b") {
            ConnectionEvent::KnownParticipantsUpdated(peers) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].name, "B");
            }
            _ => panic!("expected a known-participants update"),
        }
    }

    #[tokio::test]
    async fn relay_fallback_reuses_the_learned_receiver_table() {
        // Learn each other's receiver index table over a direct link first,
        // exactly as a successful spec.md §4.4 handshake would.
        let (client, server) = tokio::io::duplex(8192);
        let mut a = ConnectionManager::new("A", 1);
        let mut b = ConnectionManager::new("B", 2);
        b.register_receiver("CAN1", "FrameEvent");
        let (a_res, b_res) = tokio::join!(a.establish_link("B", client), b.accept_link(server));
        a_res.expect("a links to b");
        b_res.expect("b links to a");

        // Both also join a shared registry, which is what carries relayed
        // traffic once a direct link can no longer be used.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(super::super::registry::run(listener));
        a.join_registry(tokio::net::TcpStream::connect(addr).await.expect("connect a"), vec![])
            .await
            .expect("a joins registry");
        b.join_registry(tokio::net::TcpStream::connect(addr).await.expect("connect b"), vec![])
            .await
            .expect("b joins registry");

        // Force A to treat B as relay-only even though the direct link is
        // still technically open, to exercise the fallback path in isolation.
        a.mark_relay_only("B");

        let key = ReceiverKey { network_name: "CAN1".into(), msg_type_name: "FrameEvent".into() };
        let from = EndpointAddress { participant: 1, endpoint: 1 };
        a.send_broadcast(from, &key, vec![7, 7, 7]);

        match b.next_event().await.expect("relayed event") {
            ConnectionEvent::Message(m) => {
                assert_eq!(m.from_peer, "A");
                assert_eq!(m.payload, vec![7, 7, 7]);
                assert_eq!(m.receiver_idx, 1);
            }
            _ => panic!("expected a relayed message"),
        }
    }
}
