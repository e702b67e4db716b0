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

//! The rendezvous registry (spec.md §4.3).
//!
//! For each incoming connection: read a `ParticipantAnnouncement`, assign
//! (derive) the participant's id, broadcast its `PeerInfo` to already-known
//! peers via a fresh `KnownParticipants`, and reply with the full peer list.
//! After the join handshake the connection is kept open; if a participant
//! cannot reach a peer directly it relays through this same connection as
//! an opaque byte stream (`Frame::Relay`).

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;

use crate::ids::participant_id;
use crate::wire::{
    CodecError, Frame, FrameCodec, KnownParticipants, ParticipantAnnouncementReply, PeerInfo,
    ProtocolVersion, RegistryFrame, RegistryMsgHeader, Status,
};

use super::transport::{spawn_link_framed, LinkEvent, PeerLinkHandle};

/// Errors raised while running the registry service.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Failed to bind or accept on the listening socket.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct ParticipantRecord {
    info: PeerInfo,
    link: PeerLinkHandle,
}

struct SharedState {
    participants: Mutex<HashMap<String, ParticipantRecord>>,
}

impl SharedState {
    fn new() -> Self {
        Self { participants: Mutex::new(HashMap::new()) }
    }
}

fn spawn_dispatcher(shared: Arc<SharedState>) -> mpsc::UnboundedSender<(String, LinkEvent)> {
    let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<(String, LinkEvent)>();

    tokio::spawn(async move {
        while let Some((sender, event)) = dispatch_rx.recv().await {
            match event {
                LinkEvent::Frame(Frame::Relay(relay)) => {
                    if relay.from != sender {
                        tracing::warn!(sender = %sender, claimed = %relay.from, "relay frame sender mismatch, dropping");
                        continue;
                    }
                    let participants = shared.participants.lock().await;
                    match participants.get(&relay.to) {
                        Some(target) => {
                            if !target.link.send(Frame::Relay(relay.clone())) {
                                tracing::warn!(to = %relay.to, "relay target link closed, dropping frame");
                            }
                        }
                        None => {
                            tracing::warn!(to = %relay.to, from = %relay.from, "relay target unknown, dropping frame");
                        }
                    }
                }
                LinkEvent::Frame(other) => {
                    tracing::warn!(sender = %sender, "unexpected frame on registry link after join: {other:?}");
                }
                LinkEvent::Closed(_) => {
                    let mut participants = shared.participants.lock().await;
                    if participants.remove(&sender).is_some() {
                        tracing::info!(participant = %sender, "participant left the registry");
                        broadcast_known_participants(&participants).await;
                    }
                }
            }
        }
    });

    dispatch_tx
}

/// Run the registry service on a TCP `listener` until the socket itself
/// errors.
///
/// Never returns under normal operation; callers typically `tokio::spawn`
/// this alongside a shutdown signal.
pub async fn run(listener: TcpListener) -> Result<(), RegistryError> {
    let shared = Arc::new(SharedState::new());
    let dispatch_tx = spawn_dispatcher(shared.clone());

    loop {
        let (stream, addr) = listener.accept().await?;
        tracing::debug!(%addr, "registry accepted connection");
        let shared = shared.clone();
        let dispatch_tx = dispatch_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, shared, dispatch_tx).await {
                tracing::warn!(%addr, error = %e, "registry join handshake failed");
            }
        });
    }
}

/// Run the registry service on a Unix domain socket `listener` (the
/// `local://` transport of spec.md §4.2's "prefer local transport" rule,
/// applied to the registry connection itself).
#[cfg(unix)]
pub async fn run_unix(listener: tokio::net::UnixListener) -> Result<(), RegistryError> {
    let shared = Arc::new(SharedState::new());
    let dispatch_tx = spawn_dispatcher(shared.clone());

    loop {
        let (stream, _addr) = listener.accept().await?;
        tracing::debug!("registry accepted local connection");
        let shared = shared.clone();
        let dispatch_tx = dispatch_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, shared, dispatch_tx).await {
                tracing::warn!(error = %e, "registry join handshake failed");
            }
        });
    }
}

async fn handle_connection<S>(
    stream: S,
    shared: Arc<SharedState>,
    dispatch_tx: mpsc::UnboundedSender<(String, LinkEvent)>,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, FrameCodec::new(ProtocolVersion::CURRENT));

    let ann = match next_frame(&mut framed).await? {
        Frame::Registry(RegistryFrame::ParticipantAnnouncement(ann)) => ann,
        _ => {
            tracing::warn!("first frame on a new connection was not a participant announcement");
            return Ok(());
        }
    };

    let negotiated = match ProtocolVersion::negotiate(ProtocolVersion::CURRENT, ann.header.version) {
        Some(v) => v,
        None => {
            let reply = Frame::Registry(RegistryFrame::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
                header: RegistryMsgHeader::default(),
                status: Status::Failed,
                subscribers: vec![],
            }));
            send_frame(&mut framed, reply).await?;
            return Ok(());
        }
    };
    framed.codec_mut().set_version(negotiated);

    let name = ann.peer_info.name.clone();
    let id = participant_id(&name);
    let self_info = PeerInfo { name: name.clone(), id, acceptors: ann.peer_info.acceptors.clone() };

    let known_peers: Vec<PeerInfo> = {
        let participants = shared.participants.lock().await;
        participants.values().map(|r| r.info.clone()).collect()
    };

    send_frame(
        &mut framed,
        Frame::Registry(RegistryFrame::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
            header: RegistryMsgHeader { version: negotiated },
            status: Status::Success,
            subscribers: vec![],
        })),
    )
    .await?;
    send_frame(
        &mut framed,
        Frame::Registry(RegistryFrame::KnownParticipants(KnownParticipants {
            header: RegistryMsgHeader { version: negotiated },
            peers: known_peers,
        })),
    )
    .await?;

    let link = spawn_link_framed(name.clone(), framed, dispatch_tx);

    {
        let mut participants = shared.participants.lock().await;
        participants.insert(name.clone(), ParticipantRecord { info: self_info, link });
        broadcast_known_participants(&participants).await;
    }

    tracing::info!(participant = %name, id, "participant joined");
    Ok(())
}

async fn broadcast_known_participants(participants: &HashMap<String, ParticipantRecord>) {
    let all: Vec<PeerInfo> = participants.values().map(|r| r.info.clone()).collect();
    for record in participants.values() {
        let peers = all.iter().filter(|p| p.name != record.info.name).cloned().collect();
        let frame = Frame::Registry(RegistryFrame::KnownParticipants(KnownParticipants {
            header: RegistryMsgHeader::default(),
            peers,
        }));
        if !record.link.send(frame) {
            tracing::warn!(participant = %record.info.name, "could not push updated participant list, link closed");
        }
    }
}

/// Read one frame during the join handshake, before a link has a
/// `PeerLinkHandle` and shared dispatch channel.
async fn next_frame<S>(framed: &mut Framed<S, FrameCodec>) -> Result<Frame, CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures::StreamExt;
    match framed.next().await {
        Some(result) => result,
        None => Err(CodecError::Truncated),
    }
}

async fn send_frame<S>(framed: &mut Framed<S, FrameCodec>, frame: Frame) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use futures::SinkExt;
    framed.send(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Acceptor, ParticipantAnnouncement};
    use tokio::net::TcpStream as ClientStream;

    async fn announce(framed: &mut Framed<ClientStream, FrameCodec>, name: &str) {
        use futures::SinkExt;
        let frame = Frame::Registry(RegistryFrame::ParticipantAnnouncement(ParticipantAnnouncement {
            header: RegistryMsgHeader::default(),
            peer_info: PeerInfo {
                name: name.to_string(),
                id: 0,
                acceptors: vec![Acceptor { host: "127.0.0.1".into(), port: 0 }],
            },
        }));
        framed.send(frame).await.expect("send announcement");
    }

    #[tokio::test]
    async fn second_joiner_learns_about_the_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(run(listener));

        use futures::StreamExt;

        let client_a = ClientStream::connect(addr).await.expect("connect a");
        let mut framed_a = Framed::new(client_a, FrameCodec::new(ProtocolVersion::CURRENT));
        announce(&mut framed_a, "A").await;
        let _reply_a = framed_a.next().await.expect("reply a").expect("decode a");
        let known_a = framed_a.next().await.expect("known a").expect("decode known a");
        match known_a {
            Frame::Registry(RegistryFrame::KnownParticipants(kp)) => assert!(kp.peers.is_empty()),
            _ => panic!("expected known participants"),
        }

        let client_b = ClientStream::connect(addr).await.expect("connect b");
        let mut framed_b = Framed::new(client_b, FrameCodec::new(ProtocolVersion::CURRENT));
        announce(&mut framed_b, "B").await;
        let _reply_b = framed_b.next().await.expect("reply b").expect("decode b");
        let known_b = framed_b.next().await.expect("known b").expect("decode known b");
        match known_b {
            Frame::Registry(RegistryFrame::KnownParticipants(kp)) => {
                assert_eq!(kp.peers.len(), 1);
                assert_eq!(kp.peers[0].name, "A");
            }
            _ => panic!("expected known participants"),
        }
    }
}
