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

//! Reliable ordered peer-link transport over TCP or local-IPC streams
//! (spec.md §4.2).
//!
//! Each link owns one outbound queue drained by a single writer task and
//! exactly one reader task feeding a shared, single-consumer dispatch
//! channel — the connection manager draining that channel is the
//! single-threaded dispatch context of spec.md §5; per-link socket I/O is
//! free to run across the async runtime's worker threads since no mutable
//! state is touched there.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::wire::{CodecError, Frame, FrameCodec, ProtocolVersion};

/// Transport-level errors (spec.md §4.2 failure model).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed frame; closes the link (spec.md §7 `CodecError`).
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A read/write error closed the link. The connection manager decides
/// whether to reconnect (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct PeerLost {
    /// Name of the peer whose link was lost.
    pub peer_name: String,
}

/// What a reader task hands to the shared dispatch channel.
pub enum LinkEvent {
    /// A fully decoded frame.
    Frame(Frame),
    /// The link closed (cleanly or via I/O/codec error).
    Closed(Option<TransportError>),
}

/// A non-blocking handle to a peer-link's outbound queue.
#[derive(Clone)]
pub struct PeerLinkHandle {
    peer_name: String,
    outbound_tx: mpsc::UnboundedSender<Frame>,
}

impl PeerLinkHandle {
    /// Peer this handle sends to.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Enqueue a frame on the outbound queue. Non-blocking; a single
    /// background writer task drains it (spec.md §4.2 send contract).
    /// Returns `false` if the link's writer task has already exited.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound_tx.send(frame).is_ok()
    }
}

/// Spawn the reader/writer tasks for one peer-link over an already
/// connected, already version-negotiated stream.
///
/// `dispatch_tx` is shared by every link on this participant; the
/// connection manager is the single consumer that drains it, giving
/// per-peer FIFO (spec.md §5 ordering guarantees) while the reads
/// themselves may run concurrently across links.
pub fn spawn_link<S>(
    peer_name: String,
    stream: S,
    version: ProtocolVersion,
    dispatch_tx: mpsc::UnboundedSender<(String, LinkEvent)>,
) -> PeerLinkHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    spawn_link_framed(peer_name, Framed::new(stream, FrameCodec::new(version)), dispatch_tx)
}

/// Same as [`spawn_link`] but takes an already-built `Framed` stream, for
/// callers that must read or write a handshake frame on it (e.g. the
/// registry's join protocol) before handing it off to the reader/writer
/// tasks.
pub fn spawn_link_framed<S>(
    peer_name: String,
    framed: Framed<S, FrameCodec>,
    dispatch_tx: mpsc::UnboundedSender<(String, LinkEvent)>,
) -> PeerLinkHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = framed.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let reader_name = peer_name.clone();
    let reader_dispatch = dispatch_tx.clone();
    tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    if reader_dispatch.send((reader_name.clone(), LinkEvent::Frame(frame))).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(peer = %reader_name, error = %e, "peer-link codec/io error");
                    let _ = reader_dispatch.send((reader_name.clone(), LinkEvent::Closed(Some(TransportError::Codec(e)))));
                    break;
                }
                None => {
                    let _ = reader_dispatch.send((reader_name.clone(), LinkEvent::Closed(None)));
                    break;
                }
            }
        }
    });

    let writer_name = peer_name.clone();
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::warn!(peer = %writer_name, error = %e, "peer-link write failed");
                break;
            }
        }
    });

    PeerLinkHandle { peer_name, outbound_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ParticipantAnnouncement, PeerInfo, RegistryFrame, RegistryMsgHeader};

    #[tokio::test]
    async fn link_roundtrips_a_frame_over_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
        let client_handle = spawn_link("server".to_string(), client, ProtocolVersion::CURRENT, dispatch_tx.clone());
        let (server_dispatch_tx, mut server_dispatch_rx) = mpsc::unbounded_channel();
        let _server_handle = spawn_link("client".to_string(), server, ProtocolVersion::CURRENT, server_dispatch_tx);

        let ann = Frame::Registry(RegistryFrame::ParticipantAnnouncement(ParticipantAnnouncement {
            header: RegistryMsgHeader { version: ProtocolVersion::CURRENT },
            peer_info: PeerInfo { name: "Unit".into(), id: 1, acceptors: vec![] },
        }));
        assert!(client_handle.send(ann.clone()));

        let (_peer, event) = server_dispatch_rx.recv().await.expect("frame delivered");
        match event {
            LinkEvent::Frame(f) => assert_eq!(f, ann),
            LinkEvent::Closed(_) => panic!("link closed unexpectedly"),
        }
        drop(client_handle);
        let _ = dispatch_rx.try_recv();
    }
}
