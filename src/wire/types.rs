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

//! Normative wire message types.
//!
//! Field layout follows the `RegistryMsgHeader`/`VAsioMsgSubscriber`/
//! `ParticipantAnnouncement` family documented for the VAsio wire protocol:
//! a 4-byte ASCII preamble plus a `{versionHigh, versionLow}` pair precedes
//! every registry message, and per-message simulation envelopes carry a
//! `receiverIdx` plus an `{participant, endpoint}` address pair ahead of
//! their opaque payload.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use super::codec::{
    get_bytes, get_i64, get_string, get_u16, get_u32, get_u64, get_u8, get_vec, put_bytes,
    put_string, put_vec, CodecError, WireDecode, WireEncode,
};
use super::version::ProtocolVersion;

const PREAMBLE: [u8; 4] = *b"VIB-";

/// Header carried by every registry message, pinning the protocol version
/// the sender speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryMsgHeader {
    /// Protocol version of the sender.
    pub version: ProtocolVersion,
}

impl Default for RegistryMsgHeader {
    fn default() -> Self {
        Self { version: ProtocolVersion::CURRENT }
    }
}

impl WireEncode for RegistryMsgHeader {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&PREAMBLE);
        buf.extend_from_slice(&self.version.major.to_le_bytes());
        buf.extend_from_slice(&self.version.minor.to_le_bytes());
    }
}

impl WireDecode for RegistryMsgHeader {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        if buf.remaining_preamble_check(&PREAMBLE)? {
            let major = get_u16(buf)?;
            let minor = get_u16(buf)?;
            Ok(Self { version: ProtocolVersion::new(major, minor) })
        } else {
            unreachable!("remaining_preamble_check returns Err on mismatch")
        }
    }
}

trait PreambleCheck {
    fn remaining_preamble_check(&mut self, expected: &[u8; 4]) -> Result<bool, CodecError>;
}

impl PreambleCheck for Bytes {
    fn remaining_preamble_check(&mut self, expected: &[u8; 4]) -> Result<bool, CodecError> {
        if self.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let got = [get_u8(self)?, get_u8(self)?, get_u8(self)?, get_u8(self)?];
        if &got != expected {
            return Err(CodecError::BadTag(got[0]));
        }
        Ok(true)
    }
}

/// A TCP or local-IPC acceptor a participant listens on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acceptor {
    /// Host name or IP literal (empty for local-IPC acceptors).
    pub host: String,
    /// TCP port, or 0 for a local-IPC acceptor.
    pub port: u16,
}

impl WireEncode for Acceptor {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        put_string(buf, &self.host);
        buf.extend_from_slice(&self.port.to_le_bytes());
    }
}

impl WireDecode for Acceptor {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let host = get_string(buf)?;
        let port = get_u16(buf)?;
        Ok(Self { host, port })
    }
}

/// Peer identity plus its reachable acceptors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    /// Stable participant name.
    pub name: String,
    /// Deterministic numeric id derived from `name`.
    pub id: u64,
    /// Acceptors through which this peer can be reached.
    pub acceptors: Vec<Acceptor>,
}

impl WireEncode for PeerInfo {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        put_string(buf, &self.name);
        buf.extend_from_slice(&self.id.to_le_bytes());
        put_vec(version, buf, &self.acceptors);
    }
}

impl WireDecode for PeerInfo {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let name = get_string(buf)?;
        let id = get_u64(buf)?;
        let acceptors = get_vec(version, buf)?;
        Ok(Self { name, id, acceptors })
    }
}

/// One local receiver a peer-link's subscription table maps onto an index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgSubscriber {
    /// The small integer index subsequent peer messages use instead of the
    /// `(network_name, msg_type_name)` pair.
    pub receiver_idx: u64,
    /// Bus/network name this receiver is bound to.
    pub network_name: String,
    /// Logical message type name.
    pub msg_type_name: String,
    /// Message-type specific sub-version, 0 if not applicable.
    pub msg_version: u32,
}

impl WireEncode for MsgSubscriber {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.receiver_idx.to_le_bytes());
        put_string(buf, &self.network_name);
        put_string(buf, &self.msg_type_name);
        buf.extend_from_slice(&self.msg_version.to_le_bytes());
    }
}

impl WireDecode for MsgSubscriber {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let receiver_idx = get_u64(buf)?;
        let network_name = get_string(buf)?;
        let msg_type_name = get_string(buf)?;
        let msg_version = get_u32(buf)?;
        Ok(Self { receiver_idx, network_name, msg_type_name, msg_version })
    }
}

/// Success/failure status shared by subscription acks and announcement
/// replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Operation failed.
    Failed = 0,
    /// Operation succeeded.
    Success = 1,
}

impl Status {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(Status::Failed),
            1 => Ok(Status::Success),
            other => Err(CodecError::BadTag(other)),
        }
    }
}

/// Acknowledges a single `MsgSubscriber` registration on a peer-link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionAcknowledge {
    /// Whether the subscriber was accepted.
    pub status: Status,
    /// The subscriber being acknowledged.
    pub subscriber: MsgSubscriber,
}

impl WireEncode for SubscriptionAcknowledge {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&[self.status as u8]);
        self.subscriber.encode(version, buf);
    }
}

impl WireDecode for SubscriptionAcknowledge {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let status = Status::from_u8(get_u8(buf)?)?;
        let subscriber = MsgSubscriber::decode(version, buf)?;
        Ok(Self { status, subscriber })
    }
}

/// First message sent on a new peer-link; carries the sender's protocol
/// version and peer info.
///
/// !!! DO NOT CHANGE THE WIRE VALUE (1) ASSIGNED TO THIS MESSAGE KIND !!!
/// It is the first thing read off a new connection and carries the version
/// used to interpret everything that follows; changing it breaks protocol
/// mismatch detection against older builds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantAnnouncement {
    /// Header carrying the sender's protocol version.
    pub header: RegistryMsgHeader,
    /// Sender's peer info.
    pub peer_info: PeerInfo,
}

impl WireEncode for ParticipantAnnouncement {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        self.header.encode(version, buf);
        self.peer_info.encode(version, buf);
    }
}

impl WireDecode for ParticipantAnnouncement {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let header = RegistryMsgHeader::decode(version, buf)?;
        let peer_info = PeerInfo::decode(version, buf)?;
        Ok(Self { header, peer_info })
    }
}

/// Registry's reply to a `ParticipantAnnouncement`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantAnnouncementReply {
    /// Registry's own header (echoes back the negotiated version).
    pub header: RegistryMsgHeader,
    /// Success or failure; default is `Failed` so a partially-decoded reply
    /// never looks like a success.
    pub status: Status,
    /// Per-receiver subscription state to replay onto the new link.
    pub subscribers: Vec<MsgSubscriber>,
}

impl WireEncode for ParticipantAnnouncementReply {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        self.header.encode(version, buf);
        buf.extend_from_slice(&[self.status as u8]);
        put_vec(version, buf, &self.subscribers);
    }
}

impl WireDecode for ParticipantAnnouncementReply {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let header = RegistryMsgHeader::decode(version, buf)?;
        let status = Status::from_u8(get_u8(buf)?)?;
        let subscribers = get_vec(version, buf)?;
        Ok(Self { header, status, subscribers })
    }
}

/// Every currently-connected peer's info, sent to a newly joined
/// participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownParticipants {
    /// Registry's header.
    pub header: RegistryMsgHeader,
    /// Known peers.
    pub peers: Vec<PeerInfo>,
}

impl WireEncode for KnownParticipants {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        self.header.encode(version, buf);
        put_vec(version, buf, &self.peers);
    }
}

impl WireDecode for KnownParticipants {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let header = RegistryMsgHeader::decode(version, buf)?;
        let peers = get_vec(version, buf)?;
        Ok(Self { header, peers })
    }
}

/// The three registry-specific message kinds, nested under the top-level
/// `RegistryHandshake` frame kind. `Invalid = 0` is reserved and never sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryFrame {
    /// `registryKind = 1`.
    ParticipantAnnouncement(ParticipantAnnouncement),
    /// `registryKind = 2`.
    ParticipantAnnouncementReply(ParticipantAnnouncementReply),
    /// `registryKind = 3`.
    KnownParticipants(KnownParticipants),
}

impl RegistryFrame {
    fn registry_kind(&self) -> u8 {
        match self {
            RegistryFrame::ParticipantAnnouncement(_) => 1,
            RegistryFrame::ParticipantAnnouncementReply(_) => 2,
            RegistryFrame::KnownParticipants(_) => 3,
        }
    }
}

impl WireEncode for RegistryFrame {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&[self.registry_kind()]);
        match self {
            RegistryFrame::ParticipantAnnouncement(m) => m.encode(version, buf),
            RegistryFrame::ParticipantAnnouncementReply(m) => m.encode(version, buf),
            RegistryFrame::KnownParticipants(m) => m.encode(version, buf),
        }
    }
}

impl WireDecode for RegistryFrame {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_u8(buf)? {
            1 => Ok(RegistryFrame::ParticipantAnnouncement(ParticipantAnnouncement::decode(version, buf)?)),
            2 => Ok(RegistryFrame::ParticipantAnnouncementReply(ParticipantAnnouncementReply::decode(version, buf)?)),
            3 => Ok(RegistryFrame::KnownParticipants(KnownParticipants::decode(version, buf)?)),
            other => Err(CodecError::BadTag(other)),
        }
    }
}

/// Addresses a specific endpoint within a participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    /// Sender participant id.
    pub participant: u64,
    /// Sender-local endpoint id.
    pub endpoint: u64,
}

impl WireEncode for EndpointAddress {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.participant.to_le_bytes());
        buf.extend_from_slice(&self.endpoint.to_le_bytes());
    }
}

impl WireDecode for EndpointAddress {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let participant = get_u64(buf)?;
        let endpoint = get_u64(buf)?;
        Ok(Self { participant, endpoint })
    }
}

/// A simulation envelope: routes by pre-negotiated receiver index rather
/// than a string routing key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerMessage {
    /// Pre-negotiated receiver index on the receiving side.
    pub receiver_idx: u64,
    /// Sender's endpoint address, for self-delivery suppression and routing
    /// diagnostics.
    pub endpoint_address: EndpointAddress,
    /// Opaque encoded control/bus payload.
    pub payload: Vec<u8>,
}

impl WireEncode for PeerMessage {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.receiver_idx.to_le_bytes());
        self.endpoint_address.encode(_version, buf);
        put_bytes(buf, &self.payload);
    }
}

impl WireDecode for PeerMessage {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let receiver_idx = get_u64(buf)?;
        let endpoint_address = EndpointAddress::decode(version, buf)?;
        let payload = get_bytes(buf)?;
        Ok(Self { receiver_idx, endpoint_address, payload })
    }
}

/// An opaque byte stream relayed by the registry between two participants
/// that failed to establish a direct link (spec.md §4.3 point 4). The
/// registry routes on `to`/`from` without decoding `payload`; the
/// recipient decodes `payload` as another [`Frame`] exactly as if it had
/// arrived over a direct link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayFrame {
    /// Sending participant's name.
    pub from: String,
    /// Destination participant's name.
    pub to: String,
    /// Opaque inner frame bytes.
    pub payload: Vec<u8>,
}

impl WireEncode for RelayFrame {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        put_string(buf, &self.from);
        put_string(buf, &self.to);
        put_bytes(buf, &self.payload);
    }
}

impl WireDecode for RelayFrame {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let from = get_string(buf)?;
        let to = get_string(buf)?;
        let payload = get_bytes(buf)?;
        Ok(Self { from, to, payload })
    }
}

/// Top-level frame kind, carried as the `kind` byte in `[size][kind][body]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// `kind = 0`: a registry handshake message, see [`RegistryFrame`].
    Registry(RegistryFrame),
    /// `kind = 1`: acknowledges a subscriber registration on a peer-link.
    SubscriptionAck(SubscriptionAcknowledge),
    /// `kind = 2`: announces locally created services to a peer.
    AnnounceServices(ServiceAnnouncement),
    /// `kind = 3`: a simulation/control envelope.
    Peer(PeerMessage),
    /// `kind = 4`: registry-relayed opaque bytes for a peer pair that
    /// could not connect directly.
    Relay(RelayFrame),
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Registry(_) => 0,
            Frame::SubscriptionAck(_) => 1,
            Frame::AnnounceServices(_) => 2,
            Frame::Peer(_) => 3,
            Frame::Relay(_) => 4,
        }
    }
}

impl WireEncode for Frame {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&[self.kind()]);
        match self {
            Frame::Registry(m) => m.encode(version, buf),
            Frame::SubscriptionAck(m) => m.encode(version, buf),
            Frame::AnnounceServices(m) => m.encode(version, buf),
            Frame::Peer(m) => m.encode(version, buf),
            Frame::Relay(m) => m.encode(version, buf),
        }
    }
}

impl WireDecode for Frame {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_u8(buf)? {
            0 => Ok(Frame::Registry(RegistryFrame::decode(version, buf)?)),
            1 => Ok(Frame::SubscriptionAck(SubscriptionAcknowledge::decode(version, buf)?)),
            2 => Ok(Frame::AnnounceServices(ServiceAnnouncement::decode(version, buf)?)),
            3 => Ok(Frame::Peer(PeerMessage::decode(version, buf)?)),
            4 => Ok(Frame::Relay(RelayFrame::decode(version, buf)?)),
            other => Err(CodecError::BadTag(other)),
        }
    }
}

/// Logical service kind tags (spec.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceType {
    /// Participant lifecycle service.
    Lifecycle = 0,
    /// Time-synchronisation service.
    TimeSync = 1,
    /// System monitor service.
    SystemMonitor = 2,
    /// System controller service.
    SystemController = 3,
    /// Log sender service.
    LogSender = 4,
    /// Log receiver service.
    LogReceiver = 5,
    /// Service-discovery service.
    ServiceDiscovery = 6,
    /// Bus controller (opaque to the core).
    BusController = 7,
    /// Data publisher.
    DataPublisher = 8,
    /// Internal data subscriber link.
    DataSubscriberInternal = 9,
    /// RPC client.
    RpcClient = 10,
    /// Internal RPC server link.
    RpcServerInternal = 11,
    /// Internal controller link.
    InternalControllerLink = 12,
}

impl ServiceType {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        use ServiceType::*;
        Ok(match v {
            0 => Lifecycle,
            1 => TimeSync,
            2 => SystemMonitor,
            3 => SystemController,
            4 => LogSender,
            5 => LogReceiver,
            6 => ServiceDiscovery,
            7 => BusController,
            8 => DataPublisher,
            9 => DataSubscriberInternal,
            10 => RpcClient,
            11 => RpcServerInternal,
            12 => InternalControllerLink,
            other => return Err(CodecError::BadTag(other)),
        })
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceType::Lifecycle => "lifecycle",
            ServiceType::TimeSync => "time-sync",
            ServiceType::SystemMonitor => "system-monitor",
            ServiceType::SystemController => "system-controller",
            ServiceType::LogSender => "log-sender",
            ServiceType::LogReceiver => "log-receiver",
            ServiceType::ServiceDiscovery => "service-discovery",
            ServiceType::BusController => "bus-controller",
            ServiceType::DataPublisher => "data-publisher",
            ServiceType::DataSubscriberInternal => "data-subscriber-internal",
            ServiceType::RpcClient => "rpc-client",
            ServiceType::RpcServerInternal => "rpc-server-internal",
            ServiceType::InternalControllerLink => "internal-controller-link",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ServiceType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "lifecycle" => ServiceType::Lifecycle,
            "time-sync" => ServiceType::TimeSync,
            "system-monitor" => ServiceType::SystemMonitor,
            "system-controller" => ServiceType::SystemController,
            "log-sender" => ServiceType::LogSender,
            "log-receiver" => ServiceType::LogReceiver,
            "service-discovery" => ServiceType::ServiceDiscovery,
            "bus-controller" => ServiceType::BusController,
            "data-publisher" => ServiceType::DataPublisher,
            "data-subscriber-internal" => ServiceType::DataSubscriberInternal,
            "rpc-client" => ServiceType::RpcClient,
            "rpc-server-internal" => ServiceType::RpcServerInternal,
            "internal-controller-link" => ServiceType::InternalControllerLink,
            _ => return Err(CodecError::BadTag(0xFF)),
        })
    }
}

/// Uniquely identifies a logical endpoint in the mesh (spec.md §3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Owning participant's name.
    pub participant_name: String,
    /// Bus/network name.
    pub network_name: String,
    /// Service-local name.
    pub service_name: String,
    /// Service kind.
    pub service_type: ServiceType,
    /// Process-local, monotonic service id.
    pub service_id: u64,
    /// Supplemental key/value attributes (canonical ordering).
    pub supplemental: BTreeMap<String, String>,
}

/// Protocol version `supplemental` attributes were introduced in. Peers
/// negotiated down to `v3.0` (spec.md §8 scenario 5) never had this field on
/// the wire, so the v3.0 legacy serialiser omits it entirely rather than
/// sending an empty map.
const SUPPLEMENTAL_SINCE: ProtocolVersion = ProtocolVersion::new(3, 1);

impl WireEncode for ServiceDescriptor {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        put_string(buf, &self.participant_name);
        put_string(buf, &self.network_name);
        put_string(buf, &self.service_name);
        buf.extend_from_slice(&[self.service_type as u8]);
        buf.extend_from_slice(&self.service_id.to_le_bytes());
        if version >= SUPPLEMENTAL_SINCE {
            buf.extend_from_slice(&(self.supplemental.len() as u32).to_le_bytes());
            for (k, v) in &self.supplemental {
                put_string(buf, k);
                put_string(buf, v);
            }
        }
    }
}

impl WireDecode for ServiceDescriptor {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let participant_name = get_string(buf)?;
        let network_name = get_string(buf)?;
        let service_name = get_string(buf)?;
        let service_type = ServiceType::from_u8(get_u8(buf)?)?;
        let service_id = get_u64(buf)?;
        let supplemental = if version >= SUPPLEMENTAL_SINCE {
            let count = get_u32(buf)? as usize;
            let mut supplemental = BTreeMap::new();
            for _ in 0..count {
                let k = get_string(buf)?;
                let v = get_string(buf)?;
                supplemental.insert(k, v);
            }
            supplemental
        } else {
            BTreeMap::new()
        };
        Ok(Self { participant_name, network_name, service_name, service_type, service_id, supplemental })
    }
}

/// Broadcast of locally-created services; cached and replayed to each new
/// peer-link exactly once (spec.md §4.5).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ServiceAnnouncement {
    /// The descriptors being announced.
    pub descriptors: Vec<ServiceDescriptor>,
}

impl WireEncode for ServiceAnnouncement {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        put_vec(version, buf, &self.descriptors);
    }
}

impl WireDecode for ServiceAnnouncement {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self { descriptors: get_vec(version, buf)? })
    }
}

/// A single created/removed service-discovery event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDiscoveryEvent {
    /// `true` for creation, `false` for removal.
    pub is_created: bool,
    /// Affected descriptor.
    pub descriptor: ServiceDescriptor,
}

impl WireEncode for ServiceDiscoveryEvent {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&[self.is_created as u8]);
        self.descriptor.encode(version, buf);
    }
}

impl WireDecode for ServiceDiscoveryEvent {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let is_created = get_u8(buf)? != 0;
        let descriptor = ServiceDescriptor::decode(version, buf)?;
        Ok(Self { is_created, descriptor })
    }
}

/// Cluster-wide or per-participant command kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Transition ReadyToRun -> Running.
    Run = 1,
    /// Transition Running/Paused -> Stopping -> Stopped.
    Stop = 2,
    /// Transition Stopped/Error -> ShuttingDown -> Shutdown.
    Shutdown = 3,
    /// Transition Stopped/Error -> ServicesCreated.
    Restart = 4,
    /// Transition any non-terminal -> Aborting -> Shutdown.
    AbortSimulation = 5,
    /// Transition Running -> Paused.
    Pause = 6,
    /// Transition Paused -> Running.
    Continue = 7,
}

impl CommandKind {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        use CommandKind::*;
        Ok(match v {
            1 => Run,
            2 => Stop,
            3 => Shutdown,
            4 => Restart,
            5 => AbortSimulation,
            6 => Pause,
            7 => Continue,
            other => return Err(CodecError::BadTag(other)),
        })
    }
}

/// Command targeted at one participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParticipantCommand {
    /// Target participant id.
    pub target: u64,
    /// Command kind.
    pub kind: CommandKind,
}

impl WireEncode for ParticipantCommand {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.target.to_le_bytes());
        buf.extend_from_slice(&[self.kind as u8]);
    }
}

impl WireDecode for ParticipantCommand {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let target = get_u64(buf)?;
        let kind = CommandKind::from_u8(get_u8(buf)?)?;
        Ok(Self { target, kind })
    }
}

/// Command broadcast to the whole cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemCommand {
    /// Command kind.
    pub kind: CommandKind,
}

impl WireEncode for SystemCommand {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&[self.kind as u8]);
    }
}

impl WireDecode for SystemCommand {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self { kind: CommandKind::from_u8(get_u8(buf)?)? })
    }
}

/// Cluster-authoritative declaration of required participant names.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct WorkflowConfiguration {
    /// Required participant names.
    pub names: Vec<String>,
}

impl WireEncode for WorkflowConfiguration {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&(self.names.len() as u32).to_le_bytes());
        for n in &self.names {
            put_string(buf, n);
        }
        let _ = version;
    }
}

impl WireDecode for WorkflowConfiguration {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let count = get_u32(buf)? as usize;
        let mut names = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            names.push(get_string(buf)?);
        }
        Ok(Self { names })
    }
}

/// Wire-level participant lifecycle state tag (see `lifecycle::state`).
pub type ParticipantStateWire = u8;

/// A participant's current lifecycle state publication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantStatus {
    /// Participant name.
    pub name: String,
    /// Wire-level state tag.
    pub state: ParticipantStateWire,
    /// Human-readable reason for the current state.
    pub reason: String,
    /// Timestamp the state was entered, nanoseconds since an
    /// implementation-defined epoch.
    pub enter_time: i64,
    /// Timestamp this status was last refreshed.
    pub refresh_time: i64,
}

impl WireEncode for ParticipantStatus {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        put_string(buf, &self.name);
        buf.extend_from_slice(&[self.state]);
        put_string(buf, &self.reason);
        buf.extend_from_slice(&self.enter_time.to_le_bytes());
        buf.extend_from_slice(&self.refresh_time.to_le_bytes());
    }
}

impl WireDecode for ParticipantStatus {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let name = get_string(buf)?;
        let state = get_u8(buf)?;
        let reason = get_string(buf)?;
        let enter_time = get_i64(buf)?;
        let refresh_time = get_i64(buf)?;
        Ok(Self { name, state, reason, enter_time, refresh_time })
    }
}

/// A virtual-time synchronisation token: {timePoint, stepSize}.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextSimTask {
    /// Virtual time point this task starts at, nanoseconds.
    pub time_point: i64,
    /// Step duration, nanoseconds.
    pub duration: i64,
}

impl WireEncode for NextSimTask {
    fn encode(&self, _version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.time_point.to_le_bytes());
        buf.extend_from_slice(&self.duration.to_le_bytes());
    }
}

impl WireDecode for NextSimTask {
    fn decode(_version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        let time_point = get_i64(buf)?;
        let duration = get_i64(buf)?;
        Ok(Self { time_point, duration })
    }
}

/// Tagged union of control-plane payloads carried inside a `PeerMessage`.
///
/// The receiver index already identifies which controller a `PeerMessage`
/// is destined for; the leading tag byte here lets that single controller's
/// decode path stay a plain `match` instead of threading a second type
/// parameter through the connection manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Tag 0.
    ParticipantCommand(ParticipantCommand),
    /// Tag 1.
    SystemCommand(SystemCommand),
    /// Tag 2.
    WorkflowConfiguration(WorkflowConfiguration),
    /// Tag 3.
    ParticipantStatus(ParticipantStatus),
    /// Tag 4.
    NextSimTask(NextSimTask),
    /// Tag 5.
    ServiceDiscoveryEvent(ServiceDiscoveryEvent),
}

impl ControlMessage {
    fn tag(&self) -> u8 {
        match self {
            ControlMessage::ParticipantCommand(_) => 0,
            ControlMessage::SystemCommand(_) => 1,
            ControlMessage::WorkflowConfiguration(_) => 2,
            ControlMessage::ParticipantStatus(_) => 3,
            ControlMessage::NextSimTask(_) => 4,
            ControlMessage::ServiceDiscoveryEvent(_) => 5,
        }
    }
}

impl WireEncode for ControlMessage {
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut) {
        buf.extend_from_slice(&[self.tag()]);
        match self {
            ControlMessage::ParticipantCommand(m) => m.encode(version, buf),
            ControlMessage::SystemCommand(m) => m.encode(version, buf),
            ControlMessage::WorkflowConfiguration(m) => m.encode(version, buf),
            ControlMessage::ParticipantStatus(m) => m.encode(version, buf),
            ControlMessage::NextSimTask(m) => m.encode(version, buf),
            ControlMessage::ServiceDiscoveryEvent(m) => m.encode(version, buf),
        }
    }
}

impl WireDecode for ControlMessage {
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_u8(buf)? {
            0 => Ok(ControlMessage::ParticipantCommand(ParticipantCommand::decode(version, buf)?)),
            1 => Ok(ControlMessage::SystemCommand(SystemCommand::decode(version, buf)?)),
            2 => Ok(ControlMessage::WorkflowConfiguration(WorkflowConfiguration::decode(version, buf)?)),
            3 => Ok(ControlMessage::ParticipantStatus(ParticipantStatus::decode(version, buf)?)),
            4 => Ok(ControlMessage::NextSimTask(NextSimTask::decode(version, buf)?)),
            5 => Ok(ControlMessage::ServiceDiscoveryEvent(ServiceDiscoveryEvent::decode(version, buf)?)),
            other => Err(CodecError::BadTag(other)),
        }
    }
}

impl ControlMessage {
    /// Encode standalone (not nested in a `PeerMessage`) for payload byte
    /// construction.
    pub fn to_payload(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(version, &mut buf);
        buf.to_vec()
    }

    /// Decode from a `PeerMessage::payload` byte slice.
    pub fn from_payload(version: ProtocolVersion, payload: &[u8]) -> Result<Self, CodecError> {
        let mut b = Bytes::copy_from_slice(payload);
        Self::decode(version, &mut b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: WireEncode + WireDecode + PartialEq + std::fmt::Debug>(v: ProtocolVersion, val: T) {
        let mut buf = BytesMut::new();
        val.encode(v, &mut buf);
        let mut bytes = buf.freeze();
        let decoded = T::decode(v, &mut bytes).expect("decode");
        assert_eq!(val, decoded);
    }

    #[test]
    fn participant_announcement_roundtrip() {
        let ann = ParticipantAnnouncement {
            header: RegistryMsgHeader { version: ProtocolVersion::CURRENT },
            peer_info: PeerInfo {
                name: "Ctrl".into(),
                id: 42,
                acceptors: vec![Acceptor { host: "127.0.0.1".into(), port: 8500 }],
            },
        };
        roundtrip(ProtocolVersion::CURRENT, ann);
    }

    #[test]
    fn next_sim_task_roundtrip() {
        roundtrip(ProtocolVersion::CURRENT, NextSimTask { time_point: 5_000_000, duration: 1_000_000 });
    }

    #[test]
    fn service_descriptor_roundtrip_with_supplemental() {
        let mut supplemental = BTreeMap::new();
        supplemental.insert("k1".to_string(), "v1".to_string());
        let d = ServiceDescriptor {
            participant_name: "Unit".into(),
            network_name: "CAN1".into(),
            service_name: "pub1".into(),
            service_type: ServiceType::DataPublisher,
            service_id: 7,
            supplemental,
        };
        roundtrip(ProtocolVersion::CURRENT, d);
    }

    #[test]
    fn legacy_v3_0_serialiser_omits_supplemental_attributes() {
        let mut supplemental = BTreeMap::new();
        supplemental.insert("k1".to_string(), "v1".to_string());
        let d = ServiceDescriptor {
            participant_name: "Unit".into(),
            network_name: "CAN1".into(),
            service_name: "pub1".into(),
            service_type: ServiceType::DataPublisher,
            service_id: 7,
            supplemental,
        };
        let mut buf = BytesMut::new();
        d.encode(ProtocolVersion::OLDEST_SUPPORTED, &mut buf);
        let mut bytes = buf.freeze();
        let decoded = ServiceDescriptor::decode(ProtocolVersion::OLDEST_SUPPORTED, &mut bytes).expect("decode");
        assert!(decoded.supplemental.is_empty());
        assert!(bytes.is_empty(), "v3.0 frame must not carry trailing supplemental bytes");
    }

    #[test]
    fn bad_preamble_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"XXXX");
        buf.extend_from_slice(&3u16.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        let mut bytes = buf.freeze();
        let err = RegistryMsgHeader::decode(ProtocolVersion::CURRENT, &mut bytes).unwrap_err();
        assert!(matches!(err, CodecError::BadTag(_)));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"VIB-");
        buf.extend_from_slice(&3u16.to_le_bytes());
        // minor missing
        let mut bytes = buf.freeze();
        let err = RegistryMsgHeader::decode(ProtocolVersion::CURRENT, &mut bytes).unwrap_err();
        assert_eq!(err, CodecError::Truncated);
    }
}
