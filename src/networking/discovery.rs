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

//! Service discovery (spec.md §4.5): announce locally-created services,
//! observe remote ones, and diff against each peer's last announcement so
//! handlers fire exactly once per (descriptor, created|removed) event.

use std::collections::HashMap;

use crate::wire::{ServiceAnnouncement, ServiceDescriptor, ServiceDiscoveryEvent};

/// A service descriptor is keyed by its full address tuple (spec.md §3).
fn key(d: &ServiceDescriptor) -> (String, String, String, u64) {
    (d.participant_name.clone(), d.network_name.clone(), d.service_name.clone(), d.service_id)
}

/// Owns the local service set and every remote peer's last-seen set, and
/// dispatches created/removed events to registered handlers.
#[derive(Default)]
pub struct ServiceDiscovery {
    local: Vec<ServiceDescriptor>,
    remote: HashMap<String, HashMap<(String, String, String, u64), ServiceDescriptor>>,
    handlers: Vec<Box<dyn FnMut(&ServiceDiscoveryEvent) + Send>>,
}

impl ServiceDiscovery {
    /// Construct an empty discovery controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler invoked once per created/removed event, whether
    /// the event originated locally or from a remote peer.
    pub fn on_event(&mut self, handler: impl FnMut(&ServiceDiscoveryEvent) + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// A service was created locally. Appended to `S_local`, broadcast as a
    /// `ServiceDiscoveryEvent{created}`, and folded into the cached
    /// announcement replayed to new peer-links.
    pub fn local_service_created(&mut self, descriptor: ServiceDescriptor) -> ServiceDiscoveryEvent {
        self.local.push(descriptor.clone());
        let event = ServiceDiscoveryEvent { is_created: true, descriptor };
        self.fire(&event);
        event
    }

    /// A service was removed locally.
    pub fn local_service_removed(&mut self, descriptor: ServiceDescriptor) -> ServiceDiscoveryEvent {
        let k = key(&descriptor);
        self.local.retain(|d| key(d) != k);
        let event = ServiceDiscoveryEvent { is_created: false, descriptor };
        self.fire(&event);
        event
    }

    /// The cached announcement of every locally-owned service, replayed
    /// exactly once to each new peer-link (spec.md §3 invariant).
    pub fn local_announcement(&self) -> ServiceAnnouncement {
        ServiceAnnouncement { descriptors: self.local.clone() }
    }

    /// Apply a full `ServiceAnnouncement` received from `sender`, diffing
    /// against that peer's cached set and firing exactly one handler call
    /// per added/removed descriptor. A re-received identical announcement
    /// produces no events (spec.md §4.5 duplicate-suppression).
    pub fn receive_announcement(&mut self, sender: &str, announcement: ServiceAnnouncement) {
        let incoming: HashMap<_, _> =
            announcement.descriptors.into_iter().map(|d| (key(&d), d)).collect();
        let previous = self.remote.entry(sender.to_string()).or_default();

        let added: Vec<ServiceDescriptor> = incoming
            .iter()
            .filter(|(k, _)| !previous.contains_key(*k))
            .map(|(_, d)| d.clone())
            .collect();
        let removed: Vec<ServiceDescriptor> = previous
            .iter()
            .filter(|(k, _)| !incoming.contains_key(*k))
            .map(|(_, d)| d.clone())
            .collect();

        *previous = incoming;

        for d in added {
            let event = ServiceDiscoveryEvent { is_created: true, descriptor: d };
            self.fire(&event);
        }
        for d in removed {
            let event = ServiceDiscoveryEvent { is_created: false, descriptor: d };
            self.fire(&event);
        }
    }

    /// Apply a single `ServiceDiscoveryEvent` (incremental, as opposed to a
    /// full announcement replay) received from `sender`.
    pub fn receive_event(&mut self, sender: &str, event: ServiceDiscoveryEvent) {
        let previous = self.remote.entry(sender.to_string()).or_default();
        let k = key(&event.descriptor);
        let is_duplicate = match event.is_created {
            true => previous.contains_key(&k),
            false => !previous.contains_key(&k),
        };
        if is_duplicate {
            return;
        }
        if event.is_created {
            previous.insert(k, event.descriptor.clone());
        } else {
            previous.remove(&k);
        }
        self.fire(&event);
    }

    /// Drop every descriptor observed from `peer`, firing a removal event
    /// for each (used when a peer-link is lost permanently, spec.md §7
    /// `PeerLost` -> service-discovery "removed" events).
    pub fn remove_peer(&mut self, peer: &str) {
        if let Some(previous) = self.remote.remove(peer) {
            for d in previous.into_values() {
                let event = ServiceDiscoveryEvent { is_created: false, descriptor: d };
                self.fire(&event);
            }
        }
    }

    /// All descriptors currently observed from `peer`, including our own
    /// cached copies of remote services (used by the pub/sub matcher and by
    /// the time-sync engine's peer discovery).
    pub fn remote_services(&self, peer: &str) -> Vec<&ServiceDescriptor> {
        self.remote.get(peer).map(|m| m.values().collect()).unwrap_or_default()
    }

    fn fire(&mut self, event: &ServiceDiscoveryEvent) {
        for h in &mut self.handlers {
            h(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ServiceType;

    fn descriptor(service_id: u64) -> ServiceDescriptor {
        ServiceDescriptor {
            participant_name: "Peer".into(),
            network_name: "CAN1".into(),
            service_name: "pub1".into(),
            service_type: ServiceType::DataPublisher,
            service_id,
            supplemental: Default::default(),
        }
    }

    #[test]
    fn duplicate_announcement_does_not_refire() {
        let mut disco = ServiceDiscovery::new();
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        disco.on_event(move |_| {
            count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let ann = ServiceAnnouncement { descriptors: vec![descriptor(1)] };
        disco.receive_announcement("Peer", ann.clone());
        disco.receive_announcement("Peer", ann);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_detected_on_next_announcement() {
        let mut disco = ServiceDiscovery::new();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let events2 = events.clone();
        disco.on_event(move |e| events2.lock().unwrap().push(e.is_created));
        disco.receive_announcement("Peer", ServiceAnnouncement { descriptors: vec![descriptor(1)] });
        disco.receive_announcement("Peer", ServiceAnnouncement { descriptors: vec![] });
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn peer_loss_removes_all_its_services() {
        let mut disco = ServiceDiscovery::new();
        disco.receive_announcement("Peer", ServiceAnnouncement { descriptors: vec![descriptor(1), descriptor(2)] });
        let events = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let events2 = events.clone();
        disco.on_event(move |_| *events2.lock().unwrap() += 1);
        disco.remove_peer("Peer");
        assert_eq!(*events.lock().unwrap(), 2);
        assert!(disco.remote_services("Peer").is_empty());
    }

    #[test]
    fn local_creation_and_removal_fire_handlers() {
        let mut disco = ServiceDiscovery::new();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let events2 = events.clone();
        disco.on_event(move |e| events2.lock().unwrap().push(e.is_created));
        disco.local_service_created(descriptor(1));
        assert_eq!(disco.local_announcement().descriptors.len(), 1);
        disco.local_service_removed(descriptor(1));
        assert!(disco.local_announcement().descriptors.is_empty());
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
    }
}
