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

//! Publisher/subscriber matching by topic, media-type, and label predicate
//! (spec.md §4.6).

use std::collections::BTreeMap;

use uuid::Uuid;

/// A data publisher's announced identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublisherAnnouncement {
    /// Publisher's unique identity; internal subscriber links are named by
    /// this UUID instead of the topic string.
    pub uuid: Uuid,
    /// Topic string, matched by exact equality.
    pub topic: String,
    /// Media type; empty on the subscriber side matches any publisher.
    pub media_type: String,
    /// Label set; a subscriber matches if every one of its own label keys
    /// is present here with an equal value.
    pub labels: BTreeMap<String, String>,
}

/// A data subscriber's match predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriberSpec {
    /// Topic string, matched by exact equality.
    pub topic: String,
    /// Media type; empty matches any publisher's media type.
    pub media_type: String,
    /// Required label subset.
    pub labels: BTreeMap<String, String>,
}

impl SubscriberSpec {
    /// Evaluate the match predicate (spec.md §4.6):
    /// - topic: exact equality
    /// - media type: empty subscriber side matches any publisher
    /// - labels: every subscriber key must be present on the publisher side
    ///   with an equal value; absent keys count as a mismatch.
    pub fn matches(&self, publisher: &PublisherAnnouncement) -> bool {
        if self.topic != publisher.topic {
            return false;
        }
        if !self.media_type.is_empty() && self.media_type != publisher.media_type {
            return false;
        }
        self.labels.iter().all(|(k, v)| publisher.labels.get(k) == Some(v))
    }
}

/// An internal subscriber link bound to a matched publisher, named by the
/// publisher's UUID rather than its topic string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalSubscriber {
    /// The publisher this link is bound to.
    pub publisher_uuid: Uuid,
}

/// One subscriber's view of the mesh: its predicate plus every publisher it
/// currently matches.
pub struct DataSubscriber {
    spec: SubscriberSpec,
    matched: BTreeMap<Uuid, PublisherAnnouncement>,
}

impl DataSubscriber {
    /// Construct a subscriber with no matches yet.
    pub fn new(spec: SubscriberSpec) -> Self {
        Self { spec, matched: BTreeMap::new() }
    }

    /// A publisher announcement arrived. Returns `Some` internal subscriber
    /// link to spawn if the predicate matches and this publisher wasn't
    /// already matched; `None` otherwise.
    pub fn observe_publisher(&mut self, publisher: PublisherAnnouncement) -> Option<InternalSubscriber> {
        if !self.spec.matches(&publisher) {
            return None;
        }
        if self.matched.contains_key(&publisher.uuid) {
            return None;
        }
        let uuid = publisher.uuid;
        self.matched.insert(uuid, publisher);
        Some(InternalSubscriber { publisher_uuid: uuid })
    }

    /// A publisher was removed (or, after re-evaluation, no longer
    /// matches). Returns `true` if an internal subscriber link for it
    /// should be torn down.
    pub fn remove_publisher(&mut self, uuid: Uuid) -> bool {
        self.matched.remove(&uuid).is_some()
    }

    /// Currently matched publisher UUIDs.
    pub fn matched_publishers(&self) -> impl Iterator<Item = &Uuid> {
        self.matched.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publisher(topic: &str, media_type: &str, labels: &[(&str, &str)]) -> PublisherAnnouncement {
        PublisherAnnouncement {
            uuid: Uuid::new_v4(),
            topic: topic.to_string(),
            media_type: media_type.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    // Mirrors spec.md §8 scenario 4: publisher T/"A"/{k1:v1,k2:v2}; S1
    // matches, S2 and S3 do not.
    #[test]
    fn label_subset_and_media_type_wildcard_scenario() {
        let pub1 = publisher("T", "A", &[("k1", "v1"), ("k2", "v2")]);

        let mut s1 = DataSubscriber::new(SubscriberSpec {
            topic: "T".into(),
            media_type: "".into(),
            labels: [("k1".to_string(), "v1".to_string())].into_iter().collect(),
        });
        assert!(s1.observe_publisher(pub1.clone()).is_some());

        let mut s2 = DataSubscriber::new(SubscriberSpec {
            topic: "T".into(),
            media_type: "A".into(),
            labels: [("k1".to_string(), "v1".to_string()), ("k3".to_string(), "v3".to_string())]
                .into_iter()
                .collect(),
        });
        assert!(s2.observe_publisher(pub1.clone()).is_none());

        let mut s3 = DataSubscriber::new(SubscriberSpec {
            topic: "T".into(),
            media_type: "B".into(),
            labels: BTreeMap::new(),
        });
        assert!(s3.observe_publisher(pub1).is_none());
    }

    #[test]
    fn rematching_same_publisher_is_not_duplicated() {
        let mut sub = DataSubscriber::new(SubscriberSpec {
            topic: "T".into(),
            media_type: "".into(),
            labels: BTreeMap::new(),
        });
        let publisher = publisher("T", "A", &[]);
        assert!(sub.observe_publisher(publisher.clone()).is_some());
        assert!(sub.observe_publisher(publisher).is_none());
        assert_eq!(sub.matched_publishers().count(), 1);
    }

    #[test]
    fn removal_tears_down_internal_subscriber() {
        let mut sub = DataSubscriber::new(SubscriberSpec {
            topic: "T".into(),
            media_type: "".into(),
            labels: BTreeMap::new(),
        });
        let publisher = publisher("T", "A", &[]);
        let uuid = publisher.uuid;
        sub.observe_publisher(publisher);
        assert!(sub.remove_publisher(uuid));
        assert_eq!(sub.matched_publishers().count(), 0);
    }

    #[test]
    fn topic_mismatch_never_matches() {
        let mut sub = DataSubscriber::new(SubscriberSpec {
            topic: "T1".into(),
            media_type: "".into(),
            labels: BTreeMap::new(),
        });
        assert!(sub.observe_publisher(publisher("T2", "", &[])).is_none());
    }
}
