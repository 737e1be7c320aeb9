//! Topic alias tables of one connection.
//!
//! Both tables are rebuilt on every CONNACK; aliases never survive a reconnect even when the
//! session does.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU16;

use bytestring::ByteString;

use rmqttc_codec::v5::{DisconnectReasonCode, PublishProperties};
use rmqttc_codec::types::Publish;
use rmqttc_conf::TopicAliasPolicy;

use crate::error::{MqttError, Result};

/// What happened to an outgoing publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasUse {
    /// Sent with the full topic name only
    None,
    /// Topic name and a newly assigned alias, the peer learns the mapping
    Established(NonZeroU16),
    /// Alias only, the topic name is sent empty
    Reused(NonZeroU16),
}

/// Aliases we assign, bounded by the Topic Alias Maximum granted in CONNACK.
#[derive(Debug)]
pub struct OutgoingAliases {
    maximum: u16,
    topics: HashMap<ByteString, NonZeroU16>,
    // assignment order, the front is overwritten first under `Force`
    order: VecDeque<(NonZeroU16, ByteString)>,
    next: u16,
    free: Vec<NonZeroU16>,
}

impl OutgoingAliases {
    pub fn new(maximum: u16) -> Self {
        Self { maximum, topics: HashMap::new(), order: VecDeque::new(), next: 1, free: Vec::new() }
    }

    pub fn reset(&mut self, maximum: u16) {
        self.maximum = maximum;
        self.topics.clear();
        self.order.clear();
        self.next = 1;
        self.free.clear();
    }

    fn allocate(&mut self) -> Option<NonZeroU16> {
        if let Some(alias) = self.free.pop() {
            return Some(alias);
        }
        if self.next > self.maximum {
            return None;
        }
        let alias = NonZeroU16::new(self.next)?;
        self.next = self.next.saturating_add(1);
        Some(alias)
    }

    /// Drops a mapping the peer never learned, e.g. because its packet could not be sent.
    pub fn forget(&mut self, alias: NonZeroU16) {
        self.topics.retain(|_, a| *a != alias);
        self.order.retain(|(a, _)| *a != alias);
        self.free.push(alias);
    }

    #[inline]
    pub fn maximum(&self) -> u16 {
        self.maximum
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    fn lookup(&mut self, topic: &ByteString, policy: TopicAliasPolicy) -> AliasUse {
        if self.maximum == 0 || topic.is_empty() || policy == TopicAliasPolicy::Forbid {
            return AliasUse::None;
        }
        if let Some(alias) = self.topics.get(topic) {
            return AliasUse::Reused(*alias);
        }
        if self.topics.len() < self.maximum as usize {
            if let Some(alias) = self.allocate() {
                self.topics.insert(topic.clone(), alias);
                self.order.push_back((alias, topic.clone()));
                return AliasUse::Established(alias);
            }
        }
        if policy == TopicAliasPolicy::Force {
            if let Some((alias, old)) = self.order.pop_front() {
                self.topics.remove(&old);
                self.topics.insert(topic.clone(), alias);
                self.order.push_back((alias, topic.clone()));
                return AliasUse::Established(alias);
            }
        }
        AliasUse::None
    }

    /// Rewrites `publish` for the wire: sets the alias property and, for a known topic, clears
    /// the topic name.
    pub fn apply(&mut self, publish: &mut Publish, policy: TopicAliasPolicy) -> AliasUse {
        let used = self.lookup(&publish.topic, policy);
        match used {
            AliasUse::None => {
                if let Some(props) = publish.properties.as_mut() {
                    props.topic_alias = None;
                }
            }
            AliasUse::Established(alias) => {
                publish.properties.get_or_insert_with(PublishProperties::default).topic_alias = Some(alias.get());
            }
            AliasUse::Reused(alias) => {
                publish.properties.get_or_insert_with(PublishProperties::default).topic_alias = Some(alias.get());
                publish.topic = ByteString::new();
            }
        }
        used
    }
}

impl Default for OutgoingAliases {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Aliases the server assigns, bounded by the Topic Alias Maximum we sent in CONNECT.
#[derive(Debug, Default)]
pub struct IncomingAliases {
    maximum: u16,
    topics: HashMap<NonZeroU16, ByteString>,
}

impl IncomingAliases {
    pub fn new(maximum: u16) -> Self {
        Self { maximum, topics: HashMap::new() }
    }

    pub fn reset(&mut self, maximum: u16) {
        self.maximum = maximum;
        self.topics.clear();
    }

    /// Records or resolves the alias of an incoming publish, filling in its topic name.
    pub fn resolve(&mut self, publish: &mut Publish) -> Result<()> {
        let Some(alias) = publish.topic_alias() else {
            if publish.topic.is_empty() {
                return Err(MqttError::violation(DisconnectReasonCode::TopicNameInvalid, "empty topic without alias"));
            }
            return Ok(());
        };
        let Some(alias) = NonZeroU16::new(alias).filter(|a| a.get() <= self.maximum) else {
            return Err(MqttError::violation(
                DisconnectReasonCode::TopicAliasInvalid,
                format!("topic alias {} is outside 1..={}", alias, self.maximum),
            ));
        };
        if publish.topic.is_empty() {
            match self.topics.get(&alias) {
                Some(topic) => publish.topic = topic.clone(),
                None => {
                    return Err(MqttError::violation(
                        DisconnectReasonCode::TopicAliasInvalid,
                        format!("unknown topic alias {}", alias),
                    ))
                }
            }
        } else {
            self.topics.insert(alias, publish.topic.clone());
        }
        Ok(())
    }
}
