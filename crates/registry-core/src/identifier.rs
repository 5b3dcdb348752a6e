//! Stable short identifiers for proxies and backends.

use std::cmp::Ordering;
use std::fmt::Display;
use std::fmt::Formatter;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

/// One year in milliseconds, used to bound how far into the future an
/// identifier's epoch may sit.
const ONE_YEAR_MILLIS: u128 = 365 * 24 * 60 * 60 * 1000;

/// Which fleet a [`NodeIdentifier`] was allocated from. Proxies and backends
/// share the same identifier shape but are never interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Proxy,
    Backend,
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Proxy => write!(f, "proxy"),
            NodeKind::Backend => write!(f, "backend"),
        }
    }
}

/// Immutable, comparable identity assigned by the [allocator](crate) to a
/// proxy or backend node.
///
/// Canonical text form is `"{kind}-{uuid}-{instance}-{epoch}"`. Equality and
/// ordering derive from `(epoch, uuid, instance)`, matching spec I3/R1: two
/// identifiers minted at different instants never compare equal even if a
/// UUID were (improbably) reused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeIdentifier {
    kind: NodeKind,
    uuid: uuid::Uuid,
    instance: u8,
    epoch_millis: u128,
}

/// Errors returned while parsing a [`NodeIdentifier`] from its canonical text
/// form, or while minting one outside its valid range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("malformed node identifier: {0:?}")]
    Malformed(String),
    #[error("unknown node kind tag: {0}")]
    UnknownKind(String),
    #[error("instance {0} outside valid range [0,99]")]
    InstanceOutOfRange(u16),
    #[error("epoch timestamp {0} is not positive")]
    NonPositiveEpoch(i128),
    #[error("epoch timestamp {0} is more than one year in the future")]
    EpochTooFarFuture(u128),
}

impl NodeIdentifier {
    /// Construct a new identifier, validating every invariant in spec §3.
    /// Parsing via [`NodeIdentifier::parse`] funnels through this same path,
    /// so construction is total: either valid or rejected (spec parsing
    /// invariant).
    pub fn new(
        kind: NodeKind,
        uuid: uuid::Uuid,
        instance: u16,
        epoch_millis: u128,
    ) -> Result<Self, IdentifierError> {
        if instance > 99 {
            return Err(IdentifierError::InstanceOutOfRange(instance));
        }
        let now = now_millis();
        if epoch_millis > now + ONE_YEAR_MILLIS {
            return Err(IdentifierError::EpochTooFarFuture(epoch_millis));
        }
        Ok(Self {
            kind,
            uuid,
            instance: instance as u8,
            epoch_millis,
        })
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.uuid
    }

    pub fn instance(&self) -> u16 {
        self.instance as u16
    }

    pub fn epoch_millis(&self) -> u128 {
        self.epoch_millis
    }

    /// Parse a canonical `"{kind}-{uuid}-{instance}-{epoch}"` identifier.
    /// Total: any malformed input is rejected rather than panicking.
    pub fn parse(text: &str) -> Result<Self, IdentifierError> {
        let mut parts = text.rsplitn(3, '-');
        let epoch_str = parts.next().ok_or_else(|| IdentifierError::Malformed(text.to_owned()))?;
        let instance_str = parts.next().ok_or_else(|| IdentifierError::Malformed(text.to_owned()))?;
        let rest = parts.next().ok_or_else(|| IdentifierError::Malformed(text.to_owned()))?;
        let (kind_str, uuid_str) = rest
            .split_once('-')
            .ok_or_else(|| IdentifierError::Malformed(text.to_owned()))?;

        let kind = match kind_str {
            "proxy" => NodeKind::Proxy,
            "backend" => NodeKind::Backend,
            other => return Err(IdentifierError::UnknownKind(other.to_owned())),
        };
        let uuid = uuid::Uuid::parse_str(uuid_str)
            .map_err(|_| IdentifierError::Malformed(text.to_owned()))?;
        let instance: u16 = instance_str
            .parse()
            .map_err(|_| IdentifierError::Malformed(text.to_owned()))?;
        let epoch_millis: i128 = epoch_str
            .parse()
            .map_err(|_| IdentifierError::Malformed(text.to_owned()))?;
        if epoch_millis <= 0 {
            return Err(IdentifierError::NonPositiveEpoch(epoch_millis));
        }

        Self::new(kind, uuid, instance, epoch_millis as u128)
    }
}

impl Display for NodeIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.kind, self.uuid, self.instance, self.epoch_millis
        )
    }
}

impl PartialEq for NodeIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.epoch_millis == other.epoch_millis
            && self.uuid == other.uuid
            && self.instance == other.instance
    }
}
impl Eq for NodeIdentifier {}

impl Ord for NodeIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.epoch_millis, self.uuid, self.instance).cmp(&(
            other.epoch_millis,
            other.uuid,
            other.instance,
        ))
    }
}
impl PartialOrd for NodeIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for NodeIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.epoch_millis.hash(state);
        self.uuid.hash(state);
        self.instance.hash(state);
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_canonical_text() {
        let id = NodeIdentifier::new(NodeKind::Proxy, uuid::Uuid::now_v7(), 7, now_millis()).unwrap();
        let text = id.to_string();
        let parsed = NodeIdentifier::parse(&text).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_instance_out_of_range() {
        let err = NodeIdentifier::new(NodeKind::Backend, uuid::Uuid::now_v7(), 100, now_millis());
        assert!(matches!(err, Err(IdentifierError::InstanceOutOfRange(100))));
    }

    #[test]
    fn rejects_epoch_far_in_the_future() {
        let far_future = now_millis() + ONE_YEAR_MILLIS * 2;
        let err = NodeIdentifier::new(NodeKind::Backend, uuid::Uuid::now_v7(), 0, far_future);
        assert!(matches!(err, Err(IdentifierError::EpochTooFarFuture(_))));
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(NodeIdentifier::parse("not-an-id").is_err());
        assert!(NodeIdentifier::parse("").is_err());
    }

    #[test]
    fn orders_by_epoch_then_uuid_then_instance() {
        let u = uuid::Uuid::now_v7();
        let a = NodeIdentifier::new(NodeKind::Proxy, u, 0, 1000).unwrap();
        let b = NodeIdentifier::new(NodeKind::Proxy, u, 0, 2000).unwrap();
        assert!(a < b);
    }
}
