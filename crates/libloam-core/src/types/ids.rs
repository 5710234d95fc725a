use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest per-millisecond sequence number (24 bits)
const MAX_SEQ: u32 = 0x00ff_ffff;

/// Largest timestamp representable in the 48-bit time field
const MAX_TS_MS: u64 = 0xffff_ffff_ffff;

#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("malformed event id '{0}'")]
    Malformed(String),
    #[error("invalid context id: {0}")]
    InvalidContext(#[from] uuid::Error),
}

/// 64-bit identifier of the client that authored an event (random)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OriginId([u8; 8]);

impl OriginId {
    pub fn generate() -> Self {
        OriginId(rand::thread_rng().gen())
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        OriginId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&id_to_hex(&self.0))
    }
}

impl fmt::Debug for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OriginId({})", self)
    }
}

impl FromStr for OriginId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(OriginId(hex_to_id::<8>(s)?))
    }
}

impl TryFrom<String> for OriginId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OriginId> for String {
    fn from(id: OriginId) -> Self {
        id.to_string()
    }
}

/// Globally sortable mutation event identifier.
///
/// Ordered by `(ts_ms, seq, origin)`. The string form is fixed-width lowercase
/// hex (`tttttttttttt-ssssss-oooooooooooooooo`), so comparing two rendered ids
/// as strings gives the same answer as comparing the ids themselves. This is
/// what lets the log use the text form as its primary key and cursor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId {
    ts_ms: u64,
    seq: u32,
    origin: OriginId,
}

impl EventId {
    pub fn new(ts_ms: u64, seq: u32, origin: OriginId) -> Self {
        Self {
            ts_ms: ts_ms.min(MAX_TS_MS),
            seq: seq.min(MAX_SEQ),
            origin,
        }
    }

    pub fn ts_ms(&self) -> u64 {
        self.ts_ms
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}-{:06x}-{}", self.ts_ms, self.seq, self.origin)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self)
    }
}

impl FromStr for EventId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let (ts, seq, origin) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(ts), Some(seq), Some(origin), None) if ts.len() == 12 && seq.len() == 6 => {
                (ts, seq, origin)
            }
            _ => return Err(IdParseError::Malformed(s.to_string())),
        };
        let ts_ms =
            u64::from_str_radix(ts, 16).map_err(|_| IdParseError::Malformed(s.to_string()))?;
        let seq =
            u32::from_str_radix(seq, 16).map_err(|_| IdParseError::Malformed(s.to_string()))?;
        let origin = origin.parse()?;
        Ok(EventId::new(ts_ms, seq, origin))
    }
}

impl TryFrom<String> for EventId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventId> for String {
    fn from(id: EventId) -> Self {
        id.to_string()
    }
}

/// Issues monotonically increasing event ids for one origin.
///
/// If the wall clock stalls or goes backwards, the generator keeps the last
/// timestamp and bumps the sequence instead.
#[derive(Debug)]
pub struct EventIdGenerator {
    origin: OriginId,
    last_ts: u64,
    seq: u32,
}

impl EventIdGenerator {
    pub fn new(origin: OriginId) -> Self {
        Self {
            origin,
            last_ts: 0,
            seq: 0,
        }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    pub fn next_id(&mut self) -> EventId {
        self.next_at(current_time_ms())
    }

    /// Generate the next id as if the clock read `now_ms`
    pub fn next_at(&mut self, now_ms: u64) -> EventId {
        if now_ms > self.last_ts {
            self.last_ts = now_ms;
            self.seq = 0;
        } else if self.seq >= MAX_SEQ {
            self.last_ts += 1;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        EventId::new(self.last_ts, self.seq, self.origin)
    }
}

/// Identity of one execution context (tab, thread, process) sharing a
/// storage location
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContextId(uuid::Uuid);

impl ContextId {
    pub fn generate() -> Self {
        ContextId(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

impl FromStr for ContextId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ContextId(uuid::Uuid::parse_str(s)?))
    }
}

impl TryFrom<String> for ContextId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContextId> for String {
    fn from(id: ContextId) -> Self {
        id.to_string()
    }
}

/// Convert a fixed-size byte array to lowercase hex string
pub fn id_to_hex<const N: usize>(id: &[u8; N]) -> String {
    hex::encode(id)
}

/// Parse a hex string into a fixed-size byte array
pub fn hex_to_id<const N: usize>(hex_str: &str) -> Result<[u8; N], IdParseError> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != N {
        return Err(IdParseError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Current time in milliseconds since Unix epoch
pub fn current_time_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(n: u8) -> OriginId {
        OriginId::from_bytes([n; 8])
    }

    #[test]
    fn test_event_id_display_is_fixed_width() {
        let id = EventId::new(1, 2, origin(0xab));
        assert_eq!(id.to_string(), "000000000001-000002-abababababababab");
    }

    #[test]
    fn test_event_id_parse_roundtrip() {
        let id = EventId::new(1_700_000_000_000, 42, OriginId::generate());
        let parsed: EventId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_event_id_parse_rejects_garbage() {
        assert!(matches!(
            "not-an-id".parse::<EventId>(),
            Err(IdParseError::Malformed(_))
        ));
        assert!("000000000001-000002-zz".parse::<EventId>().is_err());
    }

    #[test]
    fn test_string_order_matches_id_order() {
        let ids = vec![
            EventId::new(5, 0, origin(9)),
            EventId::new(5, 1, origin(1)),
            EventId::new(16, 0, origin(0)),
            EventId::new(0x1_0000, 3, origin(2)),
        ];
        let mut by_value = ids.clone();
        by_value.sort();
        let mut by_string: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        by_string.sort();
        let rendered: Vec<String> = by_value.iter().map(|i| i.to_string()).collect();
        assert_eq!(rendered, by_string);
    }

    #[test]
    fn test_generator_is_monotonic_when_clock_stalls() {
        let mut gen = EventIdGenerator::new(origin(1));
        let a = gen.next_at(100);
        let b = gen.next_at(100);
        let c = gen.next_at(90);
        let d = gen.next_at(101);
        assert!(a < b && b < c && c < d);
        assert_eq!(c.ts_ms(), 100);
        assert_eq!(d.seq(), 0);
    }

    #[test]
    fn test_generator_rolls_over_sequence() {
        let mut gen = EventIdGenerator::new(origin(1));
        gen.next_at(10);
        gen.seq = MAX_SEQ;
        let next = gen.next_at(10);
        assert_eq!(next.ts_ms(), 11);
        assert_eq!(next.seq(), 0);
    }

    #[test]
    fn test_event_id_serde_as_string() {
        let id = EventId::new(7, 1, origin(3));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_context_ids_are_unique() {
        assert_ne!(ContextId::generate(), ContextId::generate());
    }

    #[test]
    fn test_hex_to_id_invalid_length() {
        let result: Result<[u8; 8], _> = hex_to_id("0001");
        assert!(matches!(result, Err(IdParseError::InvalidLength { .. })));
    }
}
