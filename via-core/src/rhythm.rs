//! Rhythm hashing: structural skeletons and stable fingerprints
//!
//! A rhythm hash is a 64-bit fingerprint of an event's level, service, and
//! the token-class skeleton of its message. Two events with the same hash
//! share a template. Hashing uses xxh3, so fingerprints are stable across
//! process restarts and architectures.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xxhash_rust::xxh3::{xxh3_64, xxh3_128};

use crate::error::EncodeError;
use crate::event::LogEvent;

/// A deterministic 64-bit fingerprint of a rhythm class.
///
/// Wire form is fixed-width lowercase hex so the value survives JSON number
/// precision limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RhythmHash(pub u64);

impl std::fmt::Display for RhythmHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for RhythmHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(RhythmHash)
    }
}

impl Serialize for RhythmHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RhythmHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// Whole-message classes, replaced before tokenization. Order matters:
// timestamps before bare numbers, UUIDs before hex runs, URLs before paths.
static RE_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .unwrap()
});
static RE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});
static RE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z][a-zA-Z0-9+.-]*://[^\s'\x22]+").unwrap());
static RE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).unwrap());
static RE_IPV4: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").unwrap());
static RE_IPV6: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){2,7}[0-9a-fA-F]{1,4}\b").unwrap()
});

// Per-token classes, applied after splitting.
static RE_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+(?:\.\d+)?$").unwrap());
static RE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:/[\w.~-]+){2,}/?$|^/[\w.~-]+/?$").unwrap());

const MIN_HEX_LEN: usize = 4;

/// Reduce a message to its structural skeleton.
///
/// Variable lexemes become class placeholders, everything else is lowercased
/// and joined by single spaces. The transformation is deterministic: the same
/// message always yields the same skeleton.
pub fn skeletonize(message: &str) -> String {
    let mut text = RE_TIMESTAMP.replace_all(message, "<ts>").into_owned();
    text = RE_UUID.replace_all(&text, "<uuid>").into_owned();
    text = RE_URL.replace_all(&text, "<url>").into_owned();
    text = RE_QUOTED.replace_all(&text, "<str>").into_owned();
    text = RE_IPV4.replace_all(&text, "<ip>").into_owned();
    text = RE_IPV6.replace_all(&text, "<ip>").into_owned();

    let mut out: Vec<String> = Vec::new();
    for raw in text.split_whitespace() {
        // Punctuation separates tokens but never splits a placeholder,
        // a path, or a dotted identifier.
        for piece in raw.split(|c: char| matches!(c, ':' | ',' | ';' | '=' | '(' | ')' | '[' | ']' | '{' | '}')) {
            let token = piece.trim_matches(|c: char| matches!(c, '.' | '!' | '?'));
            if token.is_empty() {
                continue;
            }
            out.push(classify_token(token));
        }
    }
    out.join(" ")
}

fn classify_token(token: &str) -> String {
    if token.starts_with('<') && token.ends_with('>') {
        return token.to_string();
    }
    if RE_NUMERIC.is_match(token) {
        return "<num>".to_string();
    }
    if is_hex_run(token) {
        return "<hex>".to_string();
    }
    if RE_PATH.is_match(token) {
        return "<path>".to_string();
    }
    token.to_lowercase()
}

// A 0x-prefixed run is unambiguous; a bare run additionally needs a decimal
// digit, otherwise ordinary words built from a-f letters ("deed", "cafe")
// would collapse into <hex>.
fn is_hex_run(token: &str) -> bool {
    if let Some(body) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        body.len() >= MIN_HEX_LEN && !body.is_empty() && body.bytes().all(|b| b.is_ascii_hexdigit())
    } else {
        token.len() >= MIN_HEX_LEN
            && token.bytes().all(|b| b.is_ascii_hexdigit())
            && token.bytes().any(|b| b.is_ascii_digit())
    }
}

/// Compute the rhythm hash for an already-validated event.
///
/// The fingerprint covers `level|service|skeleton`, nothing else: attribute
/// values and message variables never perturb it.
pub fn rhythm_hash(event: &LogEvent) -> RhythmHash {
    let skeleton = skeletonize(&event.message);
    rhythm_hash_of(event.level.as_str(), &event.service, &skeleton)
}

/// Hash pre-extracted parts. Used where the skeleton is already at hand.
pub fn rhythm_hash_of(level: &str, service: &str, skeleton: &str) -> RhythmHash {
    let input = format!("{level}|{service}|{skeleton}");
    RhythmHash(xxh3_64(input.as_bytes()))
}

/// Content-addressed Tier-1 point id over `(ts, service, message)`.
///
/// Identical events always map to the same id, which is what makes replayed
/// tails after a restart cheap to drop.
pub fn point_id(event: &LogEvent) -> Uuid {
    let input = format!("{}|{}|{}", event.ts, event.service, event.message);
    Uuid::from_u128(xxh3_128(input.as_bytes()))
}

/// Stable Tier-2 incident id over `(rhythm_hash, UTC day)`.
///
/// Promotion upserts under this id, which makes it idempotent within a day.
pub fn incident_id(hash: RhythmHash, utc_day: &str) -> Uuid {
    let input = format!("{hash}|{utc_day}");
    Uuid::from_u128(xxh3_128(input.as_bytes()))
}

/// The skeletonized view of a validated event, ready for Tier-1 indexing.
#[derive(Debug, Clone)]
pub struct EncodedEvent {
    pub id: Uuid,
    pub hash: RhythmHash,
    pub skeleton: String,
}

/// Validate and structurally encode an event. Never panics.
pub fn encode(event: &LogEvent) -> Result<EncodedEvent, EncodeError> {
    event.validate()?;
    let skeleton = skeletonize(&event.message);
    let hash = rhythm_hash_of(event.level.as_str(), &event.service, &skeleton);
    Ok(EncodedEvent {
        id: point_id(event),
        hash,
        skeleton,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Level;

    fn ev(message: &str) -> LogEvent {
        LogEvent::new(1_700_000_000, "gateway", Level::Info, message)
    }

    #[test]
    fn skeleton_replaces_numbers() {
        assert_eq!(skeletonize("retry 3 of 5"), "retry <num> of <num>");
    }

    #[test]
    fn skeleton_replaces_ip_and_port() {
        assert_eq!(
            skeletonize("connection established from 10.2.33.4:51442"),
            "connection established from <ip> <num>"
        );
    }

    #[test]
    fn skeleton_replaces_uuid_before_hex() {
        assert_eq!(
            skeletonize("request 550e8400-e29b-41d4-a716-446655440000 done"),
            "request <uuid> done"
        );
    }

    #[test]
    fn skeleton_replaces_hex_ids() {
        assert_eq!(skeletonize("txn 0xdeadbeef committed"), "txn <hex> committed");
        assert_eq!(skeletonize("blob a3f52c91 stored"), "blob <hex> stored");
    }

    #[test]
    fn hex_requires_a_digit() {
        // All-letter words that happen to sit inside [a-f] stay words.
        assert_eq!(skeletonize("cache deed added"), "cache deed added");
    }

    #[test]
    fn skeleton_replaces_paths() {
        assert_eq!(
            skeletonize("assertion failed at /app/src/main.c:42"),
            "assertion failed at <path> <num>"
        );
    }

    #[test]
    fn skeleton_replaces_urls() {
        assert_eq!(
            skeletonize("fetching https://example.com/v1/items?id=9"),
            "fetching <url>"
        );
    }

    #[test]
    fn skeleton_replaces_quoted_strings() {
        assert_eq!(
            skeletonize("user 'alice' not found"),
            "user <str> not found"
        );
    }

    #[test]
    fn skeleton_replaces_iso_timestamps() {
        assert_eq!(
            skeletonize("job started at 2024-06-01T12:30:00Z ok"),
            "job started at <ts> ok"
        );
    }

    #[test]
    fn skeleton_lowercases_words() {
        assert_eq!(skeletonize("Connection REFUSED by peer"), "connection refused by peer");
    }

    #[test]
    fn same_template_same_hash() {
        let a = ev("connection established from 10.0.0.1:4411");
        let b = ev("connection established from 192.168.7.9:62010");
        assert_eq!(rhythm_hash(&a), rhythm_hash(&b));
    }

    #[test]
    fn different_level_different_hash() {
        let a = ev("disk almost full");
        let mut b = a.clone();
        b.level = Level::Warn;
        assert_ne!(rhythm_hash(&a), rhythm_hash(&b));
    }

    #[test]
    fn different_service_different_hash() {
        let a = ev("disk almost full");
        let mut b = a.clone();
        b.service = "billing".to_string();
        assert_ne!(rhythm_hash(&a), rhythm_hash(&b));
    }

    #[test]
    fn hash_agrees_across_derivation_paths() {
        // The event path and the precomputed-skeleton path must agree, and
        // the hex form must round-trip: restart stability depends on both.
        let h = rhythm_hash_of("INFO", "gateway", "connection established from <ip> <num>");
        assert_eq!(h, rhythm_hash(&ev("connection established from 10.0.0.1:4411")));
        assert_eq!(h.to_string().len(), 16);
        let parsed: RhythmHash = h.to_string().parse().unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn hash_serde_round_trips_as_hex_string() {
        let h = RhythmHash(0x00ab_cdef_0123_4567);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, "\"00abcdef01234567\"");
        let back: RhythmHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn point_id_is_content_addressed() {
        let a = ev("connection reset");
        let b = ev("connection reset");
        assert_eq!(point_id(&a), point_id(&b));
        let c = LogEvent::new(1_700_000_001, "gateway", Level::Info, "connection reset");
        assert_ne!(point_id(&a), point_id(&c));
    }

    #[test]
    fn incident_id_is_stable_per_day() {
        let h = RhythmHash(42);
        assert_eq!(incident_id(h, "2024_06_01"), incident_id(h, "2024_06_01"));
        assert_ne!(incident_id(h, "2024_06_01"), incident_id(h, "2024_06_02"));
    }

    #[test]
    fn encode_rejects_bad_events() {
        let bad = LogEvent::new(1_700_000_000, "gateway", Level::Info, "");
        assert!(encode(&bad).is_err());
        let bad = LogEvent::new(-1, "gateway", Level::Info, "x");
        assert!(encode(&bad).is_err());
    }

    #[test]
    fn encode_produces_consistent_views() {
        let event = ev("assertion failed at /app/src/main.c:42");
        let enc = encode(&event).unwrap();
        assert_eq!(enc.skeleton, "assertion failed at <path> <num>");
        assert_eq!(enc.hash, rhythm_hash(&event));
        assert_eq!(enc.id, point_id(&event));
    }
}
