//! Order-preserving storage keys.
//!
//! Layout: `<hex(service)>/<type code:2>/<created_at nanos:20>/<disambiguator:16>`.
//!
//! The service is hex encoded so that every byte of the segment sorts above
//! the `/` separator; byte order of whole keys then matches the
//! `(service, type, timestamp, disambiguator)` tuple order for any service
//! name. The same textual key is used as the redb key and the S3 object key.

use crate::error::StorageError;
use chrono::{DateTime, Utc};

use super::types::{ProfileMeta, ProfileType};

pub const MAX_SERVICE_LEN: usize = 255;
pub const DISAMBIGUATOR_LEN: usize = 16;

const SEP: u8 = b'/';
const TYPE_WIDTH: usize = 2;
const TIMESTAMP_WIDTH: usize = 20;

/// Half-open key interval `[lower, upper)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Vec<u8>,
    pub upper: Vec<u8>,
}

impl KeyRange {
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.lower.as_slice() && key < self.upper.as_slice()
    }
}

pub fn encode_key(
    service: &str,
    profile_type: ProfileType,
    created_at: DateTime<Utc>,
    disambiguator: &str,
) -> Result<Vec<u8>, StorageError> {
    validate_service(service).map_err(StorageError::InvalidMetadata)?;
    let nanos = timestamp_nanos(created_at).map_err(StorageError::InvalidMetadata)?;
    if disambiguator.len() != DISAMBIGUATOR_LEN || !is_lower_hex(disambiguator.as_bytes()) {
        return Err(StorageError::InvalidMetadata(format!(
            "disambiguator must be {} lowercase hex characters, got {:?}",
            DISAMBIGUATOR_LEN, disambiguator
        )));
    }

    let mut key = type_prefix(service, profile_type);
    push_timestamp(&mut key, nanos);
    key.push(SEP);
    key.extend_from_slice(disambiguator.as_bytes());
    Ok(key)
}

/// Key interval for `[from, to)`. With a type the interval is tight; without
/// one it covers every type of the service, so entries outside the time
/// window fall inside it and must be filtered by the caller.
pub fn encode_range_bounds(
    service: &str,
    profile_type: Option<ProfileType>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<KeyRange, StorageError> {
    validate_service(service).map_err(StorageError::InvalidQuery)?;
    let (first, last) = match profile_type {
        Some(t) => (t, t),
        None => (ProfileType::ALL[0], ProfileType::ALL[ProfileType::ALL.len() - 1]),
    };

    let mut lower = type_prefix(service, first);
    push_timestamp(&mut lower, clamp_nanos(from));
    let mut upper = type_prefix(service, last);
    push_timestamp(&mut upper, clamp_nanos(to));

    Ok(KeyRange { lower, upper })
}

pub fn decode_key(key: &[u8]) -> Result<ProfileMeta, StorageError> {
    let corrupt = |reason: &str| {
        StorageError::CorruptKey(format!("{}: {:?}", reason, String::from_utf8_lossy(key)))
    };

    let parts: Vec<&[u8]> = key.split(|b| *b == SEP).collect();
    let [service, code, ts, disambiguator] = parts.as_slice() else {
        return Err(corrupt("expected 4 segments"));
    };

    if service.is_empty() || !is_lower_hex(service) {
        return Err(corrupt("service segment is not lowercase hex"));
    }
    let service = hex::decode(service)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| corrupt("service segment does not decode to UTF-8"))?;

    let profile_type = parse_fixed_digits(code, TYPE_WIDTH)
        .and_then(|c| u8::try_from(c).ok())
        .and_then(ProfileType::from_code)
        .ok_or_else(|| corrupt("unknown profile type code"))?;

    let nanos = parse_fixed_digits(ts, TIMESTAMP_WIDTH)
        .and_then(|n| i64::try_from(n).ok())
        .ok_or_else(|| corrupt("timestamp segment out of range"))?;

    if disambiguator.len() != DISAMBIGUATOR_LEN || !is_lower_hex(disambiguator) {
        return Err(corrupt("malformed disambiguator"));
    }

    Ok(ProfileMeta {
        service,
        profile_type,
        created_at: DateTime::from_timestamp_nanos(nanos),
        // checked as ASCII hex above
        disambiguator: String::from_utf8_lossy(disambiguator).into_owned(),
    })
}

/// `<hex(service)>/<type>/`, the common prefix of every key of one type.
pub(crate) fn type_prefix(service: &str, profile_type: ProfileType) -> Vec<u8> {
    let mut key = Vec::with_capacity(
        service.len() * 2 + TYPE_WIDTH + TIMESTAMP_WIDTH + DISAMBIGUATOR_LEN + 3,
    );
    key.extend_from_slice(hex::encode(service.as_bytes()).as_bytes());
    key.push(SEP);
    key.extend_from_slice(format!("{:0width$}", profile_type.code(), width = TYPE_WIDTH).as_bytes());
    key.push(SEP);
    key
}

fn validate_service(service: &str) -> Result<(), String> {
    if service.is_empty() {
        return Err("service name must not be empty".to_string());
    }
    if service.len() > MAX_SERVICE_LEN {
        return Err(format!(
            "service name is {} bytes, limit is {}",
            service.len(),
            MAX_SERVICE_LEN
        ));
    }
    Ok(())
}

fn timestamp_nanos(ts: DateTime<Utc>) -> Result<u64, String> {
    match ts.timestamp_nanos_opt() {
        Some(n) if n >= 0 => Ok(n as u64),
        _ => Err(format!("created_at {} is outside the storable range", ts)),
    }
}

/// Query bounds may lie outside the storable range; clamp instead of failing.
fn clamp_nanos(ts: DateTime<Utc>) -> u64 {
    match ts.timestamp_nanos_opt() {
        Some(n) => n.max(0) as u64,
        None if ts.timestamp() < 0 => 0,
        None => i64::MAX as u64,
    }
}

fn push_timestamp(key: &mut Vec<u8>, nanos: u64) {
    key.extend_from_slice(format!("{:0width$}", nanos, width = TIMESTAMP_WIDTH).as_bytes());
}

fn parse_fixed_digits(segment: &[u8], width: usize) -> Option<u64> {
    if segment.len() != width || !segment.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(segment).ok()?.parse().ok()
}

fn is_lower_hex(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
