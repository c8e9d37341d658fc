use crate::error::{ParseProfileTypeError, StorageError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    Cpu,
    Heap,
    Block,
    Mutex,
    Goroutine,
    Threadcreate,
    Other,
}

impl ProfileType {
    /// All types in key order.
    pub const ALL: [ProfileType; 7] = [
        ProfileType::Cpu,
        ProfileType::Heap,
        ProfileType::Block,
        ProfileType::Mutex,
        ProfileType::Goroutine,
        ProfileType::Threadcreate,
        ProfileType::Other,
    ];

    /// Stable code stored in keys. Never reorder.
    pub fn code(self) -> u8 {
        match self {
            ProfileType::Cpu => 1,
            ProfileType::Heap => 2,
            ProfileType::Block => 3,
            ProfileType::Mutex => 4,
            ProfileType::Goroutine => 5,
            ProfileType::Threadcreate => 6,
            ProfileType::Other => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileType::Cpu => "cpu",
            ProfileType::Heap => "heap",
            ProfileType::Block => "block",
            ProfileType::Mutex => "mutex",
            ProfileType::Goroutine => "goroutine",
            ProfileType::Threadcreate => "threadcreate",
            ProfileType::Other => "other",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileType {
    type Err = ParseProfileTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| ParseProfileTypeError(s.to_string()))
    }
}

/// Metadata supplied by a writer. The disambiguator is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub service: String,
    pub profile_type: ProfileType,
    pub created_at: DateTime<Utc>,
}

impl NewProfile {
    pub fn new(
        service: impl Into<String>,
        profile_type: ProfileType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            service: service.into(),
            profile_type,
            created_at,
        }
    }

    /// Assigns a fresh disambiguator.
    pub fn into_meta(self) -> ProfileMeta {
        ProfileMeta {
            service: self.service,
            profile_type: self.profile_type,
            created_at: self.created_at,
            disambiguator: generate_disambiguator(),
        }
    }
}

/// Identifies one stored profile. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProfileMeta {
    pub service: String,
    pub profile_type: ProfileType,
    pub created_at: DateTime<Utc>,
    pub disambiguator: String,
}

impl ProfileMeta {
    pub fn key(&self) -> Result<Vec<u8>, StorageError> {
        key::encode_key(
            &self.service,
            self.profile_type,
            self.created_at,
            &self.disambiguator,
        )
    }

    pub fn id(&self) -> Result<ProfileId, StorageError> {
        ProfileId::from_key(self.key()?)
    }
}

/// Random fixed-width suffix that keeps same-timestamp writes apart.
pub fn generate_disambiguator() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Stored ID handed back to writers: the textual storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    pub(crate) fn from_key(key: Vec<u8>) -> Result<Self, StorageError> {
        String::from_utf8(key)
            .map(ProfileId)
            .map_err(|_| StorageError::CorruptKey("key is not valid UTF-8".to_string()))
    }

    /// Parses an ID received from outside, checking that it is a well-formed key.
    pub fn parse(id: &str) -> Result<Self, StorageError> {
        key::decode_key(id.as_bytes())?;
        Ok(ProfileId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn meta(&self) -> Result<ProfileMeta, StorageError> {
        key::decode_key(self.as_bytes())
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub meta: ProfileMeta,
    pub payload: Bytes,
}

/// Range query over one service: `[from, to)`, optionally narrowed to a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub service: String,
    pub profile_type: Option<ProfileType>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(service: impl Into<String>, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            service: service.into(),
            profile_type: None,
            from,
            to,
            limit: None,
        }
    }

    pub fn with_type(mut self, profile_type: ProfileType) -> Self {
        self.profile_type = Some(profile_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.service.is_empty() {
            return Err(StorageError::InvalidQuery("service is required".to_string()));
        }
        if self.from >= self.to {
            return Err(StorageError::InvalidQuery(format!(
                "empty time range: from {} is not before to {}",
                self.from, self.to
            )));
        }
        if self.limit == Some(0) {
            return Err(StorageError::InvalidQuery(
                "limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Types this query touches, in key order.
    pub fn types(&self) -> Vec<ProfileType> {
        match self.profile_type {
            Some(t) => vec![t],
            None => ProfileType::ALL.to_vec(),
        }
    }

    /// One tight key range per concrete type. Wildcard queries fan out
    /// rather than scanning the covering interval.
    pub fn key_ranges(&self) -> Result<Vec<(ProfileType, key::KeyRange)>, StorageError> {
        self.validate()?;
        self.types()
            .into_iter()
            .map(|t| {
                key::encode_range_bounds(&self.service, Some(t), self.from, self.to)
                    .map(|range| (t, range))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    #[test_case("cpu", ProfileType::Cpu)]
    #[test_case("HEAP", ProfileType::Heap)]
    #[test_case("threadcreate", ProfileType::Threadcreate)]
    fn test_parse_profile_type(input: &str, expected: ProfileType) {
        assert_eq!(input.parse::<ProfileType>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_profile_type() {
        assert!("wallclock".parse::<ProfileType>().is_err());
    }

    #[test]
    fn test_codes_are_unique_and_ordered() {
        let codes: Vec<u8> = ProfileType::ALL.iter().map(|t| t.code()).collect();
        let mut sorted = codes.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(codes, sorted);
        for t in ProfileType::ALL {
            assert_eq!(ProfileType::from_code(t.code()), Some(t));
        }
    }

    #[test]
    fn test_disambiguators_are_fixed_width() {
        let a = generate_disambiguator();
        let b = generate_disambiguator();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_query_validation() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        assert!(Query::new("api", t0, t1).validate().is_ok());
        assert!(matches!(
            Query::new("", t0, t1).validate(),
            Err(StorageError::InvalidQuery(_))
        ));
        assert!(matches!(
            Query::new("api", t1, t0).validate(),
            Err(StorageError::InvalidQuery(_))
        ));
        assert!(matches!(
            Query::new("api", t0, t0).validate(),
            Err(StorageError::InvalidQuery(_))
        ));
        assert!(matches!(
            Query::new("api", t0, t1).with_limit(0).validate(),
            Err(StorageError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_wildcard_query_fans_out_per_type() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        let all = Query::new("api", t0, t1).key_ranges().unwrap();
        assert_eq!(all.len(), ProfileType::ALL.len());

        let one = Query::new("api", t0, t1)
            .with_type(ProfileType::Heap)
            .key_ranges()
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].0, ProfileType::Heap);
    }
}
