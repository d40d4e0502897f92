//! The per-zone key model.
//!
//! A [`KeySet`] is the ordered collection of [`KeyRecord`]s of one zone.
//! Every rollover rule is built on [`KeySet::find`], which selects the n-th
//! key of a given kind and status in list order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::base::iana::SecurityAlgorithm;
use serde::{Deserialize, Serialize};

use crate::engine::{GenerateError, KeyRequest, SigningEngine};

/// DNSKEY flag bits.
pub mod flags {
    /// The key is a zone key.
    pub const ZONE: u16 = 0x0100;

    /// The key has been revoked (RFC 5011).
    pub const REVOKE: u16 = 0x0080;

    /// Secure entry point, i.e. a key signing key.
    pub const SEP: u16 = 0x0001;
}

/// The only protocol value a DNSKEY record may carry.
pub const PROTOCOL_DNSSEC: u8 = 3;

//------------ UnixTime ------------------------------------------------------

/// Seconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UnixTime(i64);

impl UnixTime {
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self(i64::try_from(d.as_secs()).unwrap_or(i64::MAX)),
            Err(e) => Self(-i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX)),
        }
    }

    pub fn as_secs(self) -> i64 {
        self.0
    }

    /// The time `duration` later.
    pub fn add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(secs(duration)))
    }

    /// The time `duration` earlier.
    pub fn sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(secs(duration)))
    }

    /// The time elapsed since `earlier`, zero if `earlier` lies ahead.
    pub fn since(self, earlier: UnixTime) -> Duration {
        Duration::from_secs(u64::try_from(self.0.saturating_sub(earlier.0)).unwrap_or(0))
    }
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match jiff::Timestamp::from_second(self.0) {
            Ok(ts) => write!(f, "{}", ts.strftime("%Y-%m-%d %H:%M:%S")),
            Err(_) => write!(f, "@{}", self.0),
        }
    }
}

//------------ KeyStatus -----------------------------------------------------

/// The lifecycle status of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Published in the zone but not signing (pre-publish or standby key).
    Published,

    /// Signing the zone.
    Active,

    /// No longer signing, kept until cached signatures have expired.
    Depreciated,

    /// Revoked key signing key (RFC 5011).
    Revoked,
}

impl KeyStatus {
    /// Whether a key of the given kind may move from `self` to `next`.
    ///
    /// Transitions never go backwards and only key signing keys can be
    /// revoked.
    pub fn can_become(self, next: KeyStatus, is_ksk: bool) -> bool {
        use KeyStatus::*;
        match (self, next) {
            (a, b) if a == b => is_ksk || b != Revoked,
            (Published, Active) | (Active, Depreciated) => true,
            (Active, Revoked) => is_ksk,
            _ => false,
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            KeyStatus::Published => "published",
            KeyStatus::Active => "active",
            KeyStatus::Depreciated => "depreciated",
            KeyStatus::Revoked => "revoked",
        })
    }
}

/// A status change that would move a key backwards in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    pub tag: u16,
    pub from: KeyStatus,
    pub to: KeyStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key {} cannot change from {} to {}",
            self.tag, self.from, self.to
        )
    }
}

impl From<InvalidTransition> for crate::error::Error {
    fn from(err: InvalidTransition) -> Self {
        err.to_string().into()
    }
}

//------------ KeyRecord -----------------------------------------------------

/// The attributes of one DNSSEC key.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeyRecord {
    /// Directory holding the key files.
    #[serde(skip)]
    pub dir: PathBuf,

    /// File name of the key files without extension.
    pub base: String,

    /// Owner name of the key.
    pub owner: String,

    pub algorithm: u8,
    pub protocol: u8,
    pub flags: u16,

    /// When the key entered its current status.
    pub created: UnixTime,

    /// The key tag as reported by the signing engine.
    pub tag: u16,

    pub status: KeyStatus,

    /// Lifetime overriding the configured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<Duration>,

    /// Explicit expiration time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<UnixTime>,

    /// The public key in base64.
    pub public_key: String,
}

impl KeyRecord {
    pub fn is_ksk(&self) -> bool {
        self.flags & flags::SEP != 0
    }

    /// Time spent in the current status, clamped to zero on clock skew.
    pub fn age(&self, now: UnixTime) -> Duration {
        now.since(self.created)
    }

    /// Change the status and restart the key's age.
    pub fn set_status(&mut self, status: KeyStatus, now: UnixTime) -> Result<(), InvalidTransition> {
        self.set_status_preserve_time(status)?;
        self.created = now;
        Ok(())
    }

    /// Change the status but keep the time the key's age is counted from.
    pub fn set_status_preserve_time(&mut self, status: KeyStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_become(status, self.is_ksk()) {
            return Err(InvalidTransition {
                tag: self.tag,
                from: self.status,
                to: status,
            });
        }
        if status == KeyStatus::Revoked {
            self.flags |= flags::REVOKE;
        }
        self.status = status;
        Ok(())
    }

    pub fn algorithm_name(&self) -> String {
        SecurityAlgorithm::from_int(self.algorithm).to_string()
    }

    pub fn kind(&self) -> &'static str {
        if self.is_ksk() {
            "KSK"
        } else {
            "ZSK"
        }
    }

    pub fn path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}{ext}", self.base))
    }

    /// The DNSKEY record of this key in presentation format.
    pub fn dnskey(&self, ttl: Option<Duration>) -> String {
        let owner = if self.owner.ends_with('.') {
            self.owner.clone()
        } else {
            format!("{}.", self.owner)
        };
        let ttl = ttl.map(|t| format!("{} ", t.as_secs())).unwrap_or_default();
        format!(
            "{owner} {ttl}IN DNSKEY {} {} {} {}",
            self.flags, self.protocol, self.algorithm, self.public_key
        )
    }
}

//------------ Search --------------------------------------------------------

/// The outcome of looking up a key by tag and name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Search {
    NotFound,
    Found(usize),

    /// More than one key matched; the indexes of all of them.
    Ambiguous(Vec<usize>),
}

//------------ KeySet --------------------------------------------------------

/// The keys of one zone in list order.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KeySet {
    zone: String,
    keys: Vec<KeyRecord>,

    /// Keys removed during this pass, awaiting retirement by the store.
    #[serde(skip)]
    retired: Vec<KeyRecord>,
}

impl KeySet {
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            keys: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn keys(&self) -> &[KeyRecord] {
        &self.keys
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut KeyRecord> {
        self.keys.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Point all keys at the directory the set was loaded from.
    pub fn set_dir(&mut self, dir: &Path) {
        for key in &mut self.keys {
            key.dir = dir.to_path_buf();
        }
    }

    /// Append a key, returning its index.
    pub fn add(&mut self, key: KeyRecord) -> usize {
        self.keys.push(key);
        self.keys.len() - 1
    }

    /// The index of the `nth` key (counting from one) of the given kind and
    /// status.
    pub fn find(&self, ksk: bool, status: KeyStatus, nth: usize) -> Option<usize> {
        if nth == 0 {
            return None;
        }
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_ksk() == ksk && k.status == status)
            .nth(nth - 1)
            .map(|(i, _)| i)
    }

    /// Indexes of all keys of the given kind.
    pub fn indexes(&self, ksk: bool) -> Vec<usize> {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.is_ksk() == ksk)
            .map(|(i, _)| i)
            .collect()
    }

    /// Look a key up by tag and/or owner name.
    pub fn search(&self, tag: Option<u16>, name: Option<&str>) -> Search {
        let matches: Vec<usize> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(_, k)| tag.is_none_or(|t| k.tag == t))
            .filter(|(_, k)| name.is_none_or(|n| same_name(&k.owner, n)))
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => Search::NotFound,
            1 => Search::Found(matches[0]),
            _ => Search::Ambiguous(matches),
        }
    }

    /// Tags shared by more than one key, with the keys sharing them.
    pub fn duplicate_tags(&self) -> Vec<(u16, Vec<usize>)> {
        let mut tags: Vec<u16> = self.keys.iter().map(|k| k.tag).collect();
        tags.sort_unstable();
        tags.dedup();
        tags.into_iter()
            .filter_map(|tag| match self.search(Some(tag), None) {
                Search::Ambiguous(keys) => Some((tag, keys)),
                _ => None,
            })
            .collect()
    }

    /// Take a key out of the set and queue it for retirement.
    pub fn remove(&mut self, index: usize) -> Option<&KeyRecord> {
        if index >= self.keys.len() {
            return None;
        }
        let key = self.keys.remove(index);
        self.retired.push(key);
        self.retired.last()
    }

    pub fn retired(&self) -> &[KeyRecord] {
        &self.retired
    }

    pub fn take_retired(&mut self) -> Vec<KeyRecord> {
        std::mem::take(&mut self.retired)
    }

    /// Mint a key through the signing engine and add it with `status`.
    pub fn generate(
        &mut self,
        engine: &mut impl SigningEngine,
        request: &KeyRequest,
        status: KeyStatus,
        now: UnixTime,
    ) -> Result<usize, GenerateError> {
        let new = engine.generate(request)?;
        let mut flags = new.flags | flags::ZONE;
        if request.ksk {
            flags |= flags::SEP;
        }
        Ok(self.add(KeyRecord {
            dir: request.dir.clone(),
            base: new.base,
            owner: request.zone.clone(),
            algorithm: new.algorithm,
            protocol: PROTOCOL_DNSSEC,
            flags,
            created: now,
            tag: new.tag,
            status,
            lifetime: request.lifetime,
            expires: None,
            public_key: new.public_key,
        }))
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}
