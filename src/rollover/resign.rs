//! Deciding whether a zone must be signed again.

use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::keys::UnixTime;

/// Signatures are renewed this much before the resign interval is up, so
/// a zone due shortly after a pass is signed in that pass.
pub const RESIGN_OFFSET: Duration = Duration::from_secs(5 * 60);

/// What is known about a zone when deciding on resigning.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResignInputs {
    /// Signing was requested explicitly.
    pub force: bool,

    /// A key changed status during this pass.
    pub new_keys: bool,

    /// Modification time of the zone source file.
    pub zone_modified: Option<UnixTime>,

    /// Modification time of the key database file.
    pub keys_modified: Option<UnixTime>,

    /// Modification time of the signed output; `None` if never signed.
    pub last_signed: Option<UnixTime>,

    /// A delegated child published a new keyset.
    pub new_child_keyset: bool,

    /// The zone is dynamically updated.
    pub dynamic: bool,
}

/// Why a zone is signed again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResignReason {
    Forced,
    NewKeys,
    NeverSigned,
    ZoneModified,
    KeysModified,
    Expiring,
    ChildKeyset,
    Dynamic,
}

impl fmt::Display for ResignReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResignReason::Forced => "signing forced",
            ResignReason::NewKeys => "keys changed",
            ResignReason::NeverSigned => "zone has not been signed yet",
            ResignReason::ZoneModified => "zone file is newer than the signed zone",
            ResignReason::KeysModified => "key file is newer than the signed zone",
            ResignReason::Expiring => "resign interval reached",
            ResignReason::ChildKeyset => "new keyset from a child zone",
            ResignReason::Dynamic => "zone is dynamic",
        })
    }
}

/// The first reason the zone must be signed, or `None` if it need not be.
pub fn decide(inputs: &ResignInputs, config: &Config, now: UnixTime) -> Option<ResignReason> {
    if inputs.force {
        return Some(ResignReason::Forced);
    }
    if inputs.new_keys {
        return Some(ResignReason::NewKeys);
    }
    let Some(signed) = inputs.last_signed else {
        return Some(ResignReason::NeverSigned);
    };
    if inputs.zone_modified.is_some_and(|t| t > signed) {
        return Some(ResignReason::ZoneModified);
    }
    if inputs.keys_modified.is_some_and(|t| t > signed) {
        return Some(ResignReason::KeysModified);
    }
    if now.since(signed) > config.resign_interval.saturating_sub(RESIGN_OFFSET) {
        return Some(ResignReason::Expiring);
    }
    if inputs.new_child_keyset {
        return Some(ResignReason::ChildKeyset);
    }
    if inputs.dynamic {
        return Some(ResignReason::Dynamic);
    }
    None
}
