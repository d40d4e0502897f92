//! The key rollover decision engine.
//!
//! Each scheduled pass runs, per zone, one of the two KSK paths
//! ([`ksk::ksk_status`] or [`rfc5011::ksk5011_status`]), then
//! [`zsk::zsk_status`], and finally asks [`resign::decide`] whether the zone
//! must be signed again. The manual KSK rollover in [`manual`] is driven by
//! the operator instead.
//!
//! All rules look at key ages relative to an explicit `now`, so running a
//! rule twice without a threshold being crossed in between changes nothing.

use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::keys::UnixTime;

pub mod ksk;
pub mod manual;
pub mod resign;
pub mod rfc5011;
pub mod zsk;

/// Slack applied to lifetimes so a key due shortly after a pass is rolled
/// in that pass.
pub const OFFSET: Duration = Duration::from_secs(150);

const DAY: u64 = 86400;

/// How long a revoked KSK stays published (RFC 5011 remove hold-down).
pub const REMOVE_HOLD_DOWN: Duration = Duration::from_secs(30 * DAY);

/// Upper bound of the time a standby KSK must be published before use
/// (RFC 5011 add hold-down).
pub const ADD_HOLD_DOWN: Duration = Duration::from_secs(30 * DAY);

/// What a rollover rule needs to know about the zone it works on.
#[derive(Clone, Copy, Debug)]
pub struct RollContext<'a> {
    pub zone: &'a str,
    pub dir: &'a Path,
    pub config: &'a Config,
    pub now: UnixTime,
}
