//! Lifecycle monitoring of key signing keys outside RFC 5011 mode.

use tracing::{error, info, warn};

use crate::engine::SigningEngine;
use crate::keys::{KeySet, KeyStatus};
use crate::parse::format_age;

use super::RollContext;

/// Make sure the zone has an active KSK and warn once it is past its
/// lifetime.
///
/// An expired KSK is never replaced here: its DS record lives in the parent
/// zone, so replacing it needs the operator (see [`super::manual`]).
///
/// Returns whether a new key was created, which requires resigning.
pub fn ksk_status(keys: &mut KeySet, ctx: &RollContext<'_>, engine: &mut impl SigningEngine) -> bool {
    let zone = ctx.zone;
    let Some(active) = keys.find(true, KeyStatus::Active, 1) else {
        info!(zone, "no active KSK found: generating a new one");
        let request = ctx.config.key_request(ctx.dir, zone, true);
        return match keys.generate(engine, &request, KeyStatus::Active, ctx.now) {
            Ok(index) => {
                info!(zone, "created active KSK {}", keys.keys()[index].tag);
                true
            }
            Err(err) => {
                error!(zone, "cannot generate new KSK: {}", err.diagnostic());
                false
            }
        };
    };

    let key = &keys.keys()[active];
    let lifetime = key.lifetime.unwrap_or(ctx.config.ksk.lifetime);
    let age = key.age(ctx.now);
    if !lifetime.is_zero() && age > lifetime {
        warn!(
            zone,
            "lifetime of KSK {} exceeded since {}: a manual rollover is due",
            key.tag,
            format_age(age - lifetime)
        );
    }
    false
}
