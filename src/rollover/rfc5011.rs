//! Automated KSK rollover with RFC 5011 trust anchor signalling.
//!
//! A zone is in RFC 5011 mode once it carries a standby KSK (a published,
//! not yet active key signing key) or a revoked one. When the active KSK
//! expires, the standby takes over, the old key is revoked and a fresh
//! standby is published, so exactly one standby is always in the pipeline.
//! Resolvers that track the zone as a trust anchor follow along without the
//! operator having to do anything.

use std::cmp::min;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::engine::SigningEngine;
use crate::error::Error;
use crate::keys::{KeyRecord, KeySet, KeyStatus, UnixTime};
use crate::parse::format_age;

use super::{ksk, RollContext, ADD_HOLD_DOWN, REMOVE_HOLD_DOWN};

/// What the RFC 5011 check found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rfc5011Status {
    /// The zone must be signed again.
    pub resign: bool,

    /// The zone uses RFC 5011 rollovers.
    pub in_use: bool,
}

/// When a KSK expires: its explicit expiration, or its lifetime after it
/// became active.
pub fn expiration(key: &KeyRecord, config: &Config) -> UnixTime {
    key.expires
        .unwrap_or_else(|| key.created.add(key.lifetime.unwrap_or(config.ksk.lifetime)))
}

/// Run the RFC 5011 state machine over the key signing keys of a zone.
pub fn ksk5011_status(
    keys: &mut KeySet,
    ctx: &RollContext<'_>,
    engine: &mut impl SigningEngine,
) -> Result<Rfc5011Status, Error> {
    let config = ctx.config;
    let now = ctx.now;
    let zone = ctx.zone;
    let mut status = Rfc5011Status::default();
    if config.ksk.lifetime.is_zero() {
        return Ok(status);
    }
    debug!(zone, "checking RFC 5011 status");

    let revoked_present = keys.find(true, KeyStatus::Revoked, 1).is_some();
    loop {
        let Some(index) = (1..)
            .map_while(|nth| keys.find(true, KeyStatus::Revoked, nth))
            .find(|&i| now > expiration(&keys.keys()[i], config).add(REMOVE_HOLD_DOWN))
        else {
            break;
        };
        if let Some(key) = keys.remove(index) {
            info!(
                zone,
                "removing revoked KSK {} which is older than {}",
                key.tag,
                format_age(REMOVE_HOLD_DOWN)
            );
        }
        status.resign = true;
    }

    let standby = keys.find(true, KeyStatus::Published, 1);
    if standby.is_none() && !revoked_present {
        return Ok(status);
    }
    status.in_use = true;

    let Some(active) = keys.find(true, KeyStatus::Active, 1) else {
        status.resign |= ksk::ksk_status(keys, ctx, engine);
        return Ok(status);
    };

    let Some(standby) = standby else {
        info!(zone, "no standby KSK found: generating a new one");
        if let Some(index) = new_standby(keys, ctx, engine) {
            info!(zone, "created standby KSK {}", keys.keys()[index].tag);
            status.resign = true;
        }
        return Ok(status);
    };

    let expires = expiration(&keys.keys()[active], config);
    let trusted = keys.keys()[standby].created.add(min(ADD_HOLD_DOWN, config.key_ttl));
    if now > expires && now > trusted {
        let (old_tag, next_tag) = (keys.keys()[active].tag, keys.keys()[standby].tag);
        info!(
            zone,
            "lifetime of KSK {old_tag} exceeded ({}): starting RFC 5011 rollover",
            format_age(keys.keys()[active].age(now))
        );
        let Some(fresh) = new_standby(keys, ctx, engine) else {
            return Ok(status);
        };
        info!(zone, "created standby KSK {}", keys.keys()[fresh].tag);

        let revoked = match engine.revoke(&keys.keys()[active]) {
            Ok(revoked) => revoked,
            Err(err) => {
                error!(zone, "cannot revoke KSK {old_tag}: {}", err.diagnostic());
                // Without the revocation the pipeline must not move on.
                keys.remove(fresh);
                return Ok(status);
            }
        };

        if let Some(key) = keys.get_mut(standby) {
            key.set_status(KeyStatus::Active, now)?;
        }
        info!(zone, "activated standby KSK {next_tag}");
        if let Some(key) = keys.get_mut(active) {
            key.base = revoked.base;
            key.tag = revoked.tag;
            key.flags = revoked.flags;
            key.public_key = revoked.public_key;
            key.set_status(KeyStatus::Revoked, now)?;
            key.expires = Some(now);
        }
        info!(zone, "revoked KSK {old_tag}, now published as {}", revoked.tag);
        status.resign = true;
    }

    Ok(status)
}

fn new_standby(keys: &mut KeySet, ctx: &RollContext<'_>, engine: &mut impl SigningEngine) -> Option<usize> {
    let request = ctx.config.key_request(ctx.dir, ctx.zone, true);
    match keys.generate(engine, &request, KeyStatus::Published, ctx.now) {
        Ok(index) => Some(index),
        Err(err) => {
            error!(zone = ctx.zone, "cannot generate new standby KSK: {}", err.diagnostic());
            None
        }
    }
}
