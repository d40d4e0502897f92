//! Pre-publish rollover of zone signing keys.

use tracing::{error, info};

use crate::engine::SigningEngine;
use crate::error::Error;
use crate::keys::{KeySet, KeyStatus};
use crate::parse::format_age;

use super::{RollContext, OFFSET};

/// Check the zone signing keys of a zone and roll them where due.
///
/// In order, this retires depreciated keys whose signatures can no longer
/// be cached anywhere, replaces an expired active key by a successor that
/// has been published long enough, and pre-publishes a new key when the
/// active one will expire before the next pass.
///
/// Returns whether the set of keys changed.
pub fn zsk_status(
    keys: &mut KeySet,
    ctx: &RollContext<'_>,
    engine: &mut impl SigningEngine,
) -> Result<bool, Error> {
    let config = ctx.config;
    let now = ctx.now;
    let zone = ctx.zone;
    let mut changed = false;

    // Old signatures may be cached for up to max_ttl after the last server
    // stopped serving them.
    let hold = config.max_ttl + config.propagation;
    loop {
        let Some(index) = (1..)
            .map_while(|nth| keys.find(false, KeyStatus::Depreciated, nth))
            .find(|&i| keys.keys()[i].age(now) > hold)
        else {
            break;
        };
        let age = keys.keys()[index].age(now);
        if let Some(key) = keys.remove(index) {
            info!(
                zone,
                "depreciated ZSK {} exceeded its hold time of {} ({}): removing it",
                key.tag,
                format_age(hold),
                format_age(age)
            );
        }
        changed = true;
    }

    let mut lifetime = config.zsk.lifetime;
    let mut active = keys.find(false, KeyStatus::Active, 1);
    match active {
        None if !lifetime.is_zero() => {
            info!(zone, "no active ZSK found: generating a new one");
            let request = config.key_request(ctx.dir, zone, false);
            match keys.generate(engine, &request, KeyStatus::Active, now) {
                Ok(index) => {
                    info!(zone, "created active ZSK {}", keys.keys()[index].tag);
                    active = Some(index);
                    changed = true;
                }
                Err(err) => {
                    error!(zone, "cannot generate new ZSK: {}", err.diagnostic());
                }
            }
        }
        None => {}
        Some(current) => {
            if let Some(own) = keys.keys()[current].lifetime {
                lifetime = own;
            }
            let age = keys.keys()[current].age(now);
            if !lifetime.is_zero() && age > lifetime.saturating_sub(OFFSET) {
                // Mid-rollover a second active key is the successor,
                // otherwise the pre-published one.
                let successor = keys
                    .find(false, KeyStatus::Active, 2)
                    .filter(|&i| i != current)
                    .or_else(|| keys.find(false, KeyStatus::Published, 1));

                let wait = config.key_ttl + config.propagation;
                let tag = keys.keys()[current].tag;
                match successor {
                    Some(next) if keys.keys()[next].age(now) > wait => {
                        let next_tag = keys.keys()[next].tag;
                        if let Some(key) = keys.get_mut(current) {
                            key.set_status(KeyStatus::Depreciated, now)?;
                        }
                        if let Some(key) = keys.get_mut(next) {
                            if key.status != KeyStatus::Active {
                                key.set_status(KeyStatus::Active, now)?;
                            }
                        }
                        info!(
                            zone,
                            "lifetime of ZSK {tag} exceeded since {}: depreciated it and activated ZSK {next_tag}",
                            format_age(age.saturating_sub(lifetime))
                        );
                        active = Some(next);
                        changed = true;
                    }
                    _ => {
                        info!(
                            zone,
                            "lifetime of ZSK {tag} exceeded since {}: rollover deferred, waiting for pre-publish key",
                            format_age(age.saturating_sub(lifetime))
                        );
                    }
                }
            }
        }
    }

    // A new key must be published now if the active one expires before the
    // next pass, so it has propagated by the time it is needed.
    if keys.find(false, KeyStatus::Published, 1).is_none() && !lifetime.is_zero() {
        let needed = match active {
            None => true,
            Some(i) => {
                keys.keys()[i].age(now.add(config.resign_interval)) > lifetime.saturating_sub(OFFSET)
            }
        };
        if needed {
            info!(zone, "new pre-publish ZSK needed");
            let request = config.key_request(ctx.dir, zone, false);
            match keys.generate(engine, &request, KeyStatus::Published, now) {
                Ok(index) => {
                    info!(zone, "created pre-publish ZSK {}", keys.keys()[index].tag);
                    changed = true;
                }
                Err(err) => {
                    error!(zone, "cannot generate new ZSK: {}", err.diagnostic());
                }
            }
        }
    }

    Ok(changed)
}
