use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::Config;
use crate::env::Env;
use crate::error::{Context, Error};
use crate::keys::KeyStatus;
use crate::rollover::manual::{self, ParentState};
use crate::rollover::RollContext;
use crate::store::{self, ZoneLock};
use crate::zone::Zone;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum RollPhase {
    Phase1,
    Phase2,
    Phase3,
    Status,
}

#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct KskRoll {
    /// Configuration file [default: dnssec.json, if present]
    #[arg(short = 'c', long = "config", value_name = "file")]
    config: Option<PathBuf>,

    /// The rollover phase to run
    #[arg(value_enum, value_name = "phase")]
    phase: RollPhase,

    /// The zone directory
    #[arg(value_name = "dir")]
    dir: PathBuf,
}

impl KskRoll {
    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        let global = Config::load(&env, self.config.as_deref())?;
        let dir = std::fs::canonicalize(env.in_cwd(&self.dir))
            .map_err(|e| format!("{}: {e}", self.dir.display()))?;
        let zone = Zone::from_dir(&env, &dir)?;
        let config = global.for_zone(&env, &zone.dir);
        let _lock = ZoneLock::acquire(&env, &zone.dir)?;

        let mut keys = store::load_keyset(&env, &zone.dir, &zone.name)?;
        let state = ParentState::load(&env, &zone.dir)?;
        let now = env.now();
        let ctx = RollContext {
            zone: &zone.name,
            dir: &zone.dir,
            config: &config,
            now,
        };
        let state_file = ParentState::path(&zone.dir);

        match self.phase {
            RollPhase::Phase1 => {
                let mut engine = env.signing_engine(config.engine_settings());
                let new = manual::phase1(&mut keys, &ctx, &mut engine, state.as_ref())?;

                // The state file goes first: a published KSK without it would
                // be taken for an RFC 5011 standby by the next pass.
                if let Err(err) = new.save(&env, &zone.dir) {
                    if let Some(index) = keys.find(true, KeyStatus::Published, 1) {
                        keys.remove(index);
                    }
                    if let Err(err) = store::save_keyset(&env, &zone.dir, &mut keys) {
                        warn!(zone = zone.name, "cannot retire the new KSK: {err}");
                    }
                    return Err(err);
                }
                if let Err(err) = store::save_keyset(&env, &zone.dir, &mut keys) {
                    if let Err(err) = ParentState::remove(&env, &zone.dir) {
                        warn!(zone = zone.name, "cannot remove {}: {err}", state_file.display());
                    }
                    return Err(err);
                }
                store::write_dnskey_file(&env, &zone.key_file(&config), &keys, config.key_ttl, now)?;
                info!(zone = zone.name, "KSK rollover phase 1 done");
                writeln!(
                    env.stdout(),
                    "New KSK published. Send the keyset in {} to the parent:\n{}",
                    state_file.display(),
                    new.dnskey
                );
            }
            RollPhase::Phase2 => {
                let new = manual::phase2(&keys, &ctx, state.as_ref())?;
                new.save(&env, &zone.dir)?;
                info!(zone = zone.name, "KSK rollover phase 2 done");
                writeln!(
                    env.stdout(),
                    "Send the new KSK in {} to the parent for a new DS record:\n{}",
                    state_file.display(),
                    new.dnskey
                );
            }
            RollPhase::Phase3 => {
                manual::phase3(&mut keys, &ctx, state.as_ref())?;
                store::save_keyset(&env, &zone.dir, &mut keys)?;
                store::write_dnskey_file(&env, &zone.key_file(&config), &keys, config.key_ttl, now)?;
                ParentState::remove(&env, &zone.dir)
                    .with_context(|| format!("removing {}", state_file.display()))?;
                info!(zone = zone.name, "KSK rollover phase 3 done");
                writeln!(env.stdout(), "Old KSK removed, the rollover is complete.");
            }
            RollPhase::Status => {
                writeln!(env.stdout(), "{}", manual::status(&ctx, state.as_ref()));
            }
        }
        Ok(())
    }
}
