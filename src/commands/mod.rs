//! The commands of _keyroll_.
pub mod key;
pub mod keys;
pub mod kskroll;
pub mod sign;

use clap::builder::ValueParser;
use tracing::error;

use crate::env::Env;
use crate::keys::KeySet;
use crate::parse::parse_name_list;
use crate::store;
use crate::zone::Zone;

use super::error::Error;

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Maintain the keys of all zones and sign the zones that need it
    ///
    /// For every zone found below the given directories, key signing keys
    /// are checked (and rolled when RFC 5011 rollovers are in use), zone
    /// signing keys are rolled when due, and the zone is signed again if
    /// anything changed or its signatures are getting old.
    ///
    /// A zone is a directory containing the zone file. Without directories
    /// the configured zone directory is searched.
    #[command(name = "sign", verbatim_doc_comment)]
    Sign(self::sign::Sign),

    /// Roll the KSK of a zone by hand, coordinating with the parent
    ///
    /// phase1: publish a new KSK; the parent state file holds the old key
    /// phase2: after propagation, put the new key in the parent state file
    ///         for the parent to create a DS record from
    /// phase3: after the parent has published the new DS, remove the old KSK
    /// status: show the current phase and how long to wait for the next
    #[command(name = "ksk-roll", verbatim_doc_comment)]
    KskRoll(self::kskroll::KskRoll),

    /// List the keys of all zones
    #[command(name = "keys")]
    Keys(self::keys::Keys),

    /// Manage single keys by hand
    ///
    /// Keys are named by their tag, optionally followed by the zone:
    /// "12345" or "12345:example.net". A tag shared by more than one key
    /// must be qualified by the zone.
    #[command(name = "key", verbatim_doc_comment)]
    Key(self::key::Key),
}

impl Command {
    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        match self {
            Self::Sign(sign) => sign.execute(env),
            Self::KskRoll(roll) => roll.execute(env),
            Self::Keys(keys) => keys.execute(env),
            Self::Key(key) => key.execute(env),
        }
    }
}

/// Load the key sets of the given zones.
///
/// A zone whose keys cannot be read is reported and skipped. Returns the
/// readable zones and the number of skipped ones.
fn load_keysets(env: &impl Env, zones: Vec<Zone>) -> (Vec<(Zone, KeySet)>, usize) {
    let mut loaded = Vec::new();
    let mut failed = 0;
    for zone in zones {
        match store::load_keyset(env, &zone.dir, &zone.name) {
            Ok(keys) => loaded.push((zone, keys)),
            Err(err) => {
                error!(zone = zone.name, "{err}");
                failed += 1;
            }
        }
    }
    (loaded, failed)
}

/// A list of zone names given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneList(pub Vec<String>);

impl ZoneList {
    pub fn parser() -> ValueParser {
        ValueParser::new(|arg: &str| parse_name_list(arg).map(ZoneList))
    }
}
