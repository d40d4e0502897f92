use std::path::PathBuf;

use crate::config::Config;
use crate::env::Env;
use crate::error::{ensure, Error};
use crate::keys::{KeySet, UnixTime};
use crate::parse::format_age;
use crate::zone;

use super::{load_keysets, ZoneList};

#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct Keys {
    /// Configuration file [default: dnssec.json, if present]
    #[arg(short = 'c', long = "config", value_name = "file")]
    config: Option<PathBuf>,

    /// Only list these zones (comma or space separated)
    #[arg(short = 'l', long = "zones", value_name = "zones", value_parser = ZoneList::parser())]
    zones: Option<ZoneList>,

    /// Zone directories or directories containing them
    #[arg(value_name = "dir")]
    dirs: Vec<PathBuf>,
}

impl Keys {
    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        let config = Config::load(&env, self.config.as_deref())?;
        let dirs = match self.dirs.is_empty() {
            true => vec![config.zone_dir.clone()],
            false => self.dirs,
        };
        let only = self.zones.as_ref().map(|z| z.0.as_slice());
        let now = env.now();

        let zones = zone::discover(&env, &dirs, &config, only)?;
        let count = zones.len();
        let (loaded, failed) = load_keysets(&env, zones);
        for (_, keys) in loaded {
            let mut out = env.stdout();
            write!(out, "{}", format_keys(&keys, now));
            for (tag, indexes) in keys.duplicate_tags() {
                writeln!(out, "  duplicate key tag {tag} ({} keys)", indexes.len());
            }
        }
        ensure!(failed == 0, "the keys of {} of {} zones could not be read", failed, count);
        Ok(())
    }
}

fn format_keys(keys: &KeySet, now: UnixTime) -> String {
    let mut out = format!("{}\n", keys.zone());
    if keys.is_empty() {
        out.push_str("  no keys\n");
        return out;
    }
    for key in keys.keys() {
        out.push_str(&format!(
            "  {} {:5} {:11} {:16} {:>13}  {}\n",
            key.kind(),
            key.tag,
            key.status,
            key.algorithm_name(),
            format_age(key.age(now)),
            key.base
        ));
    }
    out
}
