//! Persistent key state of a zone.
//!
//! Each zone directory holds the zone's [`KeySet`] as JSON, the key files
//! written by the signing engine, and the DNSKEY database file included by
//! the zone.

use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::env::Env;
use crate::error::{ensure, Context, Error};
use crate::keys::{KeySet, UnixTime};
use crate::util;

/// Name of the key state file in a zone directory.
pub const KEYSET_FILE: &str = "keyset.json";

/// Name of the lock file in a zone directory.
pub const LOCK_FILE: &str = ".keyroll.lock";

/// Appended to the names of the files of a retired key.
pub const REMOVED_SUFFIX: &str = ".removed";

//------------ ZoneLock ------------------------------------------------------

/// Exclusive access to a zone directory, held until dropped.
#[derive(Debug)]
pub struct ZoneLock {
    _file: File,
}

impl ZoneLock {
    /// Lock a zone directory without waiting.
    pub fn acquire(env: &impl Env, dir: &Path) -> Result<Self, Error> {
        let path = dir.join(LOCK_FILE);
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(env.in_cwd(&path))
            .map_err(|e| format!("unable to open lock file {}: {e}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Err(format!(
                "zone directory {} is locked by another process",
                dir.display()
            )
            .into()),
            Err(e) => Err(format!("unable to lock {}: {e}", path.display()).into()),
        }
    }
}

//------------ Key state -----------------------------------------------------

pub fn keyset_path(dir: &Path) -> PathBuf {
    dir.join(KEYSET_FILE)
}

/// Load the key set of a zone, or an empty one if the zone has none yet.
pub fn load_keyset(env: &impl Env, dir: &Path, zone: &str) -> Result<KeySet, Error> {
    let path = keyset_path(dir);
    let file = match File::open(env.in_cwd(&path)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(zone, "no key state in {}, starting afresh", dir.display());
            return Ok(KeySet::new(zone));
        }
        Err(e) => return Err(format!("unable to open {}: {e}", path.display()).into()),
    };
    let mut keys: KeySet = serde_json::from_reader(io::BufReader::new(file))
        .map_err(Error::from)
        .with_context(|| format!("reading {}", path.display()))?;
    ensure!(
        keys.zone().eq_ignore_ascii_case(zone),
        "{} holds keys of zone {}, expected {}",
        path.display(),
        keys.zone(),
        zone
    );
    keys.set_dir(&env.in_cwd(&dir));
    for (tag, indexes) in keys.duplicate_tags() {
        let bases: Vec<_> = indexes.iter().map(|&i| keys.keys()[i].base.as_str()).collect();
        warn!(zone, "key tag {tag} is used by more than one key: {}", bases.join(", "));
    }
    Ok(keys)
}

/// Write the key set of a zone and retire the files of removed keys.
pub fn save_keyset(env: &impl Env, dir: &Path, keys: &mut KeySet) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(keys)?;
    util::write_atomic(env, keyset_path(dir), json.as_bytes())?;
    for key in keys.take_retired() {
        for ext in [".key", ".private"] {
            let path = key.path(ext);
            if !env.in_cwd(&path).exists() {
                debug!("{} is already gone", path.display());
                continue;
            }
            let mut removed = path.clone();
            removed.as_mut_os_string().push(REMOVED_SUFFIX);
            util::rename_path(env, &path, &removed)
                .with_context(|| format!("retiring key {}", key.tag))?;
        }
        debug!(zone = keys.zone(), "retired key files of {}", key.base);
    }
    Ok(())
}

//------------ DNSKEY database -----------------------------------------------

/// The DNSKEY database file contents: all KSKs, then all ZSKs.
pub fn format_dnskey_file(keys: &KeySet, ttl: Duration, now: UnixTime) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; DNSKEY records of {}", keys.zone());
    let _ = writeln!(out, "; generated {now}, do not edit");
    out.push_str(&format_dnskey_records(keys, Some(ttl)));
    out
}

/// The DNSKEY records of a zone, each after a comment describing the key.
pub fn format_dnskey_records(keys: &KeySet, ttl: Option<Duration>) -> String {
    let mut out = String::new();
    for ksk in [true, false] {
        for index in keys.indexes(ksk) {
            let key = &keys.keys()[index];
            let _ = writeln!(
                out,
                ";\n; {} {} {}, {}, since {}",
                key.kind(),
                key.tag,
                key.status,
                key.algorithm_name(),
                key.created
            );
            let _ = writeln!(out, "{}", key.dnskey(ttl));
        }
    }
    out
}

pub fn write_dnskey_file(
    env: &impl Env,
    path: &Path,
    keys: &KeySet,
    ttl: Duration,
    now: UnixTime,
) -> Result<(), Error> {
    util::write_atomic(env, path, format_dnskey_file(keys, ttl, now).as_bytes())
}
