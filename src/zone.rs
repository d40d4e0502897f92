//! Finding zones and what is known about their files.
//!
//! A zone is a directory holding a zone file. The zone is named after the
//! directory.

use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::env::Env;
use crate::error::{bail, ensure, Error};
use crate::keys::UnixTime;
use crate::parse::parse_name;
use crate::rollover::resign::ResignInputs;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Zone {
    /// The absolute zone name.
    pub name: String,
    pub dir: PathBuf,
}

impl Zone {
    /// The zone in `dir`, named after the directory.
    ///
    /// Paths like `.` are resolved first to find the directory's name.
    pub fn from_dir(env: &impl Env, dir: &Path) -> Result<Self, Error> {
        let resolved = match dir.file_name() {
            Some(_) => dir.to_path_buf(),
            None => std::fs::canonicalize(env.in_cwd(&dir))
                .map_err(|e| format!("cannot resolve {}: {e}", dir.display()))?,
        };
        let Some(base) = resolved.file_name().and_then(|n| n.to_str()) else {
            bail!("cannot derive a zone name from {}", dir.display());
        };
        let name = parse_name(base)
            .map_err(|e| Error::from(format!("directory {} is not a zone name: {e}", dir.display())))?;
        Ok(Self {
            name,
            dir: dir.to_path_buf(),
        })
    }

    pub fn zone_file(&self, config: &Config) -> PathBuf {
        self.dir.join(&config.zone_file)
    }

    pub fn signed_file(&self, config: &Config) -> PathBuf {
        self.dir.join(format!("{}.signed", config.zone_file))
    }

    pub fn key_file(&self, config: &Config) -> PathBuf {
        self.dir.join(&config.key_file)
    }

    /// Collect the file times the resign decision looks at.
    pub fn resign_inputs(&self, env: &impl Env, config: &Config) -> ResignInputs {
        let last_signed = modified(env, &self.signed_file(config));
        ResignInputs {
            zone_modified: modified(env, &self.zone_file(config)),
            keys_modified: modified(env, &self.key_file(config)),
            last_signed,
            new_child_keyset: last_signed.is_some_and(|signed| self.new_child_keyset(env, signed)),
            dynamic: config.dynamic,
            ..Default::default()
        }
    }

    /// Whether a child zone dropped a keyset here after the zone was last
    /// signed.
    fn new_child_keyset(&self, env: &impl Env, signed: UnixTime) -> bool {
        let own = format!("keyset-{}", self.name);
        let Ok(entries) = std::fs::read_dir(env.in_cwd(&self.dir)) else {
            return false;
        };
        entries.flatten().any(|entry| {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return false;
            };
            if !name.starts_with("keyset-") || name == own {
                return false;
            }
            let newer = modified(env, &entry.path()).is_some_and(|t| t > signed);
            if newer {
                debug!(zone = self.name, "new child keyset {name}");
            }
            newer
        })
    }
}

/// Modification time of a file, if it exists.
pub fn modified(env: &impl Env, path: &Path) -> Option<UnixTime> {
    std::fs::metadata(env.in_cwd(&path))
        .and_then(|m| m.modified())
        .ok()
        .map(UnixTime::from_system_time)
}

/// Find the zones below the given directories.
///
/// A directory that itself holds a zone file is a zone. Otherwise its
/// subdirectories are searched, and theirs when `recursive` is set. With
/// `only`, zones not named in it are skipped.
pub fn discover(
    env: &impl Env,
    roots: &[PathBuf],
    config: &Config,
    only: Option<&[String]>,
) -> Result<Vec<Zone>, Error> {
    let mut zones = Vec::new();
    for root in roots {
        let abs = env.in_cwd(root);
        ensure!(abs.is_dir(), "{} is not a directory", root.display());
        if abs.join(&config.zone_file).is_file() {
            add_zone(env, &mut zones, root, only);
        } else {
            search(env, root, config, only, &mut zones)?;
        }
    }
    Ok(zones)
}

fn search(
    env: &impl Env,
    dir: &Path,
    config: &Config,
    only: Option<&[String]>,
    zones: &mut Vec<Zone>,
) -> Result<(), Error> {
    trace!("searching {} for zones", dir.display());
    let entries = std::fs::read_dir(env.in_cwd(&dir))
        .map_err(|e| format!("cannot read directory {}: {e}", dir.display()))?;
    let mut subdirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| dir.join(e.file_name()))
        .collect();
    subdirs.sort();

    for sub in subdirs {
        if env.in_cwd(&sub).join(&config.zone_file).is_file() {
            add_zone(env, zones, &sub, only);
        } else if config.recursive {
            search(env, &sub, config, only, zones)?;
        }
    }
    Ok(())
}

fn add_zone(env: &impl Env, zones: &mut Vec<Zone>, dir: &Path, only: Option<&[String]>) {
    match Zone::from_dir(env, dir) {
        Ok(zone) => {
            if only.is_some_and(|names| !names.contains(&zone.name)) {
                trace!("skipping zone {}", zone.name);
                return;
            }
            zones.push(zone);
        }
        Err(err) => warn!("{err}"),
    }
}
