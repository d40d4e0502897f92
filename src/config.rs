//! Configuration.
//!
//! Settings are read from JSON files: a global one and, optionally, one per
//! zone directory that overrides it. A bad setting is reported and keeps
//! its previous value; it never stops processing.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use domain::base::iana::SecurityAlgorithm;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::engine::{EngineSettings, KeyRequest};
use crate::env::Env;
use crate::error::{bail, Context, Error};
use crate::parse::parse_duration;

/// Name of the configuration file looked for in the current and zone
/// directories.
pub const CONFIG_FILE: &str = "dnssec.json";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const SIG_VALIDITY: u64 = 30 * DAY;

/// Parameters for keys of one kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPolicy {
    /// Zero means keys of this kind are never rolled.
    pub lifetime: Duration,
    pub algorithm: u8,
    pub bits: u32,
    pub random: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub zone_dir: PathBuf,
    pub recursive: bool,

    pub sig_validity: Duration,

    /// The largest TTL of any record in the zone.
    pub max_ttl: Duration,

    /// The TTL of the DNSKEY records.
    pub key_ttl: Duration,

    /// Time for a change to reach all secondaries.
    pub propagation: Duration,

    /// Time for a change to reach all servers of the parent zone.
    pub parent_propagation: Duration,

    pub resign_interval: Duration,

    pub ksk: KeyPolicy,
    pub zsk: KeyPolicy,

    pub zone_file: String,
    pub key_file: String,

    /// Where keyset artifacts go, relative to the zone directory.
    pub keyset_dir: Option<PathBuf>,

    /// Whether zones are dynamically updated and need signing on every pass.
    pub dynamic: bool,

    pub keygen_command: String,
    pub revoke_command: String,
    pub sign_command: String,
    pub engine_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zone_dir: PathBuf::from("."),
            recursive: false,
            sig_validity: Duration::from_secs(SIG_VALIDITY),
            max_ttl: Duration::from_secs(6 * HOUR),
            key_ttl: Duration::from_secs(6 * HOUR),
            propagation: Duration::from_secs(5 * MINUTE),
            parent_propagation: Duration::from_secs(5 * MINUTE),
            resign_interval: Duration::from_secs(SIG_VALIDITY / 10),
            ksk: KeyPolicy {
                lifetime: Duration::from_secs(365 * DAY),
                algorithm: SecurityAlgorithm::RSASHA256.to_int(),
                bits: 2048,
                random: None,
            },
            zsk: KeyPolicy {
                lifetime: Duration::from_secs(SIG_VALIDITY / 3),
                algorithm: SecurityAlgorithm::RSASHA256.to_int(),
                bits: 1024,
                random: Some(PathBuf::from("/dev/urandom")),
            },
            zone_file: "zone.db".into(),
            key_file: "dnskey.db".into(),
            keyset_dir: None,
            dynamic: false,
            keygen_command: "dnssec-keygen".into(),
            revoke_command: "dnssec-revoke".into(),
            sign_command: "dnssec-signzone".into(),
            engine_timeout: Duration::from_secs(5 * MINUTE),
        }
    }
}

impl Config {
    /// Load the global configuration.
    ///
    /// An explicitly given file must exist. Without one, `dnssec.json` in
    /// the current directory is used if present.
    pub fn load(env: &impl Env, path: Option<&Path>) -> Result<Self, Error> {
        let mut config = Config::default();
        match path {
            Some(path) => config.apply_file(env, path)?,
            None => {
                let path = Path::new(CONFIG_FILE);
                if env.in_cwd(&path).is_file() {
                    config.apply_file(env, path)?;
                }
            }
        }
        for warning in config.check() {
            warn!("{warning}");
        }
        Ok(config)
    }

    /// The configuration for the zone in `dir`.
    ///
    /// A broken zone configuration file is reported and ignored.
    pub fn for_zone(&self, env: &impl Env, dir: &Path) -> Self {
        let mut config = self.clone();
        let path = dir.join(CONFIG_FILE);
        if env.in_cwd(&path).is_file() {
            if let Err(err) = config.apply_file(env, &path) {
                warn!("ignoring {}: {err}", path.display());
                return self.clone();
            }
        }
        config
    }

    /// Override settings with those from a JSON file.
    pub fn apply_file(&mut self, env: &impl Env, path: &Path) -> Result<(), Error> {
        let file = File::open(env.in_cwd(&path))
            .map_err::<Error, _>(|e| format!("unable to open config file {}: {e}", path.display()).into())?;
        let value: Value = serde_json::from_reader(file)
            .map_err(Error::from)
            .with_context(|| format!("loading {}", path.display()))?;
        let Value::Object(map) = value else {
            bail!("{}: expected a JSON object", path.display());
        };
        self.apply(&map, path);
        Ok(())
    }

    /// Override settings from a JSON object, warning about bad ones.
    pub fn apply(&mut self, map: &Map<String, Value>, origin: &Path) {
        for (key, value) in map {
            let res = match key.as_str() {
                "zone_dir" => string(value).map(|v| self.zone_dir = v.into()),
                "recursive" => boolean(value).map(|v| self.recursive = v),
                "sig_validity" => duration(value).map(|v| self.sig_validity = v),
                "max_ttl" => duration(value).map(|v| self.max_ttl = v),
                "key_ttl" => duration(value).map(|v| self.key_ttl = v),
                "propagation" => duration(value).map(|v| self.propagation = v),
                "parent_propagation" => duration(value).map(|v| self.parent_propagation = v),
                "resign_interval" => duration(value).map(|v| self.resign_interval = v),
                "ksk_lifetime" => duration(value).map(|v| self.ksk.lifetime = v),
                "ksk_algorithm" => algorithm(value).map(|v| self.ksk.algorithm = v),
                "ksk_bits" => bits(value).map(|v| self.ksk.bits = v),
                "ksk_random" => optional_path(value).map(|v| self.ksk.random = v),
                "zsk_lifetime" => duration(value).map(|v| self.zsk.lifetime = v),
                "zsk_algorithm" => algorithm(value).map(|v| self.zsk.algorithm = v),
                "zsk_bits" => bits(value).map(|v| self.zsk.bits = v),
                "zsk_random" => optional_path(value).map(|v| self.zsk.random = v),
                "zone_file" => string(value).map(|v| self.zone_file = v),
                "key_file" => string(value).map(|v| self.key_file = v),
                "keyset_dir" => optional_path(value).map(|v| self.keyset_dir = v),
                "dynamic" => boolean(value).map(|v| self.dynamic = v),
                "keygen_command" => string(value).map(|v| self.keygen_command = v),
                "revoke_command" => string(value).map(|v| self.revoke_command = v),
                "sign_command" => string(value).map(|v| self.sign_command = v),
                "engine_timeout" => duration(value).map(|v| self.engine_timeout = v),
                _ => Err("unknown setting".into()),
            };
            if let Err(err) = res {
                warn!("{}: ignoring setting '{key}': {err}", origin.display());
            }
        }
    }

    /// Report settings that make no sense together.
    pub fn check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.resign_interval >= self.sig_validity {
            warnings.push(format!(
                "resign interval ({}s) should be less than the signature validity ({}s)",
                self.resign_interval.as_secs(),
                self.sig_validity.as_secs()
            ));
        }
        if !self.zsk.lifetime.is_zero() && self.zsk.lifetime <= self.resign_interval {
            warnings.push(format!(
                "ZSK lifetime ({}s) should be greater than the resign interval ({}s)",
                self.zsk.lifetime.as_secs(),
                self.resign_interval.as_secs()
            ));
        }
        if !self.ksk.lifetime.is_zero() && self.ksk.lifetime <= self.zsk.lifetime {
            warnings.push("KSK lifetime should be greater than the ZSK lifetime".into());
        }
        warnings
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            keygen_command: self.keygen_command.clone(),
            revoke_command: self.revoke_command.clone(),
            sign_command: self.sign_command.clone(),
            timeout: self.engine_timeout,
            sig_validity: self.sig_validity,
        }
    }

    /// The request for minting a key of the given kind in `dir`.
    pub fn key_request(&self, dir: &Path, zone: &str, ksk: bool) -> KeyRequest {
        let policy = if ksk { &self.ksk } else { &self.zsk };
        KeyRequest {
            dir: dir.to_path_buf(),
            zone: zone.to_string(),
            ksk,
            algorithm: policy.algorithm,
            bits: policy.bits,
            random: policy.random.clone(),
            lifetime: None,
        }
    }
}

//--- Printing

impl Config {
    /// The settings as a JSON object in the format [`Config::apply`] reads.
    pub fn to_json(&self) -> Value {
        let secs = |d: Duration| Value::from(d.as_secs());
        let path = |p: &Option<PathBuf>| match p {
            Some(p) => Value::from(p.display().to_string()),
            None => Value::Null,
        };
        let algorithm = |n: u8| Value::from(SecurityAlgorithm::from_int(n).to_string());
        json!({
            "zone_dir": self.zone_dir.display().to_string(),
            "recursive": self.recursive,
            "sig_validity": secs(self.sig_validity),
            "max_ttl": secs(self.max_ttl),
            "key_ttl": secs(self.key_ttl),
            "propagation": secs(self.propagation),
            "parent_propagation": secs(self.parent_propagation),
            "resign_interval": secs(self.resign_interval),
            "ksk_lifetime": secs(self.ksk.lifetime),
            "ksk_algorithm": algorithm(self.ksk.algorithm),
            "ksk_bits": self.ksk.bits,
            "ksk_random": path(&self.ksk.random),
            "zsk_lifetime": secs(self.zsk.lifetime),
            "zsk_algorithm": algorithm(self.zsk.algorithm),
            "zsk_bits": self.zsk.bits,
            "zsk_random": path(&self.zsk.random),
            "zone_file": self.zone_file,
            "key_file": self.key_file,
            "keyset_dir": path(&self.keyset_dir),
            "dynamic": self.dynamic,
            "keygen_command": self.keygen_command,
            "revoke_command": self.revoke_command,
            "sign_command": self.sign_command,
            "engine_timeout": secs(self.engine_timeout),
        })
    }
}

//------------ Value parsers -------------------------------------------------

fn string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err("expected a string".into()),
    }
}

fn optional_path(value: &Value) -> Result<Option<PathBuf>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s.into())),
        _ => Err("expected a path or null".into()),
    }
}

fn boolean(value: &Value) -> Result<bool, String> {
    value.as_bool().ok_or_else(|| "expected true or false".into())
}

fn duration(value: &Value) -> Result<Duration, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| "expected a non-negative number of seconds".into()),
        Value::String(s) => parse_duration(s).map_err(|e| e.to_string()),
        _ => Err("expected a duration".into()),
    }
}

fn bits(value: &Value) -> Result<u32, String> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| "expected a positive number of bits".into())
}

fn algorithm(value: &Value) -> Result<u8, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| "algorithm number out of range".into()),
        Value::String(s) => {
            SecurityAlgorithm::from_mnemonic(s.to_ascii_uppercase().as_bytes())
                .map(|alg| alg.to_int())
                .ok_or_else(|| format!("unknown algorithm {s}"))
        }
        _ => Err("expected an algorithm name or number".into()),
    }
}
