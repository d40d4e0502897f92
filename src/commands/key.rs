use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use clap::builder::ValueParser;
use clap::Subcommand;
use tracing::info;

use crate::config::Config;
use crate::env::Env;
use crate::error::{bail, ensure, Error};
use crate::keys::{KeySet, KeyStatus, Search, UnixTime};
use crate::parse::parse_key_spec;
use crate::rollover::manual::ParentState;
use crate::store::{self, ZoneLock};
use crate::zone::{self, Zone};

use super::load_keysets;

#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct Key {
    /// Configuration file [default: dnssec.json, if present]
    #[arg(short = 'c', long = "config", value_name = "file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: KeyCommands,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
enum KeyCommands {
    /// Create a key in a zone directory
    ///
    /// The new key is published but does not sign until activated. A new
    /// KSK is a standby key, which puts the zone into RFC 5011 mode.
    Create {
        /// Create a key signing key
        #[arg(short = 'k', long = "ksk")]
        ksk: bool,

        /// The zone directory
        #[arg(value_name = "dir")]
        dir: PathBuf,
    },

    /// Mark a key as published
    Publish {
        #[arg(value_name = "keyspec", value_parser = KeySpec::parser())]
        spec: KeySpec,

        /// Zone directories or directories containing them
        #[arg(value_name = "dir")]
        dirs: Vec<PathBuf>,
    },

    /// Let a published key sign
    Activate {
        #[arg(value_name = "keyspec", value_parser = KeySpec::parser())]
        spec: KeySpec,

        /// Zone directories or directories containing them
        #[arg(value_name = "dir")]
        dirs: Vec<PathBuf>,
    },

    /// Stop an active key from signing
    Depreciate {
        #[arg(value_name = "keyspec", value_parser = KeySpec::parser())]
        spec: KeySpec,

        /// Zone directories or directories containing them
        #[arg(value_name = "dir")]
        dirs: Vec<PathBuf>,
    },

    /// Remove a key and retire its files
    Remove {
        #[arg(value_name = "keyspec", value_parser = KeySpec::parser())]
        spec: KeySpec,

        /// Zone directories or directories containing them
        #[arg(value_name = "dir")]
        dirs: Vec<PathBuf>,
    },

    /// Print the DNSKEY record of a key
    Show {
        #[arg(value_name = "keyspec", value_parser = KeySpec::parser())]
        spec: KeySpec,

        /// Zone directories or directories containing them
        #[arg(value_name = "dir")]
        dirs: Vec<PathBuf>,
    },

    /// Print the DNSKEY records of all zones
    Dnskeys {
        /// Zone directories or directories containing them
        #[arg(value_name = "dir")]
        dirs: Vec<PathBuf>,
    },

    /// Print the KSKs of all zones as a trusted-keys section
    Trusted {
        /// Zone directories or directories containing them
        #[arg(value_name = "dir")]
        dirs: Vec<PathBuf>,
    },

    /// Print the configuration in effect
    Config,
}

/// A key named on the command line: its tag and, optionally, its zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySpec {
    pub tag: u16,
    pub zone: Option<String>,
}

impl KeySpec {
    pub fn parser() -> ValueParser {
        ValueParser::new(|arg: &str| {
            parse_key_spec(arg).map(|(tag, zone)| KeySpec { tag, zone })
        })
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.zone {
            Some(zone) => write!(f, "{}:{zone}", self.tag),
            None => write!(f, "{}", self.tag),
        }
    }
}

impl Key {
    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        let config = Config::load(&env, self.config.as_deref())?;
        let roots = |dirs: Vec<PathBuf>| match dirs.is_empty() {
            true => vec![config.zone_dir.clone()],
            false => dirs,
        };

        match self.cmd {
            KeyCommands::Create { ksk, dir } => create(&env, &config, &dir, ksk),
            KeyCommands::Publish { spec, dirs } => {
                set_status(&env, &config, &roots(dirs), &spec, KeyStatus::Published)
            }
            KeyCommands::Activate { spec, dirs } => {
                set_status(&env, &config, &roots(dirs), &spec, KeyStatus::Active)
            }
            KeyCommands::Depreciate { spec, dirs } => {
                set_status(&env, &config, &roots(dirs), &spec, KeyStatus::Depreciated)
            }
            KeyCommands::Remove { spec, dirs } => {
                update(&env, &config, &roots(dirs), &spec, |keys, index, _| {
                    let key = keys.remove(index).ok_or("key vanished")?;
                    Ok(format!("removed {} {}", key.kind(), key.tag))
                })
            }
            KeyCommands::Show { spec, dirs } => {
                let (_, keys, index) = locate(&env, &config, &roots(dirs), &spec)?;
                writeln!(env.stdout(), "{}", keys.keys()[index].dnskey(None));
                Ok(())
            }
            KeyCommands::Dnskeys { dirs } => {
                let (loaded, failed) = zones(&env, &config, &roots(dirs))?;
                for (_, keys) in &loaded {
                    write!(env.stdout(), "{}", store::format_dnskey_records(keys, None));
                }
                ensure!(failed == 0, "the keys of {} zones could not be read", failed);
                Ok(())
            }
            KeyCommands::Trusted { dirs } => {
                let (loaded, failed) = zones(&env, &config, &roots(dirs))?;
                let keysets: Vec<KeySet> = loaded.into_iter().map(|(_, keys)| keys).collect();
                write!(env.stdout(), "{}", format_trusted_keys(&keysets));
                ensure!(failed == 0, "the keys of {} zones could not be read", failed);
                Ok(())
            }
            KeyCommands::Config => {
                let json = serde_json::to_string_pretty(&config.to_json())?;
                writeln!(env.stdout(), "{json}");
                Ok(())
            }
        }
    }
}

fn zones(
    env: &impl Env,
    config: &Config,
    dirs: &[PathBuf],
) -> Result<(Vec<(Zone, KeySet)>, usize), Error> {
    let zones = zone::discover(env, dirs, config, None)?;
    Ok(load_keysets(env, zones))
}

/// Mint a published key in the zone in `dir`.
fn create(env: &impl Env, global: &Config, dir: &Path, ksk: bool) -> Result<(), Error> {
    let dir = std::fs::canonicalize(env.in_cwd(&dir))
        .map_err(|e| format!("{}: {e}", dir.display()))?;
    let zone = Zone::from_dir(env, &dir)?;
    let config = global.for_zone(env, &zone.dir);
    let _lock = ZoneLock::acquire(env, &zone.dir)?;
    if ksk && ParentState::load(env, &zone.dir)?.is_some() {
        bail!("a manual KSK rollover of {} is in progress", zone.name);
    }

    let mut keys = store::load_keyset(env, &zone.dir, &zone.name)?;
    let now = env.now();
    let mut engine = env.signing_engine(config.engine_settings());
    let request = config.key_request(&zone.dir, &zone.name, ksk);
    let index = keys
        .generate(&mut engine, &request, KeyStatus::Published, now)
        .map_err(|e| format!("cannot generate key: {}", e.diagnostic()))?;
    store::save_keyset(env, &zone.dir, &mut keys)?;
    store::write_dnskey_file(env, &zone.key_file(&config), &keys, config.key_ttl, now)?;

    let key = &keys.keys()[index];
    info!(zone = zone.name, "created published {} {}", key.kind(), key.tag);
    writeln!(env.stdout(), "{} {} {}", key.kind(), key.tag, key.base);
    Ok(())
}

fn set_status(
    env: &impl Env,
    config: &Config,
    dirs: &[PathBuf],
    spec: &KeySpec,
    status: KeyStatus,
) -> Result<(), Error> {
    update(env, config, dirs, spec, |keys, index, now| {
        let key = keys.get_mut(index).ok_or("key vanished")?;
        key.set_status(status, now)?;
        Ok(format!("{} {} is {status} now", key.kind(), key.tag))
    })
}

/// Change the key named by `spec` and store the zone's keys.
fn update(
    env: &impl Env,
    global: &Config,
    dirs: &[PathBuf],
    spec: &KeySpec,
    change: impl FnOnce(&mut KeySet, usize, UnixTime) -> Result<String, Error>,
) -> Result<(), Error> {
    let (zone, _, _) = locate(env, global, dirs, spec)?;
    let config = global.for_zone(env, &zone.dir);
    let _lock = ZoneLock::acquire(env, &zone.dir)?;

    // Look again now that nobody else can change the keys.
    let mut keys = store::load_keyset(env, &zone.dir, &zone.name)?;
    let Search::Found(index) = keys.search(Some(spec.tag), Some(zone.name.as_str())) else {
        bail!("the keys of {} changed meanwhile, try again", zone.name);
    };
    let now = env.now();
    let done = change(&mut keys, index, now)?;
    store::save_keyset(env, &zone.dir, &mut keys)?;
    store::write_dnskey_file(env, &zone.key_file(&config), &keys, config.key_ttl, now)?;

    info!(zone = zone.name, "{done}");
    writeln!(env.stdout(), "{done}");
    Ok(())
}

/// Find the one key named by `spec` among the zones below `dirs`.
fn locate(
    env: &impl Env,
    config: &Config,
    dirs: &[PathBuf],
    spec: &KeySpec,
) -> Result<(Zone, KeySet, usize), Error> {
    let only = spec.zone.as_ref().map(std::slice::from_ref);
    let zones = zone::discover(env, dirs, config, only)?;
    let (loaded, _) = load_keysets(env, zones);

    let mut matches = Vec::new();
    for (zone, keys) in loaded {
        let indexes = match keys.search(Some(spec.tag), spec.zone.as_deref()) {
            Search::NotFound => continue,
            Search::Found(index) => vec![index],
            Search::Ambiguous(indexes) => indexes,
        };
        matches.push((zone, keys, indexes));
    }

    match &matches[..] {
        [] => bail!("key {} not found", spec),
        [(_, _, indexes)] if indexes.len() == 1 => {}
        _ => {
            let mut names = Vec::new();
            for (zone, keys, indexes) in &matches {
                for &index in indexes {
                    names.push(format!("{} ({})", keys.keys()[index].base, zone.name));
                }
            }
            bail!("key {} is ambiguous: {}", spec, names.join(", "));
        }
    }
    let Some((zone, keys, indexes)) = matches.pop() else {
        bail!("key {} not found", spec);
    };
    Ok((zone, keys, indexes[0]))
}

/// The KSKs of the given zones as a `trusted-keys` section.
///
/// Revoked keys are left out.
fn format_trusted_keys(keysets: &[KeySet]) -> String {
    let mut out = String::new();
    let anchors: Vec<_> = keysets
        .iter()
        .flat_map(|keys| keys.keys())
        .filter(|k| k.is_ksk() && k.status != KeyStatus::Revoked)
        .collect();
    if anchors.is_empty() {
        return out;
    }
    out.push_str("trusted-keys {\n");
    for key in anchors {
        let _ = writeln!(
            out,
            "\t\"{}\" {} {} {} \"{}\"; // key id = {}",
            key.owner, key.flags, key.protocol, key.algorithm, key.public_key, key.tag
        );
    }
    out.push_str("};\n");
    out
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use crate::commands::Command;
    use crate::env::fake::{FakeCmd, FakeEnv, FIRST_TAG};
    use crate::keys::tests::{days, key, NOW};
    use crate::keys::{KeySet, KeyStatus};
    use crate::store;

    use super::{format_trusted_keys, Key, KeyCommands, KeySpec};

    #[track_caller]
    fn parse(args: FakeCmd) -> Key {
        let res = args.parse();
        let Command::Key(x) = res.unwrap().command else {
            panic!("Not a Key!");
        };
        x
    }

    fn setup(zones: &[&str]) -> TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        for zone in zones {
            let zone_dir = dir.path().join(zone);
            fs::create_dir(&zone_dir).unwrap();
            fs::write(zone_dir.join("zone.db"), "$INCLUDE dnskey.db\n").unwrap();
            let res = FakeCmd::new(["keyroll", "sign", "-n"])
                .cwd(&zone_dir)
                .now(NOW)
                .run();
            assert_eq!(res.exit_code, 0, "{res:?}");
        }
        dir
    }

    fn keyset(dir: &TempDir, zone: &str) -> KeySet {
        store::load_keyset(&FakeEnv::default(), &dir.path().join(zone), &format!("{zone}.")).unwrap()
    }

    #[test]
    fn parse_args() {
        let cmd = FakeCmd::new(["keyroll", "key"]);
        cmd.parse().unwrap_err();
        cmd.args(["create"]).parse().unwrap_err();
        cmd.args(["activate", "example.net"]).parse().unwrap_err();
        cmd.args(["activate", "12:bad..name"]).parse().unwrap_err();

        assert_eq!(
            parse(cmd.args(["create", "-k", "example.net"])),
            Key {
                config: None,
                cmd: KeyCommands::Create {
                    ksk: true,
                    dir: PathBuf::from("example.net"),
                },
            }
        );
        assert_eq!(
            parse(cmd.args(["-c", "my.json", "activate", "1234:Example.NET", "zones"])),
            Key {
                config: Some(PathBuf::from("my.json")),
                cmd: KeyCommands::Activate {
                    spec: KeySpec {
                        tag: 1234,
                        zone: Some("example.net.".into()),
                    },
                    dirs: vec![PathBuf::from("zones")],
                },
            }
        );
        assert_eq!(parse(cmd.args(["config"])).cmd, KeyCommands::Config);
    }

    #[test]
    fn standby_ksk_starts_rfc5011_rollovers() {
        let dir = setup(&["example.net"]);
        let zone_dir = dir.path().join("example.net");

        let res = FakeCmd::new(["keyroll", "key", "create", "--ksk", "example.net"])
            .cwd(&dir)
            .now(NOW)
            .run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        let standby = FIRST_TAG + 2;
        assert!(res.stdout.starts_with(&format!("KSK {standby} ")), "{}", res.stdout);
        let keys = keyset(&dir, "example.net");
        assert_eq!(keys.find(true, KeyStatus::Published, 1), Some(2));

        // A year later the active KSK has expired: it is revoked through the
        // engine and keeps signing under its new tag.
        let res = FakeCmd::new(["keyroll", "sign"])
            .cwd(&dir)
            .now(NOW.add(days(366)))
            .run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert_eq!(res.revoked, [format!("Kexample.net.+008+{FIRST_TAG:05}")]);

        let keys = keyset(&dir, "example.net");
        let revoked = &keys.keys()[keys.find(true, KeyStatus::Revoked, 1).unwrap()];
        assert_eq!(revoked.tag, FIRST_TAG + 128);
        assert_eq!(revoked.flags, 385);
        let key_file = fs::read_to_string(zone_dir.join(format!("{}.key", revoked.base))).unwrap();
        assert!(key_file.contains("DNSKEY 385"), "{key_file}");
        assert!(!zone_dir.join(format!("Kexample.net.+008+{FIRST_TAG:05}.key")).exists());

        let active = keys.find(true, KeyStatus::Active, 1).unwrap();
        assert_eq!(keys.keys()[active].tag, standby);
        assert!(keys.find(true, KeyStatus::Published, 1).is_some());

        let signed = fs::read_to_string(zone_dir.join("zone.db.signed")).unwrap();
        assert!(signed.contains(&(FIRST_TAG + 128).to_string()), "{signed}");
        assert!(signed.contains(&standby.to_string()), "{signed}");
    }

    #[test]
    fn status_changes_by_keyspec() {
        let dir = setup(&["example.net"]);
        let cmd = FakeCmd::new(["keyroll", "key"]).cwd(&dir);
        let res = cmd.args(["create", "example.net"]).now(NOW).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        let tag = (FIRST_TAG + 2).to_string();

        let res = cmd.args(["activate", &tag]).now(NOW.add(days(1))).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert!(res.stdout.contains("is active now"), "{}", res.stdout);
        let keys = keyset(&dir, "example.net");
        let key = &keys.keys()[2];
        assert_eq!((key.status, key.created), (KeyStatus::Active, NOW.add(days(1))));
        let dnskeys = fs::read_to_string(dir.path().join("example.net/dnskey.db")).unwrap();
        assert!(dnskeys.contains(&format!("ZSK {tag} active")), "{dnskeys}");

        let spec = format!("{tag}:example.net");
        let res = cmd.args(["depreciate", &spec]).now(NOW.add(days(2))).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert_eq!(keyset(&dir, "example.net").keys()[2].status, KeyStatus::Depreciated);

        // Keys never go back in their lifecycle.
        let res = cmd.args(["publish", &spec]).now(NOW.add(days(3))).run();
        assert_eq!(res.exit_code, 1);
        assert!(res.stderr.contains("cannot change from depreciated to published"), "{}", res.stderr);

        let res = cmd.args(["activate", "4242"]).now(NOW).run();
        assert_eq!(res.exit_code, 1);
        assert!(res.stderr.contains("key 4242 not found"), "{}", res.stderr);
    }

    #[test]
    fn shared_tags_need_the_zone() {
        let dir = setup(&["example.net", "example.org"]);
        let cmd = FakeCmd::new(["keyroll", "key"]).cwd(&dir).now(NOW);
        let tag = FIRST_TAG.to_string();

        let res = cmd.args(["show", &tag]).run();
        assert_eq!(res.exit_code, 1, "{res:?}");
        assert!(res.stderr.contains(&format!("key {tag} is ambiguous")), "{}", res.stderr);
        assert!(res.stderr.contains("(example.org.)"), "{}", res.stderr);

        let res = cmd.args(["show", &format!("{tag}:example.org")]).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert_eq!(res.stdout, format!("example.org. IN DNSKEY 257 3 8 AwEAAa{FIRST_TAG:05}\n"));
    }

    #[test]
    fn removed_key_is_retired() {
        let dir = setup(&["example.net"]);
        let cmd = FakeCmd::new(["keyroll", "key"]).cwd(&dir).now(NOW);
        assert_eq!(cmd.args(["create", "example.net"]).run().exit_code, 0);
        let base = format!("Kexample.net.+008+{:05}", FIRST_TAG + 2);

        let res = cmd.args(["remove", &(FIRST_TAG + 2).to_string()]).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert!(res.stdout.contains("removed ZSK"), "{}", res.stdout);
        let zone_dir = dir.path().join("example.net");
        assert!(zone_dir.join(format!("{base}.key.removed")).exists());
        assert!(!zone_dir.join(format!("{base}.key")).exists());
        assert_eq!(keyset(&dir, "example.net").len(), 2);
        let dnskeys = fs::read_to_string(zone_dir.join("dnskey.db")).unwrap();
        assert!(!dnskeys.contains(&(FIRST_TAG + 2).to_string()), "{dnskeys}");
    }

    #[test]
    fn dnskey_and_trusted_key_listings() {
        let dir = setup(&["example.net"]);
        let cmd = FakeCmd::new(["keyroll", "key"]).cwd(&dir).now(NOW);

        let res = cmd.args(["dnskeys"]).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        let records: Vec<_> = res.stdout.lines().filter(|l| !l.starts_with(';')).collect();
        assert_eq!(records.len(), 2, "{}", res.stdout);
        assert!(records[0].starts_with("example.net. IN DNSKEY 257"));

        let res = cmd.args(["trusted"]).run();
        assert_eq!(
            res.stdout,
            format!(
                "trusted-keys {{\n\t\"example.net.\" 257 3 8 \"AwEAAa{FIRST_TAG:05}\"; // key id = {FIRST_TAG}\n}};\n"
            )
        );

        let res = cmd.args(["config"]).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        let json: serde_json::Value = serde_json::from_str(&res.stdout).unwrap();
        assert_eq!(json["ksk_lifetime"], 365 * 86400);
    }

    #[test]
    fn revoked_keys_are_no_trust_anchors() {
        let mut keys = KeySet::new("example.net.");
        keys.add(key(1, true, KeyStatus::Revoked, days(1)));
        keys.add(key(2, false, KeyStatus::Active, days(1)));
        assert_eq!(format_trusted_keys(&[keys.clone()]), "");

        keys.add(key(3, true, KeyStatus::Published, days(1)));
        let out = format_trusted_keys(&[keys]);
        assert_eq!(out.lines().count(), 3);
        assert!(out.contains("// key id = 3"));
    }
}
