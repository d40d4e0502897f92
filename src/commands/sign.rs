use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{SignRequest, SigningEngine};
use crate::env::Env;
use crate::error::{ensure, in_context, Context, Error};
use crate::rollover::manual::ParentState;
use crate::rollover::{ksk, resign, rfc5011, zsk, RollContext};
use crate::store::{self, ZoneLock};
use crate::zone::{self, Zone};

use super::ZoneList;

#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct Sign {
    /// Configuration file [default: dnssec.json, if present]
    #[arg(short = 'c', long = "config", value_name = "file")]
    config: Option<PathBuf>,

    /// Sign the zones even if nothing changed
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Maintain the keys but do not run the signing engine
    #[arg(short = 'n', long = "no-sign")]
    no_sign: bool,

    /// Only process these zones (comma or space separated)
    #[arg(short = 'l', long = "zones", value_name = "zones", value_parser = ZoneList::parser())]
    zones: Option<ZoneList>,

    /// Zone directories or directories containing them
    #[arg(value_name = "dir")]
    dirs: Vec<PathBuf>,
}

impl Sign {
    pub fn execute(self, env: impl Env) -> Result<(), Error> {
        let config = Config::load(&env, self.config.as_deref())?;
        let dirs = match self.dirs.is_empty() {
            true => vec![config.zone_dir.clone()],
            false => self.dirs.clone(),
        };
        let only = self.zones.as_ref().map(|z| z.0.as_slice());
        let zones = zone::discover(&env, &dirs, &config, only)?;
        if zones.is_empty() {
            warn!("no zones found");
        }

        let mut failed = 0;
        for zone in &zones {
            match self.process(&env, &config, zone) {
                Ok(()) => {}
                Err(err) if err.is_warning() => warn!(zone = zone.name, "{err}"),
                Err(err) => {
                    error!(zone = zone.name, "{err}");
                    failed += 1;
                }
            }
        }
        ensure!(failed == 0, "{} of {} zones failed", failed, zones.len());
        Ok(())
    }

    /// One pass over one zone.
    fn process(&self, env: &impl Env, global: &Config, zone: &Zone) -> Result<(), Error> {
        let config = global.for_zone(env, &zone.dir);
        let _lock = ZoneLock::acquire(env, &zone.dir)?;
        let mut keys = store::load_keyset(env, &zone.dir, &zone.name)?;
        let now = env.now();
        let dir = env.in_cwd(&zone.dir);
        let ctx = RollContext {
            zone: &zone.name,
            dir: &dir,
            config: &config,
            now,
        };
        let mut engine = env.signing_engine(config.engine_settings());
        debug!(zone = zone.name, "checking {} keys", keys.len());

        // A manual rollover in progress owns the published KSK.
        let manual_roll = ParentState::load(env, &zone.dir)?;
        let mut new_keys = false;
        let mut in_5011 = false;
        if manual_roll.is_none() {
            let status = rfc5011::ksk5011_status(&mut keys, &ctx, &mut engine)?;
            new_keys = status.resign;
            in_5011 = status.in_use;
        }
        if !in_5011 {
            new_keys |= ksk::ksk_status(&mut keys, &ctx, &mut engine);
        }
        new_keys |= zsk::zsk_status(&mut keys, &ctx, &mut engine)?;

        let mut inputs = zone.resign_inputs(env, &config);
        inputs.force = self.force;
        inputs.new_keys = new_keys;
        let reason = resign::decide(&inputs, &config, now);

        store::save_keyset(env, &zone.dir, &mut keys)?;

        let Some(reason) = reason else {
            debug!(zone = zone.name, "zone is up to date");
            return Ok(());
        };
        info!(zone = zone.name, "resigning: {reason}");
        store::write_dnskey_file(env, &zone.key_file(&config), &keys, config.key_ttl, now)?;
        if self.no_sign {
            info!(zone = zone.name, "not running the signing engine");
            return Ok(());
        }

        let request = SignRequest {
            zone: &zone.name,
            dir: &dir,
            zone_file: &config.zone_file,
            keys: keys.keys(),
        };
        let signed = match engine.sign(&request) {
            Ok(signed) => signed,
            Err(err) if err.is_retryable() => {
                return Err(Error::warn(&format!("{err}, retrying on the next pass")));
            }
            Err(err) => return Err(Error::new(&err.to_string()).context("signing zone")),
        };
        info!(zone = zone.name, "zone signed");

        if let (Some(artifact), Some(keyset_dir)) = (signed.artifact, &config.keyset_dir) {
            distribute(&artifact, &dir.join(keyset_dir))
                .with_context(|| format!("distributing keyset of {}", zone.name))?;
        }
        Ok(())
    }
}

/// Copy a keyset artifact into the directory the parent picks it up from.
fn distribute(artifact: &Path, target: &Path) -> Result<(), Error> {
    in_context(
        || format!("copying {} to {}", artifact.display(), target.display()),
        || {
            let name = artifact.file_name().ok_or("artifact has no file name")?;
            std::fs::copy(artifact, target.join(name))?;
            debug!("copied {} to {}", artifact.display(), target.display());
            Ok(())
        },
    )
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use crate::commands::{Command, ZoneList};
    use crate::engine::SignError;
    use crate::env::fake::{FakeCmd, FIRST_TAG};
    use crate::keys::tests::{days, NOW};
    use crate::keys::KeyStatus;
    use crate::store;

    use super::Sign;

    #[track_caller]
    fn parse(args: FakeCmd) -> Sign {
        let res = args.parse();
        let Command::Sign(x) = res.unwrap().command else {
            panic!("Not a Sign!");
        };
        x
    }

    fn setup(zones: &[&str]) -> TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        for zone in zones {
            let zone_dir = dir.path().join(zone);
            fs::create_dir(&zone_dir).unwrap();
            fs::write(zone_dir.join("zone.db"), "$INCLUDE dnskey.db\n").unwrap();
        }
        dir
    }

    #[test]
    fn parse_args() {
        let cmd = FakeCmd::new(["keyroll", "sign"]);

        let base = Sign {
            config: None,
            force: false,
            no_sign: false,
            zones: None,
            dirs: vec![],
        };
        assert_eq!(parse(cmd.clone()), base);

        let res = parse(cmd.args(["-fn", "-c", "my.json", "zones"]));
        assert_eq!(
            res,
            Sign {
                config: Some(PathBuf::from("my.json")),
                force: true,
                no_sign: true,
                dirs: vec![PathBuf::from("zones")],
                ..base.clone()
            }
        );

        let res = parse(cmd.args(["-l", "a.example,B.example"]));
        assert_eq!(
            res.zones,
            Some(ZoneList(vec!["a.example.".into(), "b.example.".into()]))
        );
        cmd.args(["-l", "bad..name"]).parse().unwrap_err();
    }

    #[test]
    fn new_zone_gets_keys_and_is_signed() {
        let dir = setup(&["example.net"]);
        let res = FakeCmd::new(["keyroll", "sign"]).cwd(&dir).now(NOW).run();

        assert_eq!(res.exit_code, 0, "{res:?}");
        assert_eq!(res.signed, ["example.net."]);
        assert_eq!(res.generated.len(), 2);

        let zone_dir = dir.path().join("example.net");
        let keys = store::load_keyset(&crate::env::fake::FakeEnv::default(), &zone_dir, "example.net.").unwrap();
        let ksk = keys.find(true, KeyStatus::Active, 1).unwrap();
        let zsk = keys.find(false, KeyStatus::Active, 1).unwrap();
        assert_eq!(keys.keys()[ksk].tag, FIRST_TAG);
        assert_eq!(keys.keys()[zsk].tag, FIRST_TAG + 1);

        let dnskeys = fs::read_to_string(zone_dir.join("dnskey.db")).unwrap();
        assert_eq!(dnskeys.lines().filter(|l| l.contains("DNSKEY 25")).count(), 2);
        assert!(zone_dir.join("zone.db.signed").exists());
        assert!(res.stderr.contains("resigning"), "{}", res.stderr);
    }

    #[test]
    fn second_pass_changes_nothing() {
        let dir = setup(&["example.net"]);
        let cmd = FakeCmd::new(["keyroll", "sign"]).cwd(&dir).now(NOW);
        assert_eq!(cmd.run().exit_code, 0);

        let res = cmd.run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert!(res.signed.is_empty());
        assert!(res.generated.is_empty());

        let res = cmd.args(["-f"]).run();
        assert_eq!(res.signed, ["example.net."]);
    }

    #[test]
    fn no_sign_manages_keys_only() {
        let dir = setup(&["example.net"]);
        let res = FakeCmd::new(["keyroll", "sign", "-n"]).cwd(&dir).now(NOW).run();

        assert_eq!(res.exit_code, 0, "{res:?}");
        assert!(res.signed.is_empty());
        assert_eq!(res.generated.len(), 2);
        assert!(dir.path().join("example.net/dnskey.db").exists());
        assert!(!dir.path().join("example.net/zone.db.signed").exists());
    }

    #[test]
    fn zone_list_restricts_pass() {
        let dir = setup(&["example.net", "example.org"]);
        let res = FakeCmd::new(["keyroll", "sign", "-l", "example.org"])
            .cwd(&dir)
            .now(NOW)
            .run();

        assert_eq!(res.exit_code, 0, "{res:?}");
        assert_eq!(res.signed, ["example.org."]);
    }

    #[test]
    fn zsk_is_rolled_over_passes() {
        let dir = setup(&["example.net"]);
        fs::write(
            dir.path().join("example.net/dnssec.json"),
            r#"{ "zsk_lifetime": "30d", "key_ttl": "1h", "propagation": "5m" }"#,
        )
        .unwrap();
        let cmd = FakeCmd::new(["keyroll", "sign", "-n"]).cwd(&dir);
        assert_eq!(cmd.now(NOW).run().exit_code, 0);

        // Close to the end of its lifetime a successor is published.
        let res = cmd.now(NOW.add(days(28))).run();
        assert_eq!(res.generated.len(), 1, "{res:?}");

        let later = NOW.add(days(31));
        assert_eq!(cmd.now(later).run().exit_code, 0);
        let zone_dir = dir.path().join("example.net");
        let keys = store::load_keyset(&crate::env::fake::FakeEnv::default(), &zone_dir, "example.net.").unwrap();
        let active = keys.find(false, KeyStatus::Active, 1).unwrap();
        assert_eq!(keys.keys()[active].tag, FIRST_TAG + 2);
        let old = keys.find(false, KeyStatus::Depreciated, 1).unwrap();
        assert_eq!(keys.keys()[old].tag, FIRST_TAG + 1);
    }

    #[test]
    fn signing_timeout_is_only_a_warning() {
        let dir = setup(&["example.net"]);
        let res = FakeCmd::new(["keyroll", "sign"])
            .cwd(&dir)
            .now(NOW)
            .sign_error(SignError::Timeout(std::time::Duration::from_secs(300)))
            .run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert!(res.stderr.contains("timed out"));

        let res = FakeCmd::new(["keyroll", "sign"])
            .cwd(&dir)
            .now(NOW)
            .sign_error(SignError::Failed("broken zone".into()))
            .run();
        assert_eq!(res.exit_code, 1, "{res:?}");
        assert!(res.stderr.contains("broken zone"));
    }

    #[test]
    fn failed_zone_does_not_stop_the_pass() {
        let dir = setup(&["example.net", "example.org"]);
        fs::write(dir.path().join("example.net/keyset.json"), "{ not json").unwrap();

        let res = FakeCmd::new(["keyroll", "sign"]).cwd(&dir).now(NOW).run();
        assert_eq!(res.exit_code, 1, "{res:?}");
        assert_eq!(res.signed, ["example.org."]);
        assert!(res.stderr.contains("1 of 2 zones failed"));
    }

    #[test]
    fn keyset_is_distributed() {
        let dir = setup(&["example.net"]);
        fs::write(
            dir.path().join("dnssec.json"),
            r#"{ "keyset_dir": ".." }"#,
        )
        .unwrap();
        let res = FakeCmd::new(["keyroll", "sign"]).cwd(&dir).now(NOW).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        let keyset = fs::read_to_string(dir.path().join("keyset-example.net.")).unwrap();
        assert!(keyset.contains("DNSKEY 257"));
    }

    #[test]
    fn failed_key_generation_is_retried() {
        let dir = setup(&["example.net"]);
        fs::write(
            dir.path().join("example.net/dnssec.json"),
            r#"{ "zsk_lifetime": "30d", "key_ttl": "1h" }"#,
        )
        .unwrap();
        let cmd = FakeCmd::new(["keyroll", "sign"]).cwd(&dir);
        assert_eq!(cmd.now(NOW).run().exit_code, 0);
        let zone_dir = dir.path().join("example.net");
        let env = crate::env::fake::FakeEnv::default();
        let before = store::load_keyset(&env, &zone_dir, "example.net.").unwrap();

        // The successor ZSK is due but cannot be minted.
        let due = NOW.add(days(28));
        let res = cmd.now(due).generate_error("out of entropy").run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert!(res.stderr.contains("cannot generate new ZSK: out of entropy"), "{}", res.stderr);
        assert!(res.generated.is_empty());
        assert!(res.signed.is_empty());
        let keys = store::load_keyset(&env, &zone_dir, "example.net.").unwrap();
        assert_eq!(keys.keys(), before.keys());

        // The next pass tries again.
        let res = cmd.now(due).run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert_eq!(res.generated.len(), 1);
        let keys = store::load_keyset(&env, &zone_dir, "example.net.").unwrap();
        assert!(keys.find(false, KeyStatus::Published, 1).is_some());
    }

    #[test]
    fn zone_directory_as_working_directory() {
        let dir = setup(&["example.net"]);
        let res = FakeCmd::new(["keyroll", "sign"])
            .cwd(dir.path().join("example.net"))
            .now(NOW)
            .run();
        assert_eq!(res.exit_code, 0, "{res:?}");
        assert_eq!(res.signed, ["example.net."]);
        assert!(dir.path().join("example.net/zone.db.signed").exists());
    }

    #[test]
    fn only_active_keys_sign() {
        let dir = setup(&["example.net"]);
        fs::write(
            dir.path().join("example.net/dnssec.json"),
            r#"{ "zsk_lifetime": "30d", "key_ttl": "1h" }"#,
        )
        .unwrap();
        let cmd = FakeCmd::new(["keyroll", "sign"]).cwd(&dir);
        assert_eq!(cmd.now(NOW).run().exit_code, 0);

        // The pre-published successor is in the DNSKEY set but does not sign.
        let res = cmd.now(NOW.add(days(28))).run();
        assert_eq!(res.signed, ["example.net."], "{res:?}");
        let zone_dir = dir.path().join("example.net");
        let signed = fs::read_to_string(zone_dir.join("zone.db.signed")).unwrap();
        assert_eq!(signed, format!("; signed with {} {}\n", FIRST_TAG, FIRST_TAG + 1));
        let dnskeys = fs::read_to_string(zone_dir.join("dnskey.db")).unwrap();
        assert_eq!(dnskeys.lines().filter(|l| l.contains("DNSKEY 256")).count(), 2);
    }
}
