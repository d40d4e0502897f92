use std::borrow::Cow;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::{fmt, io};

use crate::engine::{
    EngineSettings, GenerateError, GeneratedKey, KeyRequest, SignError, SignRequest, Signed,
    SigningEngine,
};
use crate::error::Error;
use crate::keys::{flags, KeyRecord, UnixTime};
use crate::{parse_args, run, Args};

use super::Env;
use super::Stream;

/// Tags handed out by the fake signing engine start here.
pub const FIRST_TAG: u16 = 1000;

/// A command to run in a [`FakeEnv`]
///
/// This is used for testing the utilities, running the real code in a fake
/// environment.
#[derive(Clone)]
pub struct FakeCmd {
    /// The command to run, including `argv[0]`
    cmd: Vec<OsString>,
    cwd: Option<PathBuf>,
    now: Option<UnixTime>,
    generate_error: Option<String>,
    sign_error: Option<SignError>,
}

/// The result of running a [`FakeCmd`]
///
/// The fields are public to allow for easy assertions in tests.
#[derive(Debug)]
pub struct FakeResult {
    pub exit_code: u8,
    pub stdout: String,
    pub stderr: String,

    /// Zones passed to the signing engine, in order.
    pub signed: Vec<String>,

    /// Base names of the keys generated, in order.
    pub generated: Vec<String>,

    /// Base names of the keys revoked, in order.
    pub revoked: Vec<String>,
}

/// An environment that mocks interaction with the outside world
pub struct FakeEnv {
    /// Description of the command being run
    pub cmd: FakeCmd,

    /// The mocked stdout
    pub stdout: FakeStream,

    /// The mocked stderr
    pub stderr: FakeStream,

    /// What the signing engine did
    pub engine: Arc<Mutex<EngineLog>>,
}

impl Default for FakeEnv {
    fn default() -> Self {
        FakeCmd::new(["keyroll"]).env()
    }
}

impl Env for FakeEnv {
    fn args_os(&self) -> impl Iterator<Item = OsString> {
        self.cmd.cmd.iter().map(Into::into)
    }

    fn stdout(&self) -> Stream<impl io::Write> {
        Stream::new(self.stdout.clone(), false)
    }

    fn stderr(&self) -> Stream<impl io::Write + Send + Sync + 'static> {
        Stream::new(self.stderr.clone(), false)
    }

    fn in_cwd<'a>(&self, path: &'a impl AsRef<Path>) -> Cow<'a, Path> {
        match &self.cmd.cwd {
            Some(cwd) => cwd.join(path).into(),
            None => path.as_ref().into(),
        }
    }

    fn now(&self) -> UnixTime {
        self.cmd.now.unwrap_or_else(UnixTime::now)
    }

    fn signing_engine(&self, _settings: EngineSettings) -> impl SigningEngine {
        FakeEngine {
            log: self.engine.clone(),
        }
    }
}

impl FakeCmd {
    /// Construct a new [`FakeCmd`] with a given command.
    ///
    /// The command can consist of multiple strings to specify a subcommand.
    pub fn new<S: Into<OsString>>(cmd: impl IntoIterator<Item = S>) -> Self {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            cwd: None,
            now: None,
            generate_error: None,
            sign_error: None,
        }
    }

    pub fn cwd(&self, path: impl AsRef<Path>) -> Self {
        Self {
            cwd: Some(path.as_ref().to_path_buf()),
            ..self.clone()
        }
    }

    /// Fix the clock.
    pub fn now(&self, now: UnixTime) -> Self {
        Self {
            now: Some(now),
            ..self.clone()
        }
    }

    /// Make key generation fail.
    pub fn generate_error(&self, diagnostic: &str) -> Self {
        Self {
            generate_error: Some(diagnostic.into()),
            ..self.clone()
        }
    }

    /// Make signing fail.
    pub fn sign_error(&self, err: SignError) -> Self {
        Self {
            sign_error: Some(err),
            ..self.clone()
        }
    }

    /// Add arguments to a clone of the [`FakeCmd`]
    ///
    /// ```rust,ignore
    /// let cmd = FakeCmd::new(["keyroll"])
    /// let sub1 = cmd.args(["sign"]);         // keyroll sign
    /// let sub2 = cmd.args(["ksk-roll"]);     // keyroll ksk-roll
    /// let sub3 = sub2.args(["status"]);      // keyroll ksk-roll status
    /// ```
    pub fn args<S: Into<OsString>>(&self, args: impl IntoIterator<Item = S>) -> Self {
        let mut new = self.clone();
        new.cmd.extend(args.into_iter().map(Into::into));
        new
    }

    pub fn env(&self) -> FakeEnv {
        FakeEnv {
            cmd: self.clone(),
            stdout: Default::default(),
            stderr: Default::default(),
            engine: Arc::new(Mutex::new(EngineLog {
                next_tag: FIRST_TAG,
                generate_error: self.generate_error.clone(),
                sign_error: self.sign_error.clone(),
                ..Default::default()
            })),
        }
    }

    /// Parse the arguments of this [`FakeCmd`] and return the result
    pub fn parse(&self) -> Result<Args, Error> {
        parse_args(self.env())
    }

    /// Run the [`FakeCmd`] in a [`FakeEnv`], returning a [`FakeResult`]
    pub fn run(&self) -> FakeResult {
        let env = self.env();
        let exit_code = run(&env);
        let log = env.engine.lock().unwrap();

        FakeResult {
            exit_code,
            stdout: env.get_stdout(),
            stderr: env.get_stderr(),
            signed: log.signed.clone(),
            generated: log.generated.clone(),
            revoked: log.revoked.clone(),
        }
    }
}

impl FakeEnv {
    pub fn get_stdout(&self) -> String {
        String::from_utf8(self.stdout.0.lock().unwrap().clone()).unwrap()
    }

    pub fn get_stderr(&self) -> String {
        String::from_utf8(self.stderr.0.lock().unwrap().clone()).unwrap()
    }
}

/// A type to used to mock stdout and stderr
#[derive(Clone, Default)]
pub struct FakeStream(Arc<Mutex<Vec<u8>>>);

impl io::Write for FakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // do nothing
        Ok(())
    }
}

impl fmt::Display for FakeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(std::str::from_utf8(&self.0.lock().unwrap()).unwrap())
    }
}

//------------ FakeEngine ----------------------------------------------------

/// The record of a [`FakeEngine`].
#[derive(Default)]
pub struct EngineLog {
    pub next_tag: u16,
    pub generated: Vec<String>,
    pub revoked: Vec<String>,
    pub signed: Vec<String>,
    pub generate_error: Option<String>,
    pub sign_error: Option<SignError>,
}

/// A signing engine that writes placeholder files instead of doing
/// cryptography.
///
/// Keys get the lowest tag from [`FIRST_TAG`] on that has no key file in
/// the zone directory yet. Revoking adds 128 to the tag, like setting the
/// REVOKE flag does to a real key tag. Signing writes the signed zone,
/// naming the keys it signed with, and a keyset artifact.
pub struct FakeEngine {
    log: Arc<Mutex<EngineLog>>,
}

impl SigningEngine for FakeEngine {
    fn generate(&mut self, request: &KeyRequest) -> Result<GeneratedKey, GenerateError> {
        let mut log = self.log.lock().unwrap();
        if let Some(diagnostic) = &log.generate_error {
            return Err(GenerateError::new(diagnostic.clone()));
        }
        let (base, tag) = loop {
            let tag = log.next_tag;
            log.next_tag += 1;
            let base = format!("K{}+{:03}+{tag:05}", request.zone, request.algorithm);
            let taken = [".key", ".key.removed"]
                .iter()
                .any(|ext| request.dir.join(format!("{base}{ext}")).exists());
            if !taken {
                break (base, tag);
            }
        };
        let mut key_flags = flags::ZONE;
        if request.ksk {
            key_flags |= flags::SEP;
        }
        let public_key = format!("AwEAAa{tag:05}");
        write_key_files(&request.dir, &base, &request.zone, key_flags, request.algorithm, &public_key)?;
        log.generated.push(base.clone());

        Ok(GeneratedKey {
            base,
            tag,
            algorithm: request.algorithm,
            flags: key_flags,
            public_key,
        })
    }

    fn revoke(&mut self, key: &KeyRecord) -> Result<GeneratedKey, GenerateError> {
        let mut log = self.log.lock().unwrap();
        let tag = key.tag.wrapping_add(128);
        let base = format!("K{}+{:03}+{tag:05}", key.owner, key.algorithm);
        let key_flags = key.flags | flags::REVOKE;
        write_key_files(&key.dir, &base, &key.owner, key_flags, key.algorithm, &key.public_key)?;
        for ext in [".key", ".private"] {
            let path = key.path(ext);
            std::fs::remove_file(&path)
                .map_err(|e| GenerateError::new(format!("cannot remove {}: {e}", path.display())))?;
        }
        log.revoked.push(key.base.clone());

        Ok(GeneratedKey {
            base,
            tag,
            algorithm: key.algorithm,
            flags: key_flags,
            public_key: key.public_key.clone(),
        })
    }

    fn sign(&mut self, request: &SignRequest<'_>) -> Result<Signed, SignError> {
        let mut log = self.log.lock().unwrap();
        if let Some(err) = &log.sign_error {
            return Err(err.clone());
        }
        let signed = request.dir.join(format!("{}.signed", request.zone_file));
        let tags: Vec<String> = request
            .signing_ksks()
            .chain(request.signing_zsks())
            .map(|k| k.tag.to_string())
            .collect();
        std::fs::write(&signed, format!("; signed with {}\n", tags.join(" ")))
            .map_err(|e| SignError::Failed(e.to_string()))?;

        let artifact = request.dir.join(format!("keyset-{}", request.zone));
        let ksks: Vec<String> = request
            .keys
            .iter()
            .filter(|k| k.is_ksk())
            .map(|k| k.dnskey(None))
            .collect();
        std::fs::write(&artifact, ksks.join("\n")).map_err(|e| SignError::Failed(e.to_string()))?;
        log.signed.push(request.zone.to_string());

        Ok(Signed {
            artifact: Some(artifact),
        })
    }
}

fn write_key_files(
    dir: &Path,
    base: &str,
    owner: &str,
    key_flags: u16,
    algorithm: u8,
    public_key: &str,
) -> Result<(), GenerateError> {
    let record = format!("{owner} IN DNSKEY {key_flags} 3 {algorithm} {public_key}\n");
    for (ext, contents) in [(".key", record.as_str()), (".private", "Private-key-format: v1.3\n")] {
        let path = dir.join(format!("{base}{ext}"));
        std::fs::write(&path, contents)
            .map_err(|e| GenerateError::new(format!("cannot write {}: {e}", path.display())))?;
    }
    Ok(())
}
