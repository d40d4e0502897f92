//! The external signing engine.
//!
//! Key pairs are minted, revoked and zones are signed by an external
//! engine, by default the BIND `dnssec-keygen`, `dnssec-revoke` and
//! `dnssec-signzone` tools. Every invocation is bounded by a timeout; a
//! timed out signing run is reported as retryable so the next scheduled
//! pass tries again.
//!
//! The engine only ever signs with the keys named in the request: active
//! and revoked KSKs sign the DNSKEY RRset, active ZSKs the zone. Published
//! and depreciated keys are never handed to it.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use domain::base::iana::SecurityAlgorithm;
use tracing::{debug, trace};

use crate::keys::{KeyRecord, KeyStatus};

//------------ EngineSettings ------------------------------------------------

/// How to reach the signing engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub keygen_command: String,
    pub revoke_command: String,
    pub sign_command: String,

    /// Upper bound for a single engine invocation.
    pub timeout: Duration,

    /// Validity of the signatures created when signing.
    pub sig_validity: Duration,
}

//------------ Requests and results ------------------------------------------

/// Parameters for minting one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRequest {
    pub dir: PathBuf,
    pub zone: String,
    pub ksk: bool,
    pub algorithm: u8,
    pub bits: u32,
    pub random: Option<PathBuf>,
    pub lifetime: Option<Duration>,
}

/// A key minted by the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedKey {
    pub base: String,
    pub tag: u16,
    pub algorithm: u8,
    pub flags: u16,
    pub public_key: String,
}

/// Key generation failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateError {
    diagnostic: String,
}

impl GenerateError {
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
        }
    }

    /// What the engine had to say about the failure.
    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }
}

impl fmt::Display for GenerateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.diagnostic)
    }
}

/// A zone to be signed.
#[derive(Clone, Debug)]
pub struct SignRequest<'a> {
    pub zone: &'a str,
    pub dir: &'a Path,
    pub zone_file: &'a str,
    pub keys: &'a [KeyRecord],
}

impl SignRequest<'_> {
    /// The key signing keys that sign the DNSKEY RRset.
    ///
    /// A revoked KSK keeps signing so resolvers see the revocation.
    pub fn signing_ksks(&self) -> impl Iterator<Item = &KeyRecord> {
        self.keys
            .iter()
            .filter(|k| k.is_ksk() && matches!(k.status, KeyStatus::Active | KeyStatus::Revoked))
    }

    /// The zone signing keys that sign the zone data.
    pub fn signing_zsks(&self) -> impl Iterator<Item = &KeyRecord> {
        self.keys
            .iter()
            .filter(|k| !k.is_ksk() && k.status == KeyStatus::Active)
    }
}

/// The result of a successful signing run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Signed {
    /// The keyset or DS set produced for the parent, if any.
    pub artifact: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignError {
    /// The engine did not finish in time.
    Timeout(Duration),

    /// The engine could not be run or reported failure.
    Failed(String),
}

impl SignError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SignError::Timeout(_))
    }
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignError::Timeout(t) => write!(f, "signing engine timed out after {}s", t.as_secs()),
            SignError::Failed(s) => f.write_str(s),
        }
    }
}

//------------ SigningEngine -------------------------------------------------

pub trait SigningEngine {
    /// Mint a new key pair.
    fn generate(&mut self, request: &KeyRequest) -> Result<GeneratedKey, GenerateError>;

    /// Set the REVOKE flag of a key signing key.
    ///
    /// Revoking changes the key tag, so the key comes back under a new base
    /// name. The files of the old name are gone afterwards.
    fn revoke(&mut self, key: &KeyRecord) -> Result<GeneratedKey, GenerateError>;

    /// Sign a zone with the active and revoked keys of the request.
    fn sign(&mut self, request: &SignRequest<'_>) -> Result<Signed, SignError>;
}

//------------ CommandEngine -------------------------------------------------

/// A signing engine driven through external commands.
pub struct CommandEngine {
    settings: EngineSettings,
}

enum RunError {
    Timeout,
    Io(std::io::Error),
}

impl CommandEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    fn run(&self, program: &str, args: &[OsString], cwd: &Path) -> Result<Output, RunError> {
        trace!("running {program} {args:?} in {}", cwd.display());
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).current_dir(cwd).kill_on_drop(true);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RunError::Io)?;
        runtime.block_on(async {
            match tokio::time::timeout(self.settings.timeout, cmd.output()).await {
                Ok(res) => res.map_err(RunError::Io),
                Err(_) => Err(RunError::Timeout),
            }
        })
    }

    /// Run a key tool, turning every failure into a diagnostic.
    fn run_keytool(
        &self,
        program: &str,
        args: &[OsString],
        cwd: &Path,
    ) -> Result<Output, GenerateError> {
        let output = match self.run(program, args, cwd) {
            Ok(output) => output,
            Err(RunError::Timeout) => {
                return Err(GenerateError::new(format!("{program} timed out")))
            }
            Err(RunError::Io(e)) => {
                return Err(GenerateError::new(format!("cannot run {program}: {e}")))
            }
        };
        if !output.status.success() {
            return Err(GenerateError::new(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(output)
    }
}

impl SigningEngine for CommandEngine {
    fn generate(&mut self, request: &KeyRequest) -> Result<GeneratedKey, GenerateError> {
        let algorithm = SecurityAlgorithm::from_int(request.algorithm).to_string();
        let mut args: Vec<OsString> = vec![
            "-q".into(),
            "-K".into(),
            request.dir.clone().into(),
            "-a".into(),
            algorithm.into(),
            "-b".into(),
            request.bits.to_string().into(),
            "-n".into(),
            "ZONE".into(),
        ];
        if request.ksk {
            args.extend([OsString::from("-f"), OsString::from("KSK")]);
        }
        if let Some(random) = &request.random {
            args.extend([OsString::from("-r"), random.clone().into()]);
        }
        args.push(request.zone.clone().into());

        let output = self.run_keytool(&self.settings.keygen_command, &args, &request.dir)?;
        let key = read_key(&request.dir, &output)?;
        debug!("generated key {}", key.base);
        Ok(key)
    }

    fn revoke(&mut self, key: &KeyRecord) -> Result<GeneratedKey, GenerateError> {
        let args: Vec<OsString> = vec![
            "-r".into(),
            "-K".into(),
            key.dir.clone().into(),
            key.base.clone().into(),
        ];
        let output = self.run_keytool(&self.settings.revoke_command, &args, &key.dir)?;
        let revoked = read_key(&key.dir, &output)?;
        debug!("revoked key {} is now {}", key.base, revoked.base);
        Ok(revoked)
    }

    fn sign(&mut self, request: &SignRequest<'_>) -> Result<Signed, SignError> {
        let signed_file = format!("{}.signed", request.zone_file);
        let mut args: Vec<OsString> = vec![
            "-o".into(),
            request.zone.into(),
            "-e".into(),
            format!("+{}", self.settings.sig_validity.as_secs()).into(),
            // Child keysets become DS records.
            "-g".into(),
            "-f".into(),
            signed_file.into(),
        ];
        for ksk in request.signing_ksks() {
            args.extend([OsString::from("-k"), ksk.path("").into()]);
        }
        args.push(request.zone_file.into());
        args.extend(request.signing_zsks().map(|zsk| OsString::from(zsk.path(""))));

        let output = match self.run(&self.settings.sign_command, &args, request.dir) {
            Ok(output) => output,
            Err(RunError::Timeout) => return Err(SignError::Timeout(self.settings.timeout)),
            Err(RunError::Io(e)) => {
                return Err(SignError::Failed(format!(
                    "cannot run {}: {e}",
                    self.settings.sign_command
                )))
            }
        };
        if !output.status.success() {
            return Err(SignError::Failed(format!(
                "{} failed: {}",
                self.settings.sign_command,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(
            "{} returned: {}",
            self.settings.sign_command,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        let zone = request.zone.trim_end_matches('.');
        let artifact = ["keyset", "dsset"]
            .iter()
            .map(|prefix| request.dir.join(format!("{prefix}-{zone}.")))
            .find(|path| path.is_file());
        Ok(Signed { artifact })
    }
}

//------------ Helpers -------------------------------------------------------

/// The key a key tool named on stdout, read from its `.key` file.
fn read_key(dir: &Path, output: &Output) -> Result<GeneratedKey, GenerateError> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| GenerateError::new("key tool printed no key name"))?;
    let file_name = line.rsplit('/').next().unwrap_or(line);
    let base = file_name
        .strip_suffix(".key")
        .or_else(|| file_name.strip_suffix(".private"))
        .unwrap_or(file_name)
        .to_string();
    let (_, algorithm, tag) = parse_base_name(&base)
        .ok_or_else(|| GenerateError::new(format!("unexpected key name '{base}'")))?;

    let key_file = dir.join(format!("{base}.key"));
    let text = std::fs::read_to_string(&key_file)
        .map_err(|e| GenerateError::new(format!("cannot read '{}': {e}", key_file.display())))?;
    let (flags, public_key) = parse_dnskey_text(&text).ok_or_else(|| {
        GenerateError::new(format!("no DNSKEY record in '{}'", key_file.display()))
    })?;

    Ok(GeneratedKey {
        base,
        tag,
        algorithm,
        flags,
        public_key,
    })
}

/// Split a key file base name `K<owner>+<alg>+<tag>` into its parts.
pub fn parse_base_name(base: &str) -> Option<(&str, u8, u16)> {
    let rest = base.strip_prefix('K')?;
    let mut parts = rest.rsplitn(3, '+');
    let tag = parts.next()?.parse().ok()?;
    let algorithm = parts.next()?.parse().ok()?;
    let owner = parts.next()?;
    if owner.is_empty() {
        return None;
    }
    Some((owner, algorithm, tag))
}

/// Extract flags and public key from a DNSKEY record in a `.key` file.
fn parse_dnskey_text(text: &str) -> Option<(u16, String)> {
    text.lines()
        .map(|l| l.split(';').next().unwrap_or_default())
        .find_map(|line| {
            let mut fields = line.split_whitespace().skip_while(|f| *f != "DNSKEY");
            fields.next()?;
            let flags = fields.next()?.parse().ok()?;
            let _protocol = fields.next()?;
            let _algorithm = fields.next()?;
            let key: String = fields.collect();
            (!key.is_empty()).then_some((flags, key))
        })
}
