//! The operator driven three phase KSK rollover.
//!
//! The parent zone has to learn about a new KSK before the old one can go.
//! The phases hand the relevant DNSKEY record to the operator through the
//! parent state file, who passes it on to the parent:
//!
//! 1. A new KSK is generated and published. The file holds the old key.
//! 2. Once the new key has propagated, the file is rewritten with the new
//!    key for the parent to create a DS record from.
//! 3. Once the parent has published the new DS record, the old KSK is
//!    removed and the new one takes over.
//!
//! A phase whose precondition does not hold fails without changing
//! anything and says how long to wait.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::engine::{GenerateError, SigningEngine};
use crate::env::Env;
use crate::error::{Context, Error};
use crate::keys::{InvalidTransition, KeyRecord, KeySet, KeyStatus, Search, UnixTime};
use crate::parse::format_age;
use crate::util;

use super::RollContext;

/// Name of the parent state file in a zone directory.
pub const PARENT_STATE_FILE: &str = "parent.state";

//------------ Phase ---------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// A new KSK has been published; the parent gets the old key.
    NewKey,

    /// The parent gets the new key.
    Publish,
}

impl Phase {
    fn number(self) -> u8 {
        match self {
            Phase::NewKey => 1,
            Phase::Publish => 2,
        }
    }

    fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Phase::NewKey),
            2 => Some(Phase::Publish),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {}", self.number())
    }
}

//------------ ParentState ---------------------------------------------------

/// The contents of the parent state file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentState {
    pub phase: Phase,

    /// When the phase was entered.
    pub created: UnixTime,

    /// Tag of the key in the file.
    pub tag: u16,

    /// The DNSKEY record in presentation format.
    pub dnskey: String,
}

impl ParentState {
    fn new(phase: Phase, key: &KeyRecord, ctx: &RollContext<'_>) -> Self {
        Self {
            phase,
            created: ctx.now,
            tag: key.tag,
            dnskey: key.dnskey(Some(ctx.config.key_ttl)),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(PARENT_STATE_FILE)
    }

    /// Parse the file format written by the [`fmt::Display`] impl.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut phase = None;
        let mut created = None;
        let mut tag = None;
        let mut dnskey = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(setting) = line.strip_prefix(";%") {
                let Some((name, value)) = setting.split_once('=') else {
                    continue;
                };
                match name.trim() {
                    "phase" => {
                        phase = value.trim().parse().ok().and_then(Phase::from_number);
                        if phase.is_none() {
                            return Err(format!("invalid phase '{}'", value.trim()).into());
                        }
                    }
                    "created" => {
                        let secs = value
                            .trim()
                            .parse()
                            .map_err(|_| Error::from(format!("invalid time '{}'", value.trim())))?;
                        created = Some(UnixTime::from_secs(secs));
                    }
                    _ => {}
                }
            } else if let Some(comment) = line.strip_prefix(';') {
                if let Some(id) = comment.trim().strip_prefix("key id =") {
                    tag = id.trim().parse().ok();
                }
            } else if dnskey.is_none() {
                dnskey = Some(line.to_string());
            }
        }

        let phase = phase.ok_or("missing phase")?;
        let created = created.ok_or("missing creation time")?;
        let dnskey = dnskey.ok_or("missing DNSKEY record")?;
        let tag = tag.ok_or("missing key id")?;
        Ok(Self {
            phase,
            created,
            tag,
            dnskey,
        })
    }

    /// Read the parent state file of a zone, if there is one.
    pub fn load(env: &impl Env, dir: &Path) -> Result<Option<Self>, Error> {
        let path = Self::path(dir);
        let text = match std::fs::read_to_string(env.in_cwd(&path)) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format!("cannot read '{}': {err}", path.display()).into()),
        };
        Self::parse(&text)
            .with_context(|| format!("reading '{}'", path.display()))
            .map(Some)
    }

    pub fn save(&self, env: &impl Env, dir: &Path) -> Result<(), Error> {
        util::write_atomic(env, Self::path(dir), self.to_string().as_bytes())
    }

    pub fn remove(env: &impl Env, dir: &Path) -> Result<(), Error> {
        util::remove_file(env, Self::path(dir))
    }
}

impl fmt::Display for ParentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ";% phase={}", self.phase.number())?;
        writeln!(f, ";% created={}", self.created.as_secs())?;
        writeln!(f, "; key id = {}", self.tag)?;
        writeln!(f, "{}", self.dnskey)
    }
}

//------------ RollError -----------------------------------------------------

/// Why a phase cannot be run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RollError {
    /// A rollover is already in progress.
    InProgress(Phase),

    /// The previous phase has not been run.
    WrongPhase {
        expected: Phase,
        found: Option<Phase>,
    },

    KskCount {
        expected: usize,
        found: usize,
    },

    /// The phase may only run after this much more time.
    TooEarly {
        phase: Phase,
        remaining: Duration,
    },

    /// There is no published KSK to hand to the parent.
    NoNewKey,

    KeyNotFound(u16),
    AmbiguousKey(u16),

    Transition(InvalidTransition),
    Generate(GenerateError),
}

impl fmt::Display for RollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollError::InProgress(phase) => {
                write!(f, "a KSK rollover is already in progress ({phase})")
            }
            RollError::WrongPhase { expected, found } => match found {
                Some(found) => write!(f, "rollover is in {found}, {expected} must be completed first"),
                None => write!(f, "no rollover in progress, {expected} must be run first"),
            },
            RollError::KskCount { expected, found } => {
                write!(f, "expected {expected} KSK(s), found {found}")
            }
            RollError::TooEarly { phase, remaining } => write!(
                f,
                "{phase} has not been in effect long enough: wait another {}",
                format_age(*remaining)
            ),
            RollError::NoNewKey => f.write_str("no published KSK found"),
            RollError::KeyNotFound(tag) => write!(f, "KSK {tag} from the parent state file not found"),
            RollError::AmbiguousKey(tag) => write!(f, "more than one key has tag {tag}"),
            RollError::Transition(err) => write!(f, "{err}"),
            RollError::Generate(err) => write!(f, "cannot generate new KSK: {}", err.diagnostic()),
        }
    }
}

impl From<RollError> for Error {
    fn from(err: RollError) -> Self {
        err.to_string().into()
    }
}

//------------ Phases --------------------------------------------------------

/// Phase 1: publish a new KSK.
///
/// Returns the parent state to write, carrying the old KSK.
pub fn phase1(
    keys: &mut KeySet,
    ctx: &RollContext<'_>,
    engine: &mut impl SigningEngine,
    state: Option<&ParentState>,
) -> Result<ParentState, RollError> {
    if let Some(state) = state {
        return Err(RollError::InProgress(state.phase));
    }
    let ksks = keys.indexes(true);
    let [old] = ksks[..] else {
        return Err(RollError::KskCount {
            expected: 1,
            found: ksks.len(),
        });
    };

    let request = ctx.config.key_request(ctx.dir, ctx.zone, true);
    let new = keys
        .generate(engine, &request, KeyStatus::Published, ctx.now)
        .map_err(RollError::Generate)?;
    let old = &keys.keys()[old];
    info!(
        zone = ctx.zone,
        "created KSK {} to replace KSK {}",
        keys.keys()[new].tag,
        old.tag
    );
    Ok(ParentState::new(Phase::NewKey, old, ctx))
}

/// Phase 2: hand the new KSK to the parent.
pub fn phase2(
    keys: &KeySet,
    ctx: &RollContext<'_>,
    state: Option<&ParentState>,
) -> Result<ParentState, RollError> {
    let state = expect_phase(state, Phase::NewKey)?;
    wait_for(state, ctx.config.propagation + ctx.config.key_ttl, ctx.now)?;
    let found = keys.indexes(true).len();
    if found != 2 {
        return Err(RollError::KskCount { expected: 2, found });
    }
    let new = keys
        .find(true, KeyStatus::Published, 1)
        .ok_or(RollError::NoNewKey)?;
    let new = &keys.keys()[new];
    info!(zone = ctx.zone, "KSK {} is ready to be sent to the parent", new.tag);
    Ok(ParentState::new(Phase::Publish, new, ctx))
}

/// Phase 3: drop the old KSK and activate the new one.
///
/// The parent state file must be removed by the caller.
pub fn phase3(
    keys: &mut KeySet,
    ctx: &RollContext<'_>,
    state: Option<&ParentState>,
) -> Result<(), RollError> {
    let state = expect_phase(state, Phase::Publish)?;
    wait_for(state, ctx.config.parent_propagation + ctx.config.key_ttl, ctx.now)?;
    let new = match keys.search(Some(state.tag), Some(ctx.zone)) {
        Search::Found(index) if keys.keys()[index].is_ksk() => index,
        Search::Found(_) | Search::NotFound => return Err(RollError::KeyNotFound(state.tag)),
        Search::Ambiguous(_) => return Err(RollError::AmbiguousKey(state.tag)),
    };

    let mut old: Vec<usize> = keys.indexes(true).into_iter().filter(|&i| i != new).collect();
    if let Some(key) = keys.get_mut(new) {
        if key.status != KeyStatus::Active {
            key.set_status_preserve_time(KeyStatus::Active)
                .map_err(RollError::Transition)?;
        }
    }
    old.sort_unstable_by(|a, b| b.cmp(a));
    for index in old {
        if let Some(key) = keys.remove(index) {
            info!(zone = ctx.zone, "removed old KSK {}", key.tag);
        }
    }
    info!(zone = ctx.zone, "KSK {} is now the only KSK", state.tag);
    Ok(())
}

/// Where a rollover stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RollStatus {
    pub phase: Option<Phase>,

    /// Tag of the key in the parent state file.
    pub tag: Option<u16>,

    /// How long until the next phase may run.
    pub remaining: Duration,
}

impl fmt::Display for RollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (Some(phase), Some(tag)) = (self.phase, self.tag) else {
            return f.write_str("no KSK rollover in progress");
        };
        let next = match phase {
            Phase::NewKey => "phase 2",
            Phase::Publish => "phase 3",
        };
        write!(f, "{phase} completed, parent state file holds KSK {tag}; ")?;
        if self.remaining.is_zero() {
            write!(f, "{next} may be run now")
        } else {
            write!(f, "{next} may be run in {}", format_age(self.remaining))
        }
    }
}

pub fn status(ctx: &RollContext<'_>, state: Option<&ParentState>) -> RollStatus {
    let Some(state) = state else {
        return RollStatus {
            phase: None,
            tag: None,
            remaining: Duration::ZERO,
        };
    };
    let wait = match state.phase {
        Phase::NewKey => ctx.config.propagation,
        Phase::Publish => ctx.config.parent_propagation,
    } + ctx.config.key_ttl;
    RollStatus {
        phase: Some(state.phase),
        tag: Some(state.tag),
        remaining: wait.saturating_sub(ctx.now.since(state.created)),
    }
}

fn expect_phase(state: Option<&ParentState>, expected: Phase) -> Result<&ParentState, RollError> {
    match state {
        Some(state) if state.phase == expected => Ok(state),
        other => Err(RollError::WrongPhase {
            expected,
            found: other.map(|s| s.phase),
        }),
    }
}

fn wait_for(state: &ParentState, wait: Duration, now: UnixTime) -> Result<(), RollError> {
    let elapsed = now.since(state.created);
    if elapsed < wait {
        return Err(RollError::TooEarly {
            phase: state.phase,
            remaining: wait - elapsed,
        });
    }
    Ok(())
}
