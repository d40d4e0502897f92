use std::borrow::Cow;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::Path;

use crate::engine::{CommandEngine, EngineSettings, SigningEngine};
use crate::keys::UnixTime;

use super::{Env, Stream};

/// Use real I/O
pub struct RealEnv;

impl Env for RealEnv {
    fn args_os(&self) -> impl Iterator<Item = OsString> {
        std::env::args_os()
    }

    fn stdout(&self) -> Stream<impl io::Write> {
        let stdout = io::stdout();
        let is_terminal = stdout.is_terminal();
        Stream::new(stdout, is_terminal)
    }

    fn stderr(&self) -> Stream<impl io::Write + Send + Sync + 'static> {
        let stderr = io::stderr();
        let is_terminal = stderr.is_terminal();
        Stream::new(stderr, is_terminal)
    }

    fn in_cwd<'a>(&self, path: &'a impl AsRef<Path>) -> Cow<'a, Path> {
        path.as_ref().into()
    }

    fn now(&self) -> UnixTime {
        UnixTime::now()
    }

    fn signing_engine(&self, settings: EngineSettings) -> impl SigningEngine {
        CommandEngine::new(settings)
    }
}
