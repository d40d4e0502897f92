use std::borrow::Cow;
use std::ffi::OsString;
use std::ops::DerefMut;
use std::path::Path;
use std::sync::Mutex;
use std::{fmt, io};

use tracing_subscriber::fmt::MakeWriter;

use crate::engine::{EngineSettings, SigningEngine};
use crate::keys::UnixTime;

#[cfg(test)]
pub mod fake;

mod real;
pub use real::RealEnv;

pub trait Env {
    /// Get an iterator over the command line arguments passed to the program
    ///
    /// Equivalent to [`std::env::args_os`]
    fn args_os(&self) -> impl Iterator<Item = OsString>;

    /// Get a reference to stdout
    ///
    /// Equivalent to [`std::io::stdout`]
    fn stdout(&self) -> Stream<impl io::Write>;

    /// Get a reference to stderr
    ///
    /// Equivalent to [`std::io::stderr`]
    fn stderr(&self) -> Stream<impl io::Write + Send + Sync + 'static>;

    /// Make relative paths absolute.
    fn in_cwd<'a>(&self, path: &'a impl AsRef<Path>) -> Cow<'a, Path>;

    /// The current time.
    fn now(&self) -> UnixTime;

    /// The engine that mints keys and signs zones.
    fn signing_engine(&self, settings: EngineSettings) -> impl SigningEngine;
}

/// A type with an infallible `write_fmt` method for use with [`write!`] macros
///
/// This ensures that we don't have to `use` either [`std::fmt::Write`] or
/// [`std::io::Write`]. Additionally, this `write_fmt` does not return a
/// result. This means that we can use the [`write!`] and [`writeln`] macros
/// without handling errors.
pub struct Stream<T: io::Write> {
    writer: Mutex<T>,
    is_terminal: bool,
}

impl<'writer, T: io::Write + 'writer> MakeWriter<'writer> for Stream<T> {
    type Writer = &'writer Self;

    fn make_writer(&'writer self) -> Self::Writer {
        self
    }
}

impl<T: io::Write> io::Write for &Stream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer
            .lock()
            .map_err(|_| io::Error::other("poisoned stream"))?
            .deref_mut()
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer
            .lock()
            .map_err(|_| io::Error::other("poisoned stream"))?
            .deref_mut()
            .flush()
    }
}

impl<T: io::Write> Stream<T> {
    pub fn new(writer: T, is_terminal: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            is_terminal,
        }
    }

    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) {
        // This unwrap is not _really_ safe, but we are using this as stdout.
        // The `println` macro also ignores errors and `push_str` of the
        // fake stream also does not return an error. If this fails, it means
        // we can't write to stdout anymore so a graceful exit will be very
        // hard anyway.
        self.writer
            .lock()
            .unwrap()
            .deref_mut()
            .write_fmt(args)
            .unwrap();
    }

    pub fn is_terminal(&self) -> bool {
        self.is_terminal
    }
}

impl<E: Env> Env for &E {
    fn args_os(&self) -> impl Iterator<Item = OsString> {
        (**self).args_os()
    }

    fn stdout(&self) -> Stream<impl io::Write> {
        (**self).stdout()
    }

    fn stderr(&self) -> Stream<impl io::Write + Send + Sync + 'static> {
        (**self).stderr()
    }

    fn in_cwd<'a>(&self, path: &'a impl AsRef<Path>) -> Cow<'a, Path> {
        (**self).in_cwd(path)
    }

    fn now(&self) -> UnixTime {
        (**self).now()
    }

    fn signing_engine(&self, settings: EngineSettings) -> impl SigningEngine {
        (**self).signing_engine(settings)
    }
}
