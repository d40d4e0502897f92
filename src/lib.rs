//! Automated DNSSEC key lifecycle management.
//!
//! `keyroll` keeps the keys of a set of signed zones in shape: it rolls zone
//! signing keys, watches and rolls key signing keys, and decides when a
//! zone has to be signed again. Key generation and signing are left to an
//! external [`engine::SigningEngine`].

use clap::Parser;

pub use self::args::Args;
use self::env::Env;
use self::error::Error;

pub mod args;
pub mod commands;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod keys;
pub mod log;
pub mod parse;
pub mod rollover;
pub mod store;
pub mod util;
pub mod zone;

pub fn parse_args(env: impl Env) -> Result<Args, Error> {
    Args::try_parse_from(env.args_os()).map_err(Error::from)
}

/// Run the program in the given environment, returning the exit code.
pub fn run(env: impl Env) -> u8 {
    let args = match parse_args(&env) {
        Ok(args) => args,
        Err(err) => {
            err.pretty_print(&env);
            return err.exit_code();
        }
    };

    let verbose = args.verbose;
    match log::with_logging(&env, verbose, || args.execute(&env)) {
        Ok(()) => 0,
        Err(err) => {
            err.pretty_print(&env);
            err.exit_code()
        }
    }
}
