use std::process::ExitCode;

use keyroll::env::RealEnv;

fn main() -> ExitCode {
    ExitCode::from(keyroll::run(RealEnv))
}
