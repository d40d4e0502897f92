//! A utility module for common file operations.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::env::Env;
use crate::error::{in_context, Result};

/// Create and open a file that must not exist yet.
pub fn create_new_file(env: &impl Env, path: impl AsRef<Path>) -> Result<File> {
    let path = path.as_ref();
    let abs_path = env.in_cwd(&path);
    File::create_new(abs_path)
        .map_err(|err| format!("cannot create '{}': {err}", path.display()).into())
}

/// Rename a file.
pub fn rename_path(env: &impl Env, old: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<()> {
    let (old, new) = (old.as_ref(), new.as_ref());
    let abs_old = env.in_cwd(&old);
    let abs_new = env.in_cwd(&new);
    std::fs::rename(abs_old, abs_new).map_err(|err| {
        format!(
            "could not move '{}' to '{}': {err}",
            old.display(),
            new.display()
        )
        .into()
    })
}

/// Replace the contents of a file.
///
/// The data goes to a temporary file next to `path` first which is then
/// renamed over it, so readers see either the old or the new contents.
pub fn write_atomic(env: &impl Env, path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let mut temp = path.to_path_buf();
    temp.as_mut_os_string().push(".new");

    in_context(
        || format!("writing '{}'", path.display()),
        || {
            let abs_temp = env.in_cwd(&temp);
            let _ = std::fs::remove_file(&abs_temp);
            let mut file = create_new_file(env, &temp)?;
            let written = file.write_all(contents).and_then(|_| file.sync_all());
            if let Err(err) = written {
                let _ = std::fs::remove_file(&abs_temp);
                return Err(format!("cannot write '{}': {err}", temp.display()).into());
            }
            rename_path(env, &temp, path)
        },
    )
}

/// Remove a file, succeeding if it is already gone.
pub fn remove_file(env: &impl Env, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match std::fs::remove_file(env.in_cwd(&path)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!("cannot remove '{}': {err}", path.display()).into()),
    }
}
