use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no folder given")]
    EmptyPath,
    #[error("{0} exists and is not a directory")]
    NotADirectory(PathBuf),
    #[error("setup cancelled")]
    Cancelled,
}

/// Asks for the local folder to sync into.
///
/// An existing folder is only accepted after the user agrees to have its
/// contents wiped; the caller does the wiping.
pub fn prompt_local_root<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    home: &Path,
) -> Result<PathBuf, SetupError> {
    write!(output, "Input local folder to use for Dropbox: ")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    let answer = line.trim();
    if answer.is_empty() {
        return Err(SetupError::EmptyPath);
    }
    let folder = expand_with_home(answer, home);

    if folder.exists() {
        if !folder.is_dir() {
            return Err(SetupError::NotADirectory(folder));
        }
        write!(
            output,
            "WARNING! The folder exists. All its contents will be deleted. Continue? [y/n] "
        )?;
        output.flush()?;
        let mut confirm = String::new();
        input.read_line(&mut confirm)?;
        writeln!(output)?;
        if !confirm.trim().eq_ignore_ascii_case("y") {
            return Err(SetupError::Cancelled);
        }
    }
    Ok(folder)
}

pub fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
