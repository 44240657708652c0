pub mod connection;
pub mod process;

use crate::errors::ProcessError;
use std::path::{Path, PathBuf};
use which::which;

/// Resolves a PostgreSQL client executable.
///
/// An explicitly configured path wins; otherwise the executable is looked up
/// in `PATH`. Resolution happens per invocation so a missing tool surfaces as
/// an error of the operation that needed it.
pub fn find_executable(program: &str, configured: Option<&Path>) -> Result<PathBuf, ProcessError> {
    match configured {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(ProcessError::NotFound {
            program: program.to_string(),
            reason: format!("configured path {} does not exist", path.display()),
        }),
        None => which(program).map_err(|e| ProcessError::NotFound {
            program: program.to_string(),
            reason: format!(
                "{e}. Please ensure PostgreSQL client tools are installed and in your PATH."
            ),
        }),
    }
}

/// Writes an executable `sh` script standing in for a client tool.
#[cfg(all(test, unix))]
pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> std::io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
