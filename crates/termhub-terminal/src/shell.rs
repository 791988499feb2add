//! Platform shell selection.

use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Shells tried on Unix when `$SHELL` is unset or unusable
pub const UNIX_FALLBACK_SHELLS: &[&str] = &["/bin/bash", "/bin/sh"];

/// Pick the interactive shell for this platform.
///
/// Windows prefers PowerShell, then `cmd.exe`, and finally hands the bare
/// `cmd.exe` name to the OS loader. Unix honours `$SHELL` when it names an
/// existing executable, then walks [`UNIX_FALLBACK_SHELLS`], then returns
/// `/bin/sh`. Never fails.
pub fn resolve_shell() -> PathBuf {
    let path_var = env::var_os("PATH");

    if cfg!(windows) {
        resolve_windows_shell(path_var.as_deref())
    } else {
        let shell_var = env::var_os("SHELL");
        resolve_unix_shell(shell_var.as_deref(), path_var.as_deref(), UNIX_FALLBACK_SHELLS)
    }
}

fn resolve_windows_shell(path_var: Option<&OsStr>) -> PathBuf {
    ["powershell.exe", "cmd.exe"]
        .iter()
        .find_map(|name| find_executable(name, path_var))
        .unwrap_or_else(|| PathBuf::from("cmd.exe"))
}

fn resolve_unix_shell(
    shell_var: Option<&OsStr>,
    path_var: Option<&OsStr>,
    fallbacks: &[&str],
) -> PathBuf {
    if let Some(shell) = shell_var.filter(|s| !s.is_empty()) {
        if let Some(found) = find_executable(shell, path_var) {
            return found;
        }
    }

    fallbacks
        .iter()
        .map(Path::new)
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/bin/sh"))
}

/// Locate `name` the way a shell would: as given when it contains a path
/// separator, otherwise by searching `PATH`.
pub fn find_executable(name: impl AsRef<OsStr>, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let name = Path::new(name.as_ref());

    if name.components().count() > 1 || name.is_absolute() {
        return is_executable(name).then(|| name.to_path_buf());
    }

    env::split_paths(path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
