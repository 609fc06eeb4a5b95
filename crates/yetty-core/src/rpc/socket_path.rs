//! Socket path resolution for the per-terminal RPC endpoint.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Environment variable exported into every spawned child so tooling can
/// find this terminal's socket.
pub const SOCKET_ENV_VAR: &str = "YETTY_SOCKET";

/// Compute the socket path for a terminal instance and create its parent
/// directory (mode 0700):
/// `<$XDG_RUNTIME_DIR | /tmp/yetty-<uid>>/yetty/yetty-<pid>.sock`.
pub fn socket_path_for_pid(pid: u32) -> Result<PathBuf> {
    let base = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/yetty-{uid}"))
        }
    };
    let dir = base.join("yetty");
    create_private_dir(&dir)?;
    Ok(dir.join(format!("yetty-{pid}.sock")))
}

/// Export the socket path as `$YETTY_SOCKET` so spawned children (shells,
/// commands) can discover this terminal's endpoint.
pub fn export_socket_path(path: &std::path::Path) {
    std::env::set_var(SOCKET_ENV_VAR, path);
}

/// Resolve the socket path exported by the hosting terminal, for clients.
pub fn socket_path_from_env() -> Result<PathBuf> {
    std::env::var_os(SOCKET_ENV_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| Error::NotFound(format!("{SOCKET_ENV_VAR} is not set")))
}

fn create_private_dir(dir: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    match std::fs::DirBuilder::new().recursive(true).mode(0o700).create(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(Error::Os(err)),
    }
    // Tighten a pre-existing directory; the socket inside must stay private.
    let mut perms = std::fs::metadata(dir)?.permissions();
    if perms.mode() & 0o777 != 0o700 {
        perms.set_mode(0o700);
        std::fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn path_ends_with_pid_socket() {
        let path = socket_path_for_pid(4242).unwrap();
        assert!(path.to_string_lossy().ends_with("yetty/yetty-4242.sock"));

        let dir = path.parent().unwrap();
        let mode = std::fs::metadata(dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
