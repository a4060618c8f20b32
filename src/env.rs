//! Environment variable names and workspace path helpers, centralized so the
//! rest of the crate never hardcodes an `AGENTBOX_*` string outside here.

use std::path::{Path, PathBuf};

pub const ENV_ENCRYPTION_KEY: &str = "AGENTBOX_ENCRYPTION_KEY";
pub const ENV_CONTAINER_SOCKET: &str = "AGENTBOX_CONTAINER_SOCKET";
pub const ENV_UPLOAD_DIR: &str = "AGENTBOX_UPLOAD_DIR";
pub const ENV_WORKSPACE_DIR: &str = "AGENTBOX_WORKSPACE_DIR";
pub const ENV_BIND_ADDR: &str = "AGENTBOX_BIND_ADDR";

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8085";
pub const DEFAULT_WORKSPACE_DIR_NAME: &str = ".agentbox/workspaces";
pub const DEFAULT_UPLOAD_DIR_NAME: &str = ".agentbox/uploads";

/// Per-Session host-side workspace directory: the staging area that gets
/// copied into the container at creation time via `ContainerDriver::copy_to`.
pub fn session_workspace_path(workspace_root: &Path, session_id: &str) -> PathBuf {
    workspace_root.join(session_id)
}

/// Directory client-uploaded files land in before being copied into a
/// Session's container.
pub fn upload_path(upload_root: &Path, session_id: &str, file_name: &str) -> PathBuf {
    upload_root.join(session_id).join(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_workspace_path_nests_under_root() {
        let root = Path::new("/var/lib/agentbox/workspaces");
        assert_eq!(
            session_workspace_path(root, "sess-1"),
            Path::new("/var/lib/agentbox/workspaces/sess-1")
        );
    }

    #[test]
    fn upload_path_nests_session_then_file() {
        let root = Path::new("/var/lib/agentbox/uploads");
        assert_eq!(
            upload_path(root, "sess-1", "notes.txt"),
            Path::new("/var/lib/agentbox/uploads/sess-1/notes.txt")
        );
    }
}
