//! Local filesystem layout: uploaded blobs, per-job artifacts and the
//! worker host-inventory file.

use std::path::{Path, PathBuf};

use chrono::{Datelike, Utc};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use aurora_model::{FileKind, Server};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store an uploaded blob under `<root>/<year>/<month>/<day>/` with
    /// the kind's mode policy applied. Returns the final path.
    pub async fn save_blob(
        &self,
        name: &str,
        kind: FileKind,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let now = Utc::now();
        let dir = self
            .root
            .join(now.year().to_string())
            .join(format!("{:02}", now.month()))
            .join(format!("{:02}", now.day()));
        fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}-{name}", Uuid::new_v4()));
        fs::write(&path, bytes).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(
                &path,
                std::fs::Permissions::from_mode(kind.mode()),
            )
            .await?;
        }

        Ok(path)
    }

    fn artifacts_root(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn artifact_dir(&self, server_id: i64, ident: &str) -> PathBuf {
        self.artifacts_root()
            .join(server_id.to_string())
            .join(ident)
    }

    /// Persist a plan's combined output for later inspection by the UI.
    pub async fn write_artifact_stdout(
        &self,
        server_id: i64,
        ident: &str,
        content: &str,
    ) -> Result<PathBuf> {
        let dir = self.artifact_dir(server_id, ident);
        fs::create_dir_all(&dir).await?;
        let path = dir.join("stdout");
        fs::write(&path, content).await?;
        Ok(path)
    }

    pub async fn read_artifact_stdout(
        &self,
        server_id: i64,
        ident: &str,
    ) -> Result<String> {
        let path = self.artifact_dir(server_id, ident).join("stdout");
        Ok(fs::read_to_string(&path).await?)
    }

    /// Drop every per-job artifact directory. Swept hourly.
    pub async fn sweep_artifacts(&self) -> Result<u64> {
        let root = self.artifacts_root();
        if !root.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            fs::remove_dir_all(entry.path()).await?;
            removed += 1;
        }
        info!("Swept {removed} artifact directories");
        Ok(removed)
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.root.join("inventory").join("hosts")
    }

    /// Regenerate the host-inventory file from the active server list.
    /// Idempotent; the whole file is rewritten each time.
    pub async fn write_inventory(&self, servers: &[Server]) -> Result<()> {
        let path = self.inventory_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut content =
            String::from("### START AUTO GENERATION ###\n");
        for server in servers {
            content.push_str(&format!(
                "{}\thost={}\tport={}\tuser={}\n",
                server.name, server.host, server.port, server.user
            ));
        }
        content.push_str("### END AUTO GENERATION ###\n");

        fs::write(&path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurora_model::ServerConfig;

    fn server(name: &str, host: &str) -> Server {
        Server {
            id: 1,
            name: name.into(),
            address: host.into(),
            host: host.into(),
            port: 22,
            user: "root".into(),
            ssh_password: None,
            key_file_id: None,
            sudo_password: None,
            config: ServerConfig::default(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn blob_layout_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());

        let path = storage
            .save_blob("id_rsa", FileKind::Secret, b"key material")
            .await
            .unwrap();
        assert!(path.starts_with(dir.path()));
        // <root>/<year>/<month>/<day>/<uuid>-<name>
        assert_eq!(
            path.strip_prefix(dir.path()).unwrap().components().count(),
            4
        );
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("-id_rsa"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn inventory_lists_active_servers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());

        storage
            .write_inventory(&[
                server("hk-1", "203.0.113.7"),
                server("sg-1", "203.0.113.8"),
            ])
            .await
            .unwrap();

        let content =
            std::fs::read_to_string(storage.inventory_path()).unwrap();
        assert!(content.starts_with("### START AUTO GENERATION ###"));
        assert!(content.contains("hk-1\thost=203.0.113.7\tport=22"));
        assert!(content.contains("sg-1"));
        assert!(content.trim_end().ends_with("### END AUTO GENERATION ###"));
    }

    #[tokio::test]
    async fn artifact_round_trip_and_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());

        storage
            .write_artifact_stdout(7, "abc", "plan output")
            .await
            .unwrap();
        assert_eq!(
            storage.read_artifact_stdout(7, "abc").await.unwrap(),
            "plan output"
        );

        assert_eq!(storage.sweep_artifacts().await.unwrap(), 1);
        assert!(storage.read_artifact_stdout(7, "abc").await.is_err());
    }
}
