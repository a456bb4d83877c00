use crate::host::{Message, Notifier, Room, RoomDirectory, UploadStore, User};
use crate::pipeline::HostServices;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// A message plus the host state needed to scan it offline.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScanFixture {
    #[serde(default)]
    pub rooms: Vec<Room>,
    pub uploads_dir: PathBuf,
    pub message: Message,
}

impl ScanFixture {
    /// Relative upload directories are resolved against the fixture file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scan fixture {path}"))?;
        let mut fixture: ScanFixture = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid scan fixture {path}"))?;

        if fixture.uploads_dir.is_relative() {
            if let Some(parent) = Path::new(path).parent() {
                fixture.uploads_dir = parent.join(&fixture.uploads_dir);
            }
        }
        Ok(fixture)
    }
}

/// Host backed by a fixed room list and a directory of uploaded files.
pub struct LocalHost {
    rooms: Vec<Room>,
    uploads_dir: PathBuf,
}

impl LocalHost {
    pub fn new(rooms: Vec<Room>, uploads_dir: PathBuf) -> Self {
        LocalHost { rooms, uploads_dir }
    }

    pub fn from_fixture(fixture: &ScanFixture) -> Self {
        Self::new(fixture.rooms.clone(), fixture.uploads_dir.clone())
    }

    pub fn services(self: Arc<Self>) -> HostServices {
        HostServices {
            rooms: self.clone(),
            uploads: self.clone(),
            notifier: self,
        }
    }

    fn upload_path(&self, content_id: &str) -> Option<PathBuf> {
        let relative = Path::new(content_id);
        let confined = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        confined.then(|| self.uploads_dir.join(relative))
    }
}

#[async_trait]
impl RoomDirectory for LocalHost {
    async fn room_by_name(&self, name: &str) -> Option<Room> {
        self.rooms
            .iter()
            .find(|room| room.name.eq_ignore_ascii_case(name))
            .cloned()
    }
}

#[async_trait]
impl UploadStore for LocalHost {
    async fn buffer_by_id(&self, content_id: &str) -> Option<Vec<u8>> {
        let Some(path) = self.upload_path(content_id) else {
            log::warn!("Refusing upload id outside the upload directory: {content_id}");
            return None;
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::debug!("Upload {} not readable: {e}", path.display());
                None
            }
        }
    }
}

#[async_trait]
impl Notifier for LocalHost {
    async fn notify_user(&self, room: &Room, user: &User, text: &str) -> anyhow::Result<()> {
        log::info!("Notice to {} in #{}: {}", user.username, room.name, text);
        Ok(())
    }
}
