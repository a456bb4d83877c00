use crate::host::RoomDirectory;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Rooms eligible for scanning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WatchedRooms {
    /// No restriction configured: every room is scanned.
    #[default]
    Unset,
    /// Configured room name -> resolved room id. An empty map means every
    /// configured name failed to resolve, and nothing is scanned.
    Restricted(HashMap<String, String>),
}

impl WatchedRooms {
    pub fn contains(&self, room_id: &str) -> bool {
        match self {
            WatchedRooms::Unset => true,
            WatchedRooms::Restricted(rooms) => rooms.values().any(|id| id == room_id),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoomFilter {
    watched: RwLock<Arc<WatchedRooms>>,
}

impl RoomFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_watched(&self, room_id: &str) -> bool {
        self.snapshot().contains(room_id)
    }

    pub fn snapshot(&self) -> Arc<WatchedRooms> {
        self.watched
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-resolves the watch list from a comma separated list of room names.
    ///
    /// Directory lookups run before the lock is taken; names that do not
    /// resolve are logged and left out.
    pub async fn rebuild(&self, csv: &str, directory: &dyn RoomDirectory) {
        self.rebuild_if(csv, directory, || true).await;
    }

    /// Like `rebuild`, but the new list is only stored if `still_current`
    /// holds once the lookups have finished. Returns whether it was stored.
    pub async fn rebuild_if<F>(
        &self,
        csv: &str,
        directory: &dyn RoomDirectory,
        still_current: F,
    ) -> bool
    where
        F: Fn() -> bool,
    {
        let watched = Self::resolve(csv, directory).await;

        let mut current = self
            .watched
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !still_current() {
            log::debug!("Discarding room list built from outdated setting '{csv}'");
            return false;
        }
        *current = Arc::new(watched);
        true
    }

    async fn resolve(csv: &str, directory: &dyn RoomDirectory) -> WatchedRooms {
        let names: Vec<String> = csv
            .trim()
            .split(',')
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        if names.is_empty() {
            log::debug!("No room restriction configured, scanning all rooms");
            WatchedRooms::Unset
        } else {
            let mut rooms = HashMap::new();
            for name in names {
                match directory.room_by_name(&name).await {
                    Some(room) => {
                        log::debug!("Watching room '{name}'");
                        rooms.insert(name, room.id);
                    }
                    None => {
                        log::warn!("Room not found for name '{name}'. Not adding to watch list.");
                    }
                }
            }
            if rooms.is_empty() {
                log::warn!("None of the configured rooms resolved; no room will be scanned");
            }
            WatchedRooms::Restricted(rooms)
        }
    }
}
