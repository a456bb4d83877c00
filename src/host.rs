//! Host messaging platform model
//!
//! The chat platform owns rooms, users, messages and uploads. This module
//! describes the slice of that model the scanner observes, plus the
//! capabilities it borrows from the host while a hook runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Attachment {
    pub image_url: Option<String>,
    pub image_type: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Message {
    pub id: String,
    pub sender: User,
    pub room: Room,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Pending edits to a message that has not been delivered yet.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn set_room(&mut self, room: Room) -> &mut Self {
        self.message.room = room;
        self
    }

    /// Removes the attachment at `index`; out-of-range indexes are ignored.
    pub fn remove_attachment(&mut self, index: usize) -> &mut Self {
        if index < self.message.attachments.len() {
            self.message.attachments.remove(index);
        }
        self
    }

    pub fn get_message(&self) -> Message {
        self.message.clone()
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn room_by_name(&self, name: &str) -> Option<Room>;
}

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn buffer_by_id(&self, content_id: &str) -> Option<Vec<u8>>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a message visible only to `user` inside `room`.
    async fn notify_user(&self, room: &Room, user: &User, text: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_two_attachments() -> Message {
        Message {
            id: "m1".to_string(),
            sender: User {
                id: "u1".to_string(),
                username: "alice".to_string(),
            },
            room: Room {
                id: "r1".to_string(),
                name: "general".to_string(),
            },
            text: None,
            attachments: vec![
                Attachment {
                    image_url: Some("/file-upload/a/one.png".to_string()),
                    image_type: Some("image/png".to_string()),
                    title: Some("one.png".to_string()),
                },
                Attachment {
                    image_url: Some("/file-upload/b/two.png".to_string()),
                    image_type: Some("image/png".to_string()),
                    title: Some("two.png".to_string()),
                },
            ],
            created_at: None,
        }
    }

    #[test]
    fn test_builder_removes_first_attachment_only() {
        let mut builder = MessageBuilder::new(message_with_two_attachments());
        builder.remove_attachment(0);

        let message = builder.get_message();
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].title.as_deref(), Some("two.png"));
    }

    #[test]
    fn test_builder_ignores_out_of_range_removal() {
        let original = message_with_two_attachments();
        let mut builder = MessageBuilder::new(original.clone());
        builder.remove_attachment(7);
        assert_eq!(builder.into_message(), original);
    }

    #[test]
    fn test_builder_reassigns_room() {
        let mut builder = MessageBuilder::new(message_with_two_attachments());
        builder.set_room(Room {
            id: "q".to_string(),
            name: "csem-quarantine".to_string(),
        });

        let message = builder.get_message();
        assert_eq!(message.room.id, "q");
        assert_eq!(message.attachments.len(), 2);
    }

    #[test]
    fn test_message_deserializes_without_optional_fields() {
        let yaml = r#"
id: m9
sender: { id: u9, username: bob }
room: { id: r9, name: random }
"#;
        let message: Message = serde_yaml::from_str(yaml).unwrap();
        assert!(message.attachments.is_empty());
        assert!(message.created_at.is_none());
    }
}
