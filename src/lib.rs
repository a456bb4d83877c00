pub mod attachment_classifier;
pub mod config;
pub mod host;
pub mod local_host;
pub mod match_client;
pub mod pipeline;
pub mod report_client;
pub mod room_filter;
pub mod statistics;

pub use attachment_classifier::{AttachmentClassifier, ImageRef};
pub use config::{PipelineConfig, SettingsStore};
pub use host::{Attachment, Message, MessageBuilder, Room, User};
pub use match_client::{MatchClient, MatchService, MatchVerdict};
pub use pipeline::{DeliveryMode, Disposition, HostServices, InterceptionPipeline};
pub use report_client::{ReportClient, ReportService};
pub use room_filter::RoomFilter;
pub use statistics::{StatEvent, StatisticsCollector};
