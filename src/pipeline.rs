//! Message interception pipeline
//!
//! Runs a message through room filtering, attachment classification and
//! remote matching, then applies the quarantine action for the configured
//! delivery mode and files a violation report when enabled.
//!
//! Every failure on the scanning path degrades to delivering the message
//! unscanned. A message is never dropped by this module.

use crate::attachment_classifier::AttachmentClassifier;
use crate::config::{ConfigError, PipelineConfig, SettingsStore, SETTING_LIMIT_ANALYSIS_TO_ROOMS};
use crate::host::{Message, MessageBuilder, Notifier, Room, RoomDirectory, UploadStore};
use crate::match_client::{MatchClient, MatchService, MatchVerdict};
use crate::report_client::{ReportClient, ReportOutcome, ReportService};
use crate::room_filter::RoomFilter;
use crate::statistics::{StatEvent, StatisticsCollector};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Scan before the message is persisted; matches are quarantined.
    PreSendGate,
    /// Scan after delivery; matches are answered with a private notice to
    /// the sender. Nothing can be quarantined in this mode.
    PostSendNotify,
}

impl DeliveryMode {
    pub fn from_config(config: &PipelineConfig) -> Self {
        if config.asynchronous_validation {
            DeliveryMode::PostSendNotify
        } else {
            DeliveryMode::PreSendGate
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RoomNotWatched,
    NoImage,
    UnsupportedImage,
    /// The delivery mode changed between a hook's check and its execution.
    DeliveryModeChanged,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RoomNotWatched => "room_not_watched",
            SkipReason::NoImage => "no_image",
            SkipReason::UnsupportedImage => "unsupported_image",
            SkipReason::DeliveryModeChanged => "delivery_mode_changed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ScanState {
    Ineligible(SkipReason),
    /// No verdict, a failed scan, or a verdict without a match.
    Unmatched,
    Matched(Box<MatchVerdict>),
}

impl ScanState {
    pub fn is_match(&self) -> bool {
        matches!(self, ScanState::Matched(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineAction {
    /// Nothing matched.
    None,
    Redirected(Room),
    AttachmentRemoved,
    /// Matched but no quarantine room is configured.
    Untouched,
    SenderNotified,
    NotificationFailed,
}

impl QuarantineAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineAction::None => "none",
            QuarantineAction::Redirected(_) => "redirected",
            QuarantineAction::AttachmentRemoved => "attachment_removed",
            QuarantineAction::Untouched => "untouched",
            QuarantineAction::SenderNotified => "sender_notified",
            QuarantineAction::NotificationFailed => "notification_failed",
        }
    }
}

/// Final state of one pipeline run.
#[derive(Debug, Clone)]
pub struct Disposition {
    pub message: Message,
    pub state: ScanState,
    pub action: QuarantineAction,
    pub report: Option<ReportOutcome>,
}

/// Capabilities borrowed from the host platform.
#[derive(Clone)]
pub struct HostServices {
    pub rooms: Arc<dyn RoomDirectory>,
    pub uploads: Arc<dyn UploadStore>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct InterceptionPipeline {
    settings: SettingsStore,
    room_filter: RoomFilter,
    host: HostServices,
    matcher: Arc<dyn MatchService>,
    reporter: Arc<dyn ReportService>,
    statistics: Option<Arc<StatisticsCollector>>,
}

impl InterceptionPipeline {
    pub fn new(
        config: PipelineConfig,
        host: HostServices,
        matcher: Arc<dyn MatchService>,
        reporter: Arc<dyn ReportService>,
    ) -> Self {
        InterceptionPipeline {
            settings: SettingsStore::new(config),
            room_filter: RoomFilter::new(),
            host,
            matcher,
            reporter,
            statistics: None,
        }
    }

    /// Pipeline backed by the HTTP matching and reporting clients.
    pub fn with_http_clients(config: PipelineConfig, host: HostServices) -> Self {
        let timeout = Duration::from_secs(config.request_timeout_seconds.max(1));
        Self::new(
            config,
            host,
            Arc::new(MatchClient::new(timeout)),
            Arc::new(ReportClient::new(timeout)),
        )
    }

    pub fn with_statistics(mut self, collector: Arc<StatisticsCollector>) -> Self {
        self.statistics = Some(collector);
        self
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn room_filter(&self) -> &RoomFilter {
        &self.room_filter
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::from_config(&self.settings.snapshot())
    }

    /// Builds the watch list from the loaded configuration.
    pub async fn on_enable(&self) {
        let config = self.settings.snapshot();
        self.rebuild_room_filter(&config.limit_analysis_to_rooms_csv)
            .await;
        log::info!(
            "Image scanning enabled in {:?} mode",
            DeliveryMode::from_config(&config)
        );
    }

    pub async fn on_setting_updated(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.settings.apply_setting(key, value)?;
        if key == SETTING_LIMIT_ANALYSIS_TO_ROOMS {
            let config = self.settings.snapshot();
            self.rebuild_room_filter(&config.limit_analysis_to_rooms_csv)
                .await;
        }
        Ok(())
    }

    // Overlapping updates may finish their lookups out of order; only a
    // list built from the CSV that is still configured gets stored.
    async fn rebuild_room_filter(&self, csv: &str) {
        self.room_filter
            .rebuild_if(csv, self.host.rooms.as_ref(), || {
                self.settings.snapshot().limit_analysis_to_rooms_csv == csv
            })
            .await;
    }

    /// Cheap gate run before `execute_pre_message_sent_modify`.
    pub fn check_pre_message_sent_modify(&self, message: &Message) -> bool {
        self.delivery_mode() == DeliveryMode::PreSendGate && self.should_scan(message)
    }

    pub async fn execute_pre_message_sent_modify(
        &self,
        message: &Message,
        mut builder: MessageBuilder,
    ) -> Message {
        let config = self.settings.snapshot();
        if DeliveryMode::from_config(&config) != DeliveryMode::PreSendGate {
            self.skip(message, SkipReason::DeliveryModeChanged);
            return builder.into_message();
        }
        self.run(&config, message, DeliveryMode::PreSendGate, &mut builder)
            .await;
        builder.into_message()
    }

    pub fn check_post_message_sent(&self, message: &Message) -> bool {
        self.delivery_mode() == DeliveryMode::PostSendNotify && self.should_scan(message)
    }

    pub async fn execute_post_message_sent(&self, message: &Message) -> Disposition {
        let config = self.settings.snapshot();
        if DeliveryMode::from_config(&config) != DeliveryMode::PostSendNotify {
            let (state, action, report) = self.skip(message, SkipReason::DeliveryModeChanged);
            return Disposition {
                message: message.clone(),
                state,
                action,
                report,
            };
        }
        self.process_with(&config, message, DeliveryMode::PostSendNotify)
            .await
    }

    /// Runs the whole state machine for one message in the given mode.
    pub async fn process(&self, message: &Message, mode: DeliveryMode) -> Disposition {
        let config = self.settings.snapshot();
        self.process_with(&config, message, mode).await
    }

    async fn process_with(
        &self,
        config: &PipelineConfig,
        message: &Message,
        mode: DeliveryMode,
    ) -> Disposition {
        let mut builder = MessageBuilder::new(message.clone());
        let (state, action, report) = self.run(config, message, mode, &mut builder).await;
        Disposition {
            message: builder.into_message(),
            state,
            action,
            report,
        }
    }

    fn should_scan(&self, message: &Message) -> bool {
        AttachmentClassifier::is_eligible(message) && self.room_filter.is_watched(&message.room.id)
    }

    async fn run(
        &self,
        config: &PipelineConfig,
        message: &Message,
        mode: DeliveryMode,
        builder: &mut MessageBuilder,
    ) -> (ScanState, QuarantineAction, Option<ReportOutcome>) {
        self.record(StatEvent::MessageSeen);

        if !self.room_filter.is_watched(&message.room.id) {
            return self.skip(message, SkipReason::RoomNotWatched);
        }
        let Some(image) = AttachmentClassifier::classify(message) else {
            let reason = if AttachmentClassifier::is_eligible(message) {
                SkipReason::UnsupportedImage
            } else {
                SkipReason::NoImage
            };
            return self.skip(message, reason);
        };

        self.record(StatEvent::Scanned);
        let verdict = match self
            .matcher
            .match_image(config, &image, self.host.uploads.as_ref())
            .await
        {
            Ok(Some(verdict)) if verdict.is_match() => verdict,
            Ok(_) => {
                log::debug!("No match for message {}", message.id);
                return (ScanState::Unmatched, QuarantineAction::None, None);
            }
            Err(e) => {
                log::warn!(
                    "Match operation failed for message {}, delivering unscanned: {e}",
                    message.id
                );
                return (ScanState::Unmatched, QuarantineAction::None, None);
            }
        };

        log::warn!(
            "CSEM-MATCH message={} sender={} room={} tracking_id={} report={}",
            message.id,
            message.sender.username,
            message.room.id,
            verdict.tracking_id,
            config.enable_automated_report
        );

        let action = match mode {
            DeliveryMode::PreSendGate => self.quarantine(config, builder).await,
            DeliveryMode::PostSendNotify => self.notify_sender(message, &verdict).await,
        };
        self.record(StatEvent::Matched {
            action: action.as_str().to_string(),
        });

        let report = if !config.enable_automated_report {
            None
        } else if config.reporting_credentials().is_none() {
            log::warn!(
                "Automated reporting is enabled but credentials are incomplete, no report for message {}",
                message.id
            );
            None
        } else {
            let outcome = self.reporter.report(config, &verdict, message).await;
            log::warn!("Violation-Report-Result {:?}", outcome);
            self.record(if outcome.is_some() {
                StatEvent::ReportSubmitted
            } else {
                StatEvent::ReportFailed
            });
            outcome
        };

        (ScanState::Matched(Box::new(verdict)), action, report)
    }

    async fn quarantine(
        &self,
        config: &PipelineConfig,
        builder: &mut MessageBuilder,
    ) -> QuarantineAction {
        let Some(room_name) = config.quarantine_target_room() else {
            log::warn!("No target room for quarantined messages provided");
            return QuarantineAction::Untouched;
        };

        match self.host.rooms.room_by_name(room_name).await {
            Some(room) => {
                // The sender is not told about the redirect.
                builder.set_room(room.clone());
                QuarantineAction::Redirected(room)
            }
            None => {
                log::warn!("Defined target room does not exist: {room_name}");
                builder.remove_attachment(0);
                QuarantineAction::AttachmentRemoved
            }
        }
    }

    async fn notify_sender(&self, message: &Message, verdict: &MatchVerdict) -> QuarantineAction {
        let text = format!(
            "Your image in #{} was flagged by content scanning (match: {}, tracking id: {}).",
            message.room.name,
            verdict.is_match(),
            verdict.tracking_id
        );

        match self
            .host
            .notifier
            .notify_user(&message.room, &message.sender, &text)
            .await
        {
            Ok(()) => QuarantineAction::SenderNotified,
            Err(e) => {
                log::error!(
                    "Failed to notify {} about message {}: {e}",
                    message.sender.username,
                    message.id
                );
                QuarantineAction::NotificationFailed
            }
        }
    }

    fn skip(
        &self,
        message: &Message,
        reason: SkipReason,
    ) -> (ScanState, QuarantineAction, Option<ReportOutcome>) {
        log::debug!("Skipping message {}: {}", message.id, reason.as_str());
        self.record(StatEvent::Skipped {
            reason: reason.as_str().to_string(),
        });
        (ScanState::Ineligible(reason), QuarantineAction::None, None)
    }

    fn record(&self, event: StatEvent) {
        if let Some(statistics) = &self.statistics {
            statistics.record_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment_classifier::ImageRef;
    use crate::config::{SETTING_ASYNCHRONOUS_VALIDATION, SETTING_ENABLE_AUTOMATED_REPORT};
    use crate::host::{Attachment, User};
    use crate::match_client::{ImagePayload, MatchError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Rooms(Vec<Room>);

    #[async_trait]
    impl RoomDirectory for Rooms {
        async fn room_by_name(&self, name: &str) -> Option<Room> {
            self.0.iter().find(|r| r.name == name).cloned()
        }
    }

    struct Uploads;

    #[async_trait]
    impl UploadStore for Uploads {
        async fn buffer_by_id(&self, _content_id: &str) -> Option<Vec<u8>> {
            Some(b"IMG".to_vec())
        }
    }

    #[derive(Default)]
    struct Notices(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl Notifier for Notices {
        async fn notify_user(&self, _room: &Room, user: &User, text: &str) -> anyhow::Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((user.username.clone(), text.to_string()));
            Ok(())
        }
    }

    enum Answer {
        Match,
        NoMatch,
        NoVerdict,
        Fail,
    }

    struct FakeMatcher {
        answer: Answer,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MatchService for FakeMatcher {
        async fn match_image(
            &self,
            _config: &PipelineConfig,
            image: &ImageRef,
            _uploads: &dyn UploadStore,
        ) -> Result<Option<MatchVerdict>, MatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let verdict = |is_match| MatchVerdict {
                tracking_id: "track-1".to_string(),
                is_match,
                image_payload: Some(ImagePayload {
                    content_type: image.mime_type.clone(),
                    filename: image.filename.clone(),
                    bytes: b"IMG".to_vec(),
                }),
                ..Default::default()
            };
            match self.answer {
                Answer::Match => Ok(Some(verdict(Some(true)))),
                Answer::NoMatch => Ok(Some(verdict(Some(false)))),
                Answer::NoVerdict => Ok(None),
                Answer::Fail => Err(MatchError::Status(503)),
            }
        }
    }

    #[derive(Default)]
    struct FakeReporter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReportService for FakeReporter {
        async fn report(
            &self,
            _config: &PipelineConfig,
            verdict: &MatchVerdict,
            _message: &Message,
        ) -> Option<ReportOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(verdict.image_payload.is_some());
            Some(ReportOutcome {
                status: 200,
                body: serde_json::json!({ "ok": true }),
            })
        }
    }

    struct Harness {
        pipeline: InterceptionPipeline,
        matcher: Arc<FakeMatcher>,
        reporter: Arc<FakeReporter>,
        notices: Arc<Notices>,
    }

    fn room(id: &str, name: &str) -> Room {
        Room {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn directory() -> Rooms {
        Rooms(vec![
            room("r-general", "general"),
            room("r-random", "random"),
            room("r-jail", "csem-quarantine"),
        ])
    }

    fn with_reporting(mut config: PipelineConfig) -> PipelineConfig {
        config.api_key = Some("key".to_string());
        config.ncmec.user = Some("reporter".to_string());
        config.ncmec.password = Some("hunter2".to_string());
        config
    }

    fn harness(config: PipelineConfig, answer: Answer) -> Harness {
        harness_with_rooms(config, answer, Arc::new(directory()))
    }

    fn harness_with_rooms(
        config: PipelineConfig,
        answer: Answer,
        rooms: Arc<dyn RoomDirectory>,
    ) -> Harness {
        let matcher = Arc::new(FakeMatcher {
            answer,
            calls: AtomicUsize::new(0),
        });
        let reporter = Arc::new(FakeReporter::default());
        let notices = Arc::new(Notices::default());
        let host = HostServices {
            rooms,
            uploads: Arc::new(Uploads),
            notifier: notices.clone(),
        };
        let pipeline = InterceptionPipeline::new(config, host, matcher.clone(), reporter.clone());
        Harness {
            pipeline,
            matcher,
            reporter,
            notices,
        }
    }

    fn image_message() -> Message {
        Message {
            id: "m1".to_string(),
            sender: User {
                id: "u1".to_string(),
                username: "mallory".to_string(),
            },
            room: room("r-general", "general"),
            text: None,
            attachments: vec![
                Attachment {
                    image_url: Some("/file-upload/abc123/name.png".to_string()),
                    image_type: Some("image/png".to_string()),
                    title: None,
                },
                Attachment {
                    image_url: None,
                    image_type: None,
                    title: Some("caption".to_string()),
                },
            ],
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_message_without_attachments_passes_through() {
        let h = harness(PipelineConfig::default(), Answer::Match);
        let mut message = image_message();
        message.attachments.clear();

        assert!(!h.pipeline.check_pre_message_sent_modify(&message));
        let disposition = h.pipeline.process(&message, DeliveryMode::PreSendGate).await;

        assert_eq!(disposition.message, message);
        assert!(matches!(
            disposition.state,
            ScanState::Ineligible(SkipReason::NoImage)
        ));
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_image_first_attachment_passes_through() {
        let h = harness(PipelineConfig::default(), Answer::Match);
        let mut message = image_message();
        message.attachments.reverse();

        let disposition = h.pipeline.process(&message, DeliveryMode::PreSendGate).await;

        assert_eq!(disposition.message, message);
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsupported_type_is_skipped() {
        let h = harness(PipelineConfig::default(), Answer::Match);
        let mut message = image_message();
        message.attachments[0].image_type = Some("image/webp".to_string());

        let disposition = h.pipeline.process(&message, DeliveryMode::PreSendGate).await;

        assert!(matches!(
            disposition.state,
            ScanState::Ineligible(SkipReason::UnsupportedImage)
        ));
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unwatched_room_is_not_scanned() {
        let config = PipelineConfig {
            limit_analysis_to_rooms_csv: "random".to_string(),
            ..Default::default()
        };
        let h = harness(config, Answer::Match);
        h.pipeline.on_enable().await;

        let message = image_message();
        assert!(!h.pipeline.check_pre_message_sent_modify(&message));

        let disposition = h.pipeline.process(&message, DeliveryMode::PreSendGate).await;
        assert!(matches!(
            disposition.state,
            ScanState::Ineligible(SkipReason::RoomNotWatched)
        ));
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_match_redirects_to_quarantine_room() {
        let h = harness(PipelineConfig::default(), Answer::Match);
        let message = image_message();

        assert!(h.pipeline.check_pre_message_sent_modify(&message));
        let delivered = h
            .pipeline
            .execute_pre_message_sent_modify(&message, MessageBuilder::new(message.clone()))
            .await;

        assert_eq!(delivered.room.id, "r-jail");
        assert_eq!(delivered.attachments, message.attachments);
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 1);
        // reporting is off by default
        assert_eq!(h.reporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_match_without_resolvable_room_strips_attachment() {
        let config = PipelineConfig {
            quarantine_target_room: Some("does-not-exist".to_string()),
            ..Default::default()
        };
        let h = harness(config, Answer::Match);
        let message = image_message();

        let disposition = h.pipeline.process(&message, DeliveryMode::PreSendGate).await;

        assert_eq!(disposition.action, QuarantineAction::AttachmentRemoved);
        assert_eq!(disposition.message.room, message.room);
        assert_eq!(disposition.message.attachments.len(), 1);
        assert_eq!(
            disposition.message.attachments[0].title.as_deref(),
            Some("caption")
        );
    }

    #[tokio::test]
    async fn test_match_without_quarantine_setting_leaves_message() {
        let config = PipelineConfig {
            quarantine_target_room: None,
            ..Default::default()
        };
        let h = harness(config, Answer::Match);
        let message = image_message();

        let disposition = h.pipeline.process(&message, DeliveryMode::PreSendGate).await;

        assert!(disposition.state.is_match());
        assert_eq!(disposition.action, QuarantineAction::Untouched);
        assert_eq!(disposition.message, message);
    }

    #[tokio::test]
    async fn test_non_matching_outcomes_are_no_ops() {
        for answer in [Answer::NoMatch, Answer::NoVerdict, Answer::Fail] {
            let config = PipelineConfig {
                enable_automated_report: true,
                ..Default::default()
            };
            let h = harness(config, answer);
            let message = image_message();

            let disposition = h.pipeline.process(&message, DeliveryMode::PreSendGate).await;

            assert_eq!(disposition.message, message);
            assert!(matches!(disposition.state, ScanState::Unmatched));
            assert_eq!(disposition.action, QuarantineAction::None);
            assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 1);
            assert_eq!(h.reporter.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_report_only_when_enabled_and_matched() {
        let h = harness(with_reporting(PipelineConfig::default()), Answer::Match);
        let message = image_message();

        h.pipeline.process(&message, DeliveryMode::PreSendGate).await;
        assert_eq!(h.reporter.calls.load(Ordering::SeqCst), 0);

        h.pipeline
            .on_setting_updated(SETTING_ENABLE_AUTOMATED_REPORT, "true")
            .await
            .unwrap();
        let disposition = h.pipeline.process(&message, DeliveryMode::PreSendGate).await;

        assert_eq!(h.reporter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(disposition.report.map(|r| r.status), Some(200));
    }

    #[tokio::test]
    async fn test_report_skipped_without_credentials() {
        let config = PipelineConfig {
            enable_automated_report: true,
            ..Default::default()
        };
        let h = harness(config, Answer::Match);

        let disposition = h
            .pipeline
            .process(&image_message(), DeliveryMode::PreSendGate)
            .await;

        assert!(disposition.state.is_match());
        assert!(matches!(disposition.action, QuarantineAction::Redirected(_)));
        assert!(disposition.report.is_none());
        assert_eq!(h.reporter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_async_mode_notifies_without_modifying() {
        let config = with_reporting(PipelineConfig {
            asynchronous_validation: true,
            enable_automated_report: true,
            ..Default::default()
        });
        let h = harness(config, Answer::Match);
        let message = image_message();

        assert!(!h.pipeline.check_pre_message_sent_modify(&message));
        assert!(h.pipeline.check_post_message_sent(&message));

        let disposition = h.pipeline.execute_post_message_sent(&message).await;

        assert_eq!(disposition.message, message);
        assert_eq!(disposition.action, QuarantineAction::SenderNotified);
        assert_eq!(h.reporter.calls.load(Ordering::SeqCst), 1);

        let notices = h.notices.0.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "mallory");
        assert!(notices[0].1.contains("match: true"));
    }

    #[tokio::test]
    async fn test_async_mode_without_match_sends_nothing() {
        let config = PipelineConfig {
            asynchronous_validation: true,
            ..Default::default()
        };
        let h = harness(config, Answer::NoMatch);

        let disposition = h.pipeline.execute_post_message_sent(&image_message()).await;

        assert_eq!(disposition.action, QuarantineAction::None);
        assert!(h.notices.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exactly_one_mode_claims_a_message() {
        let h = harness(PipelineConfig::default(), Answer::Match);
        let message = image_message();

        assert!(h.pipeline.check_pre_message_sent_modify(&message));
        assert!(!h.pipeline.check_post_message_sent(&message));

        h.pipeline
            .on_setting_updated(SETTING_ASYNCHRONOUS_VALIDATION, "true")
            .await
            .unwrap();

        assert!(!h.pipeline.check_pre_message_sent_modify(&message));
        assert!(h.pipeline.check_post_message_sent(&message));
    }

    #[tokio::test]
    async fn test_mode_switch_after_pre_send_check_scans_once() {
        let config = with_reporting(PipelineConfig {
            enable_automated_report: true,
            ..Default::default()
        });
        let h = harness(config, Answer::Match);
        let message = image_message();

        assert!(h.pipeline.check_pre_message_sent_modify(&message));
        h.pipeline
            .on_setting_updated(SETTING_ASYNCHRONOUS_VALIDATION, "true")
            .await
            .unwrap();

        let delivered = h
            .pipeline
            .execute_pre_message_sent_modify(&message, MessageBuilder::new(message.clone()))
            .await;
        assert_eq!(delivered, message);
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);

        assert!(h.pipeline.check_post_message_sent(&delivered));
        let disposition = h.pipeline.execute_post_message_sent(&delivered).await;

        assert_eq!(disposition.action, QuarantineAction::SenderNotified);
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.reporter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mode_switch_after_post_send_check_skips() {
        let config = PipelineConfig {
            asynchronous_validation: true,
            ..Default::default()
        };
        let h = harness(config, Answer::Match);
        let message = image_message();

        assert!(h.pipeline.check_post_message_sent(&message));
        h.pipeline
            .on_setting_updated(SETTING_ASYNCHRONOUS_VALIDATION, "false")
            .await
            .unwrap();

        let disposition = h.pipeline.execute_post_message_sent(&message).await;

        assert!(matches!(
            disposition.state,
            ScanState::Ineligible(SkipReason::DeliveryModeChanged)
        ));
        assert_eq!(disposition.action, QuarantineAction::None);
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);
        assert!(h.notices.0.lock().unwrap().is_empty());
    }

    struct GatedRooms {
        inner: Rooms,
        gated: &'static str,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl RoomDirectory for GatedRooms {
        async fn room_by_name(&self, name: &str) -> Option<Room> {
            if name == self.gated {
                self.gate.notified().await;
            }
            self.inner.room_by_name(name).await
        }
    }

    #[tokio::test]
    async fn test_overlapping_room_updates_keep_latest() {
        let rooms = Arc::new(GatedRooms {
            inner: directory(),
            gated: "general",
            gate: tokio::sync::Notify::new(),
        });
        let h = harness_with_rooms(PipelineConfig::default(), Answer::Match, rooms.clone());

        // "general" resolves only after the later "random" update has finished
        let slow = h
            .pipeline
            .on_setting_updated(SETTING_LIMIT_ANALYSIS_TO_ROOMS, "general");
        let fast = async {
            h.pipeline
                .on_setting_updated(SETTING_LIMIT_ANALYSIS_TO_ROOMS, "random")
                .await
                .unwrap();
            rooms.gate.notify_one();
        };
        let (slow, ()) = tokio::join!(slow, fast);
        slow.unwrap();

        assert_eq!(
            h.pipeline.settings().snapshot().limit_analysis_to_rooms_csv,
            "random"
        );
        assert!(h.pipeline.room_filter().is_watched("r-random"));
        assert!(!h.pipeline.room_filter().is_watched("r-general"));
    }

    #[tokio::test]
    async fn test_room_setting_update_rebuilds_filter() {
        let h = harness(PipelineConfig::default(), Answer::Match);
        h.pipeline.on_enable().await;
        let message = image_message();
        assert!(h.pipeline.check_pre_message_sent_modify(&message));

        h.pipeline
            .on_setting_updated(SETTING_LIMIT_ANALYSIS_TO_ROOMS, "random")
            .await
            .unwrap();
        assert!(!h.pipeline.check_pre_message_sent_modify(&message));

        // every name unresolved: nothing is watched
        h.pipeline
            .on_setting_updated(SETTING_LIMIT_ANALYSIS_TO_ROOMS, "nope")
            .await
            .unwrap();
        assert!(!h.pipeline.room_filter().is_watched("r-random"));

        h.pipeline
            .on_setting_updated(SETTING_LIMIT_ANALYSIS_TO_ROOMS, "")
            .await
            .unwrap();
        assert!(h.pipeline.check_pre_message_sent_modify(&message));
    }

    #[tokio::test]
    async fn test_invalid_setting_is_rejected() {
        let h = harness(PipelineConfig::default(), Answer::Match);
        let result = h.pipeline.on_setting_updated("no-such-setting", "1").await;
        assert!(matches!(result, Err(ConfigError::UnknownSetting(_))));
    }
}
