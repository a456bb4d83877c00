use crate::host::{Attachment, Message};
use url::Url;

/// Image encodings the matching service accepts.
pub const SUPPORTED_IMAGE_TYPES: [&str; 5] = [
    "image/gif",
    "image/jpeg",
    "image/png",
    "image/bmp",
    "image/tiff",
];

/// Path segment under which the host serves uploaded files.
const UPLOAD_NAMESPACE: &str = "file-upload";

/// Canonical reference to an uploaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub mime_type: String,
    pub filename: Option<String>,
    pub content_id: String,
}

pub struct AttachmentClassifier;

impl AttachmentClassifier {
    /// Cheap pre-check: the first attachment carries an image URL.
    ///
    /// Only the first attachment is ever looked at.
    pub fn is_eligible(message: &Message) -> bool {
        Self::first_image(message).is_some()
    }

    pub fn classify(message: &Message) -> Option<ImageRef> {
        let (attachment, image_url) = Self::first_image(message)?;

        let mime_type = attachment
            .image_type
            .as_deref()
            .map(normalize_mime_type)
            .unwrap_or_default();
        if !Self::is_supported_mime_type(&mime_type) {
            log::info!(
                "Could not perform match operation on unsupported image type '{}'",
                mime_type
            );
            return None;
        }

        let content_id = match Self::content_id(image_url) {
            Some(id) => id,
            None => {
                log::warn!("Could not derive upload id from image url {image_url}");
                return None;
            }
        };

        let filename = attachment
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| last_segment(image_url));

        Some(ImageRef {
            mime_type,
            filename,
            content_id,
        })
    }

    pub fn is_supported_mime_type(mime_type: &str) -> bool {
        SUPPORTED_IMAGE_TYPES.contains(&normalize_mime_type(mime_type).as_str())
    }

    /// Derives the upload id from an image URL such as
    /// `/file-upload/<id>/<file name>`: the upload namespace and the file
    /// name are dropped, the rest is the id.
    pub fn content_id(image_url: &str) -> Option<String> {
        let segments = path_segments(image_url)?;

        let after_namespace = match segments.iter().position(|s| s == UPLOAD_NAMESPACE) {
            Some(pos) => &segments[pos + 1..],
            None => &segments[..],
        };
        let id_segments = match after_namespace.len() {
            0 => return None,
            1 => after_namespace,
            n => &after_namespace[..n - 1],
        };

        let id = id_segments.join("/");
        (!id.is_empty()).then_some(id)
    }

    fn first_image(message: &Message) -> Option<(&Attachment, &str)> {
        let attachment = message.attachments.first()?;
        let image_url = attachment
            .image_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())?;
        Some((attachment, image_url))
    }
}

fn normalize_mime_type(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

fn path_segments(image_url: &str) -> Option<Vec<String>> {
    // Hosts usually hand out relative upload URLs.
    let parsed = Url::parse(image_url)
        .or_else(|_| Url::parse("http://localhost/").and_then(|base| base.join(image_url)))
        .ok()?;
    let segments = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Some(segments)
}

fn last_segment(image_url: &str) -> Option<String> {
    let segment = path_segments(image_url)?.pop()?;
    let decoded = urlencoding::decode(&segment)
        .map(|name| name.into_owned())
        .ok();
    Some(decoded.unwrap_or(segment))
}
