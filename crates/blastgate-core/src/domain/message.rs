//! Message bodies handed to the transport.
//!
//! A send is either plain text or a media attachment referenced by URL.  The
//! attachment kind is chosen from the URL's file extension; anything that is
//! not a recognised image, video or audio type is sent as a document.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

/// What to deliver to one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePayload {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        url: String,
        mime_type: String,
        /// Never set for audio, which cannot carry one.
        caption: Option<String>,
        /// Only set for documents.
        file_name: Option<String>,
    },
}

impl MessagePayload {
    /// Builds a payload from an optional media URL and the accompanying text.
    ///
    /// Without media the text is sent as-is.  With media the text becomes the
    /// caption (dropped when empty).  `file_name` overrides the document name,
    /// which otherwise defaults to the last path segment of the URL.
    pub fn compose(text: &str, media_url: Option<&str>, file_name: Option<&str>) -> Self {
        let Some(url) = media_url.map(str::trim).filter(|u| !u.is_empty()) else {
            return MessagePayload::Text {
                body: text.to_string(),
            };
        };

        let last_segment = last_path_segment(url);
        let extension = last_segment
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let (kind, mime_type) = classify_extension(&extension);

        let caption = match kind {
            MediaKind::Audio => None,
            _ => Some(text.to_string()).filter(|t| !t.is_empty()),
        };
        let file_name = match kind {
            MediaKind::Document => Some(
                file_name
                    .filter(|n| !n.is_empty())
                    .unwrap_or(last_segment)
                    .to_string(),
            ),
            _ => None,
        };

        MessagePayload::Media {
            kind,
            url: url.to_string(),
            mime_type: mime_type.to_string(),
            caption,
            file_name,
        }
    }

    /// Text to log or show for this payload.
    pub fn summary(&self) -> &str {
        match self {
            MessagePayload::Text { body } => body,
            MessagePayload::Media { caption, url, .. } => caption.as_deref().unwrap_or(url),
        }
    }
}

/// Last `/`-separated segment of a URL, ignoring any query or fragment.
fn last_path_segment(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

fn classify_extension(ext: &str) -> (MediaKind, &'static str) {
    match ext {
        "jpg" | "jpeg" => (MediaKind::Image, "image/jpeg"),
        "png" => (MediaKind::Image, "image/png"),
        "gif" => (MediaKind::Image, "image/gif"),
        "webp" => (MediaKind::Image, "image/webp"),
        "bmp" => (MediaKind::Image, "image/bmp"),
        "mp4" => (MediaKind::Video, "video/mp4"),
        "3gp" => (MediaKind::Video, "video/3gpp"),
        "mov" => (MediaKind::Video, "video/quicktime"),
        "mkv" => (MediaKind::Video, "video/x-matroska"),
        "webm" => (MediaKind::Video, "video/webm"),
        "mp3" => (MediaKind::Audio, "audio/mpeg"),
        "ogg" | "opus" => (MediaKind::Audio, "audio/ogg"),
        "m4a" => (MediaKind::Audio, "audio/mp4"),
        "aac" => (MediaKind::Audio, "audio/aac"),
        "wav" => (MediaKind::Audio, "audio/wav"),
        "amr" => (MediaKind::Audio, "audio/amr"),
        "pdf" => (MediaKind::Document, "application/pdf"),
        "doc" => (MediaKind::Document, "application/msword"),
        "docx" => (
            MediaKind::Document,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ),
        "xls" => (MediaKind::Document, "application/vnd.ms-excel"),
        "xlsx" => (
            MediaKind::Document,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ),
        "csv" => (MediaKind::Document, "text/csv"),
        "txt" => (MediaKind::Document, "text/plain"),
        "zip" => (MediaKind::Document, "application/zip"),
        _ => (MediaKind::Document, "application/octet-stream"),
    }
}
