use serde::{Deserialize, Serialize};

/// A file or image carried by a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Public URL of the uploaded object
    pub url: String,
    /// Attachment kind
    pub kind: AttachmentKind,
    /// Original file name
    pub name: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Thumbnail URL for previewable kinds
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

/// Attachment kind enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    Document,
    File,
}

impl Attachment {
    pub fn new(url: impl Into<String>, kind: AttachmentKind, name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            url: url.into(),
            kind,
            name: name.into(),
            size_bytes,
            thumbnail_url: None,
        }
    }

    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }

    pub fn is_image(&self) -> bool {
        matches!(self.kind, AttachmentKind::Image)
    }
}

impl From<&str> for AttachmentKind {
    fn from(mime: &str) -> Self {
        let mime = mime.to_lowercase();
        if mime.starts_with("image/") {
            AttachmentKind::Image
        } else if mime.starts_with("video/") {
            AttachmentKind::Video
        } else if mime.starts_with("audio/") {
            AttachmentKind::Audio
        } else if mime == "application/pdf" || mime.starts_with("text/") {
            AttachmentKind::Document
        } else {
            AttachmentKind::File
        }
    }
}
