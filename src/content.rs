//! # Content items
//! The immutable unit a chat front-end submits, plus the text normalization and
//! fingerprinting that every later stage keys on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Reference to an attached file (document, image, archive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// A single submission. Built once at ingestion and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub text: String,
    #[serde(default)]
    pub media: Option<MediaRef>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: None,
            sender: None,
            received_at: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }

    pub fn received_at(mut self, ts: DateTime<Utc>) -> Self {
        self.received_at = Some(ts);
        self
    }

    /// Text fed to the classifiers: message body, then attachment caption and
    /// file name so bare uploads still carry a signal.
    pub fn classification_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if !self.text.trim().is_empty() {
            parts.push(self.text.as_str());
        }
        if let Some(m) = &self.media {
            if let Some(c) = m.caption.as_deref().filter(|c| !c.trim().is_empty()) {
                parts.push(c);
            }
            if !m.file_name.trim().is_empty() {
                parts.push(m.file_name.as_str());
            }
        }
        parts.join(" ")
    }

    /// Normalized classification text.
    pub fn normalized(&self) -> String {
        normalize_text(&self.classification_text())
    }
}

/// Case-fold, collapse every whitespace run to a single space, trim.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !last_space && !out.is_empty() {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.extend(ch.to_lowercase());
            last_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// SHA-256 digest of normalized text, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of already-normalized text.
    pub fn of_normalized(normalized: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        Self(out)
    }

    /// Normalizes first, then hashes.
    pub fn of_text(raw: &str) -> Self {
        Self::of_normalized(&normalize_text(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars; safe to log in place of raw content.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
