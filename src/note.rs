use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidNoteId;

/// Opaque note identifier.
///
/// The server hands out numeric ids, but they are only ever compared and
/// placed in URLs, so they are kept as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    /// Validate a caller-supplied id before it reaches the network.
    ///
    /// Empty strings and the `undefined`/`null` placeholders that leak out of
    /// route parameters are rejected.
    pub fn parse(raw: &str) -> Result<Self, InvalidNoteId> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "undefined" || trimmed == "null" {
            return Err(InvalidNoteId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl std::str::FromStr for NoteId {
    type Err = InvalidNoteId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Recognition status of an attached image. Only ever moves `Pending -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageStatus {
    #[serde(rename = "NOT_RECOGNIZED")]
    Pending,
    #[serde(rename = "DONE")]
    Done,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "NOT_RECOGNIZED",
            ImageStatus::Done => "DONE",
        }
    }

    /// Anything other than the completion literal counts as not yet analyzed.
    pub fn from_wire(s: &str) -> Self {
        if s.eq_ignore_ascii_case("DONE") {
            ImageStatus::Done
        } else {
            ImageStatus::Pending
        }
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A photographed page attached to a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteImage {
    pub image_id: String,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_result: Option<String>,
    #[serde(rename = "noteImageStatus")]
    pub status: ImageStatus,
}

impl NoteImage {
    pub fn is_done(&self) -> bool {
        self.status == ImageStatus::Done
    }
}

/// One complete observation of a note and its images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub note_id: NoteId,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub images: Vec<NoteImage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn has_pending(&self) -> bool {
        self.images.iter().any(|img| !img.is_done())
    }

    pub fn done_count(&self) -> usize {
        self.images.iter().filter(|img| img.is_done()).count()
    }

    /// Where recognition stands for this note as a whole.
    pub fn progress(&self) -> AnalysisProgress {
        let total = self.images.len();
        let done = self.done_count();
        if total == 0 {
            AnalysisProgress::NoImages
        } else if done == total {
            AnalysisProgress::AllDone
        } else if done > 0 {
            AnalysisProgress::Partial { done, total }
        } else {
            AnalysisProgress::NotStarted
        }
    }

    /// Case-insensitive match against the title, the content and every
    /// image's recognized text. A blank query matches everything.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }

        std::iter::once(self.title.as_str())
            .chain(std::iter::once(self.content.as_str()))
            .chain(self.images.iter().filter_map(|img| img.analysis_result.as_deref()))
            .any(|text| text.to_lowercase().contains(&query))
    }

    pub fn read_images(&self) -> impl Iterator<Item = &NoteImage> {
        self.images.iter().filter(|img| img.is_done())
    }

    pub fn unread_images(&self) -> impl Iterator<Item = &NoteImage> {
        self.images.iter().filter(|img| !img.is_done())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisProgress {
    NoImages,
    NotStarted,
    Partial { done: usize, total: usize },
    AllDone,
}

impl std::fmt::Display for AnalysisProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisProgress::NoImages => write!(f, "no images"),
            AnalysisProgress::NotStarted => write!(f, "waiting for recognition"),
            AnalysisProgress::Partial { done, total } => write!(f, "{}/{} recognized", done, total),
            AnalysisProgress::AllDone => write!(f, "all recognized"),
        }
    }
}

/// Dashboard list entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSummary {
    pub note_id: NoteId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}


#[cfg(test)]
mod tests {
    use super::fixtures::{image, note};
    use super::*;

    #[test]
    fn test_note_id_rejects_placeholders() {
        assert!(NoteId::parse("").is_err());
        assert!(NoteId::parse("   ").is_err());
        assert!(NoteId::parse("undefined").is_err());
        assert!(NoteId::parse("null").is_err());
        assert_eq!(NoteId::parse(" 42 ").unwrap().as_str(), "42");
    }

    #[test]
    fn test_image_status_from_wire() {
        assert_eq!(ImageStatus::from_wire("DONE"), ImageStatus::Done);
        assert_eq!(ImageStatus::from_wire("done"), ImageStatus::Done);
        assert_eq!(ImageStatus::from_wire("NOT_RECOGNIZED"), ImageStatus::Pending);
        assert_eq!(ImageStatus::from_wire("PROCESSING"), ImageStatus::Pending);
    }

    #[test]
    fn test_progress() {
        assert_eq!(note("1", vec![]).progress(), AnalysisProgress::NoImages);
        assert_eq!(
            note("1", vec![image("a", ImageStatus::Pending)]).progress(),
            AnalysisProgress::NotStarted
        );
        assert_eq!(
            note("1", vec![image("a", ImageStatus::Done), image("b", ImageStatus::Pending)]).progress(),
            AnalysisProgress::Partial { done: 1, total: 2 }
        );
        assert_eq!(
            note("1", vec![image("a", ImageStatus::Done)]).progress(),
            AnalysisProgress::AllDone
        );
    }

    #[test]
    fn test_read_and_unread_images() {
        let n = note(
            "1",
            vec![
                image("a", ImageStatus::Done),
                image("b", ImageStatus::Pending),
                image("c", ImageStatus::Done),
            ],
        );
        let read: Vec<_> = n.read_images().map(|i| i.image_id.as_str()).collect();
        let unread: Vec<_> = n.unread_images().map(|i| i.image_id.as_str()).collect();
        assert_eq!(read, vec!["a", "c"]);
        assert_eq!(unread, vec!["b"]);
        assert!(n.has_pending());
    }

    #[test]
    fn test_note_serializes_with_wire_field_names() {
        let n = note("7", vec![image("a", ImageStatus::Pending)]);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["noteId"], "7");
        assert_eq!(json["images"][0]["noteImageStatus"], "NOT_RECOGNIZED");
        assert_eq!(json["images"][0]["imageId"], "a");
    }

    #[test]
    fn test_matches_title_content_and_recognized_text() {
        let n = note("1", vec![image("page", ImageStatus::Done), image("x", ImageStatus::Pending)]);

        assert!(n.matches("note 1"));
        assert!(n.matches("DIARY"));
        assert!(n.matches("text of page"));
        assert!(n.matches("   "));
        assert!(!n.matches("text of x"));
        assert!(!n.matches("grocery"));
    }
}
