//! Turns loosely shaped server responses into fully populated notes.
//!
//! The server wraps payloads in an `{isSuccess, code, message, result}`
//! envelope, but older endpoints and proxies return the bare object. Every
//! lookup here goes through the same precedence so callers never deal with
//! missing fields:
//!
//! 1. payload is `result` when it is an object, otherwise the root
//! 2. note id: `noteId`, then `id`, then the id that was requested
//! 3. title: non-empty `title`, else [`PLACEHOLDER_TITLE`]
//! 4. content: `content`, then `body`, else empty
//! 5. `createdAt` else now; `updatedAt` else created time
//! 6. images: `images` array, anything else is an empty list

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::note::{ImageStatus, Note, NoteId, NoteImage, NoteSummary};

pub const PLACEHOLDER_TITLE: &str = "Untitled";

/// Build a note snapshot. Never fails.
pub fn build_note(body: &Value, requested: &NoteId, now: DateTime<Utc>) -> Note {
    let payload = payload(body);

    let note_id = id_field(payload, &["noteId", "id"])
        .and_then(|raw| NoteId::parse(&raw).ok())
        .unwrap_or_else(|| requested.clone());

    let created_at = time_field(payload, "createdAt").unwrap_or(now);
    let updated_at = time_field(payload, "updatedAt").unwrap_or(created_at);

    let images = payload
        .get("images")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .enumerate()
                .map(|(index, item)| build_image(item, index))
                .collect()
        })
        .unwrap_or_default();

    Note {
        note_id,
        title: title_field(payload),
        content: str_field(payload, &["content", "body"]).unwrap_or_default(),
        images,
        created_at,
        updated_at,
    }
}

fn build_image(item: &Value, index: usize) -> NoteImage {
    NoteImage {
        image_id: id_field(item, &["imageId", "id"]).unwrap_or_else(|| index.to_string()),
        image_url: str_field(item, &["imageUrl", "url"]).unwrap_or_default(),
        analysis_result: str_field(item, &["analysisResult", "recognizedText"]),
        status: item
            .get("noteImageStatus")
            .or_else(|| item.get("status"))
            .and_then(Value::as_str)
            .map(ImageStatus::from_wire)
            .unwrap_or(ImageStatus::Pending),
    }
}

/// Build a dashboard entry. Entries without any usable id are dropped.
pub fn build_summary(item: &Value, now: DateTime<Utc>) -> Option<NoteSummary> {
    let note_id = id_field(item, &["noteId", "id"]).and_then(|raw| NoteId::parse(&raw).ok())?;
    Some(NoteSummary {
        note_id,
        title: title_field(item),
        created_at: time_field(item, "createdAt").unwrap_or(now),
    })
}

/// Find the list inside a list response: a bare array, or one nested under
/// `result`, `data`, `items` or `list`.
pub fn extract_list(body: &Value) -> &[Value] {
    if let Some(items) = body.as_array() {
        return items;
    }
    ["result", "data", "items", "list"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Id of a freshly created note: `noteId`, `result.noteId`, `id`, `result.id`.
pub fn extract_created_id(body: &Value) -> Option<NoteId> {
    let nested = body.get("result");
    [
        body.get("noteId"),
        nested.and_then(|r| r.get("noteId")),
        body.get("id"),
        nested.and_then(|r| r.get("id")),
    ]
    .into_iter()
    .flatten()
    .filter_map(id_string)
    .find_map(|raw| NoteId::parse(&raw).ok())
}

fn payload(body: &Value) -> &Value {
    match body.get("result") {
        Some(result) if result.is_object() => result,
        _ => body,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id_field(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| obj.get(*key).and_then(id_string))
}

fn str_field(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn title_field(obj: &Value) -> String {
    obj.get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| PLACEHOLDER_TITLE.to_string())
}

fn time_field(obj: &Value, key: &str) -> Option<DateTime<Utc>> {
    obj.get(key).and_then(Value::as_str).and_then(parse_time)
}

/// RFC 3339, or the zone-less ISO form the server emits for local times
/// (treated as UTC).
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
