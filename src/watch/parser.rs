//! Watcher output grammars
//!
//! `inotifywait -m --format '%e %w%f'` prints `EVENTS path` with a
//! comma-joined uppercase event list. `fswatch -x` prints `path Flag1
//! Flag2...` with space-separated flag words after the path. Both get
//! normalized to [`ChangeKind`]; lines that carry no relevant event are
//! dropped.

use crate::events::ChangeKind;

/// Flag words `fswatch -x` may append after the path. Needed to split the
/// path (which may contain spaces) from the trailing flags.
const FSWATCH_FLAGS: &[&str] = &[
    "NoOp",
    "PlatformSpecific",
    "Created",
    "Updated",
    "Removed",
    "Renamed",
    "OwnerModified",
    "AttributeModified",
    "MovedFrom",
    "MovedTo",
    "IsFile",
    "IsDir",
    "IsSymLink",
    "Link",
    "Overflow",
];

/// Parse one `inotifywait --format '%e %w%f'` line into (path, kind).
pub fn parse_inotify_line(line: &str) -> Option<(String, ChangeKind)> {
    let line = line.trim();
    let (events, path) = line.split_once(' ')?;
    if path.is_empty() {
        return None;
    }
    let kind = inotify_kind(events)?;
    Some((path.to_string(), kind))
}

/// Map an inotify event list like `CLOSE_WRITE,CLOSE` to a change kind.
/// Removal beats creation beats modification when several apply.
fn inotify_kind(events: &str) -> Option<ChangeKind> {
    let mut saw_create = false;
    let mut saw_modify = false;
    for event in events.split(',') {
        match event {
            "DELETE" | "DELETE_SELF" | "MOVED_FROM" | "MOVE_SELF" => {
                return Some(ChangeKind::Delete)
            }
            "CREATE" | "MOVED_TO" => saw_create = true,
            "MODIFY" | "CLOSE_WRITE" | "ATTRIB" => saw_modify = true,
            _ => {}
        }
    }
    if saw_create {
        Some(ChangeKind::Create)
    } else if saw_modify {
        Some(ChangeKind::Modify)
    } else {
        None
    }
}

/// Parse one `fswatch -x` line into (path, kind). Trailing known flag
/// words are peeled off the right; whatever remains is the path.
pub fn parse_fswatch_line(line: &str) -> Option<(String, ChangeKind)> {
    let mut rest = line.trim_end();
    let mut flags: Vec<&str> = Vec::new();

    while let Some((head, tail)) = rest.rsplit_once(' ') {
        if FSWATCH_FLAGS.contains(&tail) {
            flags.push(tail);
            rest = head.trim_end();
        } else {
            break;
        }
    }

    if flags.is_empty() || rest.is_empty() {
        return None;
    }
    let kind = fswatch_kind(&flags)?;
    Some((rest.to_string(), kind))
}

fn fswatch_kind(flags: &[&str]) -> Option<ChangeKind> {
    let has = |name: &str| flags.iter().any(|f| *f == name);
    if has("Removed") || has("MovedFrom") {
        Some(ChangeKind::Delete)
    } else if has("Created") || has("MovedTo") {
        Some(ChangeKind::Create)
    } else if has("Updated") || has("Renamed") || has("OwnerModified") || has("AttributeModified") {
        Some(ChangeKind::Modify)
    } else {
        None
    }
}

/// Pull complete lines out of a streaming byte buffer, leaving a trailing
/// partial line in place for the next data frame.
pub(crate) fn split_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
        lines.push(line.trim_end_matches('\r').to_string());
    }
    lines
}
