//! Text sentinels used to frame structured results inside free-form REPL output.
//! Every place that emits or parses them goes through this module.

pub const BEGIN: &str = "___BEGIN___";
pub const END: &str = "___END___";
pub const META: &str = "___META___";
pub const ERROR: &str = "___ERROR___";
pub const ERR_PREFIX: &str = "ERR:";

/// Banner printed by the firmware when raw mode is entered.
pub const RAW_REPL_BANNER: &str = "raw REPL; CTRL-B to exit";
/// Acknowledgment printed after a raw-mode payload has been accepted.
pub const RAW_ACK: &str = "OK";
pub const RAW_PROMPT: &str = ">";
pub const FRIENDLY_PROMPT: &str = ">>>";

/// Markers that must never reach the terminal transcript.
pub const DISPLAY_HIDDEN: [&str; 4] = [BEGIN, END, META, ERROR];

/// Returns the text strictly between the first `start` and the next `end` after it.
pub fn extract_between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let i = text.find(start)? + start.len();
    let j = text[i..].find(end)? + i;
    Some(&text[i..j])
}

/// Body of a `___BEGIN___ ... ___END___` frame.
pub fn framed_body(text: &str) -> Option<&str> {
    extract_between(text, BEGIN, END)
}

/// Non-empty trimmed lines of a frame body, in emitted order.
pub fn payload_lines(body: &str) -> Vec<&str> {
    body.split('\n')
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Outcome printed by the one-shot filesystem scripts: `OK` or `ERR:<message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    Ok,
    Err(String),
    Missing,
}

pub fn parse_status(captured: &str) -> StatusLine {
    match framed_body(captured).map(str::trim) {
        None => StatusLine::Missing,
        Some(body) => match body.strip_prefix(ERR_PREFIX) {
            Some(message) => StatusLine::Err(message.trim().to_string()),
            None => StatusLine::Ok,
        },
    }
}

/// First `___ERROR___` payload among the lines, if any.
pub fn error_line<'a>(lines: &[&'a str]) -> Option<&'a str> {
    lines
        .iter()
        .find_map(|l| l.strip_prefix(ERROR))
        .map(str::trim)
}

/// Removes every hidden sentinel, repeating until none is left so that stripping
/// one marker cannot splice the neighbours into a new one.
pub fn strip_markers(text: &str) -> String {
    let mut out = text.to_string();
    loop {
        let before = out.len();
        for marker in DISPLAY_HIDDEN {
            if out.contains(marker) {
                out = out.replace(marker, "");
            }
        }
        if out.len() == before {
            return out;
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of a hidden marker.
/// Such a tail may complete into a marker once the next chunk arrives.
pub fn partial_marker_suffix(text: &str) -> usize {
    DISPLAY_HIDDEN
        .iter()
        .flat_map(|marker| (1..marker.len()).rev().map(move |n| &marker[..n]))
        .filter(|prefix| text.ends_with(prefix))
        .map(str::len)
        .max()
        .unwrap_or(0)
}

/// Skips everything up to and including the raw-mode acknowledgment. The `OK` only counts
/// right after the raw prompt that follows the banner; without a banner the first `OK` is used.
fn after_raw_ack(captured: &str) -> &str {
    if let Some(idx) = captured.find(RAW_REPL_BANNER) {
        let rest = &captured[idx + RAW_REPL_BANNER.len()..];
        let rest = match rest.find(RAW_PROMPT) {
            Some(p) => &rest[p + RAW_PROMPT.len()..],
            None => rest,
        };
        return rest.strip_prefix(RAW_ACK).unwrap_or(rest);
    }
    match captured.find(RAW_ACK) {
        Some(idx) => &captured[idx + RAW_ACK.len()..],
        None => captured,
    }
}

/// Extracts what a program printed from a raw execution capture: the text after the
/// raw acknowledgment and before `end_marker`, with control bytes and the banner removed.
pub fn program_output(captured: &str, end_marker: &str) -> String {
    let body = match captured.find(end_marker) {
        Some(idx) => &captured[..idx],
        None => captured,
    };
    let body = after_raw_ack(body);
    let cleaned: String = body
        .replace(RAW_REPL_BANNER, "")
        .chars()
        .filter(|c| *c != '\u{4}' && *c != '\0' && *c != '\r')
        .collect();
    cleaned.trim_matches('\n').to_string()
}
