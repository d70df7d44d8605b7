//! Turns raw device text into a bounded, displayable transcript. Protocol sentinels and the
//! raw-mode banner never reach the transcript.

use crate::device::sentinel::{self, RAW_REPL_BANNER};
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::OnceLock;

pub const BANNER_LINE: &str = "MicroPython device ready.";

/// Rows from the bottom within which the viewport keeps following new output.
const FOLLOW_SLACK: usize = 2;

static DEVICE_BANNER_RE: OnceLock<Regex> = OnceLock::new();

fn is_device_identification(text: &str) -> bool {
    text.contains("MicroPython") || text.contains("Type \"help()\"")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub version: String,
    pub build_date: String,
    pub board: String,
}

impl DeviceInfo {
    pub fn parse(text: &str) -> Option<Self> {
        let re = DEVICE_BANNER_RE.get_or_init(|| {
            Regex::new(r"MicroPython\s+(v[^\s,;]+)[^\r\n]*?\son\s+([0-9]{4}-[0-9]{2}-[0-9]{2});\s*([^\r\n]+?)\s*(?:\r|\n|$)")
                .expect("valid device banner regex")
        });
        let caps = re.captures(text)?;
        Some(Self {
            version: caps[1].to_string(),
            build_date: caps[2].to_string(),
            board: caps[3].to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Output,
    System,
    Input,
    Banner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    pub kind: LineKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Viewport {
    pub top: usize,
    pub height: usize,
}

#[derive(Debug)]
pub struct TerminalRenderer {
    lines: VecDeque<TranscriptLine>,
    /// The last output line is still waiting for its newline.
    open_line: bool,
    /// Tail of the previous chunk that may be the start of a sentinel.
    pending: String,
    banner_shown: bool,
    device_info: Option<DeviceInfo>,
    max_lines: usize,
    viewport: Viewport,
}

impl TerminalRenderer {
    pub fn new(max_lines: usize, viewport_height: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            open_line: false,
            pending: String::new(),
            banner_shown: false,
            device_info: None,
            max_lines: max_lines.max(1),
            viewport: Viewport {
                top: 0,
                height: viewport_height.max(1),
            },
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &TranscriptLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn banner_shown(&self) -> bool {
        self.banner_shown
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Transcript text, one line per row.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The last `count` lines.
    pub fn tail(&self, count: usize) -> Vec<TranscriptLine> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Lines currently inside the viewport.
    pub fn visible(&self) -> Vec<TranscriptLine> {
        self.lines
            .iter()
            .skip(self.viewport.top)
            .take(self.viewport.height)
            .cloned()
            .collect()
    }

    fn max_top(&self) -> usize {
        self.lines.len().saturating_sub(self.viewport.height)
    }

    fn at_bottom(&self) -> bool {
        self.viewport.top + FOLLOW_SLACK >= self.max_top()
    }

    pub fn scroll_to(&mut self, top: usize) {
        self.viewport.top = top.min(self.max_top());
    }

    pub fn set_viewport_height(&mut self, height: usize) {
        self.viewport.height = height.max(1);
        self.viewport.top = self.viewport.top.min(self.max_top());
    }

    /// Runs a transcript mutation, keeping the viewport pinned to the tail only if it was there.
    fn with_follow(&mut self, mutate: impl FnOnce(&mut Self)) {
        let follow = self.at_bottom();
        mutate(self);

        let excess = self.lines.len().saturating_sub(self.max_lines);
        if excess > 0 {
            self.lines.drain(..excess);
            self.viewport.top = self.viewport.top.saturating_sub(excess);
        }

        if follow {
            self.viewport.top = self.max_top();
        } else {
            self.viewport.top = self.viewport.top.min(self.max_top());
        }
    }

    /// Feeds one decoded chunk of device output.
    pub fn push_chunk(&mut self, chunk: &str) {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(chunk);

        let mut cleaned = clean(&text);
        let hold = sentinel::partial_marker_suffix(&cleaned);
        if hold > 0 {
            self.pending = cleaned.split_off(cleaned.len() - hold);
        }
        if cleaned.is_empty() {
            return;
        }

        if !self.banner_shown && is_device_identification(&cleaned) {
            self.show_banner(&cleaned);
            return;
        }

        self.with_follow(|r| r.append_output(&cleaned));
    }

    /// Text held back because it might be the start of a marker.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Shows held-back text as output. Called once the device has gone quiet, when the
    /// held text can no longer turn into a marker.
    pub fn flush_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            self.with_follow(|r| r.append_output(&pending));
        }
    }

    fn show_banner(&mut self, identification: &str) {
        self.device_info = DeviceInfo::parse(identification);
        self.banner_shown = true;
        self.pending.clear();
        self.open_line = false;
        self.lines.clear();
        self.viewport.top = 0;
        self.with_follow(|r| {
            r.lines.push_back(TranscriptLine {
                kind: LineKind::Banner,
                text: BANNER_LINE.to_string(),
            })
        });
    }

    fn append_output(&mut self, text: &str) {
        let mut segments = text.split('\n').peekable();
        while let Some(segment) = segments.next() {
            let terminated = segments.peek().is_some();
            let extend = self.open_line && matches!(self.lines.back(), Some(l) if l.kind == LineKind::Output);
            if extend {
                if let Some(last) = self.lines.back_mut() {
                    last.text.push_str(segment);
                }
            } else {
                if segment.is_empty() && !terminated {
                    break;
                }
                self.lines.push_back(TranscriptLine {
                    kind: LineKind::Output,
                    text: segment.to_string(),
                });
            }
            self.open_line = !terminated;
        }
    }

    fn push_line(&mut self, kind: LineKind, text: &str) {
        self.with_follow(|r| {
            r.open_line = false;
            r.lines.push_back(TranscriptLine {
                kind,
                text: text.to_string(),
            });
        });
    }

    /// Adds a notice originating from this side rather than from the device.
    pub fn push_system(&mut self, text: &str) {
        self.push_line(LineKind::System, text);
    }

    /// Echoes a line typed by the user.
    pub fn push_input(&mut self, text: &str) {
        self.push_line(LineKind::Input, &format!(">>> {}", text));
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.open_line = false;
        self.pending.clear();
        self.viewport.top = 0;
    }

    /// Forgets the device after a disconnect; the next identification shows the banner again.
    pub fn reset_for_disconnect(&mut self) {
        self.banner_shown = false;
        self.device_info = None;
        self.pending.clear();
        self.open_line = false;
    }
}

/// Removes sentinels, the raw-mode banner and control characters; normalizes line endings.
fn clean(text: &str) -> String {
    // A `\r\n` split across reads must not become two line breaks.
    let mut text = text.replace('\r', "");
    // Markers take their line break with them.
    for hidden in sentinel::DISPLAY_HIDDEN.iter().chain([&RAW_REPL_BANNER]) {
        text = text.replace(&format!("{}\n", hidden), "");
    }
    let text = sentinel::strip_markers(&text).replace(RAW_REPL_BANNER, "");
    text.chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_texts(r: &TerminalRenderer) -> Vec<String> {
        r.lines().map(|l| l.text.clone()).collect()
    }

    #[test]
    fn first_identification_chunk_becomes_banner_once() {
        let mut r = TerminalRenderer::new(100, 10);
        r.push_chunk("boot noise\n");
        r.push_chunk("MicroPython v1.22.0 on 2024-01-05; Raspberry Pi Pico with RP2040\r\nType \"help()\" for more information.\r\n>>> ");
        assert!(r.banner_shown());
        assert_eq!(output_texts(&r), vec![BANNER_LINE.to_string()]);
        let info = r.device_info().unwrap();
        assert_eq!(info.version, "v1.22.0");
        assert_eq!(info.build_date, "2024-01-05");
        assert_eq!(info.board, "Raspberry Pi Pico with RP2040");

        r.push_chunk("MicroPython v1.22.0 on 2024-01-05; Raspberry Pi Pico with RP2040\n");
        assert_eq!(r.len(), 2);
        assert!(r.text().contains("MicroPython v1.22.0"));
    }

    #[test]
    fn partial_lines_coalesce_until_newline() {
        let mut r = TerminalRenderer::new(100, 10);
        r.push_chunk("hel");
        r.push_chunk("lo");
        r.push_chunk(" world\r\nnext");
        assert_eq!(output_texts(&r), vec!["hello world", "next"]);
    }

    #[test]
    fn line_break_split_across_chunks_is_one_break() {
        let mut r = TerminalRenderer::new(100, 10);
        r.push_chunk("hello\r");
        r.push_chunk("\nworld\r\n");
        assert_eq!(output_texts(&r), vec!["hello", "world"]);
    }

    #[test]
    fn held_back_underscore_is_shown_on_flush() {
        let mut r = TerminalRenderer::new(100, 10);
        r.push_chunk("name = x_");
        assert!(r.has_pending());
        assert_eq!(output_texts(&r), vec!["name = x"]);

        r.flush_pending();
        assert!(!r.has_pending());
        assert_eq!(output_texts(&r), vec!["name = x_"]);
        r.push_chunk("y\n");
        assert_eq!(output_texts(&r), vec!["name = x_y"]);
    }

    #[test]
    fn sentinels_split_across_chunks_are_hidden() {
        let mut r = TerminalRenderer::new(100, 10);
        for chunk in ["OK___BEG", "IN___\r\n[1, 2]\r\n___", "END___\r\n", "___MET", "A___{}\n"] {
            r.push_chunk(chunk);
        }
        let text = r.text();
        for marker in ["___BEGIN___", "___END___", "___META___"] {
            assert!(!text.contains(marker), "{} leaked into {:?}", marker, text);
        }
        assert!(text.contains("[1, 2]"));
    }

    #[test]
    fn raw_banner_and_control_bytes_are_removed() {
        let mut r = TerminalRenderer::new(100, 10);
        r.push_chunk("raw REPL; CTRL-B to exit\r\n>OK42\r\n\u{4}\u{4}>");
        assert_eq!(output_texts(&r), vec![">OK42", ">"]);
    }

    #[test]
    fn system_lines_close_open_output_line() {
        let mut r = TerminalRenderer::new(100, 10);
        r.push_chunk(">>> ");
        r.push_system("Disconnected");
        r.push_chunk("more");
        let kinds: Vec<LineKind> = r.lines().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![LineKind::Output, LineKind::System, LineKind::Output]);
    }

    #[test]
    fn transcript_is_bounded() {
        let mut r = TerminalRenderer::new(5, 3);
        for i in 0..20 {
            r.push_system(&format!("line {}", i));
        }
        assert_eq!(r.len(), 5);
        assert_eq!(r.lines().next().unwrap().text, "line 15");
    }

    #[test]
    fn viewport_follows_only_when_at_bottom() {
        let mut r = TerminalRenderer::new(100, 3);
        for i in 0..10 {
            r.push_system(&format!("line {}", i));
        }
        assert_eq!(r.viewport().top, 7);

        r.scroll_to(0);
        r.push_system("new");
        assert_eq!(r.viewport().top, 0);

        r.scroll_to(usize::MAX);
        r.push_system("newer");
        assert_eq!(r.viewport().top, r.len() - 3);
        assert_eq!(r.visible().last().unwrap().text, "newer");
    }

    #[test]
    fn disconnect_rearms_banner() {
        let mut r = TerminalRenderer::new(100, 10);
        r.push_chunk("MicroPython v1.20.0 on 2023-04-26; ESP32 module with ESP32\n");
        r.reset_for_disconnect();
        assert!(!r.banner_shown());
        assert!(r.device_info().is_none());
        r.push_chunk("Type \"help()\" for more information.\n");
        assert!(r.banner_shown());
    }
}
