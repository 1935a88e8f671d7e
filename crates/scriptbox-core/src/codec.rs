//! In-band control markers for the textual channel
//!
//! When the sandbox cannot post structured messages (the fallback
//! executor, or an external interpreter that only has stdout), control
//! requests travel inside the output stream as a marker followed by a
//! payload that runs to the end of the line:
//!
//! ```text
//! <<<INPUT>>>Your name?
//! <<<PLOT>>>data:image/png;base64,iVBORw0...
//! <<<SLEEP>>>start
//! ```
//!
//! [`MarkerDecoder`] is stateful so that a marker or payload split across
//! chunks decodes exactly as it would in a single chunk.

/// Marker announcing an input request; payload is the prompt
pub const INPUT_MARK: &str = "<<<INPUT>>>";
/// Marker carrying an encoded image
pub const PLOT_MARK: &str = "<<<PLOT>>>";
/// Marker carrying `start` or `end` of a cooperative sleep
pub const SLEEP_MARK: &str = "<<<SLEEP>>>";

const MARKS: [(&str, MarkKind); 3] = [
    (INPUT_MARK, MarkKind::Input),
    (PLOT_MARK, MarkKind::Plot),
    (SLEEP_MARK, MarkKind::Sleep),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkKind {
    Input,
    Plot,
    Sleep,
}

/// Boundary of a cooperative sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepPhase {
    Begin,
    End,
}

/// A control request decoded from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Input(String),
    Plot(String),
    Sleep(SleepPhase),
}

/// One decoded piece of the stream, in stream order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Control(Control),
}

/// Incremental decoder for one output stream
#[derive(Debug, Default)]
pub struct MarkerDecoder {
    buffer: String,
}

impl MarkerDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return everything that is now unambiguous
    ///
    /// Plain text is released up to the last complete line; a partial line
    /// is held back in case it turns out to contain a marker.
    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        self.buffer.push_str(chunk);
        self.drain(false)
    }

    /// Release whatever is buffered, treating end of stream as end of line
    pub fn finish(&mut self) -> Vec<Segment> {
        self.drain(true)
    }

    /// Whether a partial line is being held back
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn drain(&mut self, eof: bool) -> Vec<Segment> {
        let buffer = std::mem::take(&mut self.buffer);
        let mut segments = Vec::new();
        let mut rest = buffer.as_str();

        loop {
            let Some((index, mark, kind)) = find_marker(rest) else {
                let released = if eof {
                    rest.len()
                } else {
                    rest.rfind('\n').map_or(0, |nl| nl + 1)
                };
                push_text(&mut segments, &rest[..released]);
                rest = &rest[released..];
                break;
            };

            push_text(&mut segments, &rest[..index]);
            let payload_start = index + mark.len();
            let after_mark = &rest[payload_start..];
            match after_mark.find('\n') {
                Some(nl) => {
                    segments.push(Segment::Control(control(kind, &after_mark[..nl])));
                    rest = &after_mark[nl + 1..];
                }
                None if eof => {
                    segments.push(Segment::Control(control(kind, after_mark)));
                    rest = "";
                    break;
                }
                None => {
                    rest = &rest[index..];
                    break;
                }
            }
        }

        self.buffer = rest.to_string();
        segments
    }
}

fn find_marker(text: &str) -> Option<(usize, &'static str, MarkKind)> {
    MARKS
        .iter()
        .filter_map(|&(mark, kind)| text.find(mark).map(|index| (index, mark, kind)))
        .min_by_key(|&(index, _, _)| index)
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Segment::Text(last)) = segments.last_mut() {
        last.push_str(text);
    } else {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn control(kind: MarkKind, payload: &str) -> Control {
    let payload = payload.strip_suffix('\r').unwrap_or(payload);
    match kind {
        MarkKind::Input => Control::Input(payload.to_string()),
        MarkKind::Plot => Control::Plot(payload.trim().to_string()),
        MarkKind::Sleep => {
            if payload.trim().to_ascii_lowercase().starts_with("start") {
                Control::Sleep(SleepPhase::Begin)
            } else {
                Control::Sleep(SleepPhase::End)
            }
        }
    }
}

/// Encode a control request as one marker line
///
/// Line breaks inside the payload would end the marker early, so they are
/// replaced by spaces.
pub fn encode(control: &Control) -> String {
    let (mark, payload) = match control {
        Control::Input(prompt) => (INPUT_MARK, prompt.as_str()),
        Control::Plot(data) => (PLOT_MARK, data.as_str()),
        Control::Sleep(SleepPhase::Begin) => (SLEEP_MARK, "start"),
        Control::Sleep(SleepPhase::End) => (SLEEP_MARK, "end"),
    };
    let payload: String = payload
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!("{}{}\n", mark, payload)
}

/// Normalize line endings for display and guarantee a trailing newline
pub fn normalize_output(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    if !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}
