use std::time::Duration;

const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Output of [`SseParser`]. Only `Event` carries payload; callers that only
/// care about data frames match on it and drop the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    Event(SseEvent),
    ReconnectInterval(Duration),
}

/// Incremental SSE decoder.
///
/// Bytes may be pushed in arbitrary slices: incomplete lines stay buffered
/// until their terminator arrives, and an event is only emitted once the
/// blank line closing its frame has been seen.
#[derive(Debug)]
pub struct SseParser {
    line: Vec<u8>,
    pending_cr: bool,
    at_start: bool,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            pending_cr: false,
            at_start: true,
            event: None,
            id: None,
            data: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseItem> {
        self.push(chunk.as_bytes())
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        let mut out = Vec::new();
        let mut rest = chunk;

        // A `\r` ending the previous chunk may be the first half of `\r\n`.
        if self.pending_cr {
            self.pending_cr = false;
            if let Some((b'\n', tail)) = rest.split_first() {
                rest = tail;
            }
        }

        while let Some(pos) = rest.iter().position(|b| *b == b'\n' || *b == b'\r') {
            self.line.extend_from_slice(&rest[..pos]);
            let terminator = rest[pos];
            rest = &rest[pos + 1..];
            if terminator == b'\r' {
                match rest.first() {
                    Some(b'\n') => rest = &rest[1..],
                    Some(_) => {}
                    None => self.pending_cr = true,
                }
            }
            let line = std::mem::take(&mut self.line);
            self.process_line(&line, &mut out);
        }
        self.line.extend_from_slice(rest);
        out
    }

    /// Flushes a trailing frame that the server never closed with a blank
    /// line. The parser is reset afterwards.
    pub fn finish(&mut self) -> Vec<SseItem> {
        let mut out = Vec::new();
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.process_line(&line, &mut out);
        }
        self.dispatch(&mut out);
        *self = Self::new();
        out
    }

    fn process_line(&mut self, mut line: &[u8], out: &mut Vec<SseItem>) {
        if self.at_start {
            self.at_start = false;
            line = line.strip_prefix(BOM).unwrap_or(line);
        }

        if line.is_empty() {
            self.dispatch(out);
            return;
        }
        if line.starts_with(b":") {
            return;
        }

        let text = String::from_utf8_lossy(line);
        let (field, value) = match text.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (&*text, ""),
        };

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => {
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(ms) = value.parse::<u64>() {
                        out.push(SseItem::ReconnectInterval(Duration::from_millis(ms)));
                    }
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, out: &mut Vec<SseItem>) {
        let event = self.event.take();
        if self.data.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        out.push(SseItem::Event(SseEvent {
            event,
            id: self.id.clone(),
            data,
        }));
    }
}
