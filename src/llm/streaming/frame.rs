// src/llm/streaming/frame.rs
// Byte chunks -> complete server-sent-event frames

/// Incremental frame splitter.
///
/// Works on complete lines only, so the frames produced do not depend on
/// where the network split the bytes. Accepted layouts:
///
/// - `event: <type>` followed by one or more `data:` lines (typed), closed
///   by a blank line, the next `event:` line or end of stream
/// - a lone `data: <json>` line, with or without a blank-line separator
/// - a bare JSON document, terminated by a blank line or end of stream
///
/// Outside a typed frame each `data:` line closes its frame. Comment lines
/// (`:`), `id:` and `retry:` fields and blank lines never produce a frame on
/// their own.
#[derive(Debug, Default)]
pub struct EventFrameParser {
    /// Bytes of a line that has not seen its `\n` yet
    partial: Vec<u8>,
    /// Lines of the frame being assembled
    lines: Vec<String>,
}

impl EventFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk; returns every frame it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        let mut start = 0;

        for (i, byte) in chunk.iter().enumerate() {
            if *byte != b'\n' {
                continue;
            }
            self.partial.extend_from_slice(&chunk[start..i]);
            start = i + 1;
            let line = std::mem::take(&mut self.partial);
            self.push_line(&decode_line(&line), &mut frames);
        }
        self.partial.extend_from_slice(&chunk[start..]);
        frames
    }

    /// End of stream: emit whatever is buffered as a best-effort frame
    pub fn flush(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.push_line(&decode_line(&line), &mut frames);
        }
        self.emit(&mut frames);
        frames
    }

    /// True when nothing is buffered
    pub fn is_idle(&self) -> bool {
        self.partial.is_empty() && self.lines.is_empty()
    }

    fn push_line(&mut self, line: &str, frames: &mut Vec<String>) {
        if line.trim().is_empty() {
            self.emit(frames);
            return;
        }
        if line.starts_with(':') || line.starts_with("id:") || line.starts_with("retry:") {
            return;
        }
        if line.starts_with("event:") {
            // A new typed frame begins; anything buffered is its own frame
            self.emit(frames);
            self.lines.push(line.to_string());
            return;
        }
        if line.starts_with("data:") {
            if self.lines.first().is_some_and(|l| l.starts_with("event:")) {
                // Typed frames may carry several data lines; a blank line or
                // the next `event:` closes them
                self.lines.push(line.to_string());
                return;
            }
            self.emit(frames);
            self.lines.push(line.to_string());
            self.emit(frames);
            return;
        }
        self.lines.push(line.to_string());
    }

    fn emit(&mut self, frames: &mut Vec<String>) {
        if !self.lines.is_empty() {
            frames.push(self.lines.join("\n"));
            self.lines.clear();
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}
