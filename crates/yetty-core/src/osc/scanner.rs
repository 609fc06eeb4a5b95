//! OSC sequence framing scanner.
//!
//! Detects OSC sequences (`ESC ]` ... `BEL` or `ESC \`) in the raw PTY byte
//! stream so large card payloads can bypass the terminal parser entirely.
//! The scanner only tracks state; it never buffers or interprets sequence
//! content. The outer pipeline asks [`needs_more_data`](OscScanner::needs_more_data)
//! after each chunk: while it returns `true` the bytes must be held back,
//! immediately after the terminator it returns `false` and the complete
//! frame can be processed.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Scanner state.
///
/// ```text
/// Normal -> (ESC) -> Esc -> (]) -> InOsc -> (BEL) -> Normal
///                     |                |
///                     v (other)        v (ESC)
///                   Normal           OscEscEnd -> (\) -> Normal
///                                            |
///                                            v (other) back to InOsc
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    /// Not inside an OSC sequence.
    Normal,
    /// Saw ESC, deciding whether `]` follows.
    Esc,
    /// Inside the OSC body.
    InOsc,
    /// Saw ESC inside the body, looking for the `\` of ST.
    OscEscEnd,
}

/// Lightweight OSC sequence detector over the PTY byte stream.
#[derive(Debug)]
pub struct OscScanner {
    state: ScannerState,
    completed: u32,
}

impl Default for OscScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl OscScanner {
    pub fn new() -> Self {
        Self {
            state: ScannerState::Normal,
            completed: 0,
        }
    }

    /// Scan a chunk, updating state. Call once per incoming chunk.
    pub fn scan(&mut self, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            match self.state {
                ScannerState::Normal => {
                    // Fast path: skip straight to the next ESC.
                    match memchr::memchr(ESC, &data[i..]) {
                        Some(at) => {
                            self.state = ScannerState::Esc;
                            i += at + 1;
                        }
                        None => return,
                    }
                }
                ScannerState::Esc => {
                    self.state = if data[i] == b']' {
                        ScannerState::InOsc
                    } else {
                        ScannerState::Normal
                    };
                    i += 1;
                }
                ScannerState::InOsc => {
                    // Fast path: the body ends only at BEL or ESC.
                    match memchr::memchr2(BEL, ESC, &data[i..]) {
                        Some(at) => {
                            if data[i + at] == BEL {
                                self.state = ScannerState::Normal;
                                self.completed += 1;
                            } else {
                                self.state = ScannerState::OscEscEnd;
                            }
                            i += at + 1;
                        }
                        None => return,
                    }
                }
                ScannerState::OscEscEnd => {
                    match data[i] {
                        b'\\' => {
                            // ST terminator complete.
                            self.state = ScannerState::Normal;
                            self.completed += 1;
                        }
                        // Another ESC: the previous one was body data, this
                        // one may still start ST.
                        ESC => {}
                        _ => self.state = ScannerState::InOsc,
                    }
                    i += 1;
                }
            }
        }
    }

    /// True while inside an OSC body (including a pending ST).
    pub fn is_in_osc(&self) -> bool {
        matches!(self.state, ScannerState::InOsc | ScannerState::OscEscEnd)
    }

    /// True in any non-Normal state: the current bytes are part of an
    /// incomplete sequence and must be buffered, not fed downstream.
    pub fn needs_more_data(&self) -> bool {
        self.state != ScannerState::Normal
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ScannerState::Normal;
    }

    /// Complete OSC sequences seen since construction or the last
    /// [`reset_completed_count`](Self::reset_completed_count).
    pub fn completed_count(&self) -> u32 {
        self.completed
    }

    pub fn reset_completed_count(&mut self) {
        self.completed = 0;
    }
}

/// Strip the `ESC ]` prefix and `BEL` / `ESC \` terminator from a complete
/// OSC frame, yielding the sequence body for the command parser. Returns
/// `None` when the bytes are not a complete OSC frame or the body is not
/// UTF-8.
pub fn frame_body(frame: &[u8]) -> Option<&str> {
    let body = frame.strip_prefix(b"\x1b]")?;
    let body = body
        .strip_suffix(&[BEL])
        .or_else(|| body.strip_suffix(b"\x1b\\"))?;
    std::str::from_utf8(body).ok()
}
