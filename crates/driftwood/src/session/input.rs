//! Echo tracking over outbound input bytes.
//!
//! The session watches what it writes to the child to reconstruct the
//! command line being typed: carriage return / line feed submits it,
//! backspace trims it, tab is swallowed (completion may rewrite the line
//! shell-side), and escape sequences pass through without becoming input.

use unicode_segmentation::UnicodeSegmentation;

const ESC: u8 = 0x1b;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EchoState {
    Plain,
    Escape,
    Csi,
}

#[derive(Debug)]
pub(crate) struct InputTracker {
    state: EchoState,
    pending: Vec<u8>,
}

impl InputTracker {
    pub fn new() -> Self {
        InputTracker {
            state: EchoState::Plain,
            pending: Vec::new(),
        }
    }

    /// Consumes one outbound byte; returns the submitted command line when
    /// the byte completes one.
    pub fn feed(&mut self, byte: u8) -> Option<String> {
        match self.state {
            EchoState::Plain => match byte {
                ESC => {
                    self.state = EchoState::Escape;
                    None
                }
                b'\r' | b'\n' => {
                    let line = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    Some(line)
                }
                BACKSPACE | DELETE => {
                    self.pop_last_char();
                    None
                }
                b'\t' => None,
                byte if byte >= 0x20 => {
                    self.pending.push(byte);
                    None
                }
                _ => None,
            },
            EchoState::Escape => {
                self.state = if byte == b'[' {
                    EchoState::Csi
                } else {
                    EchoState::Plain
                };
                None
            }
            EchoState::Csi => {
                if (0x40..=0x7e).contains(&byte) {
                    self.state = EchoState::Plain;
                }
                None
            }
        }
    }

    /// Drops the last grapheme from the pending line, falling back to one
    /// scalar when the buffer ends mid-sequence.
    fn pop_last_char(&mut self) {
        let cut = match std::str::from_utf8(&self.pending) {
            Ok(text) => text.grapheme_indices(true).last().map(|(offset, _)| offset),
            Err(_) => None,
        };
        match cut {
            Some(offset) => self.pending.truncate(offset),
            None => {
                while let Some(byte) = self.pending.pop() {
                    if byte & 0xc0 != 0x80 {
                        break;
                    }
                }
            }
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn pending_line(&self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.state = EchoState::Plain;
    }
}
