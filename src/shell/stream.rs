//! Line assembly for interactive shell output.
//!
//! Reads from an interactive session split lines, multi-byte characters and
//! terminal control sequences at arbitrary points. The assembler keeps a
//! carry-over buffer of raw bytes and only interprets complete lines, so the
//! completion sentinel is matched against the assembled line stream rather
//! than against individual reads.

use tracing::debug;
use uuid::Uuid;

/// Marker substituted for the echoed sentinel command.
pub const END_MARKER: &str = "---END---";

/// Unique completion marker echoed after every command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sentinel {
    value: String,
    command: String,
}

impl Sentinel {
    /// Draws a fresh sentinel.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_value(format!("+++END-{}+++", Uuid::new_v4().simple()))
    }

    /// Builds a sentinel around a caller-chosen value.
    #[must_use]
    pub fn from_value(value: impl Into<String>) -> Self {
        let rendered = value.into();
        let command = format!("echo '{rendered}'");
        Self {
            value: rendered,
            command,
        }
    }

    /// Text the remote shell prints when the sentinel command runs.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Literal command line sent to the remote shell.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Lines collected by a single read loop.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Assembled {
    /// Complete lines seen before the sentinel (or before the loop ended).
    pub lines: Vec<String>,
    /// Whether the sentinel value was observed.
    pub complete: bool,
}

/// Accumulates raw session bytes into cleaned lines.
#[derive(Debug)]
pub struct LineAssembler {
    host: String,
    carry: Vec<u8>,
    lines: Vec<String>,
    complete: bool,
    skip_blank: bool,
}

impl LineAssembler {
    /// Creates an assembler whose display lines are tagged with `host`.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            carry: Vec::new(),
            lines: Vec::new(),
            complete: false,
            skip_blank: false,
        }
    }

    /// Discards all state ahead of a new read loop.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.lines.clear();
        self.complete = false;
    }

    /// Feeds a chunk of raw bytes.
    ///
    /// Returns `true` once a complete line carrying the sentinel value has
    /// been assembled. Lines after the sentinel are left unread.
    pub fn push(&mut self, chunk: &[u8], sentinel: Option<&Sentinel>) -> bool {
        if self.complete {
            return true;
        }
        self.carry.extend_from_slice(chunk);

        while let Some(position) = self.carry.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.carry.drain(..=position).collect();
            let (line, redraw) = clean_line(raw.strip_suffix(b"\n").unwrap_or(&raw));
            let rewritten = match sentinel {
                Some(marker) => line.replace(marker.command(), END_MARKER),
                None => line,
            };

            if sentinel.is_some_and(|marker| rewritten.contains(marker.value())) {
                self.complete = true;
                return true;
            }

            self.display(&rewritten, redraw);
            self.lines.push(rewritten);
        }
        false
    }

    /// Flushes the partial line to the display log and returns the collected
    /// lines. The partial line itself (usually a prompt) is not captured.
    pub fn finish(&mut self) -> Assembled {
        if !self.complete && !self.carry.is_empty() {
            let raw = std::mem::take(&mut self.carry);
            let (partial, redraw) = clean_line(&raw);
            self.display(&partial, redraw);
        }
        self.carry.clear();
        Assembled {
            lines: std::mem::take(&mut self.lines),
            complete: std::mem::replace(&mut self.complete, false),
        }
    }

    fn display(&mut self, line: &str, redraw: bool) {
        if redraw {
            return;
        }
        if line.is_empty() {
            if self.skip_blank {
                return;
            }
            self.skip_blank = true;
        } else {
            self.skip_blank = false;
        }
        debug!(host = %self.host, "{line}");
    }
}

/// Decodes a raw line, normalising the line ending and removing terminal
/// control sequences. The flag reports a line that still ended in a carriage
/// return, i.e. a progress redraw.
fn clean_line(raw: &[u8]) -> (String, bool) {
    let decoded = String::from_utf8_lossy(raw);
    let without_cr = decoded.strip_suffix('\r').unwrap_or(&decoded);
    let redraw = without_cr.ends_with('\r');
    (strip_control_sequences(without_cr), redraw)
}

/// Removes ANSI/VT escape sequences (CSI, OSC and two-byte escapes).
#[must_use]
pub fn strip_control_sequences(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\u{1b}' {
            cleaned.push(ch);
            continue;
        }

        match chars.next() {
            Some('[') => {
                while chars.next_if(|c| ('\u{30}'..='\u{3f}').contains(c)).is_some() {}
                while chars.next_if(|c| ('\u{20}'..='\u{2f}').contains(c)).is_some() {}
                chars.next_if(|c| ('\u{40}'..='\u{7e}').contains(c));
            }
            Some(']') => {
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' {
                        chars.next_if_eq(&'\\');
                        break;
                    }
                }
            }
            Some(c) if ('\u{30}'..='\u{7e}').contains(&c) => {}
            Some(c) => {
                cleaned.push(ch);
                cleaned.push(c);
            }
            None => {}
        }
    }

    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sentinel() -> Sentinel {
        Sentinel::from_value("+++END+++")
    }

    #[rstest]
    #[case("plain text", "plain text")]
    #[case("\u{1b}[01;32muser@host\u{1b}[00m:~$ ", "user@host:~$ ")]
    #[case("\u{1b}]0;user@host: ~\u{7}prompt", "prompt")]
    #[case("\u{1b}[?2004hready", "ready")]
    #[case("\u{1b}=keypad", "keypad")]
    #[case("\u{1b}7saved\u{1b}8\u{1b}>", "saved")]
    fn strips_control_sequences(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_control_sequences(input), expected);
    }

    #[test]
    fn carries_partial_lines_across_chunks() {
        let mut assembler = LineAssembler::new("host");
        let marker = sentinel();

        assert!(!assembler.push(b"hel", Some(&marker)));
        assert!(!assembler.push(b"lo\r", Some(&marker)));
        assert!(!assembler.push(b"\nwor", Some(&marker)));
        assert!(assembler.push(b"ld\n+++END+++\r\n$ ", Some(&marker)));

        let assembled = assembler.finish();
        assert!(assembled.complete);
        assert_eq!(assembled.lines, vec!["hello", "world"]);
    }

    #[test]
    fn rewrites_echoed_sentinel_command_split_across_reads() {
        let mut assembler = LineAssembler::new("host");
        let marker = sentinel();

        assert!(!assembler.push(b"$ echo '+++E", Some(&marker)));
        assert!(!assembler.push(b"ND+++'\r\n", Some(&marker)));
        assert!(assembler.push(b"+++END+++\r\n", Some(&marker)));

        let assembled = assembler.finish();
        assert_eq!(assembled.lines, vec![format!("$ {END_MARKER}")]);
    }

    #[test]
    fn finish_without_sentinel_reports_incomplete() {
        let mut assembler = LineAssembler::new("host");

        assembler.push(b"Welcome\r\nLast login: today\r\n$ ", None);
        let assembled = assembler.finish();

        assert!(!assembled.complete);
        assert_eq!(assembled.lines, vec!["Welcome", "Last login: today"]);
    }

    #[test]
    fn decodes_multibyte_characters_split_across_reads() {
        let mut assembler = LineAssembler::new("host");
        let bytes = "caf\u{e9}\n".as_bytes();
        let (head, tail) = bytes.split_at(4);

        assembler.push(head, None);
        assembler.push(tail, None);

        assert_eq!(assembler.finish().lines, vec!["caf\u{e9}"]);
    }

    #[test]
    fn reset_discards_previous_lines() {
        let mut assembler = LineAssembler::new("host");
        assembler.push(b"stale\npartial", None);

        assembler.reset();
        assembler.push(b"fresh\n", None);

        assert_eq!(assembler.finish().lines, vec!["fresh"]);
    }

    #[test]
    fn generated_sentinels_are_unique() {
        let first = Sentinel::generate();
        let second = Sentinel::generate();

        assert_ne!(first.value(), second.value());
        assert_eq!(first.command(), format!("echo '{}'", first.value()));
    }
}
