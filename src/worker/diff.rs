//! Whitespace-insensitive output comparison.
//!
//! Lines are compared token by token. Spacing inside a line, trailing
//! whitespace, `\r\n` line endings and blank lines anywhere are ignored.

use std::fmt;

/// First difference between an answer and an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// 1-based index among non-blank lines.
    pub line: usize,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}: expected {:?}, got {:?}",
            self.line, self.expected, self.actual
        )
    }
}

impl std::error::Error for Mismatch {}

const EOF: &str = "<EOF>";

fn content_lines(text: &str) -> impl Iterator<Item = Vec<&str>> {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|tokens| !tokens.is_empty())
}

pub fn compare(expected: &[u8], actual: &[u8]) -> Result<(), Mismatch> {
    let expected = String::from_utf8_lossy(expected);
    let actual = String::from_utf8_lossy(actual);
    let mut want = content_lines(&expected);
    let mut got = content_lines(&actual);

    let mut line = 0;
    loop {
        line += 1;
        match (want.next(), got.next()) {
            (None, None) => return Ok(()),
            (Some(w), Some(g)) if w == g => continue,
            (w, g) => {
                return Err(Mismatch {
                    line,
                    expected: w.map(|t| t.join(" ")).unwrap_or_else(|| EOF.to_string()),
                    actual: g.map(|t| t.join(" ")).unwrap_or_else(|| EOF.to_string()),
                })
            }
        }
    }
}
