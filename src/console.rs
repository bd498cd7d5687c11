//! The operator's console.
//!
//! The workflow never touches standard input or output directly. Everything the operator sees or
//! types goes through a [`Console`], which lets the shell redirect it (eg. to a dedicated virtual
//! terminal) and lets tests script it.

use std::io::{self, BufRead, Write};

/// Line-oriented access to the operator.
///
/// Implementations must be usable from the bus executor as well as from the workflow's own
/// thread, since credential prompts are answered from inside D-Bus method handlers.
pub trait Console: Send + Sync {
    /// Shows a single line of output to the operator.
    fn say(&self, line: &str);

    /// Shows `question` and reads one line of input.
    ///
    /// Returns [`None`] if the operator closed the input (end of file) or reading failed. The
    /// returned line has its line terminator removed.
    fn ask(&self, question: &str) -> Option<String>;
}

/// A [`Console`] on the process' standard input and output.
#[derive(Debug, Clone)]
pub struct Stdio {
    prefix: String,
}

impl Stdio {
    /// Creates a console that writes `prefix` in front of every line.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Console for Stdio {
    fn say(&self, line: &str) {
        let mut out = io::stdout().lock();
        // Nothing sensible to do if the terminal went away.
        let _ = writeln!(out, "{}{}", self.prefix, line);
        let _ = out.flush();
    }

    fn ask(&self, question: &str) -> Option<String> {
        {
            let mut out = io::stdout().lock();
            let _ = write!(out, "{}{}", self.prefix, question);
            let _ = out.flush();
        }

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(strip_newline(line)),
            Err(e) => {
                log::warn!("failed to read from stdin: {}", e);
                None
            }
        }
    }
}

fn strip_newline(mut line: String) -> String {
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

/// The operator's answer to a numbered selection list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// A 0-based index into the list.
    Index(usize),
    /// A number past the end of the list.
    Unknown(usize),
    /// The operator backed out (no input, a non-numeric answer, or a number below 1).
    Abort,
}

impl Selection {
    /// Interprets an answer to a list of `count` entries numbered from 1.
    ///
    /// Like C's `strtol`, only the leading integer (after optional whitespace and sign) is
    /// considered, so `"2 please"` selects the second entry.
    pub fn parse(answer: Option<&str>, count: usize) -> Self {
        let Some(answer) = answer else {
            return Self::Abort;
        };

        let s = answer.trim_start();
        let (negative, s) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        let digits = s.bytes().take_while(u8::is_ascii_digit).count();
        if negative || digits == 0 {
            return Self::Abort;
        }

        // Anything too large to represent is certainly past the end of the list.
        let n = s[..digits].parse::<usize>().unwrap_or(usize::MAX);
        match n {
            0 => Self::Abort,
            n if n > count => Self::Unknown(n),
            n => Self::Index(n - 1),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection() {
        assert_eq!(Selection::parse(Some("1"), 3), Selection::Index(0));
        assert_eq!(Selection::parse(Some("  3\n"), 3), Selection::Index(2));
        assert_eq!(Selection::parse(Some("+2"), 3), Selection::Index(1));
        assert_eq!(Selection::parse(Some("2 please"), 3), Selection::Index(1));
        assert_eq!(Selection::parse(Some("4"), 3), Selection::Unknown(4));
        assert_eq!(
            Selection::parse(Some("99999999999999999999999"), 3),
            Selection::Unknown(usize::MAX)
        );
    }

    #[test]
    fn selection_abort() {
        assert_eq!(Selection::parse(None, 3), Selection::Abort);
        assert_eq!(Selection::parse(Some(""), 3), Selection::Abort);
        assert_eq!(Selection::parse(Some("0"), 3), Selection::Abort);
        assert_eq!(Selection::parse(Some("-1"), 3), Selection::Abort);
        assert_eq!(Selection::parse(Some("HomeNet"), 3), Selection::Abort);
        assert_eq!(Selection::parse(Some("1"), 0), Selection::Unknown(1));
    }

    #[test]
    fn newline_stripping() {
        assert_eq!(strip_newline("s3cret\r\n".into()), "s3cret");
        assert_eq!(strip_newline("s3cret".into()), "s3cret");
        assert_eq!(strip_newline("\n".into()), "");
    }
}
