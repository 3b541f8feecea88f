//! Textual include-directive extraction.
//!
//! Only `#include`, `#import` and `#include_next` followed by a quoted or
//! angle-bracketed spelling are recognized. Comments are blanked out first
//! (line structure preserved) and directives naming a macro are skipped.

use std::path::Path;

use super::IncludeRef;
use crate::error::IncludeError;

const DIRECTIVES: [&str; 3] = ["include_next", "include", "import"];

/// Extract the include references of one file, in source order.
pub fn extract_includes(
    file: &Path,
    text: &str,
    allow_backslash_separators: bool,
) -> Result<Vec<IncludeRef>, IncludeError> {
    let code = strip_comments(text);
    let mut refs = Vec::new();

    for (index, line) in code.lines().enumerate() {
        let line_no = index + 1;
        let Some(rest) = line.trim_start().strip_prefix('#') else {
            continue;
        };
        let rest = rest.trim_start();
        let Some(rest) = DIRECTIVES
            .iter()
            .find_map(|d| rest.strip_prefix(d))
        else {
            continue;
        };
        // `#includes` or `#important` are not directives.
        if rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        let rest = rest.trim_start();

        let (angled, close) = match rest.chars().next() {
            Some('"') => (false, '"'),
            Some('<') => (true, '>'),
            // Macro include; the spelling is not known textually.
            _ => continue,
        };
        let body = &rest[1..];
        let Some(end) = body.find(close) else {
            return Err(IncludeError::MalformedDirective {
                file: file.to_path_buf(),
                line: line_no,
                spelling: body.trim_end().to_owned(),
            });
        };
        let spelling = &body[..end];
        validate_spelling(file, line_no, spelling, allow_backslash_separators)?;

        refs.push(IncludeRef {
            spelling: spelling.to_owned(),
            angled,
            line: line_no,
        });
    }

    Ok(refs)
}

fn validate_spelling(
    file: &Path,
    line: usize,
    spelling: &str,
    allow_backslash_separators: bool,
) -> Result<(), IncludeError> {
    let malformed = spelling.trim().is_empty()
        || spelling
            .chars()
            .any(|c| c.is_control() || matches!(c, '*' | '?' | '|' | '"' | '<' | '>'));
    if malformed {
        return Err(IncludeError::MalformedDirective {
            file: file.to_path_buf(),
            line,
            spelling: spelling.to_owned(),
        });
    }
    if !allow_backslash_separators && spelling.contains('\\') {
        return Err(IncludeError::WrongSeparator {
            file: file.to_path_buf(),
            line,
            spelling: spelling.to_owned(),
        });
    }
    Ok(())
}

/// Replace `//` and `/* */` comments with whitespace, keeping newlines so
/// line numbers survive. String and character literals are left alone.
fn strip_comments(text: &str) -> String {
    #[derive(Clone, Copy)]
    enum State {
        Code,
        Line,
        Block,
        Literal(char),
    }

    let mut out = String::with_capacity(text.len());
    let mut state = State::Code;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            State::Code => match ch {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::Line;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push(' ');
                    state = State::Block;
                }
                '"' | '\'' => {
                    out.push(ch);
                    state = State::Literal(ch);
                }
                _ => out.push(ch),
            },
            State::Line => {
                if ch == '\n' {
                    out.push('\n');
                    state = State::Code;
                }
            }
            State::Block => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                } else if ch == '\n' {
                    out.push('\n');
                }
            }
            State::Literal(quote) => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(&next) = chars.peek() {
                        if next != '\n' {
                            out.push(next);
                            chars.next();
                        }
                    }
                } else if ch == quote || ch == '\n' {
                    state = State::Code;
                }
            }
        }
    }

    out
}
