use crate::error::TuskerError;
use crate::sql::SENTINEL_PREFIX;

/// A slice of a fragment's SQL: literal text, or a local placeholder
/// with its 1-based index.
pub(super) enum Piece<'a> {
    Text(&'a str),
    Placeholder(usize),
}

#[derive(Clone)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

/// Split a fragment's SQL into text runs and local placeholders.
///
/// Quoted strings, comments, and dollar-quoted blocks are passed
/// through untouched, so a sentinel-shaped sequence inside an escaped
/// literal never turns into a placeholder.
pub(super) fn split_sentinels(sql: &str) -> Result<Vec<Piece<'_>>, TuskerError> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut state = State::Normal;
    let mut text_start = 0;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => state = State::BlockComment(1),
                b'$' => {
                    if bytes[idx..].starts_with(SENTINEL_PREFIX.as_bytes()) {
                        let digits_start = idx + SENTINEL_PREFIX.len();
                        let Some((digits_end, digits)) = scan_digits(bytes, digits_start) else {
                            return Err(TuskerError::InvalidInput(format!(
                                "reserved placeholder prefix {SENTINEL_PREFIX} without an index"
                            )));
                        };
                        let index: usize = digits.parse().map_err(|_| {
                            TuskerError::InvalidInput(format!(
                                "placeholder index {digits} is out of range"
                            ))
                        })?;
                        if text_start < idx {
                            pieces.push(Piece::Text(&sql[text_start..idx]));
                        }
                        pieces.push(Piece::Placeholder(index));
                        idx = digits_end;
                        text_start = idx;
                        continue;
                    }
                    if let Some((tag, advance)) = try_start_dollar_quote(bytes, idx) {
                        state = State::DollarQuoted(tag);
                        idx = advance;
                    }
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                } else if is_block_comment_end(bytes, idx) {
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                }
            }
            State::DollarQuoted(ref tag) => {
                if b == b'$' && matches_tag(bytes, idx, tag) {
                    let tag_len = tag.len();
                    state = State::Normal;
                    idx += tag_len;
                }
            }
        }

        idx += 1;
    }

    if text_start < sql.len() {
        pieces.push(Piece::Text(&sql[text_start..]));
    }

    Ok(pieces)
}

fn scan_digits(bytes: &[u8], start: usize) -> Option<(usize, &str)> {
    let mut idx = start;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == start {
        None
    } else {
        std::str::from_utf8(&bytes[start..idx])
            .ok()
            .map(|digits| (idx, digits))
    }
}

fn is_line_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'-') && bytes.get(idx + 1) == Some(&b'-')
}

fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        idx += 1;
    }

    if idx < bytes.len() && bytes[idx] == b'$' {
        let tag = String::from_utf8(bytes[start + 1..idx].to_vec()).ok()?;
        Some((tag, idx))
    } else {
        None
    }
}

fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    end < bytes.len()
        && bytes[idx + 1..=end].starts_with(tag.as_bytes())
        && bytes.get(end) == Some(&b'$')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(sql: &str) -> Vec<String> {
        split_sentinels(sql)
            .unwrap()
            .into_iter()
            .map(|p| match p {
                Piece::Text(t) => t.to_string(),
                Piece::Placeholder(n) => format!("<{n}>"),
            })
            .collect()
    }

    #[test]
    fn splits_sentinels_from_text() {
        assert_eq!(
            rendered("SELECT $tusker_1 + $tusker_2"),
            vec!["SELECT ", "<1>", " + ", "<2>"]
        );
    }

    #[test]
    fn adjacent_sentinels_do_not_open_a_dollar_quote() {
        assert_eq!(rendered("$tusker_1$tusker_2"), vec!["<1>", "<2>"]);
    }

    #[test]
    fn skips_literals_and_comments() {
        assert_eq!(
            rendered("SELECT '$tusker_1', $tusker_1 -- $tusker_2\n/* $tusker_3 */"),
            vec![
                "SELECT '$tusker_1', ",
                "<1>",
                " -- $tusker_2\n/* $tusker_3 */"
            ]
        );
    }

    #[test]
    fn skips_dollar_quoted_blocks() {
        assert_eq!(
            rendered("$fn$ $tusker_1 $fn$ || $tusker_1"),
            vec!["$fn$ $tusker_1 $fn$ || ", "<1>"]
        );
    }

    #[test]
    fn rejects_prefix_without_index() {
        assert!(split_sentinels("SELECT $tusker_x").is_err());
    }
}
