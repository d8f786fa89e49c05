//! Quoting for strings that cross the shell and SQL boundaries during
//! dumps, replay, and credential resync.

/// Wrap in single quotes for `sh -c`; embedded quotes become `'\''`.
pub fn shell_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Double-quoted SQL identifier, `"` doubled.
pub fn sql_quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Single-quoted SQL literal, `'` doubled.
pub fn sql_quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
