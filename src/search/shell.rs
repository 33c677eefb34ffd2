//! Shell quoting for remote command construction
//!
//! Every user-supplied fragment that ends up inside a remote shell command
//! (search patterns, paths, globs) must pass through [`shell_quote`]. This
//! is the only quoting primitive in the crate; command builders are not
//! allowed to interpolate raw strings. Getting this wrong is remote command
//! injection, so the rules live in one place and are tested in one place.

/// Quote `value` so a POSIX shell treats it as one literal word.
///
/// Technique: wrap in single quotes and replace each literal single quote
/// with `'\''` (close quote, escaped quote, reopen quote). Inside single
/// quotes the shell expands nothing, so `$`, backticks, `;`, `|`, newlines
/// and globs all pass through verbatim.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Quote every value and join with single spaces. Convenience for builders
/// that append a list of roots or glob arguments.
pub fn shell_quote_all<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| shell_quote(v.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
