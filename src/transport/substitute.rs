//! `{VERSION}` token substitution. The encoding depends on the token's
//! syntactic position: shell-quoted in command templates, percent-encoded
//! in URLs, JSON-string-escaped in request bodies.

pub const VERSION_TOKEN: &str = "{VERSION}";

/// Single-quote a value for POSIX shells; embedded single quotes are
/// rewritten as `'\''`.
pub fn shell_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Substitute into a shell template. The value is always quoted, so a
/// hostile version string cannot break out of its argv position.
pub fn substitute_shell(template: &str, version: &str) -> String {
    template.replace(VERSION_TOKEN, &shell_quote(version))
}

/// Substitute into a URL; the value is percent-encoded.
pub fn substitute_url(url: &str, version: &str) -> String {
    url.replace(VERSION_TOKEN, &urlencoding::encode(version))
}

/// Substitute into a request body, escaping for a JSON string position.
pub fn substitute_body(body: &str, version: &str) -> String {
    // to_string on a &str yields a quoted JSON string; strip the quotes to
    // get just the escaped payload.
    let escaped = serde_json::to_string(version).unwrap_or_else(|_| "\"\"".to_string());
    let inner = &escaped[1..escaped.len() - 1];
    body.replace(VERSION_TOKEN, inner)
}
