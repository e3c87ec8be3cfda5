//! Identifier mangling for generated sandbox sources.
//!
//! Server and tool names come from arbitrary MCP configs; the generated
//! modules need identifier-safe, deterministic names.

/// Mangle a raw name into a valid identifier: lowercase, strip characters
/// outside `[A-Za-z0-9_]`, capitalize the letter following each dropped run
/// (camel case), and prefix an underscore when the result would start with a
/// digit.
pub fn sanitize_ident(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut capitalize_next = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            let lower = ch.to_ascii_lowercase();
            if capitalize_next && !out.is_empty() {
                out.push(lower.to_ascii_uppercase());
            } else {
                out.push(lower);
            }
            capitalize_next = false;
        } else if !out.is_empty() {
            capitalize_next = true;
        }
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Same mangling with the first letter upper-cased, for type names.
pub fn sanitize_type_name(raw: &str) -> String {
    let ident = sanitize_ident(raw);
    let mut chars = ident.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => ident,
    }
}

/// Reduce text to printable 7-bit ASCII so generated sources never depend on
/// the runner's source-encoding handling. Newlines collapse to spaces.
pub fn sanitize_ascii(text: &str) -> String {
    text.chars()
        .map(|ch| match ch {
            '\n' | '\r' | '\t' => ' ',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => ' ',
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
