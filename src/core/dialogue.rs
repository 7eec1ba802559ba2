//! Dialogue span detection for rendered prose.
//!
//! A single left-to-right scan wraps quoted dialogue in
//! `<span class="dialogue">` for styling. Three quote-matching branches are
//! tried in order at each position; when none matches (or no closing
//! delimiter exists) the character is emitted through the same escaping
//! routine used inside spans, so the output is injection-safe either way.
//! Greedy and non-backtracking: malformed quotation degrades to literal
//! text instead of erroring.

const TYPOGRAPHIC_PAIRS: [(char, char); 3] = [('\u{201C}', '\u{201D}'), ('\u{2018}', '\u{2019}'), ('«', '»')];

fn is_word(c: Option<char>) -> bool {
    matches!(c, Some(c) if c.is_ascii_alphanumeric() || c == '_')
}

/// Boundary = string edge or non-word character.
fn is_boundary(c: Option<char>) -> bool {
    !is_word(c)
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        '\'' => out.push_str("&#39;"),
        _ => out.push(c),
    }
}

fn push_span(out: &mut String, span: &[char]) {
    out.push_str("<span class=\"dialogue\">");
    for &c in span {
        push_escaped(out, c);
    }
    out.push_str("</span>");
}

fn typographic_close(open: char) -> Option<char> {
    TYPOGRAPHIC_PAIRS
        .iter()
        .find(|(o, _)| *o == open)
        .map(|&(_, c)| c)
}

/// Next straight double quote not preceded by a backslash.
fn find_closing_dquote(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len()).find(|&j| chars[j] == '"' && chars[j - 1] != '\\')
}

/// Next straight single quote that closes a span: not flanked by word
/// characters on both sides (a mid-word apostrophe), and followed by a
/// boundary.
fn find_closing_squote(chars: &[char], from: usize) -> Option<usize> {
    (from..chars.len()).find(|&j| {
        chars[j] == '\''
            && !(is_word(chars.get(j - 1).copied()) && is_word(chars.get(j + 1).copied()))
            && is_boundary(chars.get(j + 1).copied())
    })
}

pub fn mark_dialogue(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 32);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let prev = if i == 0 { None } else { Some(chars[i - 1]) };

        if let Some(close) = typographic_close(c) {
            if let Some(end) = (i + 1..chars.len()).find(|&j| chars[j] == close) {
                push_span(&mut out, &chars[i..=end]);
                i = end + 1;
                continue;
            }
            // unmatched open glyph: literal
        } else if c == '"' && is_boundary(prev) {
            if let Some(end) = find_closing_dquote(&chars, i + 1) {
                push_span(&mut out, &chars[i..=end]);
                i = end + 1;
                continue;
            }
        } else if c == '\'' && is_boundary(prev) {
            if let Some(end) = find_closing_squote(&chars, i + 1) {
                push_span(&mut out, &chars[i..=end]);
                i = end + 1;
                continue;
            }
        }

        push_escaped(&mut out, c);
        i += 1;
    }

    out
}
