//! Markdown → Telegram HTML rendering and message splitting.
//!
//! AI responses arrive as loose Markdown.  Telegram's HTML parse mode only
//! understands a handful of tags, so the conversion is deliberately small:
//! fenced code, headings, bullets, bold, italic, inline code and links.
//! Everything else is escaped and passed through as text.

/// Telegram rejects messages longer than this many characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Render `markdown` into HTML chunks that each fit in one message.
///
/// Splitting happens on the Markdown source so tags are never cut in half;
/// a piece whose rendering overflows the limit is split again.
pub fn render_chunks(markdown: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    for piece in split_message(markdown, limit) {
        push_rendered(&piece, limit, &mut out);
    }
    out
}

fn push_rendered(piece: &str, limit: usize, out: &mut Vec<String>) {
    let html = markdown_to_html(piece);
    let len = piece.chars().count();
    if html.chars().count() <= limit || len <= 1 {
        if !html.trim().is_empty() {
            out.push(html);
        }
        return;
    }
    for smaller in split_message(piece, (len / 2).max(1)) {
        push_rendered(&smaller, limit, out);
    }
}

/// Split `text` into pieces of at most `max_chars` characters, preferring a
/// newline, then a space, as the cut point.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        // Byte offset of the first char past the limit, if any.
        let limit = match rest.char_indices().nth(max_chars) {
            Some((idx, _)) => idx,
            None => {
                chunks.push(rest.to_string());
                break;
            }
        };

        let window = &rest[..limit];
        let cut = match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(0) | None => limit,
            Some(i) => i,
        };

        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start_matches([' ', '\n']);
    }
    chunks
}

/// Escape the characters Telegram HTML treats specially.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

/// Convert Markdown to the HTML subset Telegram accepts.
pub fn markdown_to_html(md: &str) -> String {
    let mut html = String::with_capacity(md.len() + md.len() / 4);
    let mut lines = md.lines();

    while let Some(line) = lines.next() {
        if line.trim_start().starts_with("```") {
            let mut code = Vec::new();
            for inner in lines.by_ref() {
                if inner.trim_start().starts_with("```") {
                    break;
                }
                code.push(inner);
            }
            html.push_str("<pre><code>");
            html.push_str(&escape_html(&code.join("\n")));
            html.push_str("</code></pre>\n");
            continue;
        }

        let escaped = escape_html(line);
        let trimmed = escaped.trim_start();

        if let Some(heading) = heading_text(trimmed) {
            html.push_str("<b>");
            html.push_str(&inline(heading));
            html.push_str("</b>\n");
            continue;
        }

        match trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
            Some(item) => {
                html.push_str("• ");
                html.push_str(&inline(item));
            }
            None => html.push_str(&inline(&escaped)),
        }
        html.push('\n');
    }

    while html.ends_with('\n') {
        html.pop();
    }
    html
}

fn heading_text(line: &str) -> Option<&str> {
    let after = line.trim_start_matches('#');
    if after.len() == line.len() || line.len() - after.len() > 6 {
        return None;
    }
    after.strip_prefix(' ').map(str::trim)
}

/// Inline spans on one already-escaped line.
fn inline(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '`' {
            if let Some(end) = find(&chars, i + 1, |j| chars[j] == '`') {
                wrap(&mut out, "code", &chars[i + 1..end]);
                i = end + 1;
                continue;
            }
        }

        if c == '*' && chars.get(i + 1) == Some(&'*') {
            if let Some(end) = find(&chars, i + 2, |j| {
                chars[j] == '*' && chars.get(j + 1) == Some(&'*')
            }) {
                out.push_str("<b>");
                out.push_str(&inline(&chars[i + 2..end].iter().collect::<String>()));
                out.push_str("</b>");
                i = end + 2;
                continue;
            }
        }

        if c == '[' {
            if let Some((text, url, next)) = link(&chars, i) {
                out.push_str("<a href=\"");
                out.push_str(&url);
                out.push_str("\">");
                out.push_str(&text);
                out.push_str("</a>");
                i = next;
                continue;
            }
        }

        // `_x_` only at a word start, so snake_case survives.
        if c == '_' && (i == 0 || chars[i - 1].is_whitespace()) {
            if let Some(end) = find(&chars, i + 1, |j| chars[j] == '_') {
                let closes_word = chars
                    .get(end + 1)
                    .map_or(true, |n| n.is_whitespace() || n.is_ascii_punctuation());
                if end > i + 1 && closes_word {
                    wrap(&mut out, "i", &chars[i + 1..end]);
                    i = end + 1;
                    continue;
                }
            }
        }

        if c == '*' && chars.get(i + 1).is_some_and(|n| !n.is_whitespace() && *n != '*') {
            if let Some(end) = find(&chars, i + 2, |j| {
                chars[j] == '*' && chars.get(j + 1) != Some(&'*')
            }) {
                wrap(&mut out, "i", &chars[i + 1..end]);
                i = end + 1;
                continue;
            }
        }

        out.push(c);
        i += 1;
    }
    out
}

fn find(chars: &[char], from: usize, pred: impl Fn(usize) -> bool) -> Option<usize> {
    (from..chars.len()).find(|&j| pred(j))
}

fn wrap(out: &mut String, tag: &str, inner: &[char]) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.extend(inner);
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

/// `[text](url)` starting at `start`; returns text, url and the index after `)`.
fn link(chars: &[char], start: usize) -> Option<(String, String, usize)> {
    let close = find(chars, start + 1, |j| chars[j] == ']')?;
    if chars.get(close + 1) != Some(&'(') {
        return None;
    }
    let paren = find(chars, close + 2, |j| chars[j] == ')')?;
    let text: String = chars[start + 1..close].iter().collect();
    let url: String = chars[close + 2..paren].iter().collect();
    if url.is_empty() {
        return None;
    }
    Some((text, url, paren + 1))
}
