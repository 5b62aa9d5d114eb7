//! Pragmatic markdown-to-node renderer for streamed assistant output.
//!
//! The input buffer grows as response fragments arrive and is re-parsed in
//! full after every fragment, so `parse` keeps no state between calls and
//! must tolerate a buffer that is a prefix of the final text: an open code
//! fence at end-of-buffer still renders with everything accumulated so far.
//!
//! Only a subset of markdown is handled (headings 1-3, ordered/unordered
//! lists, fenced and inline code, bold, italic). Inline markers resolve by
//! a strict first-match-left-to-right rule rather than CommonMark
//! precedence, so pathological inputs like `**a*b**` parse deterministically
//! but not the way a full parser would.

const FENCE: &str = "```";

#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Heading { level: u8, text: String },
    CodeBlock { language: String, code: String, closed: bool },
    OrderedList(Vec<Vec<Span>>),
    UnorderedList(Vec<Vec<Span>>),
    Paragraph(Vec<Span>),
    /// Vertical spacing from a blank line; consecutive blanks collapse to one.
    Spacer,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Span {
    Text(String),
    Code(String),
    Bold(String),
    Italic(String),
}

/// Parse the full buffer accumulated so far into display blocks.
pub fn parse(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut blocks: Vec<Block> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix(FENCE) {
            let language = rest.trim().to_string();
            let mut body: Vec<&str> = Vec::new();
            let mut closed = false;
            i += 1;
            while i < lines.len() {
                if lines[i].trim() == FENCE {
                    closed = true;
                    i += 1;
                    break;
                }
                body.push(lines[i]);
                i += 1;
            }
            // Stream may still be mid-fence; render what we have.
            blocks.push(Block::CodeBlock {
                language,
                code: body.join("\n"),
                closed,
            });
            continue;
        }

        if let Some(text) = line.strip_prefix("# ") {
            blocks.push(Block::Heading {
                level: 1,
                text: text.to_string(),
            });
        } else if let Some(text) = line.strip_prefix("## ") {
            blocks.push(Block::Heading {
                level: 2,
                text: text.to_string(),
            });
        } else if let Some(text) = line.strip_prefix("### ") {
            blocks.push(Block::Heading {
                level: 3,
                text: text.to_string(),
            });
        } else if ordered_item(line).is_some() {
            let mut items = Vec::new();
            while i < lines.len() {
                match ordered_item(lines[i]) {
                    Some(content) => {
                        items.push(parse_inline(content));
                        i += 1;
                    }
                    None => break,
                }
            }
            blocks.push(Block::OrderedList(items));
            continue;
        } else if unordered_item(line).is_some() {
            let mut items = Vec::new();
            while i < lines.len() {
                match unordered_item(lines[i]) {
                    Some(content) => {
                        items.push(parse_inline(content));
                        i += 1;
                    }
                    None => break,
                }
            }
            blocks.push(Block::UnorderedList(items));
            continue;
        } else if trimmed.is_empty() {
            if !matches!(blocks.last(), None | Some(Block::Spacer)) {
                blocks.push(Block::Spacer);
            }
        } else {
            blocks.push(Block::Paragraph(parse_inline(line)));
        }

        i += 1;
    }

    blocks
}

/// `<digits>. ` list marker; returns the item content after the marker.
fn ordered_item(line: &str) -> Option<&str> {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let rest = line[digits..].strip_prefix('.')?;
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_whitespace() => Some(chars.as_str()),
        _ => None,
    }
}

/// `- ` or `* ` list marker; returns the item content after the marker.
fn unordered_item(line: &str) -> Option<&str> {
    let rest = line
        .strip_prefix('-')
        .or_else(|| line.strip_prefix('*'))?;
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_whitespace() => Some(chars.as_str()),
        _ => None,
    }
}

/// Inline scan: code spans first, then bold/italic on the rest. Text before
/// a code span is scanned for emphasis only, so code never nests.
pub fn parse_inline(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if let Some((start, end, content)) = find_code_span(rest) {
            if start > 0 {
                parse_emphasis(&rest[..start], &mut spans);
            }
            spans.push(Span::Code(content.to_string()));
            rest = &rest[end..];
            continue;
        }
        parse_emphasis(rest, &mut spans);
        break;
    }

    spans
}

/// Bold before italic, first match wins, recurse on the suffix.
fn parse_emphasis(text: &str, out: &mut Vec<Span>) {
    let mut rest = text;
    while !rest.is_empty() {
        if let Some((start, end, content)) = find_bold(rest) {
            if start > 0 {
                out.push(Span::Text(rest[..start].to_string()));
            }
            out.push(Span::Bold(content.to_string()));
            rest = &rest[end..];
            continue;
        }
        if let Some((start, end, content)) = find_italic(rest) {
            if start > 0 {
                out.push(Span::Text(rest[..start].to_string()));
            }
            out.push(Span::Italic(content.to_string()));
            rest = &rest[end..];
            continue;
        }
        out.push(Span::Text(rest.to_string()));
        break;
    }
}

/// First `` `non-empty` `` pair. Byte offsets are safe to slice on because
/// the delimiters are ASCII.
fn find_code_span(text: &str) -> Option<(usize, usize, &str)> {
    let mut from = 0;
    while let Some(rel) = text[from..].find('`') {
        let open = from + rel;
        let close = text[open + 1..].find('`').map(|j| open + 1 + j)?;
        if close > open + 1 {
            return Some((open, close + 1, &text[open + 1..close]));
        }
        // Empty span: the closing backtick becomes the next candidate opener.
        from = open + 1;
    }
    None
}

/// First `**…**` with a star-free, non-empty body.
fn find_bold(text: &str) -> Option<(usize, usize, &str)> {
    let mut from = 0;
    while let Some(rel) = text[from..].find("**") {
        let open = from + rel;
        let body = &text[open + 2..];
        if let Some(star) = body.find('*') {
            if star > 0 && body.as_bytes().get(star + 1) == Some(&b'*') {
                let close = open + 2 + star;
                return Some((open, close + 2, &text[open + 2..close]));
            }
        }
        from = open + 1;
    }
    None
}

/// First `*…*` with a star-free, non-empty body.
fn find_italic(text: &str) -> Option<(usize, usize, &str)> {
    let mut from = 0;
    while let Some(rel) = text[from..].find('*') {
        let open = from + rel;
        match text[open + 1..].find('*') {
            Some(0) => from = open + 1,
            Some(j) => {
                let close = open + 1 + j;
                return Some((open, close + 1, &text[open + 1..close]));
            }
            None => return None,
        }
    }
    None
}
