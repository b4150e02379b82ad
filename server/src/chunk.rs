//! Chunker — splits source artifacts into retrieval-ready chunks.
//!
//! Code goes through tree-sitter: the tree is walked top-down and split at
//! declaration boundaries, each chunk carrying symbol metadata (name, kind,
//! signature, parent, docstring). Anything that fails to parse — or isn't a
//! recognized language — falls back to the prose path: paragraph packing
//! with sentence-boundary splitting and a character overlap between
//! neighbors. HTML is reduced to text first.

use tree_sitter::{Language, Node, Parser};

use atoll_core::types::{Symbol, SymbolKind};

/// Soft lower bound; single small declarations may go below it.
pub const MIN_CHUNK_CHARS: usize = 200;
/// Hard upper bound per chunk.
pub const MAX_CHUNK_CHARS: usize = 2000;
/// Greedy packing target.
pub const TARGET_CHUNK_CHARS: usize = 800;
/// Overlap prefixed onto prose chunks (≈15% of the target).
pub const OVERLAP_CHARS: usize = 120;

/// Standalone fragments below this size are dropped as noise.
const MIN_FRAGMENT_CHARS: usize = 40;

/// A chunk before identity and storage metadata are attached.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub content: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub symbol: Option<Symbol>,
    pub lang: Option<String>,
}

// ---------------------------------------------------------------------------
// Language resolution
// ---------------------------------------------------------------------------

fn language_for_ext(ext: &str) -> Option<Language> {
    match ext {
        "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
        "ts" | "tsx" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "js" | "jsx" | "mjs" | "cjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        "c" | "h" => Some(tree_sitter_c::LANGUAGE.into()),
        "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => Some(tree_sitter_cpp::LANGUAGE.into()),
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        _ => None,
    }
}

/// Display name recorded in the chunk's `lang` payload field.
pub fn lang_for_ext(ext: &str) -> Option<&'static str> {
    match ext {
        "rs" => Some("rust"),
        "ts" | "tsx" => Some("typescript"),
        "js" | "jsx" | "mjs" | "cjs" => Some("javascript"),
        "py" | "pyi" => Some("python"),
        "go" => Some("go"),
        "c" | "h" => Some("c"),
        "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => Some("cpp"),
        "java" => Some("java"),
        "rb" => Some("ruby"),
        "kt" | "kts" => Some("kotlin"),
        "swift" => Some("swift"),
        "cs" => Some("csharp"),
        "php" => Some("php"),
        "scala" => Some("scala"),
        "sh" | "bash" => Some("shell"),
        _ => None,
    }
}

/// Recognized programming-language extension — routes to the code encoder.
pub fn is_code_extension(ext: &str) -> bool {
    lang_for_ext(ext).is_some()
}

fn is_python(ext: &str) -> bool {
    matches!(ext, "py" | "pyi")
}
fn is_c_cpp(ext: &str) -> bool {
    matches!(ext, "c" | "h" | "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx")
}

// ---------------------------------------------------------------------------
// Declaration classification
// ---------------------------------------------------------------------------

/// Map a tree-sitter node kind onto the symbol taxonomy. `None` means "not a
/// declaration" — the walk either descends (wrapper kinds) or leaves the
/// span for gap handling.
fn classify_node(kind: &str) -> Option<SymbolKind> {
    match kind {
        // Rust
        "function_item" => Some(SymbolKind::Function),
        "struct_item" | "enum_item" | "union_item" => Some(SymbolKind::Class),
        "trait_item" => Some(SymbolKind::Interface),
        "impl_item" => Some(SymbolKind::Class),
        "mod_item" => Some(SymbolKind::Module),
        "const_item" | "static_item" => Some(SymbolKind::Constant),

        // JS/TS/Go/Java shared
        "function_declaration" => Some(SymbolKind::Function),
        "class_declaration" => Some(SymbolKind::Class),
        "interface_declaration" => Some(SymbolKind::Interface),
        "method_definition" | "method_declaration" => Some(SymbolKind::Method),
        "enum_declaration" => Some(SymbolKind::Class),
        "lexical_declaration" | "variable_declaration" => None,

        // Python
        "function_definition" => Some(SymbolKind::Function),
        "class_definition" => Some(SymbolKind::Class),

        // C / C++
        "struct_specifier" | "class_specifier" | "enum_specifier" => Some(SymbolKind::Class),
        "namespace_definition" => Some(SymbolKind::Module),

        // Java
        "constructor_declaration" => Some(SymbolKind::Method),

        _ => None,
    }
}

/// Wrapper nodes the walk descends through without emitting anything.
fn is_transparent(kind: &str) -> bool {
    matches!(
        kind,
        "export_statement"
            | "decorated_definition"
            | "declaration_list"
            | "field_declaration_list"
            | "class_body"
            | "block"
            | "body"
            | "source_file"
            | "program"
            | "module"
            | "translation_unit"
    )
}

/// Container kinds whose children should become their own chunks when the
/// container itself is too big for one.
fn is_container(kind: SymbolKind) -> bool {
    matches!(kind, SymbolKind::Class | SymbolKind::Interface | SymbolKind::Module)
}

// ---------------------------------------------------------------------------
// Symbol extraction (name, signature, docstring)
// ---------------------------------------------------------------------------

fn extract_name(node: &Node<'_>, source: &[u8]) -> Option<String> {
    for field in &["name", "type"] {
        if let Some(name_node) = node.child_by_field_name(*field) {
            if let Ok(text) = name_node.utf8_text(source) {
                let name = text.trim().to_string();
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
    }

    // C function: declarator chains down to the identifier
    if let Some(decl) = node.child_by_field_name("declarator") {
        if let Some(name_node) = decl.child_by_field_name("declarator") {
            if let Ok(text) = name_node.utf8_text(source) {
                return Some(text.trim().to_string());
            }
        }
        if let Ok(text) = decl.utf8_text(source) {
            let s = text.trim();
            if let Some(paren) = s.find('(') {
                return Some(s[..paren].trim().to_string());
            }
            return Some(s.to_string());
        }
    }

    None
}

/// One-line display signature: declaration text up to the body opener.
fn extract_signature(node: &Node<'_>, source: &[u8], ext: &str) -> String {
    let text = node.utf8_text(source).unwrap_or("");
    let first_line = text.lines().next().unwrap_or("").trim();

    let sig = if is_python(ext) {
        match first_line.find(':') {
            Some(colon) => &first_line[..=colon],
            None => first_line,
        }
    } else if let Some(brace) = first_line.find('{') {
        first_line[..brace].trim_end()
    } else {
        first_line
    };

    truncate_chars(sig, 200)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

fn is_comment_line(line: &str, ext: &str) -> bool {
    let t = line.trim_start();
    if is_python(ext) {
        return t.starts_with('#');
    }
    t.starts_with("//") || t.starts_with("/*") || t.starts_with('*') || t.starts_with("*/")
}

fn strip_comment_markers(line: &str) -> &str {
    let t = line.trim();
    for marker in ["///", "//!", "//", "/**", "/*", "*/", "#"] {
        if let Some(rest) = t.strip_prefix(marker) {
            return rest.trim();
        }
    }
    t.strip_prefix("* ").or_else(|| t.strip_prefix('*')).unwrap_or(t).trim()
}

/// Python docstring: the first statement of the body when it's a bare string.
fn python_docstring(node: &Node<'_>, source: &[u8]) -> Option<String> {
    let body = node.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let expr = first.named_child(0)?;
    if expr.kind() != "string" {
        return None;
    }
    let raw = expr.utf8_text(source).ok()?;
    let cleaned = raw.trim_matches(|c| c == '"' || c == '\'').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(truncate_chars(cleaned, 500))
    }
}

// ---------------------------------------------------------------------------
// Code path
// ---------------------------------------------------------------------------

/// A declaration span scheduled for emission.
struct Unit {
    /// 0-based rows, inclusive.
    start: usize,
    end: usize,
    symbol: Symbol,
}

/// Walk a level of the tree, turning declarations into units. Oversized
/// containers recurse so each method/member becomes its own unit; the
/// container header keeps the container's symbol.
fn collect_units(
    node: &Node<'_>,
    source: &[u8],
    ext: &str,
    parent: Option<&Symbol>,
    units: &mut Vec<Unit>,
) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let kind = child.kind();
        if let Some(mut sym_kind) = classify_node(kind) {
            if parent.is_some() && sym_kind == SymbolKind::Function {
                sym_kind = SymbolKind::Method;
            }

            let name = extract_name(&child, source).unwrap_or_default();
            let symbol = Symbol {
                name,
                kind: sym_kind,
                signature: Some(extract_signature(&child, source, ext)),
                parent: parent.map(|p| p.name.clone()),
                docstring: if is_python(ext) { python_docstring(&child, source) } else { None },
            };

            let start = child.start_position().row;
            let end = child.end_position().row;
            let span_bytes = child.byte_range().len();

            if span_bytes > MAX_CHUNK_CHARS && is_container(sym_kind) {
                // Header (signature, fields, docs) up to the first child
                // declaration, then each member on its own.
                let body = child.child_by_field_name("body").unwrap_or(child);
                let body_start = body.start_position().row;
                if body_start > start {
                    units.push(Unit { start, end: body_start.max(start), symbol: symbol.clone() });
                } else {
                    units.push(Unit { start, end: start, symbol: symbol.clone() });
                }
                collect_units(&body, source, ext, Some(&symbol), units);
            } else {
                units.push(Unit { start, end, symbol });
            }
        } else if is_transparent(kind) || !child.is_named() {
            collect_units(&child, source, ext, parent, units);
        }
    }
}

/// AST-aware chunking. `None` when the language is unsupported or the parse
/// found nothing usable — callers fall back to the prose path.
fn chunk_code(content: &str, ext: &str, want_symbols: bool) -> Option<Vec<RawChunk>> {
    let language = language_for_ext(ext)?;
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(content, None)?;
    let root = tree.root_node();
    if root.has_error() && root.named_child_count() == 0 {
        return None;
    }

    let source = content.as_bytes();
    let mut units = Vec::new();
    collect_units(&root, source, ext, None, &mut units);
    if units.is_empty() {
        return None;
    }
    units.sort_by_key(|u| (u.start, u.end));

    let lines: Vec<&str> = content.lines().collect();
    let lang = lang_for_ext(ext).map(str::to_string);
    let mut chunks: Vec<RawChunk> = Vec::new();
    let mut covered_until = 0usize; // first row not yet emitted

    for unit in &units {
        if unit.start < covered_until && unit.end < covered_until {
            continue; // fully inside an already-emitted span
        }
        let mut start = unit.start.max(covered_until);

        // Pull in the contiguous leading comment block.
        let mut doc_lines: Vec<&str> = Vec::new();
        while start > covered_until && start > 0 && is_comment_line(lines[start - 1], ext) {
            start -= 1;
            doc_lines.push(lines[start]);
        }
        doc_lines.reverse();

        // Gap before this declaration: module-level code, imports.
        if start > covered_until {
            emit_gap(&lines, covered_until, start - 1, &lang, &mut chunks);
        }

        let mut symbol = unit.symbol.clone();
        if symbol.docstring.is_none() && !doc_lines.is_empty() {
            let doc = doc_lines
                .iter()
                .map(|l| strip_comment_markers(l))
                .collect::<Vec<_>>()
                .join(" ");
            let doc = doc.trim().to_string();
            if !doc.is_empty() {
                symbol.docstring = Some(truncate_chars(&doc, 500));
            }
        }

        let end = unit.end.min(lines.len().saturating_sub(1));
        if start > end {
            continue; // span swallowed by a previous unit (same-line decls)
        }
        emit_span(
            &lines,
            start,
            end,
            if want_symbols { Some(symbol) } else { None },
            &lang,
            &mut chunks,
        );
        covered_until = end + 1;
    }

    // Trailing gap after the last declaration.
    if covered_until < lines.len() {
        emit_gap(&lines, covered_until, lines.len() - 1, &lang, &mut chunks);
    }

    Some(chunks)
}

/// Emit one declaration span, splitting at line boundaries when it exceeds
/// the max. Continuation windows re-carry a couple of lines of context and
/// keep the declaration's symbol.
fn emit_span(
    lines: &[&str],
    start: usize,
    end: usize,
    symbol: Option<Symbol>,
    lang: &Option<String>,
    chunks: &mut Vec<RawChunk>,
) {
    let total: usize = lines[start..=end].iter().map(|l| l.len() + 1).sum();
    if total <= MAX_CHUNK_CHARS {
        let content = lines[start..=end].join("\n");
        if !content.trim().is_empty() {
            chunks.push(RawChunk {
                content,
                start_line: start + 1,
                end_line: end + 1,
                symbol,
                lang: lang.clone(),
            });
        }
        return;
    }

    let mut window_start = start;
    let mut size = 0usize;
    let mut row = start;
    while row <= end {
        size += lines[row].len() + 1;
        if size >= MAX_CHUNK_CHARS && row > window_start {
            chunks.push(RawChunk {
                content: lines[window_start..=row].join("\n"),
                start_line: window_start + 1,
                end_line: row + 1,
                symbol: symbol.clone(),
                lang: lang.clone(),
            });
            // Overlap: re-carry up to ~15% of the window.
            let mut overlap_rows = 0usize;
            let mut overlap_chars = 0usize;
            while overlap_rows < row - window_start
                && overlap_chars + lines[row - overlap_rows].len() < MAX_CHUNK_CHARS / 8
            {
                overlap_chars += lines[row - overlap_rows].len() + 1;
                overlap_rows += 1;
            }
            window_start = row + 1 - overlap_rows;
            size = overlap_chars;
        }
        row += 1;
    }
    if window_start <= end {
        let content = lines[window_start..=end].join("\n");
        if !content.trim().is_empty() {
            chunks.push(RawChunk {
                content,
                start_line: window_start + 1,
                end_line: end + 1,
                symbol,
                lang: lang.clone(),
            });
        }
    }
}

/// Emit the code between declarations (imports, module statements) as
/// symbol-less chunks; trivial fragments are dropped.
fn emit_gap(
    lines: &[&str],
    start: usize,
    end: usize,
    lang: &Option<String>,
    chunks: &mut Vec<RawChunk>,
) {
    let text = lines[start..=end].join("\n");
    if text.trim().len() < MIN_FRAGMENT_CHARS {
        return;
    }
    emit_span(lines, start, end, None, lang, chunks);
}

// ---------------------------------------------------------------------------
// Prose path
// ---------------------------------------------------------------------------

/// Paragraph-packing chunker for documentation and web text.
pub fn chunk_prose(content: &str) -> Vec<RawChunk> {
    let normalized = content.replace("\r\n", "\n");
    if normalized.trim().is_empty() {
        return Vec::new();
    }

    // Paragraphs with their 0-based line spans.
    let mut paragraphs: Vec<(usize, usize, String)> = Vec::new();
    let mut para_start: Option<usize> = None;
    let mut buffer: Vec<&str> = Vec::new();
    let lines: Vec<&str> = normalized.lines().collect();
    for (row, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            if let Some(start) = para_start.take() {
                paragraphs.push((start, row - 1, buffer.join("\n")));
                buffer.clear();
            }
        } else {
            if para_start.is_none() {
                para_start = Some(row);
            }
            buffer.push(line);
        }
    }
    if let Some(start) = para_start {
        paragraphs.push((start, lines.len() - 1, buffer.join("\n")));
    }

    let mut chunks: Vec<RawChunk> = Vec::new();
    let mut pack: Vec<&(usize, usize, String)> = Vec::new();
    let mut pack_len = 0usize;

    let flush = |pack: &mut Vec<&(usize, usize, String)>,
                 pack_len: &mut usize,
                 chunks: &mut Vec<RawChunk>| {
        if pack.is_empty() {
            return;
        }
        let start = pack[0].0;
        let end = pack[pack.len() - 1].1;
        let content = pack.iter().map(|p| p.2.as_str()).collect::<Vec<_>>().join("\n\n");
        chunks.push(RawChunk {
            content,
            start_line: start + 1,
            end_line: end + 1,
            symbol: None,
            lang: None,
        });
        pack.clear();
        *pack_len = 0;
    };

    for para in &paragraphs {
        let para_len = para.2.len();
        if para_len > MAX_CHUNK_CHARS {
            flush(&mut pack, &mut pack_len, &mut chunks);
            split_long_paragraph(para, &mut chunks);
            continue;
        }
        if pack_len > 0 && (pack_len + para_len + 2 > MAX_CHUNK_CHARS || pack_len >= TARGET_CHUNK_CHARS)
        {
            flush(&mut pack, &mut pack_len, &mut chunks);
        }
        pack_len += para_len + 2;
        pack.push(para);
    }
    flush(&mut pack, &mut pack_len, &mut chunks);

    // Overlap: each chunk after the first carries the tail of its
    // predecessor. Line spans describe the chunk's own content only.
    for i in 1..chunks.len() {
        let tail = overlap_tail(&chunks[i - 1].content);
        if !tail.is_empty() {
            chunks[i].content = format!("{tail}\n{}", chunks[i].content);
        }
    }

    chunks
}

/// Last `OVERLAP_CHARS` of a chunk, snapped forward to a word boundary.
fn overlap_tail(content: &str) -> String {
    if content.len() <= OVERLAP_CHARS {
        return content.to_string();
    }
    let mut cut = content.len() - OVERLAP_CHARS;
    while cut < content.len() && !content.is_char_boundary(cut) {
        cut += 1;
    }
    let tail = &content[cut..];
    match tail.find(char::is_whitespace) {
        Some(ws) => tail[ws..].trim_start().to_string(),
        None => tail.to_string(),
    }
}

/// Break one oversized paragraph at sentence boundaries, line spans derived
/// from the newline counts inside each piece.
fn split_long_paragraph(para: &(usize, usize, String), chunks: &mut Vec<RawChunk>) {
    let (start_row, _, text) = para;
    let sentences = split_sentences(text);

    let mut piece = String::new();
    let mut piece_start_row = *start_row;
    let mut rows_consumed = 0usize;

    let mut flush_piece =
        |piece: &mut String, piece_start_row: &mut usize, rows_consumed: usize| {
            if piece.trim().is_empty() {
                return;
            }
            let newlines = piece.matches('\n').count();
            chunks.push(RawChunk {
                content: std::mem::take(piece),
                start_line: *piece_start_row + 1,
                end_line: *piece_start_row + newlines + 1,
                symbol: None,
                lang: None,
            });
            *piece_start_row = *start_row + rows_consumed;
        };

    for sentence in sentences {
        if !piece.is_empty() && piece.len() + sentence.len() > MAX_CHUNK_CHARS {
            flush_piece(&mut piece, &mut piece_start_row, rows_consumed);
        }
        rows_consumed += sentence.matches('\n').count();
        if sentence.len() > MAX_CHUNK_CHARS {
            // Pathological sentence: hard-split at char boundaries.
            let mut rest = sentence.as_str();
            while rest.len() > MAX_CHUNK_CHARS {
                let mut cut = MAX_CHUNK_CHARS;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                piece.push_str(&rest[..cut]);
                flush_piece(&mut piece, &mut piece_start_row, rows_consumed);
                rest = &rest[cut..];
            }
            piece.push_str(rest);
        } else {
            piece.push_str(&sentence);
        }
    }
    flush_piece(&mut piece, &mut piece_start_row, rows_consumed);
}

/// Split on sentence-ending punctuation, keeping delimiters attached.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            if let Some(&next) = chars.peek() {
                if next.is_whitespace() {
                    current.push(chars.next().unwrap_or(' '));
                    out.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

// ---------------------------------------------------------------------------
// HTML reduction
// ---------------------------------------------------------------------------

/// Strip an HTML document down to readable text: script/style dropped, block
/// elements become paragraph breaks, basic entities decoded. Not a renderer
/// — just enough for the crawl pipeline's prose path.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];

        let lower = rest.to_lowercase();
        // Skip script/style bodies entirely.
        let mut skipped = false;
        for container in ["script", "style", "noscript"] {
            if lower.starts_with(&format!("<{container}")) {
                let close = format!("</{container}");
                match lower.find(&close) {
                    Some(end) => {
                        let after = rest[end..].find('>').map(|i| end + i + 1).unwrap_or(rest.len());
                        rest = &rest[after..];
                    }
                    None => rest = "",
                }
                skipped = true;
                break;
            }
        }
        if skipped {
            continue;
        }

        match rest.find('>') {
            Some(close) => {
                let tag = rest[1..close].trim_start_matches('/');
                let tag_name: String = tag
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_lowercase();
                if matches!(
                    tag_name.as_str(),
                    "p" | "div" | "br" | "li" | "ul" | "ol" | "table" | "tr" | "section"
                        | "article" | "header" | "footer" | "h1" | "h2" | "h3" | "h4" | "h5"
                        | "h6" | "pre" | "blockquote"
                ) {
                    out.push_str("\n\n");
                }
                rest = &rest[close + 1..];
            }
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    // Collapse runs of blank lines left by nested blocks.
    let mut cleaned = String::with_capacity(decoded.len());
    let mut blank_run = 0usize;
    for line in decoded.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        cleaned.push_str(line.trim_end());
        cleaned.push('\n');
    }
    cleaned.trim().to_string()
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Chunk a source file: AST-aware when the extension has a grammar, prose
/// otherwise (and as the fallback when parsing fails). Empty content yields
/// no chunks.
pub fn chunk_file(content: &str, path: &str, want_symbols: bool) -> Vec<RawChunk> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");

    if let Some(chunks) = chunk_code(content, ext, want_symbols) {
        if !chunks.is_empty() {
            return chunks;
        }
    }

    let lang = lang_for_ext(ext).map(str::to_string);
    let mut chunks = chunk_prose(content);
    for c in &mut chunks {
        c.lang = lang.clone();
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_yields_no_chunks() {
        assert!(chunk_file("", "a.py", true).is_empty());
        assert!(chunk_file("   \n\n  ", "a.md", true).is_empty());
    }

    #[test]
    fn single_python_function_is_one_chunk() {
        let src = "def greet(name):\n    \"\"\"Say hello.\"\"\"\n    a = 1\n    b = 2\n    c = 3\n    d = 4\n    e = 5\n    f = 6\n    g = 7\n    return name\n";
        let chunks = chunk_file(src, "hello.py", true);
        assert_eq!(chunks.len(), 1);
        let c = &chunks[0];
        assert_eq!(c.start_line, 1);
        assert_eq!(c.end_line, 10);
        let sym = c.symbol.as_ref().unwrap();
        assert_eq!(sym.name, "greet");
        assert_eq!(sym.kind, SymbolKind::Function);
        assert_eq!(sym.docstring.as_deref(), Some("Say hello."));
        assert_eq!(c.lang.as_deref(), Some("python"));
    }

    #[test]
    fn two_functions_become_two_chunks() {
        let mut src = String::new();
        src.push_str("def greet(name):\n");
        for _ in 0..8 {
            src.push_str("    pass\n");
        }
        src.push_str("def bye(name):\n");
        for _ in 0..8 {
            src.push_str("    pass\n");
        }
        let chunks = chunk_file(&src, "hello.py", true);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].symbol.as_ref().unwrap().name, "greet");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 9);
        assert_eq!(chunks[1].symbol.as_ref().unwrap().name, "bye");
        assert_eq!(chunks[1].start_line, 10);
        assert_eq!(chunks[1].end_line, 18);
    }

    #[test]
    fn rust_doc_comment_becomes_docstring() {
        let src = "/// Adds two numbers.\npub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n";
        let chunks = chunk_file(src, "math.rs", true);
        assert_eq!(chunks.len(), 1);
        let sym = chunks[0].symbol.as_ref().unwrap();
        assert_eq!(sym.name, "add");
        assert_eq!(sym.docstring.as_deref(), Some("Adds two numbers."));
        assert!(sym.signature.as_deref().unwrap().starts_with("pub fn add"));
        // doc comment included in content, chunk starts at line 1
        assert_eq!(chunks[0].start_line, 1);
    }

    #[test]
    fn methods_get_parent_and_method_kind() {
        // Class made big enough to force member-level chunking.
        let mut src = String::from("class Big:\n    \"\"\"Container.\"\"\"\n");
        for i in 0..12 {
            src.push_str(&format!("    def method_{i}(self):\n"));
            for _ in 0..6 {
                src.push_str(&format!("        x = '{}'\n", "y".repeat(30)));
            }
        }
        let chunks = chunk_file(&src, "big.py", true);
        assert!(chunks.len() > 2, "container must split into member chunks");

        let method_chunk = chunks
            .iter()
            .find(|c| c.symbol.as_ref().map(|s| s.name.starts_with("method_")).unwrap_or(false))
            .expect("member chunk present");
        let sym = method_chunk.symbol.as_ref().unwrap();
        assert_eq!(sym.kind, SymbolKind::Method);
        assert_eq!(sym.parent.as_deref(), Some("Big"));
    }

    #[test]
    fn oversized_function_splits_but_keeps_symbol() {
        let mut src = String::from("fn huge() {\n");
        for i in 0..120 {
            src.push_str(&format!("    let line_{i} = \"{}\";\n", "x".repeat(30)));
        }
        src.push_str("}\n");
        let chunks = chunk_file(&src, "huge.rs", true);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.len() <= MAX_CHUNK_CHARS + 200, "window stays near the cap");
            assert_eq!(c.symbol.as_ref().unwrap().name, "huge");
            assert!(c.start_line <= c.end_line);
        }
        assert_eq!(chunks.last().unwrap().end_line, src.lines().count());
    }

    #[test]
    fn unknown_extension_goes_prose() {
        let src = "First paragraph of documentation text.\n\nSecond paragraph continues here.";
        let chunks = chunk_file(src, "README.md", true);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].symbol.is_none());
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn prose_packs_to_target_and_overlaps() {
        let para = "Sentence one of the paragraph. Sentence two keeps it going.";
        let text = (0..40).map(|_| para).collect::<Vec<_>>().join("\n\n");
        let chunks = chunk_prose(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.len() <= MAX_CHUNK_CHARS + OVERLAP_CHARS + 2);
        }
        // Every chunk after the first starts with its predecessor's tail.
        let prev_tail_word = "going.";
        assert!(chunks[1].content.starts_with(|c: char| c.is_ascii()) );
        assert!(chunks[1].content.contains(prev_tail_word));
    }

    #[test]
    fn single_huge_paragraph_splits_at_sentences() {
        let text = (0..100)
            .map(|i| format!("This is sentence number {i} inside an endless paragraph."))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_prose(&text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.len() <= MAX_CHUNK_CHARS + OVERLAP_CHARS + 2);
        }
    }

    #[test]
    fn html_is_reduced_to_text() {
        let html = "<html><head><style>.x{color:red}</style><script>var a=1;</script></head>\
                    <body><h1>Title</h1><p>Hello &amp; welcome.</p><p>Second para.</p></body></html>";
        let text = html_to_text(html);
        assert!(text.contains("Title"));
        assert!(text.contains("Hello & welcome."));
        assert!(!text.contains("color:red"));
        assert!(!text.contains("var a=1"));
        let chunks = chunk_prose(&text);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn last_line_boundary_is_exact() {
        let src = "fn one() {\n    let a = 1;\n}\n";
        let chunks = chunk_file(src, "one.rs", true);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end_line, 3);
        assert_eq!(chunks[0].start_line, 1);
    }
}
