//! Content transformation: markup classification, title extraction, link
//! rewriting and the small text helpers (slugs, category names, excerpts)
//! shared by the hierarchy resolver and the orchestrator.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::ContentError;

const EXCERPT_MAX_CHARS: usize = 160;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern is valid")
}

static CMS_BLOCK_MARKER: LazyLock<Regex> = LazyLock::new(|| re(r"<!--\s*/?wp:"));

static BLOCK_CONTAINER_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)^\s*<(div|section|article|main|header|footer|aside|nav|figure|table|ul|ol|p|blockquote|pre|h[1-6])[\s>/]")
});

static HTML_OPEN: LazyLock<Regex> = LazyLock::new(|| re(r"^\s*<[a-zA-Z!/]"));

static MARKDOWN_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?m)^#{1,6}\s+\S",         // headers
        r"(?m)^\s*[-*+]\s+\S",       // unordered list
        r"(?m)^\s*\d+\.\s+\S",       // ordered list
        r"(?m)^\s*(```|~~~)",        // fenced code
        r"\[[^\]\n]+\]\([^)\n]+\)",  // links and images
        r"(?m)^\s*\|.*\|\s*$",       // tables
        r"(?m)^\s*>\s?\S",           // blockquotes
        r"\*\*[^*\n]+\*\*|__[^_\n]+__|\*[^*\s][^*\n]*\*|\b_[^_\n]+_\b", // emphasis
        r"`[^`\n]+`",                // inline code
    ]
    .into_iter()
    .map(re)
    .collect()
});

static TITLE_LINE: LazyLock<Regex> = LazyLock::new(|| re(r"^#[ \t]+(.*?)[ \t]*#*[ \t]*$"));

static INLINE_LINK: LazyLock<Regex> =
    LazyLock::new(|| re(r#"(!?\[[^\]\n]*\])\(\s*([^)\s]+)(\s+"[^"\n]*")?\s*\)"#));

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| re(r"(?s)<!--.*?-->|<[^>]+>"));

static MARKDOWN_LINK_TEXT: LazyLock<Regex> = LazyLock::new(|| re(r"!?\[([^\]\n]*)\]\([^)\n]*\)"));

/// True when `text` is already structured markup and must be stored verbatim.
///
/// CMS block markers or an opening block-level container mean markup; otherwise
/// any markdown signature means markdown; otherwise anything that does not
/// open with an HTML tag is treated as markdown.
pub fn is_structured_markup(text: &str) -> bool {
    if CMS_BLOCK_MARKER.is_match(text) || BLOCK_CONTAINER_OPEN.is_match(text) {
        return true;
    }
    if MARKDOWN_SIGNATURES.iter().any(|sig| sig.is_match(text)) {
        return false;
    }
    HTML_OPEN.is_match(text)
}

/// Split the first level-1 header off the document.
///
/// Returns `(title, body)` where `body` no longer contains the title line.
/// Headers inside fenced code blocks are ignored.
pub fn extract_title(markdown: &str, source_file: &str) -> Result<(String, String), ContentError> {
    let mut in_fence = false;
    let lines: Vec<&str> = markdown.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some(caps) = TITLE_LINE.captures(line) else {
            continue;
        };
        let title = caps[1].trim();
        if title.is_empty() {
            continue;
        }
        let body = lines[..idx]
            .iter()
            .chain(lines[idx + 1..].iter())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        return Ok((title.to_string(), body.trim_matches('\n').to_string()));
    }
    Err(ContentError::MissingTitle(source_file.to_string()))
}

/// Output of [`LinkRewriter::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedContent {
    pub body: String,
    /// Resolved document paths that had no known record and got a fallback link.
    pub fallback_links: Vec<String>,
}

/// Rewrites intra-repository document links.
#[derive(Debug, Clone)]
pub struct LinkRewriter {
    extension: String,
    fallback_prefix: String,
}

impl LinkRewriter {
    pub fn new(extension: &str, fallback_prefix: &str) -> Self {
        Self {
            extension: extension.to_ascii_lowercase(),
            fallback_prefix: fallback_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Rewrite every inline link whose target is a document.
    ///
    /// `lookup` maps a resolved docs-relative path to a permalink when a record
    /// for it is already known. A relative target is looked up against the
    /// current file's directory first, then against the docs root; the
    /// fallback is built from the directory-relative path.
    pub fn process<F>(&self, markdown: &str, current_path: &str, lookup: F) -> ProcessedContent
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut fallback_links = Vec::new();
        let body = INLINE_LINK.replace_all(markdown, |caps: &Captures| {
            let whole = caps[0].to_string();
            let target = &caps[2];
            if is_external(target) {
                return whole;
            }
            let (path_part, fragment) = match target.split_once('#') {
                Some((p, f)) => (p, Some(f)),
                None => (target, None),
            };
            if !path_part.to_ascii_lowercase().ends_with(&self.extension) {
                return whole;
            }
            let resolved = resolve_link_path(current_path, path_part);
            let known = lookup(&resolved).or_else(|| {
                // `./x.md` written as if from the docs root is common; try that too.
                (!path_part.starts_with('/'))
                    .then(|| resolve_link_path("", path_part))
                    .filter(|root| *root != resolved)
                    .and_then(|root| lookup(&root))
            });
            let mut href = match known {
                Some(permalink) => permalink,
                None => {
                    let href = self.fallback_href(&resolved);
                    fallback_links.push(resolved);
                    href
                }
            };
            if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
                href.push('#');
                href.push_str(fragment);
            }
            let title = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            format!("{}({}{})", &caps[1], href, title)
        });
        ProcessedContent {
            body: body.into_owned(),
            fallback_links,
        }
    }

    /// Deterministic address for a document with no record yet.
    pub fn fallback_href(&self, resolved_path: &str) -> String {
        let stem = strip_extension(resolved_path, &self.extension);
        format!("{}/{}", self.fallback_prefix, slugify(stem))
    }
}

fn is_external(target: &str) -> bool {
    target.contains("://") || target.starts_with("mailto:") || target.starts_with('#')
}

fn strip_extension<'a>(path: &'a str, extension: &str) -> &'a str {
    if path.to_ascii_lowercase().ends_with(extension) {
        &path[..path.len() - extension.len()]
    } else {
        path
    }
}

/// Resolve a link target against the directory of `current_path`.
///
/// A leading `/` is relative to the docs root; `.` segments are dropped and
/// `..` pops one directory (never above the root).
pub fn resolve_link_path(current_path: &str, target: &str) -> String {
    let (mut segments, target) = match target.strip_prefix('/') {
        Some(absolute) => (Vec::new(), absolute),
        None => {
            let mut dir: Vec<&str> = current_path.split('/').collect();
            dir.pop();
            (dir, target)
        }
    };
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.retain(|s| !s.is_empty());
    segments.join("/")
}

/// Lowercase, alphanumeric runs joined by `-`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Category name for a directory segment: separators become spaces and each
/// word gets an upper-case first letter (`getting-started` -> `Getting Started`).
pub fn segment_to_name(segment: &str) -> String {
    segment
        .split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Category chain for a docs-relative file path (its directory segments).
pub fn subpath_for(source_file: &str) -> Vec<String> {
    let mut segments: Vec<&str> = source_file.split('/').collect();
    segments.pop();
    segments
        .into_iter()
        .map(segment_to_name)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Plain-text summary: the first prose paragraph, markup removed.
pub fn excerpt(body: &str) -> String {
    let without_tags = HTML_TAG.replace_all(body, "\n");
    let mut in_fence = false;
    let mut paragraph: Vec<String> = Vec::new();
    for line in without_tags.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if trimmed.is_empty() {
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with('|') {
            if !paragraph.is_empty() {
                break;
            }
            continue;
        }
        let text = trimmed
            .trim_start_matches('>')
            .trim_start_matches(['-', '*', '+'])
            .trim();
        paragraph.push(text.to_string());
    }
    let joined = paragraph.join(" ");
    let plain = MARKDOWN_LINK_TEXT.replace_all(&joined, "$1");
    let plain: String = plain.chars().filter(|c| !matches!(c, '*' | '`')).collect();
    let plain = plain.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_on_word(&plain, EXCERPT_MAX_CHARS)
}

fn truncate_on_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    let cut = match cut.rfind(' ') {
        Some(idx) if idx > 0 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{}…", cut.trim_end_matches([',', '.', ';', ':']))
}
