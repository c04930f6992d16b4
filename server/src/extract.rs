//! Best-effort scraping of verification email bodies.
//!
//! Two independent operations: pull every anchor out of an HTML body, and
//! hunt for the short numeric sign-in code that accompanies the "enter this
//! code to sign in" phrasing. The code search is a ranked strategy chain --
//! strategies are tried in decreasing specificity and the first hit wins, so
//! a markup change upstream means reordering or editing one list entry, not
//! rewriting control flow.

use std::sync::OnceLock;

use kuchiki::traits::*;
use kuchiki::NodeRef;
use regex::Regex;

/// An anchor pulled from an email body. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedLink {
    pub href: String,
    pub text: String,
}

const SIGN_IN_PHRASE: &str = "enter this code to sign in";

/// How far past the phrase the raw-markup fallback will look for a code.
const RAW_SEARCH_WINDOW: usize = 500;

/// All anchors with a non-empty href, in document order, with trimmed
/// visible text. No filtering happens here; callers decide what is
/// actionable.
pub fn extract_links(html: &str) -> Vec<ExtractedLink> {
    let document = kuchiki::parse_html().one(html);
    let mut links = Vec::new();

    if let Ok(anchors) = document.select("a[href]") {
        for anchor in anchors {
            let attributes = anchor.attributes.borrow();
            let Some(href) = attributes.get("href") else {
                continue;
            };
            if href.is_empty() {
                continue;
            }
            links.push(ExtractedLink {
                href: href.to_string(),
                text: anchor.text_contents().trim().to_string(),
            });
        }
    }

    links
}

type CodeStrategy = fn(&NodeRef, &str) -> Option<String>;

/// Ranked from most to least specific. First success wins even if a later
/// strategy would also match.
const CODE_STRATEGIES: &[(&str, CodeStrategy)] = &[
    ("adjacent-cell", adjacent_cell),
    ("same-row", same_row),
    ("raw-markup", raw_markup),
    ("emphasized-cell", emphasized_cell),
];

/// Heuristic search for the 4-digit sign-in code. Returns `None` when every
/// strategy comes up empty.
pub fn extract_code(html: &str) -> Option<String> {
    let document = kuchiki::parse_html().one(html);

    for (name, strategy) in CODE_STRATEGIES {
        if let Some(code) = strategy(&document, html) {
            tracing::debug!(strategy = name, "sign-in code matched");
            return Some(code);
        }
    }
    None
}

fn four_digit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})\b").expect("valid literal regex"))
}

fn find_four_digits(text: &str) -> Option<String> {
    // Collapse the newlines and indentation text_contents leaves behind.
    let squeezed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    four_digit_re()
        .captures(&squeezed)
        .map(|c| c[1].to_string())
}

/// The `<td>` holding the phrase, then the next cell in the same row.
fn adjacent_cell(document: &NodeRef, _html: &str) -> Option<String> {
    let (row, phrase_cell) = phrase_row(document)?;
    let cells = row_cells(&row);
    let position = cells.iter().position(|cell| *cell == phrase_cell)?;
    let next = cells.get(position + 1)?;
    find_four_digits(&next.text_contents())
}

/// Any 4-digit run anywhere in the row containing the phrase. Cell texts
/// are joined with a space so digits from adjacent cells cannot merge into
/// a false code.
fn same_row(document: &NodeRef, _html: &str) -> Option<String> {
    let (row, _) = phrase_row(document)?;
    let joined = row_cells(&row)
        .iter()
        .map(|cell| cell.text_contents())
        .collect::<Vec<_>>()
        .join(" ");
    find_four_digits(&joined)
}

/// 4-digit run within a fixed window after the phrase in raw markup. Catches
/// bodies where the table structure was mangled or stripped by the HTML
/// parser.
fn raw_markup(_document: &NodeRef, html: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?is){SIGN_IN_PHRASE}.{{0,{RAW_SEARCH_WINDOW}}}?\b(\d{{4}})\b"
        ))
        .expect("valid literal regex")
    });
    re.captures(html).map(|c| c[1].to_string())
}

/// Any cell whose entire text is a 4-digit run. OTP codes are usually
/// visually emphasized, so cells carrying size/weight/spacing styling win
/// the tie-break.
fn emphasized_cell(document: &NodeRef, _html: &str) -> Option<String> {
    let cells = document.select("td").ok()?;

    let mut plain = None;
    for cell in cells {
        let text: String = cell.text_contents().split_whitespace().collect();
        if text.len() != 4 || !text.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        if has_emphasis_hint(&cell) {
            return Some(text);
        }
        plain.get_or_insert(text);
    }
    plain
}

const EMPHASIS_HINTS: &[&str] = &["font-size", "font-weight", "letter-spacing"];

fn has_emphasis_hint(cell: &kuchiki::NodeDataRef<kuchiki::ElementData>) -> bool {
    let attributes = cell.attributes.borrow();
    attributes
        .get("style")
        .map(|style| EMPHASIS_HINTS.iter().any(|hint| style.contains(hint)))
        .unwrap_or(false)
}

/// The row element containing the phrase cell, plus the cell itself.
fn phrase_row(document: &NodeRef) -> Option<(NodeRef, NodeRef)> {
    let cells = document.select("td").ok()?;
    for cell in cells {
        if !cell
            .text_contents()
            .to_lowercase()
            .contains(SIGN_IN_PHRASE)
        {
            continue;
        }
        let node = cell.as_node().clone();
        let row = node
            .ancestors()
            .find(is_row)
            .or_else(|| node.parent())?;
        return Some((row, node));
    }
    None
}

fn is_row(node: &NodeRef) -> bool {
    node.as_element()
        .map(|el| el.name.local.as_ref() == "tr")
        .unwrap_or(false)
}

fn row_cells(row: &NodeRef) -> Vec<NodeRef> {
    row.descendants()
        .filter(|node| {
            node.as_element()
                .map(|el| el.name.local.as_ref() == "td")
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_links_returns_empty_for_anchorless_html() {
        assert!(extract_links("<p>no links here</p>").is_empty());
    }

    #[test]
    fn extract_links_preserves_document_order() {
        let html = r#"
            <a href="https://a.example/">First</a>
            <a href="https://b.example/">  Second  </a>
        "#;
        let links = extract_links(html);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].href, "https://a.example/");
        assert_eq!(links[0].text, "First");
        assert_eq!(links[1].text, "Second");
    }

    #[test]
    fn extract_links_skips_empty_href() {
        let html = r#"<a href="">nothing</a><a href="https://x.example/">x</a>"#;
        let links = extract_links(html);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].href, "https://x.example/");
    }

    #[test]
    fn extract_links_is_pure() {
        let html = r#"<a href="https://x.example/">x</a>"#;
        assert_eq!(extract_links(html), extract_links(html));
    }

    #[test]
    fn code_from_adjacent_cell() {
        let html = r#"
            <table><tr>
                <td>Enter this code to sign in</td>
                <td>4821</td>
            </tr></table>
        "#;
        assert_eq!(extract_code(html), Some("4821".to_string()));
    }

    #[test]
    fn code_from_bare_cells_via_raw_markup_fallback() {
        // td tags outside a table get stripped by the parser; the raw-markup
        // strategy still finds the code.
        let html = "<td>Enter this code to sign in</td><td>4821</td>";
        assert_eq!(extract_code(html), Some("4821".to_string()));
    }

    #[test]
    fn code_from_same_row_when_adjacent_cell_has_no_digits() {
        let html = r#"
            <table><tr>
                <td>Enter this code to sign in</td>
                <td>on your TV</td>
                <td>9073</td>
            </tr></table>
        "#;
        assert_eq!(extract_code(html), Some("9073".to_string()));
    }

    #[test]
    fn code_prefers_emphasized_cell_over_plain() {
        let html = r#"
            <table>
                <tr><td>1111</td></tr>
                <tr><td style="font-size:32px; letter-spacing:8px">2222</td></tr>
            </table>
        "#;
        assert_eq!(extract_code(html), Some("2222".to_string()));
    }

    #[test]
    fn code_not_assembled_across_adjacent_cells() {
        let html = r#"<table><tr><td>Enter this code to sign in</td><td>12</td><td>34</td></tr></table>"#;
        assert_eq!(extract_code(html), None);
    }

    #[test]
    fn code_ignores_longer_digit_runs() {
        let html = r#"
            <table><tr>
                <td>Enter this code to sign in</td>
                <td>123456</td>
            </tr></table>
        "#;
        assert_eq!(extract_code(html), None);
    }

    #[test]
    fn code_absent_returns_none() {
        assert_eq!(extract_code("<p>Your account was updated.</p>"), None);
    }

    #[test]
    fn raw_markup_window_is_bounded() {
        let padding = "x".repeat(RAW_SEARCH_WINDOW + 50);
        let html = format!("<p>Enter this code to sign in</p>{padding}<p>4821</p>");
        assert_eq!(extract_code(&html), None);
    }

    #[test]
    fn extract_code_is_pure() {
        let html = r#"<table><tr><td>Enter this code to sign in</td><td>5150</td></tr></table>"#;
        assert_eq!(extract_code(html), extract_code(html));
    }
}
