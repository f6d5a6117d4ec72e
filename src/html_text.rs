//! HTML → plain text conversion
//!
//! Tolerant HTML-to-text conversion with tracking-pixel and hidden-element
//! removal ahead of the main conversion pass. Grounded in the teacher's
//! `mime.rs` sanitization discipline (`ammonia::clean` before further
//! processing) generalized from MIME-part walking to a pre-pass over raw
//! HTML, plus `html2text` (teacher dependency) for the tag-stripping
//! fallback.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::AppResult;

const MAX_TABLE_COLUMN_WIDTH: usize = 30;
const MAX_TABLE_ROWS: usize = 10;

static TRACKING_PIXEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<img\b[^>]*\b(?:width\s*=\s*["']?1["']?|height\s*=\s*["']?1["']?|src\s*=\s*["']?cid:)[^>]*>"#)
        .expect("valid tracking pixel regex")
});

static HIDDEN_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<(\w+)\b[^>]*\bstyle\s*=\s*["'][^"']*(?:display\s*:\s*none|visibility\s*:\s*hidden)[^"']*["'][^>]*>.*?</\1>"#)
        .expect("valid hidden element regex")
});

static SCRIPT_STYLE_SVG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|svg)\b[^>]*>.*?</\1>").expect("valid strip regex"));

static TAG_STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid tag-strip regex"));

/// Convert an HTML body to plain text.
///
/// Removes `<script>`/`<style>`/`<svg>` entirely, tracking pixels, and any
/// element carrying `display:none`/`visibility:hidden`; converts
/// `<ul>/<ol>/<li>` to markdown-style lists and `<table>` to a
/// pipe-delimited compact table (column width capped at 30, row count
/// capped at 10 with a `"... (N more rows)"` tail marker). Falls back, on
/// parse failure, to `plain_text_fallback` if provided, else to regex-based
/// tag stripping.
pub fn html_to_text(html: &str, plain_text_fallback: Option<&str>) -> AppResult<String> {
    let pre_pass = SCRIPT_STYLE_SVG.replace_all(html, "");
    let pre_pass = TRACKING_PIXEL.replace_all(&pre_pass, "");
    let pre_pass = HIDDEN_ELEMENT.replace_all(&pre_pass, "");
    let with_tables = convert_tables(&pre_pass);
    let with_lists = convert_lists(&with_tables);

    match html2text::from_read(with_lists.as_bytes(), 10_000) {
        Ok(text) => Ok(collapse_blank_lines(&text)),
        Err(_) => {
            if let Some(plain) = plain_text_fallback {
                Ok(plain.to_string())
            } else {
                Ok(collapse_blank_lines(&TAG_STRIP.replace_all(&with_lists, " ")))
            }
        }
    }
}

static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<li\b[^>]*>(.*?)</li>").expect("valid li regex"));
static LIST_WRAPPER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)</?(ul|ol)\b[^>]*>").expect("valid list wrapper regex"));

fn convert_lists(html: &str) -> String {
    let with_items = LIST_ITEM.replace_all(html, "\n- $1\n");
    LIST_WRAPPER.replace_all(&with_items, "\n").into_owned()
}

static TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<table\b[^>]*>(.*?)</table>").expect("valid table regex"));
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>").expect("valid row regex"));
static TABLE_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<t[dh]\b[^>]*>(.*?)</t[dh]>").expect("valid cell regex"));

fn convert_tables(html: &str) -> String {
    TABLE
        .replace_all(html, |caps: &regex::Captures| {
            let body = &caps[1];
            let rows: Vec<Vec<String>> = TABLE_ROW
                .captures_iter(body)
                .map(|row| {
                    TABLE_CELL
                        .captures_iter(&row[1])
                        .map(|cell| truncate_cell(&TAG_STRIP.replace_all(&cell[1], "").trim().to_string()))
                        .collect()
                })
                .collect();

            let mut out = String::from("\n");
            let total = rows.len();
            for row in rows.iter().take(MAX_TABLE_ROWS) {
                out.push_str("| ");
                out.push_str(&row.join(" | "));
                out.push_str(" |\n");
            }
            if total > MAX_TABLE_ROWS {
                out.push_str(&format!("... ({} more rows)\n", total - MAX_TABLE_ROWS));
            }
            out
        })
        .into_owned()
}

fn truncate_cell(cell: &str) -> String {
    if cell.chars().count() <= MAX_TABLE_COLUMN_WIDTH {
        cell.to_string()
    } else {
        let truncated: String = cell.chars().take(MAX_TABLE_COLUMN_WIDTH.saturating_sub(1)).collect();
        format!("{truncated}\u{2026}")
    }
}

static MANY_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank-line regex"));

fn collapse_blank_lines(text: &str) -> String {
    MANY_BLANK_LINES.replace_all(text.trim(), "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_style_and_svg_entirely() {
        let html = "<p>Keep</p><script>evil()</script><style>.x{}</style><svg><circle/></svg>";
        let text = html_to_text(html, None).unwrap();
        assert!(text.contains("Keep"));
        assert!(!text.contains("evil"));
        assert!(!text.to_lowercase().contains("circle"));
    }

    #[test]
    fn removes_tracking_pixels() {
        let html = r#"<p>Body</p><img src="https://t.example/open.gif" width="1" height="1">"#;
        let text = html_to_text(html, None).unwrap();
        assert!(text.contains("Body"));
        assert!(!text.contains("t.example"));
    }

    #[test]
    fn removes_cid_sourced_images() {
        let html = r#"<p>Body</p><img src="cid:abc123">"#;
        let text = html_to_text(html, None).unwrap();
        assert!(!text.contains("cid:"));
    }

    #[test]
    fn removes_hidden_elements() {
        let html = r#"<p>Visible</p><div style="display:none">Invisible</div>"#;
        let text = html_to_text(html, None).unwrap();
        assert!(text.contains("Visible"));
        assert!(!text.contains("Invisible"));
    }

    #[test]
    fn converts_list_to_markdown_style() {
        let html = "<ul><li>One</li><li>Two</li></ul>";
        let text = html_to_text(html, None).unwrap();
        assert!(text.contains("- One"));
        assert!(text.contains("- Two"));
    }

    #[test]
    fn converts_table_to_pipe_delimited_and_caps_rows() {
        let mut rows = String::new();
        for i in 0..15 {
            rows.push_str(&format!("<tr><td>r{i}c1</td><td>r{i}c2</td></tr>"));
        }
        let html = format!("<table>{rows}</table>");
        let text = html_to_text(&html, None).unwrap();
        assert!(text.contains("| r0c1 | r0c2 |"));
        assert!(text.contains("more rows"));
    }

    #[test]
    fn truncates_wide_table_columns() {
        let wide = "x".repeat(50);
        let html = format!("<table><tr><td>{wide}</td></tr></table>");
        let text = html_to_text(&html, None).unwrap();
        assert!(text.contains('\u{2026}'));
        assert!(!text.contains(&wide));
    }
}
