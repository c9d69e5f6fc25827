//! HTML fragments sent to the client
//!
//! Every outbound frame is an htmx out-of-band swap: the `#results` list is
//! either replaced (new search) or appended to (next page), followed by the
//! `#more` element which is a self-triggering form while more results may
//! exist and an empty placeholder otherwise.

use std::fmt::Write;

use crate::error::SearchError;
use crate::session::Page;

/// How the results list is swapped into the client view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Swap {
    /// First page of a search: discard previous results.
    Replace,
    /// Continuation page: add to the existing results.
    Append,
}

impl Swap {
    pub fn as_str(&self) -> &'static str {
        match self {
            Swap::Replace => "innerHTML",
            Swap::Append => "beforeend",
        }
    }
}

/// Form that asks for the next page once it scrolls into view.
pub const CONTINUATION_CONTROL: &str = r##"<form id="more" hx-ext="ws-wrap-payload" ws-send hx-trigger="revealed once" hx-swap="outerHTML" hx-target="#more" hx-include="#input"><div class='indicator'>Loading more...</div></form>"##;

/// Rendered when the last page was not full.
pub const EMPTY_CONTROL: &str = r#"<div id="more"></div>"#;

/// Render one page of results.
pub fn page_fragment(swap: Swap, page: &Page) -> String {
    let mut html = String::with_capacity(64 + page.keys.len() * 32);
    let _ = write!(html, r#"<div id="results" hx-swap-oob="{}">"#, swap.as_str());
    for (i, key) in page.keys.iter().enumerate() {
        if i > 0 {
            html.push('\n');
        }
        html.push_str("<div class='item'>");
        escape_into(&mut html, key);
        html.push_str("</div>");
    }
    html.push_str("</div>\n");

    html.push_str(if page.has_more {
        CONTINUATION_CONTROL
    } else {
        EMPTY_CONTROL
    });
    html
}

/// Render a non-fatal request error inline.
pub fn error_fragment(err: &SearchError) -> String {
    let mut html = String::from(r#"<div id="errors" hx-swap-oob="innerHTML"><div class='error' data-code=""#);
    html.push_str(err.code());
    html.push_str(r#"">"#);
    escape_into(&mut html, &err.to_string());
    html.push_str("</div></div>");
    html
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}
