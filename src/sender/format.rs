//! Reply formatting: subject normalization and text-to-HTML rendering.

use std::sync::LazyLock;

use regex::Regex;

use crate::email::signal::REPLY_PREFIX;

static REPLY_PREFIXES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?i:\s*re\s*:\s*)+").expect("reply prefix pattern is valid"));

static BOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("bold pattern is valid"));

static ITALIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*(.*?)\*").expect("italic pattern is valid"));

/// Signature block appended to every HTML reply.
pub const SIGNATURE_HTML: &str = "<p>Best regards,<br>\n<strong>Your Assistant</strong></p>";

/// Exactly one `"Re: "` in front of the subject.
///
/// `"Hello"`, `"Re: Hello"` and `"RE: re: Hello"` all become `"Re: Hello"`.
pub fn normalize_subject(subject: &str) -> String {
    let rest = REPLY_PREFIXES_RE.replace(subject.trim(), "");
    format!("{REPLY_PREFIX}{}", rest.trim())
}

/// Render reply text as the inner HTML of the reply body.
///
/// Blank lines become paragraphs, single newlines `<br>`, `**x**` bold and
/// `*x*` italic. Text is HTML-escaped first.
pub fn text_to_html(text: &str) -> String {
    let escaped = escape_html(&text.replace("\r\n", "\n"));
    let html = escaped.replace("\n\n", "</p><p>").replace('\n', "<br>");
    let html = BOLD_RE.replace_all(&html, "<strong>$1</strong>");
    ITALIC_RE.replace_all(&html, "<em>$1</em>").into_owned()
}

/// Full HTML document for a reply body.
pub fn render_html_document(text: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         <style>\n\
         body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; \
         line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px; }}\n\
         .signature {{ margin-top: 30px; padding-top: 20px; border-top: 1px solid #eee; \
         font-size: 14px; color: #666; }}\n\
         </style>\n</head>\n<body>\n<p>{}</p>\n<div class=\"signature\">\n{SIGNATURE_HTML}\n</div>\n</body>\n</html>\n",
        text_to_html(text)
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_gets_single_prefix() {
        assert_eq!(normalize_subject("Hello"), "Re: Hello");
        assert_eq!(normalize_subject("Re: Hello"), "Re: Hello");
        assert_eq!(normalize_subject("RE: re:Hello"), "Re: Hello");
        assert_eq!(normalize_subject("  Re:  Re: Hello "), "Re: Hello");
    }

    #[test]
    fn subject_words_starting_with_re_are_kept() {
        assert_eq!(normalize_subject("Regarding plans"), "Re: Regarding plans");
    }

    #[test]
    fn paragraphs_and_breaks() {
        assert_eq!(text_to_html("one\n\ntwo\nthree"), "one</p><p>two<br>three");
        assert_eq!(text_to_html("a\r\nb"), "a<br>b");
    }

    #[test]
    fn bold_and_italic() {
        assert_eq!(
            text_to_html("**strong** and *soft*"),
            "<strong>strong</strong> and <em>soft</em>"
        );
    }

    #[test]
    fn markup_in_text_is_escaped() {
        assert_eq!(text_to_html("1 < 2 & <b>"), "1 &lt; 2 &amp; &lt;b&gt;");
    }

    #[test]
    fn document_wraps_body_and_signature() {
        let doc = render_html_document("Hello\n\nBye");
        assert!(doc.starts_with("<!DOCTYPE html>"));
        assert!(doc.contains("<p>Hello</p><p>Bye</p>"));
        assert!(doc.contains(SIGNATURE_HTML));
    }
}
