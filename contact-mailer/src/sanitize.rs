/// Escapes the characters which are significant in HTML.
///
/// The ampersand is replaced first so that the entities introduced by the later substitutions are
/// not escaped again.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}

/// Turns newlines into `<br>`. Only for text which has already been escaped.
pub fn line_breaks(escaped: &str) -> String {
    escaped.replace('\n', "<br>")
}
