/// Returns the media type portion of a `Content-Type` value, that is
/// everything before the first `;`, trimmed.
///
/// ```rust
/// assert_eq!(
///     mailveil_utils::media_type("application/x-pkcs7-mime; smimetype=enveloped-data"),
///     "application/x-pkcs7-mime"
/// );
/// assert_eq!(mailveil_utils::media_type(" text/plain "), "text/plain");
/// ```
pub fn media_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
}

/// Parses headers from a raw email, returning an ordered list of headers
/// and the bytes of the content after the blank-line separator.
///
/// Only the header section is decoded as text (invalid UTF-8 is replaced),
/// the content is returned as a slice of `raw` so 8-bit bodies survive
/// untouched. Headers are preserved in their original order with
/// case-preserved keys and trimmed values. Folded headers (continuation
/// lines starting with whitespace) are unfolded into a single value
/// separated by a space.
///
/// # Examples
///
/// ```rust
/// let (headers, content) = mailveil_utils::parse_raw_headers(
///     b"From: alice@example.com\r\nSubject: Hello\r\n  world\r\n\r\nCaf\xe9!"
/// );
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[0], ("From".to_string(), "alice@example.com".to_string()));
/// assert_eq!(headers[1], ("Subject".to_string(), "Hello world".to_string()));
/// assert_eq!(content, b"Caf\xe9!");
/// ```
pub fn parse_raw_headers(raw: &[u8]) -> (Vec<(String, String)>, &[u8]) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    for chunk in raw.split_inclusive(|&byte| byte == b'\n') {
        let consumed = pos + chunk.len();
        let line = chunk.strip_suffix(b"\n").unwrap_or(chunk);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.iter().all(u8::is_ascii_whitespace) {
            pos = consumed;
            break;
        }

        let text = String::from_utf8_lossy(line);
        if line.starts_with(b" ") || line.starts_with(b"\t") {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(text.trim());
                }
                None => break,
            }
        } else if let Some((key, value)) = text.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        } else {
            // not a header and not blank, treat as start of content
            break;
        }

        pos = consumed;
    }

    (headers, &raw[pos..])
}
