use base64::{engine::general_purpose, Engine as _};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Unfolds header continuations, lowercases keys, keeps the last occurrence
/// of a repeated header. The returned map is what lands on
/// `email_replies.raw_headers`.
pub fn parse_headers(raw: &str) -> HashMap<String, String> {
    let mut unfolded: Vec<String> = Vec::new();
    for line in raw.lines() {
        if line.is_empty() {
            break; // end of header block
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !unfolded.is_empty() {
            if let Some(prev) = unfolded.last_mut() {
                prev.push(' ');
                prev.push_str(line.trim_start());
            }
        } else {
            unfolded.push(line.to_string());
        }
    }

    let mut headers = HashMap::new();
    for line in unfolded {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    headers
}

/// Decodes quoted-printable content: soft line breaks and `=XX` escapes.
/// Malformed escapes pass through untouched.
pub fn decode_quoted_printable(input: &str) -> String {
    let unfolded = input.replace("=\r\n", "").replace("=\n", "");
    let bytes = unfolded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' && i + 2 < bytes.len() {
            let escaped = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = escaped {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Best-effort text and HTML bodies from a raw MIME envelope. Walks
/// multipart boundaries recursively and honors base64 and quoted-printable
/// transfer encodings.
pub fn extract_bodies(raw_mime: &str) -> (Option<String>, Option<String>) {
    let mut text = None;
    let mut html = None;
    extract_part(raw_mime, &mut text, &mut html, 0);
    (text, html)
}

fn extract_part(part: &str, text: &mut Option<String>, html: &mut Option<String>, depth: usize) {
    if depth > 8 {
        return;
    }

    let (header_block, body) = split_headers_body(part);
    let headers = parse_headers(header_block);
    let content_type: mime::Mime = headers
        .get("content-type")
        .and_then(|ct| ct.parse().ok())
        .unwrap_or(mime::TEXT_PLAIN);

    if content_type.type_() == mime::MULTIPART {
        if let Some(boundary) = content_type.get_param(mime::BOUNDARY) {
            let marker = format!("--{}", boundary.as_str());
            for section in body.split(&marker).skip(1) {
                let section = section.trim_start_matches(['\r', '\n']);
                if section.starts_with("--") || section.trim().is_empty() {
                    continue;
                }
                extract_part(section, text, html, depth + 1);
            }
        }
        return;
    }

    let decoded = match headers
        .get("content-transfer-encoding")
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("base64") => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            general_purpose::STANDARD
                .decode(compact)
                .ok()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_else(|| body.trim().to_string())
        }
        Some("quoted-printable") => decode_quoted_printable(body.trim_end()),
        _ => body.trim_end().to_string(),
    };

    if content_type.type_() == mime::TEXT && content_type.subtype() == mime::HTML {
        if html.is_none() {
            *html = Some(decoded);
        }
    } else if content_type.type_() == mime::TEXT
        && content_type.subtype() == mime::PLAIN
        && text.is_none()
    {
        *text = Some(decoded);
    }
}

fn split_headers_body(part: &str) -> (&str, &str) {
    for separator in ["\r\n\r\n", "\n\n"] {
        if let Some(idx) = part.find(separator) {
            return (&part[..idx], &part[idx + separator.len()..]);
        }
    }
    ("", part)
}

/// Parses `"Display Name" <user@host>` shapes; bare addresses pass through.
pub fn parse_address(input: &str) -> (Option<String>, String) {
    let trimmed = input.trim();
    if let (Some(open), Some(close)) = (trimmed.rfind('<'), trimmed.rfind('>')) {
        if open < close {
            let email = trimmed[open + 1..close].trim().to_string();
            let name = trimmed[..open].trim().trim_matches('"').trim().to_string();
            let name = if name.is_empty() { None } else { Some(name) };
            return (name, email);
        }
    }
    (None, trimmed.trim_matches('"').to_string())
}

/// The domain part of an address, lowercased.
pub fn email_domain(email: &str) -> Option<String> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().trim_end_matches('>').to_lowercase())
        .filter(|d| !d.is_empty())
}

/// Log id from a plus-style reply envelope: `reply-{id}@…`.
pub fn parse_reply_address_log_id(to: &str) -> Option<i64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"reply-(\d+)@").expect("valid reply-address regex"));
    re.captures(to).and_then(|c| c[1].parse().ok())
}

/// Log id embedded in our custom Message-ID: `<isg-{id}-{ms}@domain>`.
pub fn extract_embedded_log_id(in_reply_to: &str) -> Option<i64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"<isg-(\d+)-\d+@").expect("valid message-id regex"));
    re.captures(in_reply_to).and_then(|c| c[1].parse().ok())
}
