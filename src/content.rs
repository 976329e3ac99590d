// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Conversion of HTTP message parts into HAR records.
//!
//! Bodies are decoded according to `Content-Encoding` and the charset of the
//! `Content-Type`. When decoding fails the raw bytes are kept base64-encoded
//! and the content carries a comment describing the failure.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use hyper::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use mime::Mime;
use std::io::Read;

use crate::har::{HarContent, HarCookie, HarNameValuePair, HarPostData, HarPostParam};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Upper bound on a body after undoing `Content-Encoding`. Larger bodies are
/// captured truncated.
pub const MAX_DECODED_BODY: usize = 32 * 1024 * 1024;

static TEXTUAL_PREFIXES: &[&str] = &[
    "text/",
    "application/x-javascript",
    "application/javascript",
    "application/json",
    "application/xml",
    "application/xhtml+xml",
];

static REDIRECT_STATUSES: &[u16] = &[300, 301, 302, 303, 307, 308];

// Convert hyper::Version into the textual HTTP-version token used in start/status lines.
pub fn format_http_version(v: hyper::Version) -> String {
    match v {
        hyper::Version::HTTP_09 => "HTTP/0.9".to_string(),
        hyper::Version::HTTP_10 => "HTTP/1.0".to_string(),
        hyper::Version::HTTP_11 => "HTTP/1.1".to_string(),
        hyper::Version::HTTP_2 => "HTTP/2.0".to_string(),
        _ => "HTTP/1.1".to_string(),
    }
}

/// Size of a header block: each header counts name, value, ": " and CRLF.
pub fn header_size(headers: &HeaderMap) -> i64 {
    headers
        .iter()
        .map(|(n, v)| (n.as_str().len() + v.as_bytes().len() + 4) as i64)
        .sum()
}

pub fn har_headers(headers: &HeaderMap) -> Vec<HarNameValuePair> {
    headers
        .iter()
        .map(|(n, v)| HarNameValuePair::new(n.as_str(), String::from_utf8_lossy(v.as_bytes())))
        .collect()
}

pub fn query_string(raw_url: &str) -> Vec<HarNameValuePair> {
    match url::Url::parse(raw_url) {
        Ok(u) => u
            .query_pairs()
            .map(|(k, v)| HarNameValuePair::new(k, v))
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub fn request_cookies(headers: &HeaderMap) -> Vec<HarCookie> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| {
            cookie::Cookie::split_parse(s.to_string())
                .filter_map(|c| c.ok())
                .map(|c| HarCookie {
                    name: c.name().to_string(),
                    value: c.value().to_string(),
                    ..Default::default()
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

pub fn response_cookies(headers: &HeaderMap) -> Vec<HarCookie> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|s| {
            let c = cookie::Cookie::parse(s).ok()?;
            Some(HarCookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
                path: c.path().map(str::to_string),
                domain: c.domain().map(str::to_string),
                expires: cookie_attribute(s, "expires"),
                http_only: c.http_only(),
                secure: c.secure(),
                comment: None,
            })
        })
        .collect()
}

fn cookie_attribute(raw: &str, name: &str) -> Option<String> {
    raw.split(';').skip(1).find_map(|attr| {
        let (k, v) = attr.split_once('=')?;
        if k.trim().eq_ignore_ascii_case(name) {
            Some(v.trim().to_string())
        } else {
            None
        }
    })
}

pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn is_textual(content_type: &str) -> bool {
    let lower = content_type.trim().to_ascii_lowercase();
    if TEXTUAL_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return true;
    }
    match lower.parse::<Mime>() {
        Ok(m) => matches!(m.suffix().map(|s| s.as_str()), Some("json") | Some("xml")),
        Err(_) => false,
    }
}

pub fn is_redirect(status: u16) -> bool {
    REDIRECT_STATUSES.contains(&status)
}

pub fn redirect_url(status: u16, headers: &HeaderMap) -> String {
    if !is_redirect(status) {
        return String::new();
    }
    headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// A body with its `Content-Encoding` undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub bytes: Vec<u8>,
    /// Decoding stopped at the size limit.
    pub truncated: bool,
}

/// Undo `Content-Encoding`, producing at most `limit` bytes. Identity and
/// missing encodings pass through.
pub fn decompress(encoding: Option<&str>, body: &[u8], limit: usize) -> Result<Decoded, String> {
    let enc = encoding.map(|e| e.trim().to_ascii_lowercase());
    match enc.as_deref() {
        None | Some("") | Some("identity") => Ok(Decoded {
            bytes: body.to_vec(),
            truncated: false,
        }),
        Some("gzip") | Some("x-gzip") => read_limited(flate2::read::MultiGzDecoder::new(body), limit)
            .map_err(|e| format!("gzip decode failed: {}", e)),
        Some("deflate") => read_limited(flate2::read::ZlibDecoder::new(body), limit)
            .or_else(|_| read_limited(flate2::read::DeflateDecoder::new(body), limit))
            .map_err(|e| format!("deflate decode failed: {}", e)),
        Some(other) => Err(format!("unsupported content encoding '{}'", other)),
    }
}

fn read_limited<R: Read>(reader: R, limit: usize) -> std::io::Result<Decoded> {
    let mut bytes = Vec::new();
    reader
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut bytes)?;
    let truncated = bytes.len() > limit;
    bytes.truncate(limit);
    Ok(Decoded { bytes, truncated })
}

fn truncation_note(limit: usize) -> String {
    format!("decoded body truncated at {} bytes", limit)
}

fn append_comment(slot: &mut Option<String>, note: String) {
    *slot = Some(match slot.take() {
        Some(existing) => format!("{}; {}", existing, note),
        None => note,
    });
}

/// Decode text using the declared charset. Without a charset, JSON,
/// JavaScript and XML default to UTF-8 and everything else to ISO-8859-1.
pub fn decode_text(content_type: &str, body: &[u8]) -> Result<String, String> {
    let parsed = content_type.parse::<Mime>().ok();
    let declared = parsed
        .as_ref()
        .and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_string()));
    let encoding: &'static Encoding = match declared {
        Some(label) => Encoding::for_label(label.as_bytes())
            .ok_or_else(|| format!("unknown charset '{}'", label))?,
        None if defaults_to_utf8(content_type) => UTF_8,
        None => WINDOWS_1252,
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(body)
        .map(|s| s.into_owned())
        .ok_or_else(|| format!("body is not valid {}", encoding.name()))
}

fn defaults_to_utf8(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    ["json", "javascript", "xml"].iter().any(|k| lower.contains(k))
}

/// Capture flags as applied to one body.
#[derive(Debug, Clone, Copy)]
pub struct BodyCapture {
    pub text: bool,
    pub binary: bool,
}

/// Build the HAR `content` record for a response body.
pub fn response_content(headers: &HeaderMap, raw: &[u8], capture: BodyCapture) -> HarContent {
    response_content_within(headers, raw, capture, MAX_DECODED_BODY)
}

fn response_content_within(
    headers: &HeaderMap,
    raw: &[u8],
    capture: BodyCapture,
    limit: usize,
) -> HarContent {
    let mime_type = content_type(headers).unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
    let encoding = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok());

    let mut content = HarContent {
        size: raw.len() as i64,
        mime_type: mime_type.clone(),
        ..Default::default()
    };

    let Decoded { bytes: body, truncated } = match decompress(encoding, raw, limit) {
        Ok(decoded) => decoded,
        Err(e) => {
            if capture.text || capture.binary {
                content.text = Some(BASE64.encode(raw));
                content.encoding = Some("base64".into());
            }
            content.comment = Some(e);
            return content;
        }
    };
    content.size = body.len() as i64;
    if body.len() != raw.len() && !truncated {
        content.compression = Some(body.len() as i64 - raw.len() as i64);
    }

    if is_textual(&mime_type) {
        if capture.text {
            match decode_text(&mime_type, &body) {
                Ok(text) => content.text = Some(text),
                Err(e) => {
                    content.text = Some(BASE64.encode(&body));
                    content.encoding = Some("base64".into());
                    content.comment = Some(e);
                }
            }
        }
    } else if capture.binary && !body.is_empty() {
        content.text = Some(BASE64.encode(&body));
        content.encoding = Some("base64".into());
    }
    if truncated {
        append_comment(&mut content.comment, truncation_note(limit));
    }
    content
}

/// Build the HAR `postData` record for a request body.
pub fn post_data(headers: &HeaderMap, body: &[u8], capture: BodyCapture) -> Option<HarPostData> {
    if body.is_empty() {
        return None;
    }
    let mime_type = content_type(headers).unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
    let encoding = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok());
    let mut data = HarPostData {
        mime_type: mime_type.clone(),
        ..Default::default()
    };

    let Decoded {
        bytes: decoded,
        truncated,
    } = match decompress(encoding, body, MAX_DECODED_BODY) {
        Ok(d) => d,
        Err(e) => {
            if !(capture.text || capture.binary) {
                return None;
            }
            data.text = BASE64.encode(body);
            data.comment = Some(e);
            return Some(data);
        }
    };

    if is_textual(&mime_type) || mime_type.starts_with("application/x-www-form-urlencoded") {
        if !capture.text {
            return None;
        }
        if mime_type.starts_with("application/x-www-form-urlencoded") {
            data.params = url::form_urlencoded::parse(&decoded)
                .map(|(k, v)| HarPostParam {
                    name: k.into_owned(),
                    value: Some(v.into_owned()),
                    ..Default::default()
                })
                .collect();
        }
        match decode_text(&mime_type, &decoded) {
            Ok(text) => data.text = text,
            Err(e) => {
                data.text = BASE64.encode(&decoded);
                data.comment = Some(e);
            }
        }
    } else {
        if !capture.binary {
            return None;
        }
        data.text = BASE64.encode(&decoded);
        data.comment = Some("base64".into());
    }
    if truncated {
        append_comment(&mut data.comment, truncation_note(MAX_DECODED_BODY));
    }
    Some(data)
}
