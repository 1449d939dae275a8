// pixfetch-net/src/data_url.rs
//! Decoding of inline `data:` URLs.
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use pixfetch_common::error::{FetchError, Result};
use url::{Position, Url};

const DEFAULT_MEDIA_TYPE: &str = "text/plain;charset=US-ASCII";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub media_type: String,
    pub body: Vec<u8>,
}

/// `data:[<mediatype>][;base64],<data>`
pub fn decode(url: &Url) -> Result<DataUrl> {
    if url.scheme() != "data" {
        return Err(FetchError::InvalidUrl(format!("Not a data URL: {url}")));
    }
    // The fragment is not part of the payload.
    let content = &url[Position::BeforePath..Position::AfterQuery];
    let (header, payload) = content
        .split_once(',')
        .ok_or_else(|| FetchError::InvalidUrl(format!("Data URL without ',': {url}")))?;

    let mut params: Vec<&str> = header.split(';').map(str::trim).collect();
    let is_base64 = params
        .last()
        .is_some_and(|last| last.eq_ignore_ascii_case("base64"));
    if is_base64 {
        params.pop();
    }
    let media_type = match params.join(";") {
        ref mt if mt.is_empty() => DEFAULT_MEDIA_TYPE.to_string(),
        mt if mt.starts_with(';') => format!("text/plain{mt}"),
        mt => String::from_utf8_lossy(&percent_decode(&mt)).into_owned(),
    };

    let decoded = percent_decode(payload);
    let body = if is_base64 {
        let compact: Vec<u8> = decoded
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(&compact)
            .or_else(|_| STANDARD_NO_PAD.decode(&compact))
            .map_err(|e| FetchError::InvalidUrl(format!("Bad base64 payload in data URL: {e}")))?
    } else {
        decoded
    };

    Ok(DataUrl { media_type, body })
}

pub(crate) fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
