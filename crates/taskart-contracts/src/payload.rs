use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Trailing `IEND` chunk every complete PNG stream ends with.
pub const PNG_END_MARKER: [u8; 12] = [
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadDefect {
    NotDataUri,
    NotImage,
    UndecodableBase64,
    Empty,
    TruncatedPng,
}

impl PayloadDefect {
    pub fn describe(&self) -> &'static str {
        match self {
            PayloadDefect::NotDataUri => "payload is not a base64 data URI",
            PayloadDefect::NotImage => "data URI does not carry an image",
            PayloadDefect::UndecodableBase64 => "base64 body failed to decode",
            PayloadDefect::Empty => "data URI body is empty",
            PayloadDefect::TruncatedPng => "PNG payload is missing its IEND marker",
        }
    }
}

pub fn encode_data_uri(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, BASE64.encode(bytes))
}

/// Splits a `data:<mime>;base64,<body>` URI into its mime type and body.
pub fn split_data_uri(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.trim().strip_prefix("data:")?;
    let (header, body) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    Some((mime, body))
}

pub fn decode_data_uri(raw: &str) -> Option<(String, Vec<u8>)> {
    let (mime, body) = split_data_uri(raw)?;
    let bytes = BASE64.decode(body.trim().as_bytes()).ok()?;
    Some((mime.to_string(), bytes))
}

/// Pure inspection of an inline image payload. `None` means the payload looks
/// intact.
pub fn inspect_payload(raw: &str) -> Option<PayloadDefect> {
    let Some((mime, body)) = split_data_uri(raw) else {
        return Some(PayloadDefect::NotDataUri);
    };
    if !mime.to_ascii_lowercase().starts_with("image/") {
        return Some(PayloadDefect::NotImage);
    }
    if body.trim().is_empty() {
        return Some(PayloadDefect::Empty);
    }
    let Ok(bytes) = BASE64.decode(body.trim().as_bytes()) else {
        return Some(PayloadDefect::UndecodableBase64);
    };
    let is_png = mime.eq_ignore_ascii_case("image/png") || bytes.starts_with(&PNG_SIGNATURE);
    if is_png && !bytes.ends_with(&PNG_END_MARKER) {
        return Some(PayloadDefect::TruncatedPng);
    }
    None
}

pub fn is_data_uri(raw: &str) -> bool {
    raw.trim_start().starts_with("data:")
}

pub fn mime_for_bytes(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&PNG_SIGNATURE) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/png"
    }
}

pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext.trim().to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    "png"
}

#[cfg(test)]
pub(crate) fn tiny_png() -> Vec<u8> {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(b"\x00\x00\x00\x0dIHDR-fake-header-body");
    bytes.extend_from_slice(&PNG_END_MARKER);
    bytes
}
