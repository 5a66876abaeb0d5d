use base64::{engine::general_purpose, Engine as _};
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum UrlError {
    #[error(transparent)]
    Parse(#[from] url::ParseError),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

pub fn validate_url(url: &str) -> Result<Url, UrlError> {
    let parsed = Url::parse(url)?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(UrlError::UnsupportedScheme(other.to_string())),
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    general_purpose::STANDARD.decode(encoded)
}

/// Width and height of an encoded PNG. Fails when the buffer is not a PNG.
pub fn png_dimensions(bytes: &[u8]) -> Result<(u32, u32), image::ImageError> {
    image::io::Reader::with_format(Cursor::new(bytes), image::ImageFormat::Png).into_dimensions()
}

/// First `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::new(width, height);
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com/path?query=value").is_ok());
        assert!(matches!(
            validate_url("ftp://example.com"),
            Err(UrlError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(validate_url("not a url"), Err(UrlError::Parse(_))));
        assert!(validate_url("").is_err());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("", 5), "");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn test_png_dimensions() {
        let png = tiny_png(7, 3);
        assert_eq!(png_dimensions(&png).unwrap(), (7, 3));
        assert!(png_dimensions(b"definitely not a png").is_err());
    }

    #[test]
    fn test_base64() {
        assert_eq!(encode_base64(b"png"), "cG5n");
        assert_eq!(encode_base64(&[]), "");
        assert_eq!(decode_base64("cG5n").unwrap(), b"png");
        assert!(decode_base64("not base64!").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
    }
}
