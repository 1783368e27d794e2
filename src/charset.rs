//! Content-Type driven text decoding.

use axum::http::{header, HeaderMap};
use encoding_rs::Encoding;
use mime::Mime;

use crate::error::{FleetError, FleetResult};

/// HTTP/1.1 default charset (ISO-8859-1). The WHATWG label table maps
/// `ISO-8859-1` to windows-1252, a superset on every printable byte.
pub const DEFAULT_HTTP_CHARSET: &Encoding = encoding_rs::WINDOWS_1252;

/// Parsed `Content-Type` of a header map, if present and well formed.
pub fn content_type(headers: &HeaderMap) -> Option<Mime> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Mime>().ok())
}

/// Decode `body` with the charset declared in `mime`, or `default` when none
/// is declared. A declared charset we do not know is an error, not a fallback.
pub fn decode(mime: Option<&Mime>, body: &[u8], default: &'static Encoding) -> FleetResult<String> {
    let encoding = match mime.and_then(|m| m.get_param(mime::CHARSET)) {
        Some(label) => Encoding::for_label(label.as_str().as_bytes())
            .ok_or_else(|| FleetError::UnsupportedCharset(label.as_str().to_string()))?,
        None => default,
    };
    let (text, _, _) = encoding.decode(body);
    Ok(text.into_owned())
}

/// Whether a body of this type is recorded as text rather than base64.
pub fn is_text(mime: Option<&Mime>) -> bool {
    let Some(mime) = mime else {
        return false;
    };
    if mime.type_() == mime::TEXT {
        return true;
    }
    let subtype = mime.subtype().as_str();
    let suffix = mime.suffix().map(|s| s.as_str());
    matches!(subtype, "json" | "xml" | "javascript" | "x-www-form-urlencoded" | "graphql")
        || matches!(suffix, Some("json") | Some("xml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn mime(raw: &str) -> Mime {
        raw.parse().unwrap()
    }

    #[test]
    fn test_declared_charset_is_used() {
        let body = [0x63, 0x61, 0x66, 0xe9]; // "café" in latin-1
        let text = decode(Some(&mime("text/plain; charset=ISO-8859-1")), &body, encoding_rs::UTF_8).unwrap();
        assert_eq!(text, "café");
    }

    #[test]
    fn test_default_applies_without_charset() {
        let text = decode(Some(&mime("text/plain")), "héllo".as_bytes(), encoding_rs::UTF_8).unwrap();
        assert_eq!(text, "héllo");
        let text = decode(None, "plain".as_bytes(), encoding_rs::UTF_8).unwrap();
        assert_eq!(text, "plain");
    }

    #[test]
    fn test_unknown_charset_is_rejected() {
        let err = decode(Some(&mime("text/plain; charset=klingon")), b"x", encoding_rs::UTF_8).unwrap_err();
        assert!(matches!(err, FleetError::UnsupportedCharset(label) if label == "klingon"));
    }

    #[test]
    fn test_text_detection() {
        assert!(is_text(Some(&mime("text/html"))));
        assert!(is_text(Some(&mime("application/json"))));
        assert!(is_text(Some(&mime("application/vnd.api+json"))));
        assert!(!is_text(Some(&mime("image/png"))));
        assert!(!is_text(None));
    }

    #[test]
    fn test_content_type_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(content_type(&headers).is_none());
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        assert_eq!(content_type(&headers).unwrap().essence_str(), "text/plain");
    }
}
