use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::AppError;

/// Parse one "Name: Value" header.
fn parse_header(header_str: &str) -> Result<(HeaderName, HeaderValue), AppError> {
    let Some((name, value)) = header_str.split_once(':') else {
        return Err(AppError::InvalidInput(format!(
            "Invalid header format: '{header_str}'. Expected 'Name: Value'"
        )));
    };

    let name = name.trim();
    let value = value.trim();

    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| AppError::InvalidInput(format!("Invalid header name: '{name}'")))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|_| AppError::InvalidInput(format!("Invalid header value for '{name}'")))?;

    Ok((header_name, header_value))
}

/// Parse header arguments on top of `base`; later values replace earlier ones.
pub fn parse_headers(base: HeaderMap, header_strings: &[String]) -> Result<HeaderMap, AppError> {
    let mut headers = base;

    for header_str in header_strings {
        let (name, value) = parse_header(header_str)?;
        debug!(header = %name, "Adding request header");
        headers.insert(name, value);
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::ACCEPT;

    #[test]
    fn test_headers_override_base() {
        let mut base = HeaderMap::new();
        base.insert(ACCEPT, HeaderValue::from_static("image/*"));

        let headers = parse_headers(
            base,
            &[
                "Referer: https://example.com/".to_string(),
                "accept:image/png".to_string(),
            ],
        )
        .unwrap();

        assert_eq!(headers.get("referer").unwrap(), "https://example.com/");
        assert_eq!(headers.get(ACCEPT).unwrap(), "image/png");
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_value_may_contain_colons() {
        let headers =
            parse_headers(HeaderMap::new(), &["X-Origin: http://a:8080".to_string()]).unwrap();
        assert_eq!(headers.get("x-origin").unwrap(), "http://a:8080");
    }

    #[test]
    fn test_rejects_malformed_headers() {
        assert!(parse_headers(HeaderMap::new(), &["no colon".to_string()]).is_err());
        assert!(parse_headers(HeaderMap::new(), &["bad name: v".to_string()]).is_err());
    }
}
