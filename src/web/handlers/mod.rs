pub mod api;
pub mod chat;

use axum::http::HeaderMap;

/// Header set by the fronting auth layer to name the caller's organization.
pub const ORG_HEADER: &str = "x-org-id";

pub fn org_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ORG_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn org_header_is_trimmed_and_optional() {
        let mut headers = HeaderMap::new();
        assert_eq!(org_id(&headers), None);

        headers.insert(ORG_HEADER, HeaderValue::from_static("  "));
        assert_eq!(org_id(&headers), None);

        headers.insert(ORG_HEADER, HeaderValue::from_static(" acme "));
        assert_eq!(org_id(&headers).as_deref(), Some("acme"));
    }
}
