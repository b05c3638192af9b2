use std::collections::HashMap;

use serde::Serialize;

/// Wire shape of the retry-context header value.
#[derive(Serialize)]
struct RetryContext {
    attempt: u32,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
    error_code: Option<u16>,
}

/// Builds the header map for the next request.
///
/// When `header_name` is unset or `attempt` is still zero, the caller
/// headers pass through unchanged. Otherwise the retry-context header is
/// inserted with a JSON value encoding the 0-based attempt index and the
/// status code that caused the previous attempt to retry.
pub(crate) fn with_retry_context(
    headers: Option<&HashMap<String, String>>,
    header_name: Option<&str>,
    attempt: u32,
    error_code: Option<u16>,
) -> HashMap<String, String> {
    let mut out = headers.cloned().unwrap_or_default();
    let Some(name) = header_name else {
        return out;
    };
    if attempt < 1 {
        return out;
    }
    let context = RetryContext {
        attempt,
        error_code,
    };
    if let Ok(value) = serde_json::to_string(&context) {
        out.insert(name.to_owned(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::with_retry_context;

    fn caller_headers() -> HashMap<String, String> {
        HashMap::from([("x-request-id".to_owned(), "abc".to_owned())])
    }

    #[test]
    fn no_header_name_passes_headers_through() {
        let headers = caller_headers();
        let built = with_retry_context(Some(&headers), None, 3, Some(502));
        assert_eq!(built, headers);
    }

    #[test]
    fn attempt_zero_emits_no_context() {
        let headers = caller_headers();
        let built = with_retry_context(Some(&headers), Some("x-retry-context"), 0, None);
        assert_eq!(built, headers);
    }

    #[test]
    fn context_encodes_attempt_and_error_code() {
        let built = with_retry_context(None, Some("x-retry-context"), 2, Some(429));
        assert_eq!(
            built.get("x-retry-context").map(String::as_str),
            Some(r#"{"attempt":2,"errorCode":429}"#)
        );
    }

    #[test]
    fn error_code_is_omitted_when_absent() {
        let built = with_retry_context(None, Some("x-retry-context"), 1, None);
        assert_eq!(
            built.get("x-retry-context").map(String::as_str),
            Some(r#"{"attempt":1}"#)
        );
    }

    #[test]
    fn caller_headers_are_preserved_alongside_context() {
        let headers = caller_headers();
        let built = with_retry_context(Some(&headers), Some("x-retry-context"), 1, Some(503));
        assert_eq!(built.get("x-request-id").map(String::as_str), Some("abc"));
        assert!(built.contains_key("x-retry-context"));
    }
}
