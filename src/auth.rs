//! Bearer credential discovery.
//!
//! The channel appends a bearer token to its connection URL only when one
//! can be read: from explicit configuration, or from a cookie string that is
//! not HTTP-only. When neither is available the connection is made without
//! a token and the server falls back to its own cookie authentication.

/// Cookie names that may carry the bearer token, in preference order.
pub const TOKEN_COOKIE_NAMES: &[&str] = &["auth_token", "access_token"];

/// Extract the bearer token from a `Cookie`-style string
/// (`name=value; other=value`).
pub fn bearer_from_cookies(cookies: &str) -> Option<String> {
    let pairs: Vec<(&str, &str)> = cookies
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim(), value.trim().trim_matches('"')))
        .collect();

    TOKEN_COOKIE_NAMES.iter().find_map(|wanted| {
        pairs
            .iter()
            .find(|(name, value)| name == wanted && !value.is_empty())
            .map(|(_, value)| (*value).to_string())
    })
}

/// Pick the token to use: an explicit one wins over a cookie.
pub fn resolve_token(explicit: Option<&str>, cookies: Option<&str>) -> Option<String> {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    let token = cookies.and_then(bearer_from_cookies);
    if token.is_none() {
        log::debug!("[Auth] No readable bearer token, connecting without one");
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_token_cookie() {
        assert_eq!(
            bearer_from_cookies("theme=dark; auth_token=abc.def; _session=xyz"),
            Some("abc.def".to_string())
        );
    }

    #[test]
    fn test_prefers_first_listed_name() {
        assert_eq!(
            bearer_from_cookies("access_token=second; auth_token=first"),
            Some("first".to_string())
        );
    }

    #[test]
    fn test_absent_or_empty_token() {
        assert_eq!(bearer_from_cookies(""), None);
        assert_eq!(bearer_from_cookies("auth_token=; theme=dark"), None);
        assert_eq!(bearer_from_cookies("garbage"), None);
    }

    #[test]
    fn test_quoted_value() {
        assert_eq!(
            bearer_from_cookies(r#"auth_token="q1""#),
            Some("q1".to_string())
        );
    }

    #[test]
    fn test_explicit_token_wins() {
        assert_eq!(
            resolve_token(Some("explicit"), Some("auth_token=cookie")),
            Some("explicit".to_string())
        );
        assert_eq!(
            resolve_token(Some("  "), Some("auth_token=cookie")),
            Some("cookie".to_string())
        );
        assert_eq!(resolve_token(None, None), None);
    }
}
