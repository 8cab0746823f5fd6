use trellis_core::config::GatewayConfig;

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthResult {
    /// Subject the caller authenticated as (matched against workflow owner).
    pub subject: String,
    /// Master-token callers may touch any workflow.
    pub master: bool,
}

/// Full validation: Bearer header -> api_keys -> master token -> anonymous.
///
/// Returns `Some(AuthResult)` on success, `None` on auth failure.
pub fn validate_auth(
    config: &GatewayConfig,
    bearer: Option<&str>,
    query_token: Option<&str>,
) -> Option<AuthResult> {
    let presented = bearer.or(query_token);

    if let Some(token) = presented {
        for key in &config.api_keys {
            if key.key == token {
                return Some(AuthResult {
                    subject: key.name.clone(),
                    master: false,
                });
            }
        }
        if config.token.as_deref() == Some(token) {
            return Some(AuthResult {
                subject: "master".into(),
                master: true,
            });
        }
        return None; // Token provided but no match
    }

    // No auth configured = anonymous access
    if config.token.is_none() && config.api_keys.is_empty() {
        Some(AuthResult {
            subject: "anonymous".into(),
            master: true,
        })
    } else {
        None
    }
}

/// Extract the token from the query string (?auth-token=...).
pub fn extract_token_from_query(query: &str) -> Option<&str> {
    for pair in query.split('&') {
        if let Some(val) = pair.strip_prefix("auth-token=") {
            return Some(val);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::config::ApiKeyConfig;

    fn gateway(token: Option<&str>, api_keys: Vec<ApiKeyConfig>) -> GatewayConfig {
        GatewayConfig {
            bind: "127.0.0.1:8080".to_string(),
            token: token.map(|s| s.to_string()),
            api_keys,
        }
    }

    #[test]
    fn no_auth_configured_is_anonymous() {
        let config = gateway(None, vec![]);
        let auth = validate_auth(&config, None, None).expect("anonymous");
        assert!(auth.master);
        // A presented token with nothing configured still fails
        assert!(validate_auth(&config, Some("anything"), None).is_none());
    }

    #[test]
    fn master_token_via_bearer_or_query() {
        let config = gateway(Some("secret"), vec![]);
        assert!(validate_auth(&config, None, None).is_none());
        assert!(validate_auth(&config, Some("wrong"), None).is_none());

        let auth = validate_auth(&config, Some("secret"), None).expect("bearer");
        assert!(auth.master);

        let auth = validate_auth(&config, None, Some("secret")).expect("query");
        assert!(auth.master);
    }

    #[test]
    fn api_key_authenticates_subject() {
        let config = gateway(
            Some("master-tok"),
            vec![ApiKeyConfig {
                name: "ada".into(),
                key: "tk_ada".into(),
            }],
        );

        let auth = validate_auth(&config, Some("tk_ada"), None).expect("api key");
        assert_eq!(auth.subject, "ada");
        assert!(!auth.master);

        let auth = validate_auth(&config, Some("master-tok"), None).expect("master");
        assert!(auth.master);
    }

    #[test]
    fn extract_auth_token() {
        assert_eq!(extract_token_from_query("auth-token=abc"), Some("abc"));
        assert_eq!(
            extract_token_from_query("foo=bar&auth-token=abc"),
            Some("abc")
        );
        assert_eq!(extract_token_from_query("token=abc"), None);
    }
}
