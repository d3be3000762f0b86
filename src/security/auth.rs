use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::config::Settings;
use crate::context::Identity;
use crate::error::Error;
use crate::middleware::{Exchange, Middleware, Next};

/// Maps a bearer token to the identity it stands for.
pub trait IdentityResolver: Send + Sync {
    /// `None` when the token is unknown, expired or otherwise invalid.
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<Identity>>;
}

/// A fixed token table.
///
/// # Examples
///
/// ```rust
/// use tandem::context::Identity;
/// use tandem::security::StaticTokens;
///
/// let tokens = StaticTokens::new().with_token("valid-token", Identity::new("John Doe"));
/// assert_eq!(tokens.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Identity>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for StaticTokens {
    fn resolve<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<Identity>> {
        let identity = self.tokens.get(token).cloned();
        Box::pin(async move { identity })
    }
}

/// Resolves the caller from the `Authorization` header.
///
/// Sets `scope.current_user` to the resolved identity, or to `None` when the
/// header is absent or the token does not resolve. It never rejects a
/// request; handlers that need a caller use
/// [`RequestContext::require_user`](crate::context::RequestContext::require_user).
///
/// The header may carry the raw token or `<scheme> <token>`, with the scheme
/// matched case-insensitively.
pub struct Authentication {
    resolver: Arc<dyn IdentityResolver>,
    scheme: String,
}

impl Authentication {
    pub fn new(resolver: impl IdentityResolver + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
            scheme: "Bearer".to_owned(),
        }
    }

    /// Uses `settings.auth_scheme` as the token prefix.
    pub fn from_settings(resolver: impl IdentityResolver + 'static, settings: &Settings) -> Self {
        Self::new(resolver).with_scheme(settings.auth_scheme.clone())
    }

    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn token<'h>(&self, header: &'h str) -> &'h str {
        let header = header.trim();
        match header.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case(&self.scheme) => token.trim(),
            _ => header,
        }
    }
}

impl Middleware for Authentication {
    fn exec<'a>(&'a self, mut exchange: Exchange, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let token = exchange
                .scope
                .headers
                .get("authorization")
                .map(|header| self.token(header).to_owned());

            exchange.scope.current_user = match token {
                Some(token) if !token.is_empty() => self.resolver.resolve(&token).await,
                _ => None,
            };
            debug!(
                authenticated = exchange.scope.current_user.is_some(),
                "resolved caller"
            );

            next.run(exchange).await
        })
    }

    fn name(&self) -> &'static str {
        "Authentication"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> Authentication {
        Authentication::new(StaticTokens::new().with_token("valid-token", Identity::new("John Doe")))
    }

    #[test]
    fn scheme_prefix_is_optional() {
        let auth = auth();
        assert_eq!(auth.token("valid-token"), "valid-token");
        assert_eq!(auth.token("Bearer valid-token"), "valid-token");
        assert_eq!(auth.token("bearer  valid-token "), "valid-token");
        assert_eq!(auth.token("Token valid-token"), "Token valid-token");
    }

    #[tokio::test]
    async fn static_tokens_resolve_known_tokens_only() {
        let tokens = StaticTokens::new().with_token("valid-token", Identity::new("John Doe"));
        assert_eq!(tokens.resolve("valid-token").await.map(|i| i.id), Some("John Doe".to_owned()));
        assert!(tokens.resolve("nope").await.is_none());
    }
}
