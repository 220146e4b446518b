//! Caller identity as asserted by the fronting gateway.
//!
//! The gateway authenticates the request and forwards the user id and a
//! comma-separated role list. Handlers receive the resulting
//! [`AuthContext`] and check roles explicitly.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::Serialize;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLES_HEADER: &str = "x-user-roles";
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub current_user: Option<String>,
    pub roles: Vec<String>,
}

impl AuthContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let current_user = header(USER_ID_HEADER).map(str::to_string);
        let roles = header(USER_ROLES_HEADER)
            .map(|raw| {
                raw.split(',')
                    .map(|r| r.trim().to_ascii_lowercase())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self { current_user, roles }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parses_user_and_roles() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u-17"));
        headers.insert(USER_ROLES_HEADER, HeaderValue::from_static("editor, Admin ,"));

        let auth = AuthContext::from_headers(&headers);
        assert_eq!(auth.current_user.as_deref(), Some("u-17"));
        assert_eq!(auth.roles, vec!["editor", "admin"]);
        assert!(auth.has_role(ADMIN_ROLE));
    }

    #[test]
    fn test_missing_headers_is_anonymous() {
        let auth = AuthContext::from_headers(&HeaderMap::new());
        assert_eq!(auth, AuthContext::default());
        assert!(!auth.has_role(ADMIN_ROLE));
    }
}
