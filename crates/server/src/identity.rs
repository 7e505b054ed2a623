//! Identity extraction
//!
//! Authentication happens at an upstream reverse proxy which injects the
//! caller's identity as headers; the server trusts them as-is. For each
//! field the first present header wins. Requests without any identity get
//! a synthetic development identity so the server stays usable without a
//! proxy in front.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use huddle_core::User;

const USER_HEADERS: &[&str] = &["x-forwarded-user", "x-auth-request-user"];
const EMAIL_HEADERS: &[&str] = &["x-forwarded-email", "x-auth-request-email"];
const NAME_HEADERS: &[&str] = &[
    "x-forwarded-preferred-username",
    "x-auth-request-preferred-username",
];

const FALLBACK_EMAIL: &str = "dev@example.com";
const FALLBACK_NAME: &str = "Developer";

/// The caller, as asserted by the proxy.
pub struct Identity(pub User);

fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

pub fn user_from_headers(headers: &HeaderMap) -> User {
    let email = first_header(headers, EMAIL_HEADERS)
        .unwrap_or_else(|| FALLBACK_EMAIL.to_string());
    let name = first_header(headers, NAME_HEADERS).unwrap_or_else(|| FALLBACK_NAME.to_string());
    // a missing user id falls back to the email
    let id = first_header(headers, USER_HEADERS).unwrap_or_else(|| email.clone());
    User { id, email, name }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Identity(user_from_headers(&parts.headers)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn forwarded_headers_win_over_auth_request() {
        let user = user_from_headers(&headers(&[
            ("x-forwarded-user", "alice"),
            ("x-auth-request-user", "other"),
            ("x-forwarded-email", "alice@example.com"),
            ("x-forwarded-preferred-username", "Alice"),
        ]));
        assert_eq!(user.id, "alice");
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.name, "Alice");
    }

    #[test]
    fn auth_request_headers_are_accepted() {
        let user = user_from_headers(&headers(&[
            ("x-auth-request-user", "bob"),
            ("x-auth-request-email", "bob@example.com"),
            ("x-auth-request-preferred-username", "Bob"),
        ]));
        assert_eq!(user.id, "bob");
        assert_eq!(user.email, "bob@example.com");
        assert_eq!(user.name, "Bob");
    }

    #[test]
    fn missing_user_id_falls_back_to_email() {
        let user = user_from_headers(&headers(&[("x-forwarded-email", "carol@example.com")]));
        assert_eq!(user.id, "carol@example.com");
    }

    #[test]
    fn anonymous_requests_get_the_development_identity() {
        let user = user_from_headers(&HeaderMap::new());
        assert_eq!(user.email, FALLBACK_EMAIL);
        assert_eq!(user.name, FALLBACK_NAME);
        assert_eq!(user.id, FALLBACK_EMAIL);
    }
}
