// SPDX-License-Identifier: MPL-2.0

//! HTTP Basic authentication against the credential store

use axum::http::{HeaderMap, header};
use base64::prelude::*;
use tracing::debug;

use crate::accounts::CredentialStore;
use crate::errors::LeaseError;

/// Username and password from an `Authorization: Basic ...` header
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        debug!(scheme, "Unsupported authorization scheme");
        return None;
    }
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Resolve the request's credentials to a username
pub fn authenticate(headers: &HeaderMap, store: &dyn CredentialStore) -> Result<String, LeaseError> {
    let Some((username, password)) = basic_credentials(headers) else {
        return Err(LeaseError::MissingCredentials);
    };
    if username.is_empty() {
        return Err(LeaseError::MissingCredentials);
    }

    match store.lookup(&username) {
        Some(user) if user.password == password => Ok(username),
        _ => Err(LeaseError::Unauthorized(username)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::UserData;
    use axum::http::HeaderValue;

    struct OneUser;

    impl CredentialStore for OneUser {
        fn lookup(&self, username: &str) -> Option<UserData> {
            (username == "alice").then(|| UserData {
                username: "alice".into(),
                password: "secret".into(),
                role: "viewer".into(),
            })
        }
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn basic(user: &str, pass: &str) -> HeaderMap {
        headers(&format!(
            "Basic {}",
            BASE64_STANDARD.encode(format!("{user}:{pass}"))
        ))
    }

    #[test]
    fn valid_credentials_resolve_to_username() {
        assert_eq!(authenticate(&basic("alice", "secret"), &OneUser).unwrap(), "alice");
    }

    #[test]
    fn wrong_password_and_unknown_user_are_rejected() {
        assert!(matches!(
            authenticate(&basic("alice", "nope"), &OneUser),
            Err(LeaseError::Unauthorized(_))
        ));
        assert!(matches!(
            authenticate(&basic("mallory", "secret"), &OneUser),
            Err(LeaseError::Unauthorized(_))
        ));
    }

    #[test]
    fn missing_or_foreign_headers_are_unauthenticated() {
        assert!(matches!(
            authenticate(&HeaderMap::new(), &OneUser),
            Err(LeaseError::MissingCredentials)
        ));
        assert!(matches!(
            authenticate(&headers("Bearer abc"), &OneUser),
            Err(LeaseError::MissingCredentials)
        ));
        assert!(matches!(
            authenticate(&headers("Basic !!!"), &OneUser),
            Err(LeaseError::MissingCredentials)
        ));
    }

    #[test]
    fn passwords_may_contain_colons() {
        assert_eq!(
            basic_credentials(&basic("alice", "a:b")),
            Some(("alice".to_string(), "a:b".to_string()))
        );
    }
}
