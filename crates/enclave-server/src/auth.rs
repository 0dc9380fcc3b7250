//! Caller identity extraction.
//!
//! Authentication happens upstream (SSO gateway). The gateway forwards the
//! verified identity in request headers; requests without them are refused.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use enclave_shared::constants::{DISPLAY_NAME_HEADER, DOMAIN_HEADER, IDENTITY_HEADER};
use enclave_shared::types::{Caller, DomainId, IdentityId};

use crate::api::AppState;
use crate::error::ServerError;

/// The verified caller of a request. Extracting it also records the
/// identity, seeding the domain's default channels on first sight.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Caller);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let caller = caller_from_headers(&parts.headers)?;
        state.engine.register(&caller)?;
        Ok(Authenticated(caller))
    }
}

pub fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, ServerError> {
    let identity = header(headers, IDENTITY_HEADER)?
        .ok_or_else(|| ServerError::Unauthorized("missing identity".into()))?;
    let domain = header(headers, DOMAIN_HEADER)?
        .ok_or_else(|| ServerError::Unauthorized("missing domain".into()))?;

    let identity = IdentityId::new(identity.trim())
        .map_err(|e| ServerError::Unauthorized(format!("identity: {e}")))?;
    let domain =
        DomainId::new(domain).map_err(|e| ServerError::Unauthorized(format!("domain: {e}")))?;

    let caller = Caller::new(identity, domain);
    Ok(match header(headers, DISPLAY_NAME_HEADER)? {
        Some(name) if !name.trim().is_empty() => caller.with_display_name(name.trim()),
        _ => caller,
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ServerError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| ServerError::Unauthorized(format!("{name} is not valid text"))),
    }
}
