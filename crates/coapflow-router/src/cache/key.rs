//! Cache keys
//!
//! A key normalizes the parts of a proxied request that select a stored
//! representation: target URI, media type and request payload. The payload
//! takes part so that different bodies posted to the same target do not
//! share an entry.

use bytes::Bytes;
use coapflow_core::{MediaType, Request, Response};
use std::fmt;

use super::CacheError;

/// Identity of one cached response variant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    proxy_uri: String,
    media_type: MediaType,
    payload: Bytes,
}

impl CacheKey {
    pub fn new(proxy_uri: impl Into<String>, media_type: MediaType, payload: impl Into<Bytes>) -> Self {
        Self {
            proxy_uri: proxy_uri.into(),
            media_type,
            payload: payload.into(),
        }
    }

    /// One key per accepted media type
    ///
    /// A request without Accept options fans out to every known media type.
    pub fn from_accept_options(request: &Request) -> Result<Vec<CacheKey>, CacheError> {
        let proxy_uri = request.proxy_target()?;

        let keys = if request.accept.is_empty() {
            MediaType::all()
                .map(|media| CacheKey::new(proxy_uri.clone(), media, request.payload.clone()))
                .collect()
        } else {
            request
                .accept
                .iter()
                .map(|media| CacheKey::new(proxy_uri.clone(), *media, request.payload.clone()))
                .collect()
        };

        Ok(keys)
    }

    /// Key addressing what the origin actually returned
    ///
    /// Responses without a Content-Format are stored as text/plain.
    pub fn from_content_format(request: &Request, response: &Response) -> Result<CacheKey, CacheError> {
        let proxy_uri = request.proxy_target()?;
        let media_type = response.content_format.unwrap_or_default();
        Ok(CacheKey::new(proxy_uri, media_type, request.payload.clone()))
    }

    pub fn proxy_uri(&self) -> &str {
        &self.proxy_uri
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.proxy_uri, self.media_type)
    }
}
