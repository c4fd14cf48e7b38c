//! Mapping between message headers and prefixed HTTP headers.

use http::{HeaderMap, HeaderName, HeaderValue};
use mice_transport::{Result, TransportError};
use std::collections::HashMap;

/// Prefix marking HTTP headers that carry message headers.
pub const HEADER_PREFIX: &str = "X-Mice-";

// `http` stores header names lower-cased.
const HEADER_PREFIX_LOWER: &str = "x-mice-";

/// Turn message headers into `X-Mice-<key>` HTTP headers.
///
/// # Errors
///
/// Returns `InvalidHeader` if a key is not a valid header token or a value
/// contains bytes HTTP does not allow.
pub fn to_http(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_bytes(format!("{HEADER_PREFIX}{key}").as_bytes()).map_err(
            |e| TransportError::InvalidHeader {
                name: key.clone(),
                reason: e.to_string(),
            },
        )?;
        let value = HeaderValue::from_str(value).map_err(|e| TransportError::InvalidHeader {
            name: key.clone(),
            reason: e.to_string(),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Collect the `X-Mice-` headers, prefix stripped. Keys come back
/// lower-cased; values that are not visible ASCII are skipped.
#[must_use]
pub fn from_http(map: &HeaderMap) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(HEADER_PREFIX_LOWER)?;
            let value = value.to_str().ok()?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
