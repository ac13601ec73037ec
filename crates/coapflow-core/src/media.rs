//! Content formats
//!
//! CoAP identifies media types by small integers carried in the
//! Content-Format and Accept options.

use std::fmt;

/// A CoAP content format identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediaType(pub u16);

impl MediaType {
    pub const TEXT_PLAIN: MediaType = MediaType(0);
    pub const LINK_FORMAT: MediaType = MediaType(40);
    pub const APPLICATION_XML: MediaType = MediaType(41);
    pub const OCTET_STREAM: MediaType = MediaType(42);
    pub const EXI: MediaType = MediaType(47);
    pub const JSON: MediaType = MediaType(50);
    pub const CBOR: MediaType = MediaType(60);

    const KNOWN: [(MediaType, &'static str); 7] = [
        (MediaType::TEXT_PLAIN, "text/plain"),
        (MediaType::LINK_FORMAT, "application/link-format"),
        (MediaType::APPLICATION_XML, "application/xml"),
        (MediaType::OCTET_STREAM, "application/octet-stream"),
        (MediaType::EXI, "application/exi"),
        (MediaType::JSON, "application/json"),
        (MediaType::CBOR, "application/cbor"),
    ];

    /// Every media type this implementation knows about, in registry order
    pub fn all() -> impl Iterator<Item = MediaType> {
        Self::KNOWN.iter().map(|(media, _)| *media)
    }

    pub fn is_known(&self) -> bool {
        Self::KNOWN.iter().any(|(media, _)| media == self)
    }

    /// Registered name, or `unknown/<id>` for unregistered identifiers
    pub fn name(&self) -> String {
        Self::KNOWN
            .iter()
            .find(|(media, _)| media == self)
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| format!("unknown/{}", self.0))
    }

    pub fn id(&self) -> u16 {
        self.0
    }
}

impl Default for MediaType {
    fn default() -> Self {
        MediaType::TEXT_PLAIN
    }
}

impl From<u16> for MediaType {
    fn from(id: u16) -> Self {
        MediaType(id)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_types() {
        assert_eq!(MediaType::all().count(), 7);
        assert!(MediaType::JSON.is_known());
        assert!(!MediaType(9999).is_known());
        assert_eq!(MediaType::TEXT_PLAIN.name(), "text/plain");
        assert_eq!(MediaType(9999).name(), "unknown/9999");
    }
}
