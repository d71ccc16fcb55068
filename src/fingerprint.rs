//! Relay fingerprints and document digests
//!
//! Documents refer to the same 160-bit values in several encodings: spaced
//! or unspaced hex in server descriptors, unpadded base64 in the consensus,
//! lowercase hex in archive file names.

use std::fmt;

use crate::error::DocumentParseError;

/// Length of a SHA-1 digest in bytes
pub const DIGEST_LEN: usize = 20;

/// A 160-bit relay identity or document digest.
///
/// Displays as 40 uppercase hex characters, `{:x}` gives the lowercase form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; DIGEST_LEN]);

impl Fingerprint {
    pub fn from_u8(raw: &[u8]) -> Fingerprint {
        let mut bytes = [0u8; DIGEST_LEN];
        let len = raw.len().min(DIGEST_LEN);
        bytes[..len].copy_from_slice(&raw[..len]);
        Fingerprint(bytes)
    }

    /// Parse 40 hex characters of either case.
    pub fn from_str_hex(s: &str) -> Result<Fingerprint, DocumentParseError> {
        let invalid = || DocumentParseError::InvalidFingerprint { raw: s.to_string() };
        if s.len() != 2 * DIGEST_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let mut bytes = [0u8; DIGEST_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Fingerprint(bytes))
    }

    /// Parse the (usually unpadded) base64 form used in consensus documents.
    pub fn from_str_b64(s: &str) -> Result<Fingerprint, DocumentParseError> {
        Fingerprint::from_str_hex(&base64_to_string(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Compare against a hex string, ignoring case and surrounding whitespace.
    pub fn matches(&self, hex: &str) -> bool {
        format!("{:x}", self).eq_ignore_ascii_case(hex.trim())
    }
}

impl fmt::UpperHex for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::LowerHex for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::UpperHex::fmt(self, f)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Decode standard base64, with or without trailing padding, into lowercase
/// hex.
pub fn base64_to_string(encoded: &str) -> Result<String, base64::DecodeError> {
    let mut padded = encoded.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let decoded = base64::decode(padded)?;
    Ok(decoded.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Parse a port number.
///
/// Anything that is not a number in `0..=65535` yields 0, which therefore
/// stands for both "no port" and "invalid port".
pub fn string_to_port(port: &str) -> u16 {
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    port.parse::<u16>().unwrap_or(0)
}

/// Strip surrounding whitespace and uppercase a fingerprint.
pub fn sanitise_fingerprint(fingerprint: &str) -> String {
    fingerprint.trim().to_uppercase()
}
