//! Redacting display adapters for log output.
//!
//! Bridge lines name non-public entry points and must not end up in logs
//! verbatim; neither must cookie material.

use std::fmt;

/// A bridge line showing only its transport name.
pub struct RedactedBridge<'a>(pub &'a str);

impl fmt::Display for RedactedBridge<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.split_whitespace().next() {
            // A transport name never contains ':' or '.'; an address does.
            Some(first) if !first.contains([':', '.']) => write!(f, "{first} [REDACTED]"),
            Some(_) => write!(f, "[REDACTED]"),
            None => write!(f, "[EMPTY]"),
        }
    }
}

impl fmt::Debug for RedactedBridge<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact the argument of commands that carry secrets.
pub struct RedactedCommand<'a>(pub &'a str);

impl fmt::Display for RedactedCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.split_once(' ') {
            Some((verb, _)) if verb.eq_ignore_ascii_case("AUTHENTICATE") => {
                write!(f, "{verb} [REDACTED]")
            }
            Some((verb, _)) if verb.eq_ignore_ascii_case("SETCONF") => {
                write!(f, "{verb} [..]")
            }
            _ => f.write_str(self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_bridge() {
        let line = "obfs4 192.95.36.142:443 CDF2E852 cert=abc iat-mode=1";
        assert_eq!(RedactedBridge(line).to_string(), "obfs4 [REDACTED]");
    }

    #[test]
    fn test_redacted_vanilla_bridge() {
        assert_eq!(RedactedBridge("192.0.2.1:9001 ABCDEF").to_string(), "[REDACTED]");
        assert_eq!(RedactedBridge("  ").to_string(), "[EMPTY]");
    }

    #[test]
    fn test_redacted_bytes() {
        assert_eq!(RedactedBytes(&[0u8; 32]).to_string(), "[32 bytes]");
    }

    #[test]
    fn test_redacted_command() {
        assert_eq!(
            RedactedCommand("AUTHENTICATE 0a0b0c").to_string(),
            "AUTHENTICATE [REDACTED]"
        );
        assert_eq!(RedactedCommand("GETINFO version").to_string(), "GETINFO version");
    }
}
