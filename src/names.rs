//! Validated newtypes wrapping the name-shaped strings that appear in
//! header fields: interface, member, and error names, and bus names.
//!
//! Each follows the same grammar family as
//! `signature::validate_object_path`: dot- or colon-separated segments of
//! `[A-Za-z_][A-Za-z0-9_]*`, capped at 255 bytes.

use crate::error::{Error, Result};

fn validate_dotted(s: &str, allow_leading_colon: bool) -> Result<()> {
    if s.is_empty() || s.len() > 255 {
        return Err(Error::InvalidSignature);
    }
    let body = if allow_leading_colon && s.starts_with(':') { &s[1..] } else { s };
    if !body.contains('.') && !allow_leading_colon {
        return Err(Error::InvalidSignature);
    }
    for (i, seg) in body.split('.').enumerate() {
        if seg.is_empty() {
            return Err(Error::InvalidSignature);
        }
        for (j, b) in seg.bytes().enumerate() {
            let ok = b.is_ascii_alphabetic()
                || b == b'_'
                || b == b'-'
                || (j > 0 && b.is_ascii_digit())
                || (allow_leading_colon && i == 0 && b.is_ascii_digit());
            if !ok {
                return Err(Error::InvalidSignature);
            }
        }
    }
    Ok(())
}

macro_rules! dotted_name {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self> {
                let s = s.into();
                validate_dotted(&s, false)?;
                Ok($name(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

dotted_name!(InterfaceName, "A dot-separated interface name, e.g. `org.freedesktop.DBus`.");
dotted_name!(ErrorName, "A dot-separated error name, e.g. `org.freedesktop.DBus.Error.Failed`.");

/// A method or signal member name: a single `[A-Za-z_][A-Za-z0-9_]*`
/// segment (no dots).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberName(String);

impl MemberName {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() || s.len() > 255 {
            return Err(Error::InvalidSignature);
        }
        for (i, b) in s.bytes().enumerate() {
            let ok = b.is_ascii_alphabetic() || b == b'_' || (i > 0 && b.is_ascii_digit());
            if !ok {
                return Err(Error::InvalidSignature);
            }
        }
        Ok(MemberName(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MemberName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A bus name: either unique (`:1.42`) or well-known (`org.foo.Bar`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusName(String);

impl BusName {
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        validate_dotted(&s, true)?;
        Ok(BusName(s))
    }

    pub fn is_unique(&self) -> bool {
        self.0.starts_with(':')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BusName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_grammar() {
        assert!(InterfaceName::new("org.freedesktop.DBus").is_ok());
        assert!(InterfaceName::new("noops").is_err());
        assert!(InterfaceName::new("").is_err());
    }

    #[test]
    fn member_name_grammar() {
        assert!(MemberName::new("Ping").is_ok());
        assert!(MemberName::new("1Ping").is_err());
        assert!(MemberName::new("Pi.ng").is_err());
    }

    #[test]
    fn bus_name_unique_vs_well_known() {
        let unique = BusName::new(":1.42").unwrap();
        assert!(unique.is_unique());
        let known = BusName::new("org.freedesktop.DBus").unwrap();
        assert!(!known.is_unique());
    }
}
