//! Module identities and their display form.
//!
//! A [`ModuleIdentity`] is the `(name, version, culture, public key token)` tuple that the
//! runtime uses to decide whether two binaries are "the same module". Its display form,
//!
//! ```text
//! Name, Version=1.2.3.4, Culture=neutral, PublicKeyToken=null
//! ```
//!
//! is what duplicate resolution compares when it has to find the file that backs a live
//! module, and what the host reports as a module's full name.
//!
//! # Examples
//!
//! ```rust
//! use dotswap::image::{ModuleIdentity, ModuleVersion};
//!
//! let identity = ModuleIdentity::new("Lib").with_version(ModuleVersion::new(1, 0, 0, 0));
//! assert_eq!(identity.display_name(), "Lib, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null");
//!
//! let parsed = ModuleIdentity::parse(&identity.display_name())?;
//! assert_eq!(parsed, identity);
//! # Ok::<(), dotswap::Error>(())
//! ```

use std::{fmt, fmt::Write as _, path::Path};

use sha1::{Digest, Sha1};

use crate::{
    file::File,
    image::{pe::Container, reader::module_identity},
    Result,
};

/// Four part module version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ModuleVersion {
    /// Major version component
    pub major: u16,
    /// Minor version component
    pub minor: u16,
    /// Build number component
    pub build: u16,
    /// Revision number component
    pub revision: u16,
}

impl ModuleVersion {
    /// Create a version from its four components.
    #[must_use]
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Parse `major[.minor[.build[.revision]]]`; missing components are 0.
    ///
    /// # Errors
    /// Returns an error if the string has more than four components or a component is not
    /// a `u16`.
    pub fn parse(version_str: &str) -> Result<Self> {
        let parts: Vec<&str> = version_str.split('.').collect();

        if parts.is_empty() || parts.len() > 4 {
            return Err(malformed_error!("Invalid version format: {}", version_str));
        }

        let mut components = [0u16; 4];
        for (i, part) in parts.iter().enumerate() {
            components[i] = part
                .parse::<u16>()
                .map_err(|_| malformed_error!("Invalid version component: {}", part))?;
        }

        Ok(Self::new(
            components[0],
            components[1],
            components[2],
            components[3],
        ))
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// The identity of a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ModuleIdentity {
    /// Simple name, e.g. `Assembly-CSharp`
    pub name: String,
    /// Four part version
    pub version: ModuleVersion,
    /// Culture, `None` for culture neutral modules
    pub culture: Option<String>,
    /// Public key token of strong named modules
    pub public_key_token: Option<[u8; 8]>,
}

impl ModuleIdentity {
    /// A culture neutral, unsigned identity with version 0.0.0.0.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ModuleIdentity {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the version.
    #[must_use]
    pub fn with_version(mut self, version: ModuleVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the culture; `"neutral"` clears it.
    #[must_use]
    pub fn with_culture(mut self, culture: &str) -> Self {
        self.culture = (culture != "neutral").then(|| culture.to_string());
        self
    }

    /// Set the public key token directly.
    #[must_use]
    pub fn with_public_key_token(mut self, token: [u8; 8]) -> Self {
        self.public_key_token = Some(token);
        self
    }

    /// Derive the public key token from a full public key.
    #[must_use]
    pub fn with_public_key(mut self, public_key: &[u8]) -> Self {
        self.public_key_token = Some(public_key_token(public_key));
        self
    }

    /// The simple name.
    #[must_use]
    pub fn simple_name(&self) -> &str {
        &self.name
    }

    /// The runtime display name.
    #[must_use]
    pub fn display_name(&self) -> String {
        let mut result = String::with_capacity(self.name.len() + 80);

        result.push_str(&self.name);
        let _ = write!(result, ", Version={}", self.version);
        let _ = write!(
            result,
            ", Culture={}",
            self.culture.as_deref().unwrap_or("neutral")
        );

        result.push_str(", PublicKeyToken=");
        match &self.public_key_token {
            Some(token) => {
                for byte in token {
                    let _ = write!(result, "{byte:02x}");
                }
            }
            None => result.push_str("null"),
        }

        result
    }

    /// Parse a display name.
    ///
    /// Unknown components are ignored, missing ones take their defaults.
    ///
    /// # Errors
    /// Returns an error for an empty name, a malformed version or a public key token that
    /// is not 16 hex digits.
    pub fn parse(display_name: &str) -> Result<Self> {
        let mut parts = display_name.split(',').map(str::trim);

        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(malformed_error!("Module name cannot be empty"));
        }

        let mut identity = ModuleIdentity::new(name);
        for part in parts {
            if let Some(value) = part.strip_prefix("Version=") {
                identity.version = ModuleVersion::parse(value)?;
            } else if let Some(value) = part.strip_prefix("Culture=") {
                identity = identity.with_culture(value);
            } else if let Some(value) = part.strip_prefix("PublicKeyToken=") {
                if value != "null" && !value.is_empty() {
                    identity.public_key_token = Some(parse_token(value)?);
                }
            }
        }

        Ok(identity)
    }

    /// Read the identity of the module image at `path`.
    ///
    /// Only the PE headers and the metadata tables are parsed; method bodies are not
    /// decoded.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a managed PE image.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let file = File::from_file(path)?;
        Self::read_from_bytes(file.data())
    }

    /// Read the identity of an in-memory module image.
    ///
    /// # Errors
    /// Returns an error if `data` is not a managed PE image.
    pub fn read_from_bytes(data: &[u8]) -> Result<Self> {
        module_identity(&Container::read(data)?.container)
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// The ECMA-335 public key token: the last 8 bytes of the SHA-1 of the key, reversed.
#[must_use]
pub fn public_key_token(public_key: &[u8]) -> [u8; 8] {
    let mut hasher = Sha1::new();
    hasher.update(public_key);
    let hash = hasher.finalize();

    let mut token = [0u8; 8];
    for (i, byte) in hash.iter().rev().take(8).enumerate() {
        token[i] = *byte;
    }
    token
}

fn parse_token(value: &str) -> Result<[u8; 8]> {
    if value.len() != 16 || !value.is_ascii() {
        return Err(malformed_error!(
            "PublicKeyToken must be exactly 16 hex characters, got '{}'",
            value
        ));
    }

    let mut token = [0u8; 8];
    for (i, byte) in token.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16)
            .map_err(|e| malformed_error!("Invalid hex in PublicKeyToken '{}': {}", value, e))?;
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name() {
        let identity = ModuleIdentity::new("Assembly-CSharp");
        assert_eq!(
            identity.display_name(),
            "Assembly-CSharp, Version=0.0.0.0, Culture=neutral, PublicKeyToken=null"
        );

        let signed = ModuleIdentity::new("mscorlib")
            .with_version(ModuleVersion::new(4, 0, 0, 0))
            .with_public_key_token([0xb7, 0x7a, 0x5c, 0x56, 0x19, 0x34, 0xe0, 0x89]);
        assert_eq!(
            signed.to_string(),
            "mscorlib, Version=4.0.0.0, Culture=neutral, PublicKeyToken=b77a5c561934e089"
        );
    }

    #[test]
    fn parse() {
        let parsed = ModuleIdentity::parse(
            "mscorlib, Version=4.0.0.0, Culture=neutral, PublicKeyToken=b77a5c561934e089",
        )
        .unwrap();
        assert_eq!(parsed.name, "mscorlib");
        assert_eq!(parsed.version, ModuleVersion::new(4, 0, 0, 0));
        assert_eq!(parsed.culture, None);
        assert_eq!(
            parsed.public_key_token,
            Some([0xb7, 0x7a, 0x5c, 0x56, 0x19, 0x34, 0xe0, 0x89])
        );

        let localized = ModuleIdentity::parse("Res, Version=1.2, Culture=de-DE").unwrap();
        assert_eq!(localized.version, ModuleVersion::new(1, 2, 0, 0));
        assert_eq!(localized.culture.as_deref(), Some("de-DE"));

        assert!(ModuleIdentity::parse("").is_err());
        assert!(ModuleIdentity::parse("X, Version=1.2.3.4.5").is_err());
        assert!(ModuleIdentity::parse("X, PublicKeyToken=abc").is_err());
    }

    #[test]
    fn public_key_token_is_reversed_sha1_tail() {
        // SHA-1("abc") = a9993e36 4706816a ba3e2571 7850c26c 9cd0d89d
        let token = public_key_token(b"abc");
        assert_eq!(token, [0x9d, 0xd8, 0xd0, 0x9c, 0x6c, 0xc2, 0x50, 0x78]);
    }

    #[test]
    fn read_from_file() {
        use std::io::Write;

        let mut image = crate::test::ImageBuilder::new("Lib").build();
        image.identity = ModuleIdentity::new("Lib")
            .with_version(ModuleVersion::new(1, 2, 3, 4))
            .with_culture("en-US");

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&image.to_bytes().unwrap().bytes).unwrap();
        tmp.flush().unwrap();

        assert_eq!(ModuleIdentity::read_from_file(tmp.path()).unwrap(), image.identity);
    }

    #[test]
    fn read_from_other_files() {
        assert!(matches!(
            ModuleIdentity::read_from_bytes(b"\x7FELF\x02\x01"),
            Err(crate::Error::NotSupported)
        ));
        assert!(ModuleIdentity::read_from_bytes(b"MZ").is_err());
    }
}
