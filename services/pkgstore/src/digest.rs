//! SHA-256 content digests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

const ALGORITHM_PREFIX: &str = "sha256:";

/// The digest string was not 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid digest: {0:?}")]
pub struct DigestError(pub String);

/// A SHA-256 digest, the primary key of every stored blob.
///
/// Displays as 64 lowercase hex characters. Parsing accepts the same form,
/// optionally prefixed with `sha256:` as OCI clients send it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hash a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Hash several slices as if they were one contiguous buffer.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self::from_hasher(hasher)
    }

    /// Finish a running hash.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hasher.finalize().into())
    }

    /// A digest of random bytes, used as the placeholder key for open uploads.
    pub fn random() -> Self {
        Self::of(uuid::Uuid::new_v4().as_bytes())
    }

    /// Lowercase hex form.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// `sha256:<hex>` form used in OCI headers.
    pub fn oci(&self) -> String {
        format!("{ALGORITHM_PREFIX}{}", self.hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.hex())
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s.strip_prefix(ALGORITHM_PREFIX).unwrap_or(s);
        let lowercase_hex = hex_part
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if hex_part.len() != 64 || !lowercase_hex {
            return Err(DigestError(s.to_owned()));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes).map_err(|_| DigestError(s.to_owned()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLOWORLD: &str = "936a185caaa266bb9cbe981e9e05cb78cd732b0b3280eb944412bb6f8f8f07af";

    #[test]
    fn hashes_and_formats() {
        let digest = Digest::of(b"helloworld");
        assert_eq!(digest.to_string(), HELLOWORLD);
        assert_eq!(digest.oci(), format!("sha256:{HELLOWORLD}"));
        assert_eq!(Digest::of_parts(&[b"hello", b"world"]), digest);
    }

    #[test]
    fn parses_with_and_without_prefix() {
        let bare: Digest = HELLOWORLD.parse().unwrap();
        let prefixed: Digest = format!("sha256:{HELLOWORLD}").parse().unwrap();
        assert_eq!(bare, prefixed);
    }

    #[test]
    fn rejects_malformed() {
        assert!("".parse::<Digest>().is_err());
        assert!("sha256:abc".parse::<Digest>().is_err());
        assert!(HELLOWORLD.to_uppercase().parse::<Digest>().is_err());
        assert!(format!("sha512:{HELLOWORLD}").parse::<Digest>().is_err());
        assert!(format!("{HELLOWORLD}00").parse::<Digest>().is_err());
    }

    #[test]
    fn random_digests_differ() {
        assert_ne!(Digest::random(), Digest::random());
    }

    #[test]
    fn serde_uses_hex() {
        let digest = Digest::of(b"helloworld");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{HELLOWORLD}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
