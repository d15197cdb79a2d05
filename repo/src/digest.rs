use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;

use crate::error::StoreError;

/// The identity of an immutable blob: a case-insensitive `<algo>:<hex>` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algo: String,
    hex: String,
}

impl Digest {
    pub fn algo(&self) -> &str {
        &self.algo
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// The sharded path of the blob relative to the blobs root:
    /// `<algo>/<hex[0:2]>/<hex[2:4]>/<hex>`.
    pub fn blob_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{}/{}/{}/{}",
            self.algo,
            &self.hex[..2],
            &self.hex[2..4],
            self.hex
        ))
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidDigest(s.to_string()))?;
        let algo = algo.to_ascii_lowercase();
        let hex = hex.to_ascii_lowercase();
        if algo.is_empty() || hex.is_empty() {
            return Err(StoreError::InvalidDigest(s.to_string()));
        }
        if hex.len() < 4 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidDigest(s.to_string()));
        }
        Ok(Digest { algo, hex })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_lowercases() {
        let digest: Digest = "SHA256:ABCDEF012345".parse().unwrap();
        assert_eq!(digest.algo(), "sha256");
        assert_eq!(digest.hex(), "abcdef012345");
        assert_eq!(digest.to_string(), "sha256:abcdef012345");
    }

    #[test]
    fn sharded_blob_path() {
        let digest: Digest = "sha256:abcdef012345".parse().unwrap();
        assert_eq!(
            digest.blob_path().as_str(),
            "sha256/ab/cd/abcdef012345"
        );
    }

    #[test]
    fn rejects_malformed() {
        for input in ["", "no-colon", ":abcd", "sha256:", "sha256:abc", "sha256:zzzz"] {
            assert!(input.parse::<Digest>().is_err(), "{input:?} should fail");
        }
    }
}
