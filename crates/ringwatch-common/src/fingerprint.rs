use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable 128-bit identity of a time series.
///
/// Serialized as a 32-character lowercase hex string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u128);

impl Fingerprint {
    /// Computes `MD5(ident || metric || concat(tags_sorted))`.
    ///
    /// Fields are separated by a NUL byte so that adjacent fields cannot
    /// shift characters into each other.
    ///
    /// # Examples
    ///
    /// ```
    /// use ringwatch_common::fingerprint::Fingerprint;
    ///
    /// let a = Fingerprint::compute("web-01", "cpu_util", &["app=api".into()]);
    /// let b = Fingerprint::compute("web-01", "cpu_util", &["app=api".into()]);
    /// assert_eq!(a, b);
    /// assert_ne!(a, Fingerprint::compute("web-02", "cpu_util", &["app=api".into()]));
    /// ```
    pub fn compute(ident: &str, metric: &str, tags_sorted: &[String]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(ident.as_bytes());
        hasher.update([0u8]);
        hasher.update(metric.as_bytes());
        hasher.update([0u8]);
        for pair in tags_sorted {
            hasher.update(pair.as_bytes());
            hasher.update([0u8]);
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hasher.finalize());
        Fingerprint(u128::from_be_bytes(bytes))
    }

    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u128::from_str_radix(s, 16).ok().map(Fingerprint)
    }

    /// Ring position of this fingerprint.
    pub fn ring_key(self) -> u64 {
        hash64(&self.0.to_be_bytes())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint: {s}")))
    }
}

/// 64-bit hash: the leading eight bytes of the MD5 digest.
pub fn hash64(bytes: &[u8]) -> u64 {
    let digest = Md5::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Hex MD5 of the parts joined with `_`.
pub fn md5_hex(parts: &[&str]) -> String {
    let digest = Md5::digest(parts.join("_").as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
