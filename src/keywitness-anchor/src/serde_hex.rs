//! Serialize byte fields as lowercase hex strings.
//!
//! Use with `#[serde(with = "keywitness_anchor::serde_hex")]` on `Vec<u8>`
//! or fixed-size array fields.

use serde::{Deserialize, Deserializer, Serializer};

/// Serialize bytes as a hex string.
pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    serializer.serialize_str(&hex::encode(bytes.as_ref()))
}

/// Deserialize bytes from a hex string.
pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<Vec<u8>>,
{
    let s = String::deserialize(deserializer)?;
    let raw = hex::decode(&s).map_err(serde::de::Error::custom)?;
    let len = raw.len();
    T::try_from(raw)
        .map_err(|_| serde::de::Error::custom(format!("unexpected byte length {len}")))
}
