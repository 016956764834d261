//! Fixed-size binary identifiers used throughout the merchant backend
//!
//! Keys, hashes, signatures and wire-transfer identifiers are plain byte
//! arrays whose meaning comes from the type wrapping them. On the wire
//! they travel as Crockford base32 strings, which is the text encoding
//! wallets and exchanges use for every binary field.
//!
//! # Types
//!
//! - [`HashCode`]: 512-bit SHA-512 output (contract hashes, `h_wire`, pickup ids)
//! - [`WireTransferId`]: 256-bit identifier of an aggregated bank transfer
//! - Public-key newtypes for merchants, coins, exchanges, masters and reserves
//! - [`EddsaSignature`]: 512-bit Ed25519 signature
//! - [`EddsaPrivateKey`]: 256-bit Ed25519 seed (merchant and reserve keys)
//! - [`Salt`] and [`TipId`]: 256-bit random values

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Crockford base32 alphabet (no I, L, O, U)
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Error decoding a base32 string into a binary value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// A character outside the Crockford alphabet was found
    #[error("invalid base32 character '{character}' at position {position}")]
    InvalidCharacter { character: char, position: usize },

    /// The decoded value has the wrong size for the target type
    #[error("expected {expected} bytes, decoded {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// Encode bytes as Crockford base32
///
/// Bits are consumed most-significant first; the final group is padded
/// with zero bits. No padding characters are emitted.
pub fn encode_base32(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut bits: u32 = 0;
    let mut vbit: u32 = 0;
    let mut rpos = 0;

    while rpos < data.len() || vbit > 0 {
        if rpos < data.len() && vbit < 5 {
            bits = (bits << 8) | u32::from(data[rpos]);
            rpos += 1;
            vbit += 8;
        }
        if vbit < 5 {
            bits <<= 5 - vbit;
            vbit = 5;
        }
        let index = (bits >> (vbit - 5)) & 31;
        out.push(ALPHABET[index as usize] as char);
        vbit -= 5;
        bits &= (1 << vbit) - 1;
    }
    out
}

fn decode_symbol(c: char, position: usize) -> Result<u32, EncodingError> {
    let upper = c.to_ascii_uppercase();
    let mapped = match upper {
        'O' => '0',
        'I' | 'L' => '1',
        'U' => 'V',
        other => other,
    };
    ALPHABET
        .iter()
        .position(|&a| a as char == mapped)
        .map(|p| p as u32)
        .ok_or(EncodingError::InvalidCharacter {
            character: c,
            position,
        })
}

/// Decode a Crockford base32 string into bytes
///
/// Lower-case input and the usual look-alike substitutions (`O`, `I`, `L`,
/// `U`) are accepted. Trailing padding bits are discarded.
pub fn decode_base32(input: &str) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut bits: u32 = 0;
    let mut vbit: u32 = 0;

    for (position, c) in input.chars().enumerate() {
        bits = (bits << 5) | decode_symbol(c, position)?;
        vbit += 5;
        if vbit >= 8 {
            out.push((bits >> (vbit - 8)) as u8);
            vbit -= 8;
            bits &= (1 << vbit) - 1;
        }
    }
    Ok(out)
}

/// Decode a base32 string into a fixed-size array
pub fn decode_base32_fixed<const N: usize>(input: &str) -> Result<[u8; N], EncodingError> {
    let bytes = decode_base32(input)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| EncodingError::WrongLength {
            expected: N,
            actual: bytes.len(),
        })
}

/// Declare a fixed-size binary newtype with base32 text encoding
macro_rules! fixed_blob {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Size of the value in bytes
            pub const LEN: usize = $len;

            /// Wrap raw bytes
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Fill a new value from the thread-local CSPRNG
            pub fn random() -> Self {
                let mut bytes = [0u8; $len];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&encode_base32(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let encoded = encode_base32(&self.0);
                write!(f, "{}({}..)", stringify!($name), &encoded[..8.min(encoded.len())])
            }
        }

        impl FromStr for $name {
            type Err = EncodingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_base32_fixed::<$len>(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&encode_base32(&self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_blob!(
    /// SHA-512 digest
    HashCode,
    64
);

fixed_blob!(
    /// Identifier of a wire transfer aggregating one or more deposits
    WireTransferId,
    32
);

fixed_blob!(
    /// Ed25519 signature
    EddsaSignature,
    64
);

fixed_blob!(
    /// Per-account salt mixed into `h_wire`
    Salt,
    32
);

fixed_blob!(
    /// Random identifier of a tip authorization
    TipId,
    32
);

fixed_blob!(
    /// Ed25519 public key of a merchant instance
    MerchantPublicKey,
    32
);

fixed_blob!(
    /// Ed25519 public key of a coin
    CoinPublicKey,
    32
);

fixed_blob!(
    /// Ed25519 online signing key of an exchange
    ExchangePublicKey,
    32
);

fixed_blob!(
    /// Long-term Ed25519 master key of an exchange
    MasterPublicKey,
    32
);

fixed_blob!(
    /// Ed25519 public key of a tipping reserve
    ReservePublicKey,
    32
);

/// Ed25519 private key seed
///
/// Used for merchant instance keys and tip reserve keys. The `Debug`
/// rendering never shows key material.
#[derive(Clone, PartialEq, Eq)]
pub struct EddsaPrivateKey(pub [u8; 32]);

impl EddsaPrivateKey {
    /// Generate a fresh random private key
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self(seed)
    }

    /// Borrow the seed bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EddsaPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EddsaPrivateKey(<redacted>)")
    }
}

impl FromStr for EddsaPrivateKey {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_base32_fixed::<32>(s).map(Self)
    }
}

impl Serialize for EddsaPrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_base32(&self.0))
    }
}

impl<'de> Deserialize<'de> for EddsaPrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Variable-length binary value (denomination keys, blinded coins)
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_base32(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode_base32(&s).map(Blob).map_err(serde::de::Error::custom)
    }
}
