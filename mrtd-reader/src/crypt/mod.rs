//! Cryptographic functionality.


pub mod cipher_mac;
pub mod dh;
pub mod elliptic;


use std::fmt;

use num_bigint::BigUint;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::crypt::dh::DiffieHellmanParams;
use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    KeyLength { obtained: usize },
    UnalignedData { obtained: usize },
    InvalidPadding,
    PublicKey,
    PointAtInfinity,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyLength { obtained }
                => write!(f, "key or IV of {} bytes has the wrong length", obtained),
            Self::UnalignedData { obtained }
                => write!(f, "{} bytes of data are not a multiple of the block size", obtained),
            Self::InvalidPadding
                => write!(f, "invalid padding"),
            Self::PublicKey
                => write!(f, "invalid public key"),
            Self::PointAtInfinity
                => write!(f, "operation resulted in the point at infinity"),
        }
    }
}
impl std::error::Error for Error {
}


/// A key exchange method.
///
/// Private keys are unsigned integers.
///
/// For classic Diffie-Hellman, public keys and shared secrets are serialized as unsigned integers
/// in big-endian byte order, left-padded with zeroes to the byte length of the prime.
///
/// For elliptic-curve Diffie-Hellman, public keys are serialized in the following sequence:
/// 1. the byte `0x04` to signify uncompressed coordinates
/// 2. the x coordinate as an unsigned integer in big-endian byte order
/// 3. the y coordinate as an unsigned integer in big-endian byte order
///
/// Both coordinates are left-padded to the byte length of the curve's prime. The shared secret is
/// the x coordinate of the shared point, encoded the same way.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyExchange {
    DiffieHellman(DiffieHellmanParams),
    PrimeWeierstrassEllipticDiffieHellman(PrimeWeierstrassCurve),
}
impl KeyExchange {
    /// Returns the recommended number of bytes for a private key using this key exchange method.
    pub fn private_key_len_bytes(&self) -> usize {
        match self {
            Self::DiffieHellman(dhp) => dhp.subgroup_size_bytes(),
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => curve.private_key_len_bytes(),
        }
    }

    /// Generates a random private key of the recommended length.
    pub fn generate_private_key(&self) -> BigUint {
        let mut private_key_bytes = Zeroizing::new(vec![0u8; self.private_key_len_bytes()]);
        loop {
            OsRng.fill_bytes(private_key_bytes.as_mut_slice());
            let private_key = BigUint::from_bytes_be(&private_key_bytes);
            if private_key > BigUint::from(1u8) {
                return private_key;
            }
        }
    }

    /// Calculates a public key for the given private key, returning it serialized to bytes.
    pub fn calculate_public_key(&self, private_key: &BigUint) -> Result<Zeroizing<Vec<u8>>, Error> {
        match self {
            Self::DiffieHellman(dhp) => {
                let public_key_int = dhp.calculate_public_key(private_key);
                Ok(biguint_to_padded_be_bytes(&public_key_int, dhp.prime_len_bytes()))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let public_key_point = curve.calculate_public_key(private_key)?;
                Ok(public_key_point.to_be_bytes(curve.private_key_len_bytes()))
            },
        }
    }

    /// Performs the key exchange using the given private key and the other party's public key,
    /// generating a shared secret.
    pub fn exchange_keys(&self, private_key: &BigUint, other_public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        match self {
            Self::DiffieHellman(dhp) => {
                let other_public_key_int = BigUint::from_bytes_be(other_public_key);
                let shared_secret = dhp.diffie_hellman(private_key, &other_public_key_int)?;
                Ok(biguint_to_padded_be_bytes(&shared_secret, dhp.prime_len_bytes()))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other_public_key_point = AffinePoint::try_from_be_bytes(other_public_key)
                    .ok_or(Error::PublicKey)?;
                let shared_secret_point = curve.diffie_hellman(private_key, &other_public_key_point)?;
                Ok(biguint_to_padded_be_bytes(shared_secret_point.x(), curve.private_key_len_bytes()))
            },
        }
    }

    /// Derives a new key exchange method using generic mapping.
    ///
    /// The generic mapping process keeps the same parameters but derives a new generator using a
    /// given nonce and a shared secret derived from the given private key and the other party's
    /// public key using the current key exchange method.
    ///
    /// Since the derivation requires both coordinates of the shared point with elliptic-curve
    /// Diffie-Hellman, the key exchange step is integrated into this function, as
    /// [`Self::exchange_keys`] only returns the x coordinate.
    pub fn derive_generic_mapping(&self, nonce: &BigUint, private_key: &BigUint, other_public_key: &[u8]) -> Result<Self, Error> {
        match self {
            Self::DiffieHellman(dhp) => {
                let other_public_key_int = BigUint::from_bytes_be(other_public_key);
                let shared_secret = dhp.diffie_hellman(private_key, &other_public_key_int)?;
                Ok(Self::DiffieHellman(dhp.derive_generic_mapping(nonce, &shared_secret)))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other_public_key_point = AffinePoint::try_from_be_bytes(other_public_key)
                    .ok_or(Error::PublicKey)?;
                let shared_secret_point = curve.diffie_hellman(private_key, &other_public_key_point)?;
                Ok(Self::PrimeWeierstrassEllipticDiffieHellman(
                    curve.derive_generic_mapping_session_curve(nonce, &shared_secret_point)?,
                ))
            },
        }
    }

    /// The ASN.1 tag representing this type of public key.
    pub fn public_key_tag(&self) -> u8 {
        match self {
            Self::DiffieHellman(_) => 0x84, // Diffie-Hellman public key
            Self::PrimeWeierstrassEllipticDiffieHellman(_) => 0x86, // elliptic curve point
        }
    }
}


/// Serializes an unsigned integer in big-endian byte order, left-padded with zeroes to at least
/// `length` bytes.
pub fn biguint_to_padded_be_bytes(value: &BigUint, length: usize) -> Zeroizing<Vec<u8>> {
    let bytes = Zeroizing::new(value.to_bytes_be());
    let mut ret = Zeroizing::new(Vec::with_capacity(length.max(bytes.len())));
    for _ in bytes.len()..length {
        ret.push(0x00);
    }
    ret.extend(bytes.iter());
    ret
}

/// The number of bytes required to store the given unsigned integer.
pub(crate) fn byte_length(value: &BigUint) -> usize {
    usize::try_from((value.bits() + 7) / 8).unwrap_or(usize::MAX)
}
