//! Elliptic-curve cryptography.
//!
//! Arithmetic is performed on affine coordinates; the point at infinity is represented as `None`.


pub mod curves;


use num_bigint::BigUint;
use zeroize::Zeroizing;

use crate::crypt::{biguint_to_padded_be_bytes, byte_length, Error};


/// A point in affine coordinates.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AffinePoint {
    x: BigUint,
    y: BigUint,
}
impl AffinePoint {
    pub const fn new(x: BigUint, y: BigUint) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> &BigUint { &self.x }
    pub fn y(&self) -> &BigUint { &self.y }

    /// Serializes the point as `0x04 ‖ x ‖ y` with both coordinates left-padded to
    /// `bytes_per_component` bytes.
    pub fn to_be_bytes(&self, bytes_per_component: usize) -> Zeroizing<Vec<u8>> {
        let mut ret = Zeroizing::new(Vec::with_capacity(1 + 2*bytes_per_component));
        ret.push(0x04); // uncompressed coordinates
        ret.extend(biguint_to_padded_be_bytes(&self.x, bytes_per_component).iter());
        ret.extend(biguint_to_padded_be_bytes(&self.y, bytes_per_component).iter());
        ret
    }

    pub fn try_from_be_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            // mode x y
            return None;
        }
        if bytes[0] != 0x04 {
            // we only support the uncompressed representation
            return None;
        }
        if (bytes.len() - 1) % 2 != 0 {
            // it must be possible to split the value in the middle
            return None;
        }
        let coordinate_length = (bytes.len() - 1) / 2;

        let x = BigUint::from_bytes_be(&bytes[1..1+coordinate_length]);
        let y = BigUint::from_bytes_be(&bytes[1+coordinate_length..]);
        Some(Self { x, y })
    }
}


/// An elliptic curve of the form `y**2 ≡ x**3 + ax + b` modulo a prime number.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PrimeWeierstrassCurve {
    /// The prime (modulus) of the curve.
    prime: BigUint,

    /// Coefficient `a` in the curve's formula.
    coefficient_a: BigUint,

    /// Coefficient `b` in the curve's formula.
    coefficient_b: BigUint,

    /// The coordinates of the generator point of the curve.
    generator: AffinePoint,

    /// The cofactor of the curve.
    ///
    /// All curves standardized for PACE have a cofactor of 1.
    cofactor: u8,
}
impl PrimeWeierstrassCurve {
    pub fn new(
        prime: BigUint,
        coefficient_a: BigUint,
        coefficient_b: BigUint,
        generator: AffinePoint,
        cofactor: u8,
    ) -> Self {
        Self {
            prime,
            coefficient_a,
            coefficient_b,
            generator,
            cofactor,
        }
    }

    pub fn prime(&self) -> &BigUint { &self.prime }
    pub fn coefficient_a(&self) -> &BigUint { &self.coefficient_a }
    pub fn coefficient_b(&self) -> &BigUint { &self.coefficient_b }
    pub fn generator(&self) -> &AffinePoint { &self.generator }
    pub fn cofactor(&self) -> u8 { self.cofactor }

    /// Calculates the number of bytes a private key used with this curve should have.
    pub fn private_key_len_bytes(&self) -> usize {
        byte_length(&self.prime)
    }

    fn sub_mod(&self, lhs: &BigUint, rhs: &BigUint) -> BigUint {
        ((lhs % &self.prime) + &self.prime - (rhs % &self.prime)) % &self.prime
    }

    fn invert_mod(&self, value: &BigUint) -> BigUint {
        // Fermat's little theorem; the modulus is prime
        let exponent = &self.prime - BigUint::from(2u8);
        value.modpow(&exponent, &self.prime)
    }

    pub fn is_on_curve(&self, point: &AffinePoint) -> bool {
        if point.x >= self.prime || point.y >= self.prime {
            return false;
        }
        let y_squared = (&point.y * &point.y) % &self.prime;
        let x_cubed = (&point.x * &point.x * &point.x) % &self.prime;
        let ax = (&self.coefficient_a * &point.x) % &self.prime;
        let rhs = (x_cubed + ax + &self.coefficient_b) % &self.prime;
        y_squared == rhs
    }

    fn double_point(&self, point: &AffinePoint) -> Option<AffinePoint> {
        if point.y == BigUint::from(0u8) {
            return None;
        }
        // lambda = (3x**2 + a) / 2y
        let numerator = (BigUint::from(3u8) * &point.x * &point.x + &self.coefficient_a) % &self.prime;
        let denominator = (BigUint::from(2u8) * &point.y) % &self.prime;
        let lambda = (numerator * self.invert_mod(&denominator)) % &self.prime;

        let x = self.sub_mod(&(&lambda * &lambda), &(BigUint::from(2u8) * &point.x));
        let y = self.sub_mod(&(&lambda * self.sub_mod(&point.x, &x)), &point.y);
        Some(AffinePoint { x, y })
    }

    fn add_points(&self, lhs: Option<&AffinePoint>, rhs: Option<&AffinePoint>) -> Option<AffinePoint> {
        let (lhs, rhs) = match (lhs, rhs) {
            (None, None) => return None,
            (Some(p), None)|(None, Some(p)) => return Some(p.clone()),
            (Some(l), Some(r)) => (l, r),
        };
        if lhs.x == rhs.x {
            if lhs.y == rhs.y {
                return self.double_point(lhs);
            }
            // P + (-P)
            return None;
        }

        // lambda = (y2 - y1) / (x2 - x1)
        let numerator = self.sub_mod(&rhs.y, &lhs.y);
        let denominator = self.sub_mod(&rhs.x, &lhs.x);
        let lambda = (numerator * self.invert_mod(&denominator)) % &self.prime;

        let x = self.sub_mod(&self.sub_mod(&(&lambda * &lambda), &lhs.x), &rhs.x);
        let y = self.sub_mod(&(&lambda * self.sub_mod(&lhs.x, &x)), &lhs.y);
        Some(AffinePoint { x, y })
    }

    fn multiply_scalar_with_point(&self, scalar: &BigUint, point: &AffinePoint) -> Option<AffinePoint> {
        // double-and-add, most significant bit first
        let mut result: Option<AffinePoint> = None;
        for bit_index in (0..scalar.bits()).rev() {
            result = match &result {
                Some(r) => self.double_point(r),
                None => None,
            };
            if scalar.bit(bit_index) {
                result = self.add_points(result.as_ref(), Some(point));
            }
        }
        result
    }

    /// Calculates `private_key * generator`.
    pub fn calculate_public_key(&self, private_key: &BigUint) -> Result<AffinePoint, Error> {
        self.multiply_scalar_with_point(private_key, &self.generator)
            .ok_or(Error::PointAtInfinity)
    }

    /// Calculates `private_key * other_public_key`, ensuring that the other party's public key is
    /// on the curve.
    pub fn diffie_hellman(&self, private_key: &BigUint, other_public_key: &AffinePoint) -> Result<AffinePoint, Error> {
        if !self.is_on_curve(other_public_key) {
            return Err(Error::PublicKey);
        }
        self.multiply_scalar_with_point(private_key, other_public_key)
            .ok_or(Error::PointAtInfinity)
    }

    /// Generic mapping: the same curve with the generator `nonce * generator + shared_secret`.
    pub fn derive_generic_mapping_session_curve(&self, nonce: &BigUint, shared_secret: &AffinePoint) -> Result<Self, Error> {
        let nonce_generator = self.multiply_scalar_with_point(nonce, &self.generator);
        let new_generator = self.add_points(nonce_generator.as_ref(), Some(shared_secret))
            .ok_or(Error::PointAtInfinity)?;
        Ok(Self {
            prime: self.prime.clone(),
            coefficient_a: self.coefficient_a.clone(),
            coefficient_b: self.coefficient_b.clone(),
            generator: new_generator,
            cofactor: self.cofactor,
        })
    }
}
