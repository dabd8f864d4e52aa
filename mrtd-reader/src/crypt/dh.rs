//! Classic Diffie-Hellman over a prime-order subgroup of the multiplicative group modulo a prime.


use hex_literal::hex;
use num_bigint::BigUint;

use crate::crypt::{byte_length, Error};


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DiffieHellmanParams {
    /// The prime or modulus.
    prime: BigUint,

    /// The generator or base.
    generator: BigUint,

    /// The order of the subgroup generated by `generator`.
    subgroup_order: BigUint,
}
impl DiffieHellmanParams {
    pub fn new(prime: BigUint, generator: BigUint, subgroup_order: BigUint) -> Self {
        Self {
            prime,
            generator,
            subgroup_order,
        }
    }

    pub fn prime(&self) -> &BigUint { &self.prime }
    pub fn generator(&self) -> &BigUint { &self.generator }
    pub fn subgroup_order(&self) -> &BigUint { &self.subgroup_order }

    pub fn prime_len_bytes(&self) -> usize {
        byte_length(&self.prime)
    }

    pub fn subgroup_size_bytes(&self) -> usize {
        byte_length(&self.subgroup_order)
    }

    /// `generator ** private_key mod prime`
    pub fn calculate_public_key(&self, private_key: &BigUint) -> BigUint {
        self.generator.modpow(private_key, &self.prime)
    }

    /// `other_public_key ** private_key mod prime`
    ///
    /// The other party's public key must be in `2..prime-1` and belong to the subgroup.
    pub fn diffie_hellman(&self, private_key: &BigUint, other_public_key: &BigUint) -> Result<BigUint, Error> {
        let one = BigUint::from(1u8);
        let prime_minus_one = &self.prime - &one;
        if other_public_key <= &one || other_public_key >= &prime_minus_one {
            return Err(Error::PublicKey);
        }
        if other_public_key.modpow(&self.subgroup_order, &self.prime) != one {
            return Err(Error::PublicKey);
        }
        Ok(other_public_key.modpow(private_key, &self.prime))
    }

    /// Generic mapping: `generator' = generator ** nonce * shared_secret mod prime`.
    pub fn derive_generic_mapping(&self, nonce: &BigUint, shared_secret: &BigUint) -> Self {
        let mapped_generator = (self.generator.modpow(nonce, &self.prime) * shared_secret) % &self.prime;
        Self {
            prime: self.prime.clone(),
            generator: mapped_generator,
            subgroup_order: self.subgroup_order.clone(),
        }
    }
}


pub mod params {
    //! Standardized Diffie-Hellman domain parameters usable with PACE.

    use super::*;

    /// 1024-bit MODP group with 160-bit prime order subgroup (RFC 5114 § 2.1); PACE parameter ID 0.
    pub fn get_1024_modp_160_po() -> DiffieHellmanParams {
        DiffieHellmanParams::new(
            BigUint::from_bytes_be(&hex!("
                B10B8F96 A080E01D DE92DE5E AE5D54EC
                52C99FBC FB06A3C6 9A6A9DCA 52D23B61
                6073E286 75A23D18 9838EF1E 2EE652C0
                13ECB4AE A9061123 24975C3C D49B83BF
                ACCBDD7D 90C4BD70 98488E9C 219A7372
                4EFFD6FA E5644738 FAA31A4F F55BCCC0
                A151AF5F 0DC8B4BD 45BF37DF 365C1A65
                E68CFDA7 6D4DA708 DF1FB2BC 2E4A4371
            ")),
            BigUint::from_bytes_be(&hex!("
                A4D1CBD5 C3FD3412 6765A442 EFB99905
                F8104DD2 58AC507F D6406CFF 14266D31
                266FEA1E 5C41564B 777E690F 5504F213
                160217B4 B01B886A 5E91547F 9E2749F4
                D7FBD7D3 B9A92EE1 909D0D22 63F80A76
                A6A24C08 7A091F53 1DBF0A01 69B6A28A
                D662A4D1 8E73AFA3 2D779D59 18D08BC8
                858F4DCE F97C2A24 855E6EEB 22B3B2E5
            ")),
            BigUint::from_bytes_be(&hex!("
                F518AA87 81A8DF27 8ABA4E7D 64B7CB9D 49462353
            ")),
        )
    }
}
