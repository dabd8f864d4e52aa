//! Cipher and MAC (message authentication code) combinations.


use aes::{Aes128, Aes192, Aes256};
use block_padding::NoPadding;
use cipher::{BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::generic_array::GenericArray;
use cmac::{Cmac, Mac};
use des::{Des, TdesEde2};
use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::Error;


/// Appends ISO/IEC 9797-1 padding method 2 (a single `0x80` byte followed by as many `0x00` bytes
/// as necessary) up to the next multiple of `block_size`.
///
/// A full block of padding is appended if the data is already aligned.
pub fn pad_iso9797_method2(data: &mut Vec<u8>, block_size: usize) {
    data.push(0x80);
    while data.len() % block_size != 0 {
        data.push(0x00);
    }
}

/// Strips ISO/IEC 9797-1 padding method 2, returning the length of the unpadded data.
pub fn unpad_iso9797_method2(data: &[u8]) -> Result<usize, Error> {
    let mut length = data.len();
    while length > 0 && data[length - 1] == 0x00 {
        length -= 1;
    }
    if length == 0 || data[length - 1] != 0x80 {
        return Err(Error::InvalidPadding);
    }
    Ok(length - 1)
}


fn cbc_encrypt<C>(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>
    where C: BlockEncryptMut + BlockCipher + KeyInit
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;
    let data_len = data.len();
    encryptor.encrypt_padded_mut::<NoPadding>(data, data_len)
        .map_err(|_| Error::UnalignedData { obtained: data_len })?;
    Ok(())
}

fn cbc_decrypt<C>(data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>
    where C: BlockDecryptMut + BlockCipher + KeyInit
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;
    let data_len = data.len();
    decryptor.decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| Error::UnalignedData { obtained: data_len })?;
    Ok(())
}

fn truncated_cmac<M: Mac + KeyInit>(data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;
    Mac::update(&mut mac, data);
    let full_mac = mac.finalize().into_bytes();
    Ok(Zeroizing::new(full_mac[0..8].to_vec()))
}

/// Retail MAC (ISO/IEC 9797-1 MAC algorithm 3) with single DES and a zero IV.
///
/// `K1 = key[0..8]` drives the CBC chain; the final block is decrypted with `K2 = key[8..16]` and
/// encrypted with `K1` again.
fn retail_mac(data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    if key.len() != 16 {
        return Err(Error::KeyLength { obtained: key.len() });
    }
    if data.len() % 8 != 0 {
        return Err(Error::UnalignedData { obtained: data.len() });
    }
    let k1 = Des::new_from_slice(&key[0..8])
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;
    let k2 = Des::new_from_slice(&key[8..16])
        .map_err(|_| Error::KeyLength { obtained: key.len() })?;

    let mut state = Zeroizing::new([0u8; 8]);
    for block in data.chunks(8) {
        for (s, b) in state.iter_mut().zip(block.iter()) {
            *s ^= *b;
        }
        k1.encrypt_block(GenericArray::from_mut_slice(&mut state[..]));
    }
    k2.decrypt_block(GenericArray::from_mut_slice(&mut state[..]));
    k1.encrypt_block(GenericArray::from_mut_slice(&mut state[..]));
    Ok(Zeroizing::new(state.to_vec()))
}


/// A combination of cipher, MAC and KDF (key derivation function) usable during authentication and
/// Secure Messaging.
///
/// | suite  | cipher (CBC)   | MAC                      | KDF                          |
/// |--------|----------------|--------------------------|------------------------------|
/// | `Tdes` | 2-key 3DES EDE | Retail MAC with DES      | `sha1(seed ‖ c)[0..16]`      |
/// | `Aes128` | AES-128      | CMAC truncated to 8 bytes | `sha1(seed ‖ c)[0..16]`     |
/// | `Aes192` | AES-192      | CMAC truncated to 8 bytes | `sha256(seed ‖ c)[0..24]`   |
/// | `Aes256` | AES-256      | CMAC truncated to 8 bytes | `sha256(seed ‖ c)`          |
///
/// `c` is a 32-bit big-endian counter: 1 for encryption keys, 2 for MAC keys and 3 for keys
/// derived from a PACE password.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CipherSuite {
    Tdes,
    Aes128,
    Aes192,
    Aes256,
}
impl CipherSuite {
    /// Size of the cipher key in bytes.
    pub fn cipher_key_size(&self) -> usize {
        match self {
            Self::Tdes => 16,
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Block size of the cipher in bytes.
    ///
    /// Secure Messaging pads both the MAC input and the encrypted data to this size.
    pub fn cipher_block_size(&self) -> usize {
        match self {
            Self::Tdes => 8,
            Self::Aes128|Self::Aes192|Self::Aes256 => 16,
        }
    }

    pub fn is_aes(&self) -> bool {
        !matches!(self, Self::Tdes)
    }

    /// The key derivation function.
    pub fn derive_key(&self, key_seed: &[u8], counter: u32) -> Zeroizing<Vec<u8>> {
        let key_size = self.cipher_key_size();
        match self {
            Self::Tdes|Self::Aes128 => {
                let mut hasher = Sha1::new();
                Digest::update(&mut hasher, key_seed);
                Digest::update(&mut hasher, counter.to_be_bytes());
                let mut result = hasher.finalize();
                let mut ret = Zeroizing::new(result[0..key_size].to_vec());
                result.iter_mut().for_each(|b| *b = 0);
                if *self == Self::Tdes {
                    adjust_des_parity(&mut ret);
                }
                ret
            },
            Self::Aes192|Self::Aes256 => {
                let mut hasher = Sha256::new();
                Digest::update(&mut hasher, key_seed);
                Digest::update(&mut hasher, counter.to_be_bytes());
                let mut result = hasher.finalize();
                let ret = Zeroizing::new(result[0..key_size].to_vec());
                result.iter_mut().for_each(|b| *b = 0);
                ret
            },
        }
    }

    /// The key derivation function for encryption purposes.
    pub fn derive_encryption_key(&self, key_seed: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(key_seed, 1)
    }

    /// The key derivation function for message authentication purposes.
    pub fn derive_mac_key(&self, key_seed: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(key_seed, 2)
    }

    /// The password-to-key derivation function.
    pub fn derive_key_from_password(&self, password: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(password, 3)
    }

    /// Pads data to the cipher block size.
    pub fn pad(&self, data: &mut Vec<u8>) {
        pad_iso9797_method2(data, self.cipher_block_size());
    }

    /// Encrypts pre-padded data in-place using the given key and CBC IV.
    pub fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        match self {
            Self::Tdes => cbc_encrypt::<TdesEde2>(data, key, iv),
            Self::Aes128 => cbc_encrypt::<Aes128>(data, key, iv),
            Self::Aes192 => cbc_encrypt::<Aes192>(data, key, iv),
            Self::Aes256 => cbc_encrypt::<Aes256>(data, key, iv),
        }
    }

    /// Decrypts data in-place using the given key and CBC IV.
    ///
    /// Does not strip padding.
    pub fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        match self {
            Self::Tdes => cbc_decrypt::<TdesEde2>(data, key, iv),
            Self::Aes128 => cbc_decrypt::<Aes128>(data, key, iv),
            Self::Aes192 => cbc_decrypt::<Aes192>(data, key, iv),
            Self::Aes256 => cbc_decrypt::<Aes256>(data, key, iv),
        }
    }

    /// Generates an 8-byte MAC for the given data and key.
    ///
    /// The data must already be padded for 3DES; CMAC accepts any length.
    pub fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        match self {
            Self::Tdes => retail_mac(data, key),
            Self::Aes128 => truncated_cmac::<Cmac<Aes128>>(data, key),
            Self::Aes192 => truncated_cmac::<Cmac<Aes192>>(data, key),
            Self::Aes256 => truncated_cmac::<Cmac<Aes256>>(data, key),
        }
    }

    /// Verifies in constant time whether the given data fits the given MAC.
    pub fn verify_mac_padded_data(&self, data: &[u8], key: &[u8], expected_mac: &[u8]) -> Result<bool, Error> {
        let computed_mac = self.mac_padded_data(data, key)?;
        Ok(computed_mac.ct_eq(expected_mac).into())
    }
}


/// Sets the least significant bit of each key byte so that every byte has odd parity.
fn adjust_des_parity(key: &mut [u8]) {
    for b in key.iter_mut() {
        let upper_ones = (*b >> 1).count_ones();
        *b = (*b & 0xFE) | u8::from(upper_ones % 2 == 0);
    }
}
