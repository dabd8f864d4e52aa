//! Basic Access Control.


use std::fmt;

use digest::Digest;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::crypt;
use crate::crypt::cipher_mac::CipherSuite;
use crate::iso7816::apdu::{Apdu, CommandHeader, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::mrz::BacSeed;
use crate::secure_messaging::SessionKeys;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    GetChallenge,
    ExternalAuthenticate,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetChallenge => write!(f, "GET CHALLENGE"),
            Self::ExternalAuthenticate => write!(f, "EXTERNAL AUTHENTICATE"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MismatchedValue {
    RndIc,
    RndIfd,
}


#[derive(Debug)]
pub enum Error {
    Communication(CommunicationError),
    OperationFailed { operation: Operation, response: Response },
    LengthMismatch {
        operation: Operation,
        obtained: usize,
        expected_length: usize,
    },
    ResponseMac,
    ValueMismatch { value: MismatchedValue },
    Crypto(crypt::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication(e)
                => write!(f, "communication error: {}", e),
            Self::OperationFailed { operation, response }
                => write!(f, "{} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::LengthMismatch { operation, obtained, expected_length }
                => write!(f, "{} response has length {}, expected {}", operation, obtained, expected_length),
            Self::ResponseMac
                => write!(f, "EXTERNAL AUTHENTICATE response MAC incorrect"),
            Self::ValueMismatch { value }
                => write!(f, "{:?} mismatched", value),
            Self::Crypto(e)
                => write!(f, "cryptographic failure: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Communication(e) => Some(e),
            Self::Crypto(e) => Some(e),
            _ => None,
        }
    }
}
impl From<CommunicationError> for Error {
    fn from(value: CommunicationError) -> Self { Self::Communication(value) }
}
impl From<crypt::Error> for Error {
    fn from(value: crypt::Error) -> Self { Self::Crypto(value) }
}


/// Derives the BAC key seed: the first 16 bytes of the SHA-1 hash of the MRZ key.
pub fn derive_key_seed(mrz_key: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut sha1 = Sha1::new();
    Digest::update(&mut sha1, mrz_key);
    let mut sha1_hash = sha1.finalize();
    let k_seed = Zeroizing::new(sha1_hash[0..16].to_vec());
    sha1_hash.iter_mut().for_each(|b| *b = 0);
    k_seed
}


/// Requests an 8-byte challenge (RND.IC) from the chip.
#[instrument(skip(card))]
pub fn get_challenge(card: &mut dyn SmartCard) -> Result<[u8; 8], Error> {
    let get_challenge_apdu = Apdu::new(
        CommandHeader::new(0x00, 0x84, 0x00, 0x00), // GET CHALLENGE
        Vec::new(),
        Some(8),
    );
    let response = card.communicate(&get_challenge_apdu)?;
    if !response.is_success() {
        return Err(Error::OperationFailed { operation: Operation::GetChallenge, response });
    }
    if response.data.len() != 8 {
        return Err(Error::LengthMismatch {
            operation: Operation::GetChallenge,
            obtained: response.data.len(),
            expected_length: 8,
        });
    }
    let mut ret = [0u8; 8];
    ret.copy_from_slice(response.data.as_slice());
    Ok(ret)
}


/// Performs the EXTERNAL AUTHENTICATE half of BAC with the given values and derives the session
/// keys from the result.
///
/// `rnd_ic` is the chip's challenge; `rnd_ifd` and `k_ifd` are the terminal's random nonce and
/// key material.
#[instrument(skip_all)]
pub fn mutual_authenticate(
    card: &mut dyn SmartCard,
    k_seed: &[u8],
    rnd_ic: &[u8; 8],
    rnd_ifd: &[u8; 8],
    k_ifd: &[u8; 16],
) -> Result<SessionKeys, Error> {
    let suite = CipherSuite::Tdes;
    let k_enc = suite.derive_encryption_key(k_seed);
    let k_mac = suite.derive_mac_key(k_seed);

    // E_IFD = E(K_enc, RND.IFD ‖ RND.IC ‖ K.IFD)
    let mut ext_auth_data = Zeroizing::new(Vec::with_capacity(32+8));
    ext_auth_data.extend(rnd_ifd);
    ext_auth_data.extend(rnd_ic);
    ext_auth_data.extend(k_ifd);
    let iv = [0u8; 8];
    suite.encrypt_padded_data(&mut ext_auth_data, &k_enc, &iv)?;

    // M_IFD = MAC(K_mac, E_IFD)
    let mut mac_input = Zeroizing::new(ext_auth_data.to_vec());
    suite.pad(&mut mac_input);
    let mac = suite.mac_padded_data(&mac_input, &k_mac)?;
    ext_auth_data.extend(mac.iter());

    let ext_auth_request = Apdu::new(
        CommandHeader::new(0x00, 0x82, 0x00, 0x00), // EXTERNAL AUTHENTICATE
        ext_auth_data.to_vec(),
        Some(40),
    );
    let ext_auth_response = card.communicate(&ext_auth_request)?;
    if !ext_auth_response.is_success() {
        return Err(Error::OperationFailed {
            operation: Operation::ExternalAuthenticate,
            response: ext_auth_response,
        });
    }
    if ext_auth_response.data.len() != 40 {
        return Err(Error::LengthMismatch {
            operation: Operation::ExternalAuthenticate,
            obtained: ext_auth_response.data.len(),
            expected_length: 40,
        });
    }

    // verify MAC of what we obtained
    let mut response_mac_input = Zeroizing::new(ext_auth_response.data[0..32].to_vec());
    suite.pad(&mut response_mac_input);
    if !suite.verify_mac_padded_data(&response_mac_input, &k_mac, &ext_auth_response.data[32..40])? {
        return Err(Error::ResponseMac);
    }

    // decrypt: RND.IC ‖ RND.IFD ‖ K.IC
    let mut decrypted = Zeroizing::new(ext_auth_response.data[0..32].to_vec());
    suite.decrypt_padded_data(&mut decrypted, &k_enc, &iv)?;

    if !bool::from(decrypted[0..8].ct_eq(rnd_ic)) {
        return Err(Error::ValueMismatch { value: MismatchedValue::RndIc });
    }
    if !bool::from(decrypted[8..16].ct_eq(rnd_ifd)) {
        return Err(Error::ValueMismatch { value: MismatchedValue::RndIfd });
    }
    let k_ic = &decrypted[16..32];

    let mut k_session_seed = Zeroizing::new([0u8; 16]);
    for ((kss, kifd), kic) in k_session_seed.iter_mut().zip(k_ifd.iter()).zip(k_ic.iter()) {
        *kss = *kifd ^ *kic;
    }

    let mut send_sequence_counter_bytes = [0u8; 8];
    send_sequence_counter_bytes[0..4].copy_from_slice(&rnd_ic[4..8]);
    send_sequence_counter_bytes[4..8].copy_from_slice(&rnd_ifd[4..8]);
    let send_sequence_counter = u64::from_be_bytes(send_sequence_counter_bytes);

    debug!("BAC mutual authentication succeeded");
    Ok(SessionKeys::from_key_seed(suite, k_session_seed.as_slice(), send_sequence_counter)?)
}


/// Runs BAC against the chip using the given seed, returning the session keys.
#[instrument(skip_all)]
pub fn establish(card: &mut dyn SmartCard, seed: &BacSeed) -> Result<SessionKeys, Error> {
    let mrz_key = seed.mrz_key();
    let k_seed = derive_key_seed(mrz_key.as_bytes());

    let rnd_ic = get_challenge(card)?;

    let mut rnd_ifd = [0u8; 8];
    let mut k_ifd = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(&mut rnd_ifd);
    OsRng.fill_bytes(k_ifd.as_mut_slice());

    mutual_authenticate(card, &k_seed, &rnd_ic, &rnd_ifd, &k_ifd)
}
