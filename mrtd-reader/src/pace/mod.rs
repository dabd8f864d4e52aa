//! Implementation of Password Authenticated Connection Establishment.
//!
//! Only generic mapping is implemented. PACE establishes the session keys; wrapping the card in
//! Secure Messaging with them is left to the caller, so that the caller retains the card and can
//! fall back to BAC if PACE fails.


pub mod asn1;
pub mod oids;


use std::fmt;

use digest::Digest;
use num_bigint::BigUint;
use sha1::Sha1;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::crypt::{self, KeyExchange};
use crate::crypt::cipher_mac::CipherSuite;
use crate::crypt::dh::params::get_1024_modp_160_po;
use crate::crypt::elliptic::curves;
use crate::der_util::{encode_tlv, oid_to_der_bytes, try_decode_primitive_length};
use crate::iso7816::apdu::{Apdu, CommandHeader, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::mrz::BacSeed;
use crate::pace::asn1::PaceInfo;
use crate::secure_messaging::SessionKeys;


/// The password reference for the MRZ as sent in MSE:Set AT.
const PASSWORD_REFERENCE_MRZ: u8 = 0x01;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetAuthenticationTemplate,
    ObtainNonce,
    ExchangeMappingPublicKeys,
    ExchangeEphemeralPublicKeys,
    MutualAuthentication,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetAuthenticationTemplate => write!(f, "MSE:Set AT"),
            Self::ObtainNonce => write!(f, "GENERAL AUTHENTICATE (encrypted nonce)"),
            Self::ExchangeMappingPublicKeys => write!(f, "GENERAL AUTHENTICATE (map nonce)"),
            Self::ExchangeEphemeralPublicKeys => write!(f, "GENERAL AUTHENTICATE (key agreement)"),
            Self::MutualAuthentication => write!(f, "GENERAL AUTHENTICATE (mutual authentication)"),
        }
    }
}


/// How the static domain parameters are mapped to ephemeral ones.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Mapping {
    Generic,
    Integrated,
    ChipAuthentication,
}

/// The family of key agreement used by a PACE protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyAgreement {
    DiffieHellman,
    EllipticCurveDiffieHellman,
}


#[derive(Debug)]
pub enum Error {
    Communication(CommunicationError),
    MappingNotSupported { mapping: Mapping },
    CustomParameters,
    UnsupportedParameterId { parameter_id: u32 },
    IncompatibleProtocolParameter { key_agreement: KeyAgreement, parameter_id: u32 },
    OperationFailed { operation: Operation, response: Response },
    UnexpectedType { operation: Operation, type_tag: u8 },
    TlvEncoding { operation: Operation },
    MissingDataObject { operation: Operation, tag: u8 },
    InvalidOid,
    DiffieHellmanKeysEqual,
    MutualAuthentication,
    Crypto(crypt::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication(e)
                => write!(f, "communication error: {}", e),
            Self::MappingNotSupported { mapping }
                => write!(f, "{:?} mapping is not supported", mapping),
            Self::CustomParameters
                => write!(f, "custom domain parameters are not supported"),
            Self::UnsupportedParameterId { parameter_id }
                => write!(f, "standardized domain parameter ID {} is not supported", parameter_id),
            Self::IncompatibleProtocolParameter { key_agreement, parameter_id }
                => write!(f, "{:?} key agreement is incompatible with domain parameter ID {}", key_agreement, parameter_id),
            Self::OperationFailed { operation, response }
                => write!(f, "{} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::UnexpectedType { operation, type_tag }
                => write!(f, "{} received response of unexpected type 0x{:02X}", operation, type_tag),
            Self::TlvEncoding { operation }
                => write!(f, "{} received response with invalid TLV encoding", operation),
            Self::MissingDataObject { operation, tag }
                => write!(f, "{} response lacks data object 0x{:02X}", operation, tag),
            Self::InvalidOid
                => write!(f, "protocol OID cannot be encoded"),
            Self::DiffieHellmanKeysEqual
                => write!(f, "terminal and chip Diffie-Hellman keys are equal"),
            Self::MutualAuthentication
                => write!(f, "chip authentication token is incorrect"),
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


/// The PACE protocol and domain parameters advertised by a chip in one `PaceInfo` entry.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PaceParameters {
    pub protocol: Vec<u32>,
    pub key_agreement: KeyAgreement,
    pub mapping: Mapping,
    pub suite: CipherSuite,
    pub version: u32,
    pub parameter_id: Option<u32>,
}
impl PaceParameters {
    /// Assembles the parameters for a known protocol.
    pub fn new(key_agreement: KeyAgreement, mapping: Mapping, suite: CipherSuite, parameter_id: Option<u32>) -> Self {
        let mapping_arc = match (key_agreement, mapping) {
            (KeyAgreement::DiffieHellman, Mapping::Generic) => oids::MAPPING_DH_GM,
            (KeyAgreement::EllipticCurveDiffieHellman, Mapping::Generic) => oids::MAPPING_ECDH_GM,
            (KeyAgreement::DiffieHellman, Mapping::Integrated) => oids::MAPPING_DH_IM,
            (KeyAgreement::EllipticCurveDiffieHellman, Mapping::Integrated) => oids::MAPPING_ECDH_IM,
            // DH-CAM does not exist; ECDH-CAM is the closest thing
            (_, Mapping::ChipAuthentication) => oids::MAPPING_ECDH_CAM,
        };
        let cipher_arc = match suite {
            CipherSuite::Tdes => oids::CIPHER_3DES_CBC_CBC,
            CipherSuite::Aes128 => oids::CIPHER_AES_CBC_CMAC_128,
            CipherSuite::Aes192 => oids::CIPHER_AES_CBC_CMAC_192,
            CipherSuite::Aes256 => oids::CIPHER_AES_CBC_CMAC_256,
        };
        Self {
            protocol: oids::protocol_arcs(mapping_arc, cipher_arc),
            key_agreement,
            mapping,
            suite,
            version: 2,
            parameter_id,
        }
    }

    /// Interprets a `PaceInfo` entry, returning `None` if its OID is not a PACE protocol OID.
    pub fn from_pace_info(info: &PaceInfo) -> Option<Self> {
        let protocol = info.protocol.to_vec();
        let (mapping_arc, cipher_arc) = oids::split_protocol(&protocol)?;
        let (key_agreement, mapping) = match mapping_arc {
            oids::MAPPING_DH_GM => (KeyAgreement::DiffieHellman, Mapping::Generic),
            oids::MAPPING_ECDH_GM => (KeyAgreement::EllipticCurveDiffieHellman, Mapping::Generic),
            oids::MAPPING_DH_IM => (KeyAgreement::DiffieHellman, Mapping::Integrated),
            oids::MAPPING_ECDH_IM => (KeyAgreement::EllipticCurveDiffieHellman, Mapping::Integrated),
            oids::MAPPING_ECDH_CAM => (KeyAgreement::EllipticCurveDiffieHellman, Mapping::ChipAuthentication),
            _ => return None,
        };
        let suite = match cipher_arc {
            oids::CIPHER_3DES_CBC_CBC => CipherSuite::Tdes,
            oids::CIPHER_AES_CBC_CMAC_128 => CipherSuite::Aes128,
            oids::CIPHER_AES_CBC_CMAC_192 => CipherSuite::Aes192,
            oids::CIPHER_AES_CBC_CMAC_256 => CipherSuite::Aes256,
            _ => return None,
        };
        Some(Self {
            protocol,
            key_agreement,
            mapping,
            suite,
            version: info.version,
            parameter_id: info.parameter_id,
        })
    }

    /// Obtains the key exchange method for the standardized domain parameters.
    pub fn key_exchange(&self) -> Result<KeyExchange, Error> {
        let parameter_id = self.parameter_id.ok_or(Error::CustomParameters)?;
        let key_exchange = match parameter_id {
            0 => KeyExchange::DiffieHellman(get_1024_modp_160_po()),
            1|2 => return Err(Error::UnsupportedParameterId { parameter_id }),
            8 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_nist_p192()),
            9 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_brainpool_p192r1()),
            10 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_nist_p224()),
            11 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_brainpool_p224r1()),
            12 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_nist_p256()),
            13 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_brainpool_p256r1()),
            14 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_brainpool_p320r1()),
            15 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_nist_p384()),
            16 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_brainpool_p384r1()),
            17 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_brainpool_p512r1()),
            18 => KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_nist_p521()),
            _ => return Err(Error::UnsupportedParameterId { parameter_id }),
        };

        if key_agreement_of(&key_exchange) != self.key_agreement {
            return Err(Error::IncompatibleProtocolParameter {
                key_agreement: self.key_agreement,
                parameter_id,
            });
        }
        Ok(key_exchange)
    }
}

fn key_agreement_of(key_exchange: &KeyExchange) -> KeyAgreement {
    match key_exchange {
        KeyExchange::DiffieHellman(_) => KeyAgreement::DiffieHellman,
        KeyExchange::PrimeWeierstrassEllipticDiffieHellman(_) => KeyAgreement::EllipticCurveDiffieHellman,
    }
}


/// Sends a GENERAL AUTHENTICATE command carrying at most one data object within the dynamic
/// authentication data template (`7C`) and extracts the data object tagged `response_tag` from the
/// answer.
fn general_authenticate(
    card: &mut dyn SmartCard,
    operation: Operation,
    last_in_chain: bool,
    data_object: Option<(u8, &[u8])>,
    response_tag: u8,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let mut inner_data = Zeroizing::new(Vec::new());
    if let Some((tag, value)) = data_object {
        encode_tlv(&mut inner_data, &[tag], value);
    }
    let mut request_data = Vec::new();
    encode_tlv(&mut request_data, &[0x7C], &inner_data); // dynamic authentication data

    let cla = if last_in_chain {
        0b000_0_00_00 // last in a chain, no secure messaging, logical channel 0
    } else {
        0b000_1_00_00 // not the last in a chain, no secure messaging, logical channel 0
    };
    // P1 and P2 are known from MSE:Set AT
    let request = Apdu::new(
        CommandHeader::new(cla, 0x86, 0x00, 0x00), // GENERAL AUTHENTICATE
        request_data,
        Some(256),
    );
    let response = card.communicate(&request)?;
    if !response.is_success() {
        return Err(Error::OperationFailed { operation, response });
    }
    extract_data_object(operation, &response.data, response_tag)
}


/// Extracts a data object from a dynamic authentication data template.
fn extract_data_object(operation: Operation, data: &[u8], wanted_tag: u8) -> Result<Zeroizing<Vec<u8>>, Error> {
    let (&outer_tag, outer_rest) = data.split_first()
        .ok_or(Error::MissingDataObject { operation, tag: 0x7C })?;
    if outer_tag != 0x7C {
        return Err(Error::UnexpectedType { operation, type_tag: outer_tag });
    }
    let (template_length, template_rest) = try_decode_primitive_length(outer_rest)
        .ok_or(Error::TlvEncoding { operation })?;
    if template_length != template_rest.len() {
        return Err(Error::TlvEncoding { operation });
    }

    let mut rest = template_rest;
    while let Some((&tag, after_tag)) = rest.split_first() {
        let (value_length, value_rest) = try_decode_primitive_length(after_tag)
            .ok_or(Error::TlvEncoding { operation })?;
        if value_rest.len() < value_length {
            return Err(Error::TlvEncoding { operation });
        }
        if tag == wanted_tag {
            return Ok(Zeroizing::new(value_rest[..value_length].to_vec()));
        }
        rest = &value_rest[value_length..];
    }
    Err(Error::MissingDataObject { operation, tag: wanted_tag })
}


/// Selects the PACE protocol and the MRZ as the password with MSE:Set AT.
#[instrument(skip(card))]
pub fn set_authentication_template(card: &mut dyn SmartCard, protocol: &[u32]) -> Result<(), Error> {
    let protocol_bytes = oid_to_der_bytes(protocol)
        .ok_or(Error::InvalidOid)?;

    let mut request_data = Vec::new();
    encode_tlv(&mut request_data, &[0x80], &protocol_bytes); // cryptographic mechanism reference
    encode_tlv(&mut request_data, &[0x83], &[PASSWORD_REFERENCE_MRZ]);

    let request = Apdu::new(
        // MANAGE SECURITY ENVIRONMENT; set for mutual authentication; authentication template
        CommandHeader::new(0x00, 0x22, 0xC1, 0xA4),
        request_data,
        None,
    );
    let response = card.communicate(&request)?;
    if response.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed {
            operation: Operation::SetAuthenticationTemplate,
            response,
        })
    }
}


/// Requests the encrypted nonce from the chip.
#[instrument(skip(card))]
pub fn obtain_encrypted_nonce(card: &mut dyn SmartCard) -> Result<Zeroizing<Vec<u8>>, Error> {
    general_authenticate(card, Operation::ObtainNonce, false, None, 0x80)
}


/// Calculates the token used for mutual authentication: a MAC over the public key data object
/// (`7F49`) containing the protocol OID and the given public key.
fn calculate_mutual_token(
    suite: CipherSuite,
    protocol: &[u32],
    public_key_tag: u8,
    public_key: &[u8],
    k_session_mac: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let protocol_bytes = oid_to_der_bytes(protocol)
        .ok_or(Error::InvalidOid)?;

    let mut inner_data = Zeroizing::new(Vec::new());
    encode_tlv(&mut inner_data, &[0x06], &protocol_bytes);
    encode_tlv(&mut inner_data, &[public_key_tag], public_key);

    let mut outer_data = Zeroizing::new(Vec::new());
    encode_tlv(&mut outer_data, &[0x7F, 0x49], &inner_data);

    // CMAC does its own padding
    if !suite.is_aes() {
        suite.pad(&mut outer_data);
    }

    Ok(suite.mac_padded_data(&outer_data, k_session_mac)?)
}


/// Performs a generic mapping key exchange using specific values.
///
/// `mrz_key` is the MRZ-derived password; `encrypted_nonce` has been obtained from the chip using
/// [`obtain_encrypted_nonce`]. On success, returns the session keys with a send sequence counter of
/// zero.
#[instrument(skip_all)]
pub fn perform_gm_kex_with_values(
    card: &mut dyn SmartCard,
    protocol: &[u32],
    key_exchange: &KeyExchange,
    suite: CipherSuite,
    mrz_key: &[u8],
    encrypted_nonce: &[u8],
    derivation_private_key: &BigUint,
    session_private_key: &BigUint,
) -> Result<SessionKeys, Error> {
    // K_pi = KDF_pi(SHA-1(MRZ key))
    let mut mrz_hasher = Sha1::new();
    Digest::update(&mut mrz_hasher, mrz_key);
    let mrz_hash = Zeroizing::new(mrz_hasher.finalize().to_vec());
    let nonce_key = suite.derive_key_from_password(&mrz_hash);

    // decrypt the nonce
    let nonce_iv = vec![0u8; suite.cipher_block_size()];
    let mut nonce_bytes = Zeroizing::new(encrypted_nonce.to_vec());
    suite.decrypt_padded_data(&mut nonce_bytes, &nonce_key, &nonce_iv)?;
    let nonce = BigUint::from_bytes_be(&nonce_bytes);

    // map the nonce onto new domain parameters
    let session_key_exchange = {
        let public_key_bytes = key_exchange.calculate_public_key(derivation_private_key)?;
        let card_public_key_bytes = general_authenticate(
            card,
            Operation::ExchangeMappingPublicKeys,
            false,
            Some((0x81, &public_key_bytes)),
            0x82,
        )?;
        key_exchange.derive_generic_mapping(&nonce, derivation_private_key, &card_public_key_bytes)?
    };

    // key agreement with the mapped parameters
    let public_key_bytes = session_key_exchange.calculate_public_key(session_private_key)?;
    let card_public_key_bytes = general_authenticate(
        card,
        Operation::ExchangeEphemeralPublicKeys,
        false,
        Some((0x83, &public_key_bytes)),
        0x84,
    )?;
    if bool::from(public_key_bytes.ct_eq(card_public_key_bytes.as_slice())) {
        return Err(Error::DiffieHellmanKeysEqual);
    }
    let shared_secret = session_key_exchange.exchange_keys(session_private_key, &card_public_key_bytes)?;

    let k_session_mac = suite.derive_mac_key(&shared_secret);

    // each side authenticates the other side's public key
    let outgoing_token = calculate_mutual_token(
        suite,
        protocol,
        key_exchange.public_key_tag(),
        &card_public_key_bytes,
        &k_session_mac,
    )?;
    let expected_token = calculate_mutual_token(
        suite,
        protocol,
        key_exchange.public_key_tag(),
        &public_key_bytes,
        &k_session_mac,
    )?;
    let incoming_token = general_authenticate(
        card,
        Operation::MutualAuthentication,
        true,
        Some((0x85, &outgoing_token)),
        0x86,
    )?;
    if !bool::from(incoming_token.ct_eq(&expected_token)) {
        return Err(Error::MutualAuthentication);
    }

    debug!("PACE mutual authentication succeeded");
    Ok(SessionKeys::from_key_seed(suite, &shared_secret, 0)?)
}


/// Runs PACE with generic mapping against the chip, returning the session keys.
///
/// The card is left in the state after MSE:Set AT if an error occurs.
#[instrument(skip(card, seed), fields(protocol = ?params.protocol))]
pub fn establish(card: &mut dyn SmartCard, params: &PaceParameters, seed: &BacSeed) -> Result<SessionKeys, Error> {
    if params.mapping != Mapping::Generic {
        return Err(Error::MappingNotSupported { mapping: params.mapping });
    }
    let key_exchange = params.key_exchange()?;

    set_authentication_template(card, &params.protocol)?;
    let encrypted_nonce = obtain_encrypted_nonce(card)?;

    let derivation_private_key = key_exchange.generate_private_key();
    let session_private_key = key_exchange.generate_private_key();

    let mrz_key = Zeroizing::new(seed.mrz_key());
    perform_gm_kex_with_values(
        card,
        &params.protocol,
        &key_exchange,
        params.suite,
        mrz_key.as_bytes(),
        &encrypted_nonce,
        &derivation_private_key,
        &session_private_key,
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_from_pace_info() {
        let info: PaceInfo = rasn::ber::decode(&hex!("30 12 06 0A 04 00 7F 00 07 02 02 04 02 02 02 01 02 02 01 0D")).unwrap();
        let params = PaceParameters::from_pace_info(&info).unwrap();
        assert_eq!(params.key_agreement, KeyAgreement::EllipticCurveDiffieHellman);
        assert_eq!(params.mapping, Mapping::Generic);
        assert_eq!(params.suite, CipherSuite::Aes128);
        assert_eq!(params.parameter_id, Some(13));
        assert_eq!(params, PaceParameters::new(KeyAgreement::EllipticCurveDiffieHellman, Mapping::Generic, CipherSuite::Aes128, Some(13)));
        assert!(matches!(params.key_exchange(), Ok(KeyExchange::PrimeWeierstrassEllipticDiffieHellman(_))));
    }

    #[test]
    fn test_parameter_checks() {
        let dh_on_curve = PaceParameters::new(KeyAgreement::DiffieHellman, Mapping::Generic, CipherSuite::Aes128, Some(13));
        assert!(matches!(dh_on_curve.key_exchange(), Err(Error::IncompatibleProtocolParameter { .. })));

        let custom = PaceParameters::new(KeyAgreement::EllipticCurveDiffieHellman, Mapping::Generic, CipherSuite::Aes128, None);
        assert!(matches!(custom.key_exchange(), Err(Error::CustomParameters)));

        let dh_2048 = PaceParameters::new(KeyAgreement::DiffieHellman, Mapping::Generic, CipherSuite::Aes128, Some(2));
        assert!(matches!(dh_2048.key_exchange(), Err(Error::UnsupportedParameterId { parameter_id: 2 })));
    }

    #[test]
    fn test_extract_data_object() {
        let nonce = extract_data_object(
            Operation::ObtainNonce,
            &hex!("7C 12 80 10 95 A3 A0 16 52 2E E9 8D 01 E7 6C B6 B9 8B 42 C3"),
            0x80,
        ).unwrap();
        assert_eq!(nonce.as_slice(), &hex!("95A3A016522EE98D01E76CB6B98B42C3"));

        // token followed by a certification authority reference
        let token = extract_data_object(
            Operation::MutualAuthentication,
            &hex!("7C 0E 86 08 01 02 03 04 05 06 07 08 87 02 AA BB"),
            0x86,
        ).unwrap();
        assert_eq!(token.as_slice(), &hex!("0102030405060708"));

        assert!(matches!(
            extract_data_object(Operation::ObtainNonce, &hex!("7C 02 81 00"), 0x80),
            Err(Error::MissingDataObject { tag: 0x80, .. }),
        ));
        assert!(matches!(
            extract_data_object(Operation::ObtainNonce, &hex!("7C 05 80 10 00"), 0x80),
            Err(Error::TlvEncoding { .. }),
        ));
        assert!(matches!(
            extract_data_object(Operation::ObtainNonce, &hex!("30 00"), 0x80),
            Err(Error::UnexpectedType { type_tag: 0x30, .. }),
        ));
    }
}
