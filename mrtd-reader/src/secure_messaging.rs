//! Secure Messaging.
//!
//! Once BAC or PACE has produced [`SessionKeys`], every APDU exchanged with the chip is wrapped by
//! [`SecureMessaging`]: command data is padded and encrypted into data object `87` (or `85` for odd
//! instructions), the expected response length travels in data object `97` and the whole command
//! is authenticated by a MAC in data object `8E`. Responses are verified before they are decrypted.


use std::fmt;

use tracing::{debug, trace, warn};
use zeroize::Zeroizing;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt;
use crate::crypt::cipher_mac::{unpad_iso9797_method2, CipherSuite};
use crate::der_util::{encode_tlv, try_decode_primitive_length};
use crate::iso7816::apdu::{
    Apdu, CommandHeader, Response, ResponseTrailer, EXTENDED_MAX_RESPONSE_LENGTH,
    SHORT_MAX_REQUEST_LENGTH, SHORT_MAX_RESPONSE_LENGTH,
};
use crate::iso7816::card::{CommunicationError, SmartCard};


/// The largest response data length worth requesting through Secure Messaging in one go.
///
/// The protected response grows by the padding and the data objects wrapped around it, which has
/// to fit into a short response.
pub const MAX_PROTECTED_RESPONSE_DATA_LENGTH: usize = 0xDF;


#[derive(Debug)]
pub enum Error {
    /// An earlier integrity failure has made the session unusable.
    SessionUnusable,

    /// The chip reported a Secure Messaging failure using an unprotected status word.
    ChipRejected { trailer: ResponseTrailer },

    ResponseMac,
    ResponseTlvFormat,
    MissingResponseMac,
    MissingResponseStatus,
    StatusLength { obtained: usize },
    UnknownPadding { padding_mode: u8 },
    Crypto(crypt::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionUnusable
                => write!(f, "the Secure Messaging session is no longer usable"),
            Self::ChipRejected { trailer }
                => write!(f, "chip rejected the protected command with status 0x{:04X}", trailer.to_word()),
            Self::ResponseMac
                => write!(f, "response MAC incorrect"),
            Self::ResponseTlvFormat
                => write!(f, "response has an invalid TLV format"),
            Self::MissingResponseMac
                => write!(f, "response does not contain a MAC"),
            Self::MissingResponseStatus
                => write!(f, "response does not contain status"),
            Self::StatusLength { obtained }
                => write!(f, "status has unexpected length {}", obtained),
            Self::UnknownPadding { padding_mode }
                => write!(f, "response payload has unknown padding mode {}", padding_mode),
            Self::Crypto(e)
                => write!(f, "cryptographic failure: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Crypto(e) => Some(e),
            _ => None,
        }
    }
}
impl From<crypt::Error> for Error {
    fn from(value: crypt::Error) -> Self { Self::Crypto(value) }
}


/// Key material of an established session.
///
/// Created once per successful authentication and handed to [`SecureMessaging`], which is the only
/// thing that reads or updates it. Keys are wiped when the value is dropped.
#[derive(ZeroizeOnDrop)]
pub struct SessionKeys {
    #[zeroize(skip)] suite: CipherSuite,
    enc_key: Vec<u8>,
    mac_key: Vec<u8>,
    send_sequence_counter: u64,
}
impl SessionKeys {
    pub fn new(
        suite: CipherSuite,
        enc_key: &[u8],
        mac_key: &[u8],
        send_sequence_counter: u64,
    ) -> Result<Self, crypt::Error> {
        let key_size = suite.cipher_key_size();
        if enc_key.len() != key_size {
            return Err(crypt::Error::KeyLength { obtained: enc_key.len() });
        }
        if mac_key.len() != key_size {
            return Err(crypt::Error::KeyLength { obtained: mac_key.len() });
        }
        Ok(Self {
            suite,
            enc_key: enc_key.to_vec(),
            mac_key: mac_key.to_vec(),
            send_sequence_counter,
        })
    }

    /// Derives both session keys from a key seed (BAC) or shared secret (PACE).
    pub fn from_key_seed(suite: CipherSuite, key_seed: &[u8], send_sequence_counter: u64) -> Result<Self, crypt::Error> {
        let enc_key = suite.derive_encryption_key(key_seed);
        let mac_key = suite.derive_mac_key(key_seed);
        Self::new(suite, &enc_key, &mac_key, send_sequence_counter)
    }

    pub fn suite(&self) -> CipherSuite { self.suite }
    pub fn send_sequence_counter(&self) -> u64 { self.send_sequence_counter }

    /// Increments the send sequence counter and returns it serialized to a full cipher block.
    fn next_send_sequence_counter(&mut self) -> Zeroizing<Vec<u8>> {
        self.send_sequence_counter = self.send_sequence_counter.wrapping_add(1);
        let block_size = self.suite.cipher_block_size();
        let mut ssc = Zeroizing::new(vec![0u8; block_size]);
        ssc[block_size-8..].copy_from_slice(&self.send_sequence_counter.to_be_bytes());
        ssc
    }

    /// The CBC IV for the message protected under the given send sequence counter.
    fn derive_iv(&self, ssc: &[u8]) -> Result<Zeroizing<Vec<u8>>, crypt::Error> {
        let block_size = self.suite.cipher_block_size();
        let mut iv = Zeroizing::new(vec![0u8; block_size]);
        if self.suite.is_aes() {
            // E(K_enc, SSC): CBC over a single block with a zero IV
            iv.copy_from_slice(ssc);
            let zero_iv = [0u8; 16];
            self.suite.encrypt_padded_data(&mut iv, &self.enc_key, &zero_iv[..block_size])?;
        }
        Ok(iv)
    }

    fn mac(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, crypt::Error> {
        let mut padded = Zeroizing::new(data.to_vec());
        self.suite.pad(&mut padded);
        self.suite.mac_padded_data(&padded, &self.mac_key)
    }

    fn verify_mac(&self, data: &[u8], expected_mac: &[u8]) -> Result<bool, crypt::Error> {
        let mut padded = Zeroizing::new(data.to_vec());
        self.suite.pad(&mut padded);
        self.suite.verify_mac_padded_data(&padded, &self.mac_key, expected_mac)
    }
}
impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct BorrowedTlv<'d> {
    pub tag: u8,
    pub tag_and_length: &'d [u8],
    pub data: &'d [u8],
}

fn split_data_objects(mut response_slice: &[u8]) -> Result<Vec<BorrowedTlv<'_>>, Error> {
    let mut fields = Vec::new();
    while !response_slice.is_empty() {
        let tag = response_slice[0];
        let (data_length, rest_slice) = try_decode_primitive_length(&response_slice[1..])
            .ok_or(Error::ResponseTlvFormat)?;
        if data_length > rest_slice.len() {
            return Err(Error::ResponseTlvFormat);
        }
        let tag_and_length = &response_slice[0..response_slice.len()-rest_slice.len()];
        fields.push(BorrowedTlv {
            tag,
            tag_and_length,
            data: &rest_slice[0..data_length],
        });
        response_slice = &rest_slice[data_length..];
    }
    Ok(fields)
}


/// A [`SmartCard`] whose traffic is protected by Secure Messaging.
///
/// Any integrity failure leaves the session unusable; every later command fails with
/// [`Error::SessionUnusable`] without reaching the chip.
pub struct SecureMessaging {
    card: Box<dyn SmartCard>,
    keys: SessionKeys,
    broken: bool,
}
impl SecureMessaging {
    pub fn new(card: Box<dyn SmartCard>, keys: SessionKeys) -> Self {
        debug!("Secure Messaging established with {:?}", keys.suite());
        Self {
            card,
            keys,
            broken: false,
        }
    }

    pub fn suite(&self) -> CipherSuite { self.keys.suite() }

    pub fn send_sequence_counter(&self) -> u64 { self.keys.send_sequence_counter() }

    fn protect(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        // add secure messaging mark to CLA (header is part of MAC)
        let header = CommandHeader {
            cla: request.header.cla | 0b000_0_11_00,
            ..request.header
        };

        let ssc = self.keys.next_send_sequence_counter();

        let mut body_data = Vec::new();
        if let Some(request_data) = request.data.request_data() {
            let mut padded_data = Zeroizing::new(request_data.to_vec());
            self.keys.suite().pad(&mut padded_data);
            let iv = self.keys.derive_iv(&ssc)?;
            self.keys.suite().encrypt_padded_data(&mut padded_data, &self.keys.enc_key, &iv)?;

            if request.header.ins & 0b1 != 0 {
                // odd instructions carry BER-TLV data: DO85 without padding indicator
                encode_tlv(&mut body_data, &[0x85], &padded_data);
            } else {
                // DO87: padding indicator 0x01 (ISO 7816 padding) followed by the cryptogram
                let mut do87_value = Vec::with_capacity(1 + padded_data.len());
                do87_value.push(0x01);
                do87_value.extend(padded_data.iter());
                encode_tlv(&mut body_data, &[0x87], &do87_value);
            }
        }

        if let Some(response_data_length) = request.data.response_data_length() {
            // DO97: Le in its short (one-byte) or extended (two-byte) form
            if response_data_length <= SHORT_MAX_RESPONSE_LENGTH {
                let le = (response_data_length % SHORT_MAX_RESPONSE_LENGTH) as u8;
                encode_tlv(&mut body_data, &[0x97], &[le]);
            } else {
                let le = ((response_data_length % EXTENDED_MAX_RESPONSE_LENGTH) as u16).to_be_bytes();
                encode_tlv(&mut body_data, &[0x97], &le);
            }
        }

        // MAC over SSC ‖ padded header ‖ data objects
        let mut mac_data = Zeroizing::new(Vec::new());
        mac_data.extend(ssc.iter());
        let mut padded_header = header.to_bytes().to_vec();
        self.keys.suite().pad(&mut padded_header);
        mac_data.extend(&padded_header);
        mac_data.extend(&body_data);
        let mac = self.keys.mac(&mac_data)?;
        encode_tlv(&mut body_data, &[0x8E], &mac);

        let protected_response_length = if body_data.len() > SHORT_MAX_REQUEST_LENGTH {
            EXTENDED_MAX_RESPONSE_LENGTH
        } else {
            SHORT_MAX_RESPONSE_LENGTH
        };
        Ok(Apdu::new(header, body_data, Some(protected_response_length)))
    }

    fn unprotect(&mut self, response: Response) -> Result<Response, Error> {
        // the response counts even if it turns out to be unprotected
        let ssc = self.keys.next_send_sequence_counter();

        if response.data.is_empty() {
            let word = response.trailer.to_word();
            if word == 0x6987 || word == 0x6988 {
                // expected SM data objects missing / incorrect
                return Err(Error::ChipRejected { trailer: response.trailer });
            }
            if !response.is_success() {
                // plain error status; nothing to verify
                return Ok(response);
            }
            return Err(Error::MissingResponseMac);
        }

        let fields = split_data_objects(&response.data)?;

        let mut received_mac_opt = None;
        let mut mac_data = Zeroizing::new(Vec::new());
        mac_data.extend(ssc.iter());
        for field in &fields {
            if field.tag == 0x8E {
                received_mac_opt = Some(field.data);
            } else if field.tag & 0b1 != 0 {
                // odd tags are covered by the MAC
                mac_data.extend(field.tag_and_length);
                mac_data.extend(field.data);
            }
        }
        let received_mac = received_mac_opt.ok_or(Error::MissingResponseMac)?;
        if !self.keys.verify_mac(&mac_data, received_mac)? {
            return Err(Error::ResponseMac);
        }

        let status = fields.iter()
            .find(|tlv| tlv.tag == 0x99)
            .ok_or(Error::MissingResponseStatus)?;
        if status.data.len() != 2 {
            return Err(Error::StatusLength { obtained: status.data.len() });
        }
        let trailer = ResponseTrailer::new(status.data[0], status.data[1]);

        let cryptogram = fields.iter()
            .find_map(|tlv| match tlv.tag {
                0x87 => Some((true, tlv.data)),
                0x85 => Some((false, tlv.data)),
                _ => None,
            });
        let data = match cryptogram {
            None => Vec::new(),
            Some((has_padding_indicator, value)) => {
                let encrypted = if has_padding_indicator {
                    let (&padding_mode, encrypted) = value.split_first()
                        .ok_or(Error::ResponseTlvFormat)?;
                    if padding_mode != 0x01 {
                        return Err(Error::UnknownPadding { padding_mode });
                    }
                    encrypted
                } else {
                    value
                };
                let mut decrypted = Zeroizing::new(encrypted.to_vec());
                let iv = self.keys.derive_iv(&ssc)?;
                self.keys.suite().decrypt_padded_data(&mut decrypted, &self.keys.enc_key, &iv)?;
                let unpadded_length = unpad_iso9797_method2(&decrypted)?;
                decrypted[0..unpadded_length].to_vec()
            },
        };

        trace!("unprotected response: {} bytes, status {:?}", data.len(), trailer);
        Ok(Response::new(data, trailer))
    }
}
impl SmartCard for SecureMessaging {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        if self.broken {
            return Err(Error::SessionUnusable.into());
        }

        let protected_request = match self.protect(request) {
            Ok(pr) => pr,
            Err(e) => {
                self.broken = true;
                return Err(e.into());
            },
        };
        let protected_response = self.card.communicate(&protected_request)?;
        match self.unprotect(protected_response) {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Secure Messaging integrity failure: {}", e);
                self.broken = true;
                Err(e.into())
            },
        }
    }

    fn max_response_data_length(&self) -> usize {
        MAX_PROTECTED_RESPONSE_DATA_LENGTH
    }
}
