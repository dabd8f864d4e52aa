//! A simulated eMRTD chip speaking BAC, PACE (ECDH generic mapping, AES-128, brainpoolP256r1) and
//! Secure Messaging, assembled from the crate's own primitives.
#![allow(dead_code)]


use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::mpsc::Receiver;

use digest::Digest;
use mrtd_reader::access::LDS1_AID;
use mrtd_reader::bac::derive_key_seed;
use mrtd_reader::crypt::KeyExchange;
use mrtd_reader::crypt::cipher_mac::{unpad_iso9797_method2, CipherSuite};
use mrtd_reader::der_util::{encode_tlv, oid_to_der_bytes};
use mrtd_reader::iso7816::apdu::{Apdu, CommandHeader, Response, ResponseTrailer};
use mrtd_reader::iso7816::card::{Availability, CancelToken, Channel, Transport, TransportError};
use mrtd_reader::lds::tlv::{expect_tlv, TlvReader};
use mrtd_reader::mrz::BacSeed;
use mrtd_reader::pace::{KeyAgreement, Mapping, PaceParameters};
use num_bigint::BigUint;
use sha1::Sha1;


pub const ERIKSSON_MRZ: &str = concat!(
    "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<",
    "L898902C36UTO7408122F1204159ZE184226B<<<<<10",
);

pub const JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01,
    0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

pub const FID_CARD_ACCESS: u16 = 0x011C;
pub const FID_COM: u16 = 0x011E;
pub const FID_DG1: u16 = 0x0101;
pub const FID_DG2: u16 = 0x0102;

const SW_SUCCESS: ResponseTrailer = ResponseTrailer::SUCCESS;
const SW_END_OF_FILE: ResponseTrailer = ResponseTrailer::new(0x62, 0x82);
const SW_AUTHENTICATION_FAILED: ResponseTrailer = ResponseTrailer::new(0x63, 0x00);
const SW_SECURITY_STATUS: ResponseTrailer = ResponseTrailer::new(0x69, 0x82);
const SW_NO_CURRENT_EF: ResponseTrailer = ResponseTrailer::new(0x69, 0x86);
const SW_SM_INCORRECT: ResponseTrailer = ResponseTrailer::new(0x69, 0x88);
const SW_NOT_FOUND: ResponseTrailer = ResponseTrailer::new(0x6A, 0x82);
const SW_WRONG_OFFSET: ResponseTrailer = ResponseTrailer::new(0x6B, 0x00);
const SW_INS_NOT_SUPPORTED: ResponseTrailer = ResponseTrailer::new(0x6D, 0x00);


pub fn eriksson_seed() -> BacSeed {
    BacSeed::new("L898902C3", "740812", "120415").unwrap()
}

pub fn dg1(mrz: &str) -> Vec<u8> {
    let mut inner = Vec::new();
    encode_tlv(&mut inner, &[0x5F, 0x1F], mrz.as_bytes());
    let mut ret = Vec::new();
    encode_tlv(&mut ret, &[0x61], &inner);
    ret
}

pub fn dg2(image: &[u8]) -> Vec<u8> {
    // facial information, no feature points
    let image_record_length = 20 + 12 + image.len();
    let mut face = Vec::new();
    face.extend(&(image_record_length as u32).to_be_bytes());
    face.extend(&[0x00, 0x00]);
    face.extend(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    face.extend(&[0x00; 6]);
    // image information: full frontal JPEG, 240x320
    face.extend(&[0x01, 0x00, 0x00, 0xF0, 0x01, 0x40, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00]);
    face.extend(image);

    let mut record = Vec::new();
    record.extend(b"FAC\0");
    record.extend(b"010\0");
    record.extend(&((14 + face.len()) as u32).to_be_bytes());
    record.extend(&[0x00, 0x01]);
    record.extend(&face);

    let mut template = Vec::new();
    encode_tlv(&mut template, &[0xA1], &[0x80, 0x02, 0x01, 0x01]);
    encode_tlv(&mut template, &[0x5F, 0x2E], &record);
    let mut group = Vec::new();
    encode_tlv(&mut group, &[0x02], &[0x01]);
    encode_tlv(&mut group, &[0x7F, 0x60], &template);
    let mut inner = Vec::new();
    encode_tlv(&mut inner, &[0x7F, 0x61], &group);
    let mut ret = Vec::new();
    encode_tlv(&mut ret, &[0x75], &inner);
    ret
}

pub fn com() -> Vec<u8> {
    vec![
        0x60, 0x14,
        0x5F, 0x01, 0x04, b'0', b'1', b'0', b'7',
        0x5F, 0x36, 0x06, b'0', b'4', b'0', b'0', b'0', b'0',
        0x5C, 0x02, 0x61, 0x75,
    ]
}

pub fn pace_parameters() -> PaceParameters {
    PaceParameters::new(
        KeyAgreement::EllipticCurveDiffieHellman,
        Mapping::Generic,
        CipherSuite::Aes128,
        Some(13),
    )
}

/// `EF.CardAccess` advertising ECDH generic mapping with AES-128 on brainpoolP256r1.
pub fn card_access() -> Vec<u8> {
    let oid = oid_to_der_bytes(&pace_parameters().protocol).unwrap();
    let mut info = Vec::new();
    encode_tlv(&mut info, &[0x06], &oid);
    encode_tlv(&mut info, &[0x02], &[0x02]);
    encode_tlv(&mut info, &[0x02], &[0x0D]);
    let mut set = Vec::new();
    encode_tlv(&mut set, &[0x30], &info);
    let mut ret = Vec::new();
    encode_tlv(&mut ret, &[0x31], &set);
    ret
}


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChipAccess {
    /// BAC only.
    Bac,

    /// PACE advertised in `EF.CardAccess`; BAC is supported too.
    Pace,

    /// No access control at all.
    Plaintext,
}


/// What happened on the simulated chip.
#[derive(Clone, Debug, Default)]
pub struct ChipLog {
    /// Instruction bytes of all commands, after removal of Secure Messaging.
    pub instructions: Vec<u8>,
    pub transceives: usize,
    pub closes: usize,
}


/// Misbehavior to inject.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Flips this bit of the EXTERNAL AUTHENTICATE response data.
    pub flip_auth_response_bit: Option<usize>,

    /// Delivers only this many bytes of a file while its header declares the full length.
    pub truncate_file: Option<(u16, usize)>,

    /// Corrupts the MAC of the protected response with this index (counting from zero).
    pub corrupt_protected_response: Option<usize>,

    /// Fails every exchange from this one onwards (counting from zero) with a lost chip.
    pub disconnect_at: Option<usize>,

    /// Cancels the token once the file with this identifier has been selected.
    pub cancel_on_select: Option<(u16, CancelToken)>,
}


struct ChipSession {
    suite: CipherSuite,
    enc_key: Vec<u8>,
    mac_key: Vec<u8>,
    ssc: u64,
    responses: usize,
}
impl ChipSession {
    fn new(suite: CipherSuite, key_seed: &[u8], ssc: u64) -> Self {
        Self {
            suite,
            enc_key: suite.derive_encryption_key(key_seed).to_vec(),
            mac_key: suite.derive_mac_key(key_seed).to_vec(),
            ssc,
            responses: 0,
        }
    }

    fn next_ssc(&mut self) -> Vec<u8> {
        self.ssc = self.ssc.wrapping_add(1);
        let block_size = self.suite.cipher_block_size();
        let mut ssc = vec![0u8; block_size];
        ssc[block_size-8..].copy_from_slice(&self.ssc.to_be_bytes());
        ssc
    }

    fn iv(&self, ssc: &[u8]) -> Vec<u8> {
        if self.suite.is_aes() {
            let mut iv = ssc.to_vec();
            self.suite.encrypt_padded_data(&mut iv, &self.enc_key, &[0u8; 16]).unwrap();
            iv
        } else {
            vec![0u8; 8]
        }
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut padded = data.to_vec();
        self.suite.pad(&mut padded);
        self.suite.mac_padded_data(&padded, &self.mac_key).unwrap().to_vec()
    }

    fn unprotect(&mut self, request: &Apdu) -> Option<Apdu> {
        let ssc = self.next_ssc();
        if request.header.cla & 0x0C != 0x0C {
            return None;
        }

        let mut mac_input = ssc.clone();
        let mut padded_header = request.header.to_bytes().to_vec();
        self.suite.pad(&mut padded_header);
        mac_input.extend(&padded_header);

        let mut plain = Vec::new();
        let mut response_length = None;
        let mut received_mac = None;
        for tlv in TlvReader::new(request.data.request_data().unwrap_or(&[])) {
            let tlv = tlv.ok()?;
            match tlv.tag {
                0x85 | 0x87 => {
                    mac_input.extend(tlv.raw);
                    let cryptogram = if tlv.tag == 0x87 { tlv.value.get(1..)? } else { tlv.value };
                    let mut decrypted = cryptogram.to_vec();
                    let iv = self.iv(&ssc);
                    self.suite.decrypt_padded_data(&mut decrypted, &self.enc_key, &iv).ok()?;
                    let length = unpad_iso9797_method2(&decrypted).ok()?;
                    plain = decrypted[..length].to_vec();
                },
                0x97 => {
                    mac_input.extend(tlv.raw);
                    response_length = Some(match tlv.value {
                        [0x00] => 256,
                        [le] => usize::from(*le),
                        [0x00, 0x00] => 65536,
                        [hi, lo] => usize::from(u16::from_be_bytes([*hi, *lo])),
                        _ => return None,
                    });
                },
                0x8E => received_mac = Some(tlv.value.to_vec()),
                _ => return None,
            }
        }
        if self.mac(&mac_input) != received_mac? {
            return None;
        }

        let header = CommandHeader::new(
            request.header.cla & !0x0C,
            request.header.ins,
            request.header.p1,
            request.header.p2,
        );
        Some(Apdu::new(header, plain, response_length))
    }

    fn protect(&mut self, response: Response, corrupt_at: Option<usize>) -> Response {
        let ssc = self.next_ssc();
        let mut body = Vec::new();
        if !response.data.is_empty() {
            let mut padded = response.data.clone();
            self.suite.pad(&mut padded);
            let iv = self.iv(&ssc);
            self.suite.encrypt_padded_data(&mut padded, &self.enc_key, &iv).unwrap();
            let mut value = vec![0x01];
            value.extend(&padded);
            encode_tlv(&mut body, &[0x87], &value);
        }
        encode_tlv(&mut body, &[0x99], &response.trailer.to_bytes());

        let mut mac_input = ssc;
        mac_input.extend(&body);
        let mut mac = self.mac(&mac_input);
        if corrupt_at == Some(self.responses) {
            mac[0] ^= 0x01;
        }
        self.responses += 1;
        encode_tlv(&mut body, &[0x8E], &mac);
        Response::new(body, response.trailer)
    }
}


#[derive(Default)]
struct PaceState {
    nonce: Option<BigUint>,
    mapped: Option<KeyExchange>,
    terminal_public_key: Vec<u8>,
    chip_public_key: Vec<u8>,
    shared_secret: Vec<u8>,
}


pub struct SimulatedChip {
    access: ChipAccess,
    mrz_key: Vec<u8>,
    files: HashMap<u16, Vec<u8>>,
    application_selected: bool,
    selected: Option<u16>,
    bac_challenge: Option<[u8; 8]>,
    pace: PaceState,
    session: Option<ChipSession>,
    faults: Faults,
    log: Arc<Mutex<ChipLog>>,
}
impl SimulatedChip {
    /// A chip holding the ERIKSSON specimen data.
    pub fn new(access: ChipAccess) -> Self {
        let mut files = HashMap::new();
        files.insert(FID_COM, com());
        files.insert(FID_DG1, dg1(ERIKSSON_MRZ));
        files.insert(FID_DG2, dg2(JPEG));
        if access == ChipAccess::Pace {
            files.insert(FID_CARD_ACCESS, card_access());
        }
        Self {
            access,
            mrz_key: eriksson_seed().mrz_key().into_bytes(),
            files,
            application_selected: false,
            selected: None,
            bac_challenge: None,
            pace: PaceState::default(),
            session: None,
            faults: Faults::default(),
            log: Arc::new(Mutex::new(ChipLog::default())),
        }
    }

    pub fn with_file(mut self, file_id: u16, contents: Vec<u8>) -> Self {
        self.files.insert(file_id, contents);
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn log(&self) -> Arc<Mutex<ChipLog>> {
        Arc::clone(&self.log)
    }

    fn requires_authentication(&self, file_id: u16) -> bool {
        file_id != FID_CARD_ACCESS && self.access != ChipAccess::Plaintext
    }

    fn select(&mut self, request: &Apdu, secure: bool) -> Response {
        let data = request.data.request_data().unwrap_or(&[]);
        if request.header.p1 == 0x04 {
            if data != LDS1_AID {
                return Response::new(Vec::new(), SW_NOT_FOUND);
            }
            self.application_selected = true;
            self.selected = None;
            return Response::new(Vec::new(), SW_SUCCESS);
        }

        let [hi, lo] = data else {
            return Response::new(Vec::new(), SW_NOT_FOUND);
        };
        let file_id = u16::from_be_bytes([*hi, *lo]);
        if !self.files.contains_key(&file_id) {
            return Response::new(Vec::new(), SW_NOT_FOUND);
        }
        if self.requires_authentication(file_id) && !secure {
            return Response::new(Vec::new(), SW_SECURITY_STATUS);
        }
        self.selected = Some(file_id);
        if let Some((cancel_file_id, token)) = &self.faults.cancel_on_select {
            if *cancel_file_id == file_id {
                token.cancel();
            }
        }
        Response::new(Vec::new(), SW_SUCCESS)
    }

    fn read_binary(&mut self, request: &Apdu) -> Response {
        let Some(file_id) = self.selected else {
            return Response::new(Vec::new(), SW_NO_CURRENT_EF);
        };
        let mut contents = self.files[&file_id].as_slice();
        if let Some((truncated_file_id, length)) = self.faults.truncate_file {
            if truncated_file_id == file_id {
                contents = &contents[..length.min(contents.len())];
            }
        }

        let offset = (usize::from(request.header.p1 & 0x7F) << 8) | usize::from(request.header.p2);
        let wanted = request.data.response_data_length().unwrap_or(0);
        if offset >= contents.len() {
            return Response::new(Vec::new(), SW_WRONG_OFFSET);
        }
        let end = (offset + wanted).min(contents.len());
        let trailer = if end - offset < wanted { SW_END_OF_FILE } else { SW_SUCCESS };
        Response::new(contents[offset..end].to_vec(), trailer)
    }

    fn get_challenge(&mut self) -> Response {
        let challenge: [u8; 8] = rand::random();
        self.bac_challenge = Some(challenge);
        Response::new(challenge.to_vec(), SW_SUCCESS)
    }

    fn external_authenticate(&mut self, request: &Apdu) -> Response {
        let failed = Response::new(Vec::new(), SW_AUTHENTICATION_FAILED);
        let (Some(rnd_ic), Some(data)) = (self.bac_challenge.take(), request.data.request_data()) else {
            return failed;
        };
        if data.len() != 40 {
            return failed;
        }

        let suite = CipherSuite::Tdes;
        let k_seed = derive_key_seed(&self.mrz_key);
        let k_enc = suite.derive_encryption_key(&k_seed);
        let k_mac = suite.derive_mac_key(&k_seed);

        let mut mac_input = data[..32].to_vec();
        suite.pad(&mut mac_input);
        if !suite.verify_mac_padded_data(&mac_input, &k_mac, &data[32..]).unwrap() {
            return failed;
        }
        let mut decrypted = data[..32].to_vec();
        suite.decrypt_padded_data(&mut decrypted, &k_enc, &[0u8; 8]).unwrap();
        if decrypted[8..16] != rnd_ic {
            return failed;
        }
        let rnd_ifd = &decrypted[0..8];
        let k_ifd = &decrypted[16..32];
        let k_ic: [u8; 16] = rand::random();

        let mut answer = Vec::with_capacity(40);
        answer.extend(&rnd_ic);
        answer.extend(rnd_ifd);
        answer.extend(&k_ic);
        suite.encrypt_padded_data(&mut answer, &k_enc, &[0u8; 8]).unwrap();
        let mut mac_input = answer.clone();
        suite.pad(&mut mac_input);
        let mac = suite.mac_padded_data(&mac_input, &k_mac).unwrap();
        answer.extend(mac.iter());

        if let Some(bit) = self.faults.flip_auth_response_bit {
            answer[bit / 8] ^= 0x80 >> (bit % 8);
        }

        let session_seed: Vec<u8> = k_ifd.iter().zip(k_ic.iter()).map(|(a, b)| a ^ b).collect();
        let mut ssc = [0u8; 8];
        ssc[..4].copy_from_slice(&rnd_ic[4..]);
        ssc[4..].copy_from_slice(&rnd_ifd[4..]);
        self.session = Some(ChipSession::new(suite, &session_seed, u64::from_be_bytes(ssc)));
        Response::new(answer, SW_SUCCESS)
    }

    fn dynamic_authentication_data(tag: u8, value: &[u8]) -> Vec<u8> {
        let mut inner = Vec::new();
        encode_tlv(&mut inner, &[tag], value);
        let mut ret = Vec::new();
        encode_tlv(&mut ret, &[0x7C], &inner);
        ret
    }

    fn token(&self, suite: CipherSuite, k_mac: &[u8], public_key: &[u8]) -> Vec<u8> {
        let params = pace_parameters();
        let mut inner = Vec::new();
        encode_tlv(&mut inner, &[0x06], &oid_to_der_bytes(&params.protocol).unwrap());
        encode_tlv(&mut inner, &[0x86], public_key);
        let mut outer = Vec::new();
        encode_tlv(&mut outer, &[0x7F, 0x49], &inner);
        suite.mac_padded_data(&outer, k_mac).unwrap().to_vec()
    }

    fn general_authenticate(&mut self, request: &Apdu) -> Response {
        let failed = Response::new(Vec::new(), SW_AUTHENTICATION_FAILED);
        let params = pace_parameters();
        let suite = params.suite;
        let key_exchange = params.key_exchange().unwrap();

        let Ok(template) = expect_tlv(request.data.request_data().unwrap_or(&[]), 0x7C) else {
            return failed;
        };
        let Some(Ok(step)) = template.children().next() else {
            // first step: the encrypted nonce
            let nonce: [u8; 16] = rand::random();
            self.pace.nonce = Some(BigUint::from_bytes_be(&nonce));
            let mut mrz_hasher = Sha1::new();
            Digest::update(&mut mrz_hasher, &self.mrz_key);
            let k_pi = suite.derive_key_from_password(&mrz_hasher.finalize());
            let mut encrypted = nonce.to_vec();
            suite.encrypt_padded_data(&mut encrypted, &k_pi, &[0u8; 16]).unwrap();
            return Response::new(Self::dynamic_authentication_data(0x80, &encrypted), SW_SUCCESS);
        };

        match step.tag {
            0x81 => {
                let Some(nonce) = self.pace.nonce.as_ref() else { return failed };
                let private_key = key_exchange.generate_private_key();
                let public_key = key_exchange.calculate_public_key(&private_key).unwrap();
                let Ok(mapped) = key_exchange.derive_generic_mapping(nonce, &private_key, step.value) else {
                    return failed;
                };
                self.pace.mapped = Some(mapped);
                Response::new(Self::dynamic_authentication_data(0x82, &public_key), SW_SUCCESS)
            },
            0x83 => {
                let Some(mapped) = self.pace.mapped.as_ref() else { return failed };
                let private_key = mapped.generate_private_key();
                let public_key = mapped.calculate_public_key(&private_key).unwrap();
                let Ok(shared_secret) = mapped.exchange_keys(&private_key, step.value) else {
                    return failed;
                };
                self.pace.terminal_public_key = step.value.to_vec();
                self.pace.chip_public_key = public_key.to_vec();
                self.pace.shared_secret = shared_secret.to_vec();
                Response::new(Self::dynamic_authentication_data(0x84, &public_key), SW_SUCCESS)
            },
            0x85 => {
                let k_mac = suite.derive_mac_key(&self.pace.shared_secret);
                let expected = self.token(suite, &k_mac, &self.pace.chip_public_key);
                if step.value != expected.as_slice() {
                    return failed;
                }
                let answer = self.token(suite, &k_mac, &self.pace.terminal_public_key);
                self.session = Some(ChipSession::new(suite, &self.pace.shared_secret, 0));
                Response::new(Self::dynamic_authentication_data(0x86, &answer), SW_SUCCESS)
            },
            _ => failed,
        }
    }

    fn handle(&mut self, request: &Apdu, secure: bool) -> Response {
        self.log.lock().unwrap().instructions.push(request.header.ins);
        match request.header.ins {
            0xA4 => self.select(request, secure),
            0xB0 => self.read_binary(request),
            0x84 if self.access != ChipAccess::Plaintext => self.get_challenge(),
            0x82 if self.access != ChipAccess::Plaintext => self.external_authenticate(request),
            0x22 if self.access == ChipAccess::Pace => Response::new(Vec::new(), SW_SUCCESS),
            0x86 if self.access == ChipAccess::Pace => self.general_authenticate(request),
            _ => Response::new(Vec::new(), SW_INS_NOT_SUPPORTED),
        }
    }
}
impl Channel for SimulatedChip {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let exchange = {
            let mut log = self.log.lock().unwrap();
            log.transceives += 1;
            log.transceives - 1
        };
        if self.faults.disconnect_at.map(|at| exchange >= at).unwrap_or(false) {
            return Err(TransportError::Disconnected);
        }

        let request = Apdu::from_slice(command)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let response = match self.session.take() {
            Some(mut session) if request.header.cla & 0x0C == 0x0C => {
                match session.unprotect(&request) {
                    Some(inner) => {
                        let response = self.handle(&inner, true);
                        let protected = session.protect(response, self.faults.corrupt_protected_response);
                        self.session = Some(session);
                        protected
                    },
                    None => Response::new(Vec::new(), SW_SM_INCORRECT),
                }
            },
            other => {
                // a plain command ends any session
                drop(other);
                self.handle(&request, false)
            },
        };
        Ok(response.to_bytes())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
    }
}


/// Hands out the simulated chip once.
pub struct SimulatedTransport {
    availability: Availability,
    chip: Option<SimulatedChip>,
    gate: Option<Receiver<()>>,
}
impl SimulatedTransport {
    pub fn new(chip: SimulatedChip) -> Self {
        Self {
            availability: Availability::Ready,
            chip: Some(chip),
            gate: None,
        }
    }

    pub fn unavailable(availability: Availability) -> Self {
        Self {
            availability,
            chip: None,
            gate: None,
        }
    }

    /// Makes `open` block until the gate receives a value or is dropped.
    pub fn gated(mut self, gate: Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }
}
impl Transport for SimulatedTransport {
    fn availability(&self) -> Availability {
        self.availability
    }

    fn open(&mut self) -> Result<Box<dyn Channel>, TransportError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }
        let chip = self.chip.take()
            .ok_or(TransportError::Io("no chip in the field".to_owned()))?;
        Ok(Box::new(chip))
    }
}
