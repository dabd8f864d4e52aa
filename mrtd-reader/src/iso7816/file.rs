//! Reading of transparent elementary files.


use std::fmt;

use tracing::{debug, instrument};

use crate::der_util::try_decode_primitive_length;
use crate::iso7816::apdu::{self, Apdu, CommandHeader, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, SmartCard, TransportError};


/// Number of bytes first requested to learn the length of a file.
///
/// Enough for a one-byte tag and a length of up to 0xFFFF.
const HEADER_LENGTH: usize = 4;

/// Number of header bytes available after a second request.
///
/// Enough for a two-byte tag and a length of up to 0xFFFFFF.
const EXTENDED_HEADER_LENGTH: usize = 6;

/// Largest offset that can be passed in P1/P2 of READ BINARY with an even instruction byte.
const MAX_EVEN_INS_OFFSET: usize = 0x7FFF;

/// End of file reached before reading the requested number of bytes.
const SW_END_OF_FILE: ResponseTrailer = ResponseTrailer::new(0x62, 0x82);

/// Offset outside of the file.
const SW_WRONG_PARAMETERS: ResponseTrailer = ResponseTrailer::new(0x6B, 0x00);

const SW_FILE_NOT_FOUND: ResponseTrailer = ResponseTrailer::new(0x6A, 0x82);


#[derive(Debug)]
pub enum ReadError {
    /// The transport failed while the file was being selected or read.
    ChipDisconnected(TransportError),

    /// Any other failure to communicate, including Secure Messaging failures.
    Communication(CommunicationError),

    FileNotFound { file_id: u16 },
    SelectFailed { file_id: u16, response: Response },
    ReadFailed { file_id: u16, offset: usize, response: Response },

    /// The file does not start with a valid tag and length.
    MalformedHeader { file_id: u16 },

    /// The chip stopped delivering data before the declared length was reached.
    ShortRead { file_id: u16, declared: usize, obtained: usize },
}
impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChipDisconnected(e)
                => write!(f, "chip disconnected while reading: {}", e),
            Self::Communication(e)
                => write!(f, "communication failed while reading: {}", e),
            Self::FileNotFound { file_id }
                => write!(f, "file {:04X} not found", file_id),
            Self::SelectFailed { file_id, response }
                => write!(f, "SELECT of file {:04X} failed with status code 0x{:04X}", file_id, response.trailer.to_word()),
            Self::ReadFailed { file_id, offset, response }
                => write!(f, "READ BINARY of file {:04X} at offset {} failed with status code 0x{:04X}", file_id, offset, response.trailer.to_word()),
            Self::MalformedHeader { file_id }
                => write!(f, "file {:04X} does not start with a valid tag and length", file_id),
            Self::ShortRead { file_id, declared, obtained }
                => write!(f, "file {:04X} declares {} bytes but only {} could be read", file_id, declared, obtained),
        }
    }
}
impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ChipDisconnected(e) => Some(e),
            Self::Communication(e) => Some(e),
            _ => None,
        }
    }
}
impl From<CommunicationError> for ReadError {
    fn from(value: CommunicationError) -> Self {
        match value {
            CommunicationError::Transport(e) => Self::ChipDisconnected(e),
            other => Self::Communication(other),
        }
    }
}


/// Options controlling how files are read.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ReadOptions {
    /// Maximum number of bytes requested per READ BINARY.
    ///
    /// Defaults to what the card reports; the card's limit still applies unless extended-length
    /// reads are allowed.
    pub max_chunk_length: Option<usize>,

    /// Whether READ BINARY may request more than a short APDU can carry.
    pub allow_extended_length: bool,
}
impl ReadOptions {
    fn chunk_length(&self, card: &dyn SmartCard) -> usize {
        let limit = if self.allow_extended_length {
            apdu::EXTENDED_MAX_RESPONSE_LENGTH
        } else {
            card.max_response_data_length()
        };
        self.max_chunk_length
            .map(|requested| requested.min(limit))
            .unwrap_or(limit)
            .max(1)
    }
}


/// The complete contents of an elementary file, tagged with its file identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DataGroupFile {
    file_id: u16,
    data: Vec<u8>,
}
impl DataGroupFile {
    pub fn new(file_id: u16, data: Vec<u8>) -> Self {
        Self { file_id, data }
    }

    pub fn file_id(&self) -> u16 { self.file_id }
    pub fn as_bytes(&self) -> &[u8] { &self.data }
    pub fn into_bytes(self) -> Vec<u8> { self.data }
}


/// Selects an elementary file under the current DF by its file identifier.
pub fn select_file(card: &mut dyn SmartCard, file_id: u16) -> Result<(), ReadError> {
    let request = Apdu::new(
        CommandHeader::new(0x00, 0xA4, 0x02, 0x0C), // SELECT EF under current DF, no response data
        file_id.to_be_bytes().to_vec(),
        None,
    );
    let response = card.communicate(&request)?;
    if response.trailer == SW_FILE_NOT_FOUND {
        return Err(ReadError::FileNotFound { file_id });
    }
    if !response.is_success() {
        return Err(ReadError::SelectFailed { file_id, response });
    }
    Ok(())
}


/// Reads `length` bytes at `offset` from the currently selected file.
///
/// Offsets beyond 0x7FFF use the odd instruction byte with the offset in a data object; the data
/// of the response is then unwrapped from its discretionary data object.
pub fn read_binary(card: &mut dyn SmartCard, offset: usize, length: usize) -> Result<Response, CommunicationError> {
    if offset <= MAX_EVEN_INS_OFFSET {
        let offset_bytes = (offset as u16).to_be_bytes();
        let request = Apdu::new(
            CommandHeader::new(0x00, 0xB0, offset_bytes[0], offset_bytes[1]), // READ BINARY
            Vec::new(),
            Some(length),
        );
        return card.communicate(&request);
    }

    let offset_bytes = (offset as u32).to_be_bytes();
    let first_nonzero = offset_bytes.iter().position(|b| *b != 0x00).unwrap_or(3);
    let mut request_data = vec![0x54, (4 - first_nonzero) as u8]; // offset data object
    request_data.extend(&offset_bytes[first_nonzero..]);
    let request = Apdu::new(
        CommandHeader::new(0x00, 0xB1, 0x00, 0x00), // READ BINARY, offset in data
        request_data,
        Some(length),
    );
    let mut response = card.communicate(&request)?;
    let unwrapped = match response.data.split_first() {
        Some((0x53, rest)) => try_decode_primitive_length(rest)
            .filter(|(value_length, value)| *value_length <= value.len())
            .map(|(value_length, value)| value[..value_length].to_vec()),
        _ => None,
    };
    if let Some(data) = unwrapped {
        response.data = data;
    }
    Ok(response)
}


/// Decodes the tag and length at the start of a file, returning the total length of the file.
fn declared_length(header: &[u8]) -> Option<usize> {
    let (&first_tag_byte, mut rest) = header.split_first()?;
    let mut tag_length: usize = 1;
    if first_tag_byte & 0x1F == 0x1F {
        // subsequent tag bytes have the top bit set, except for the last one
        loop {
            let (&tag_byte, tag_rest) = rest.split_first()?;
            rest = tag_rest;
            tag_length += 1;
            if tag_byte & 0x80 == 0 {
                break;
            }
        }
    }
    let (value_length, value) = try_decode_primitive_length(rest)?;
    let length_length = rest.len() - value.len();
    tag_length.checked_add(length_length)?.checked_add(value_length)
}


/// Reads a whole elementary file.
///
/// The file is selected, its first bytes are read to learn its declared length from its outer
/// tag-length-value structure, and the rest is read in chunks. The file is never returned
/// incomplete.
#[instrument(skip(card, options), fields(file_id = format!("{:04X}", file_id)))]
pub fn read_file(card: &mut dyn SmartCard, file_id: u16, options: &ReadOptions) -> Result<DataGroupFile, ReadError> {
    select_file(card, file_id)?;

    let header_response = read_binary(card, 0, HEADER_LENGTH)?;
    if header_response.data.is_empty() {
        if header_response.trailer == SW_END_OF_FILE || header_response.trailer == SW_WRONG_PARAMETERS || header_response.is_success() {
            return Err(ReadError::ShortRead { file_id, declared: HEADER_LENGTH, obtained: 0 });
        }
        return Err(ReadError::ReadFailed { file_id, offset: 0, response: header_response });
    }
    if !header_response.is_success() && header_response.trailer != SW_END_OF_FILE {
        return Err(ReadError::ReadFailed { file_id, offset: 0, response: header_response });
    }

    let mut data = header_response.data;
    if declared_length(&data).is_none() && data.len() == HEADER_LENGTH {
        // longer tag or length than the first request covers
        let more = read_binary(card, HEADER_LENGTH, EXTENDED_HEADER_LENGTH - HEADER_LENGTH)?;
        if more.is_success() || more.trailer == SW_END_OF_FILE {
            data.extend_from_slice(&more.data);
        }
    }
    let total_length = declared_length(&data)
        .ok_or(ReadError::MalformedHeader { file_id })?;
    debug!("file declares {} bytes", total_length);

    data.truncate(total_length);

    let chunk_length = options.chunk_length(card);
    while data.len() < total_length {
        let offset = data.len();
        let length = chunk_length.min(total_length - offset);
        let response = read_binary(card, offset, length)?;

        let end_of_file = response.trailer == SW_END_OF_FILE || response.trailer == SW_WRONG_PARAMETERS;
        if !response.is_success() && !end_of_file {
            return Err(ReadError::ReadFailed { file_id, offset, response });
        }
        if response.data.is_empty() {
            return Err(ReadError::ShortRead { file_id, declared: total_length, obtained: offset });
        }

        let remaining = total_length - offset;
        let take = response.data.len().min(remaining);
        data.extend_from_slice(&response.data[..take]);

        if end_of_file && data.len() < total_length {
            return Err(ReadError::ShortRead { file_id, declared: total_length, obtained: data.len() });
        }
    }

    Ok(DataGroupFile::new(file_id, data))
}
