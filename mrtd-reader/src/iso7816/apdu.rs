//! Structures related to application protocol data units (APDUs).
//!
//! Command APDUs are encoded according to ISO/IEC 7816-3:2006 § 12.1.3 (cases 1, 2S, 3S, 4S, 2E, 3E
//! and 4E). Response APDUs are the response data followed by the two status bytes.


use std::fmt;


/// Maximum number of request data bytes in a short APDU.
pub const SHORT_MAX_REQUEST_LENGTH: usize = 255;

/// Maximum number of response data bytes a short APDU can request.
pub const SHORT_MAX_RESPONSE_LENGTH: usize = 256;

/// Maximum number of request data bytes in an extended APDU.
pub const EXTENDED_MAX_REQUEST_LENGTH: usize = 65535;

/// Maximum number of response data bytes an extended APDU can request.
pub const EXTENDED_MAX_RESPONSE_LENGTH: usize = 65536;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MalformedReason {
    EmptyRequestData,
    RequestDataTooLong { maximum: usize, obtained: usize },
    ResponseLengthOutOfRange { maximum: usize, obtained: usize },
    TooShort { obtained: usize },
    LengthMismatch { obtained: usize },
}
impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequestData
                => write!(f, "request data is, but must not be, empty"),
            Self::RequestDataTooLong { maximum, obtained }
                => write!(f, "too much request data: obtained {} bytes, expected maximum {} bytes", obtained, maximum),
            Self::ResponseLengthOutOfRange { maximum, obtained }
                => write!(f, "expected response length {} is outside of 1..={}", obtained, maximum),
            Self::TooShort { obtained }
                => write!(f, "command of {} bytes is shorter than a header", obtained),
            Self::LengthMismatch { obtained }
                => write!(f, "command of {} bytes does not match any encoding case", obtained),
        }
    }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CodecError {
    MalformedCommand(MalformedReason),
    TruncatedResponse { obtained: usize },
}
impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedCommand(reason)
                => write!(f, "malformed command APDU: {}", reason),
            Self::TruncatedResponse { obtained }
                => write!(f, "response of {} bytes is too short to contain a status word", obtained),
        }
    }
}
impl std::error::Error for CodecError {
}
impl From<MalformedReason> for CodecError {
    fn from(value: MalformedReason) -> Self { Self::MalformedCommand(value) }
}


#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2 }
    }

    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub const fn to_be_u32(&self) -> u32 {
        ((self.cla as u32) << 24)
        | ((self.ins as u32) << 16)
        | ((self.p1 as u32) <<  8)
        | ((self.p2 as u32) <<  0)
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} {}",
            '{', self.cla, self.ins, self.p1, self.p2, '}',
        )
    }
}

#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResponseTrailer {
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseTrailer {
    pub const SUCCESS: Self = Self::new(0x90, 0x00);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
        }
    }

    pub const fn from_word(word: u16) -> Self {
        let bytes = word.to_be_bytes();
        Self::new(bytes[0], bytes[1])
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }
}
impl fmt::Debug for ResponseTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseTrailer {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}


/// The body of a command APDU.
///
/// Expected response lengths are stored as the actual number of bytes, i.e. a short `Le` of `0x00`
/// is stored as 256 and an extended `Le` of `0x0000` as 65536.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Data {
    NoData,
    RequestDataShort {
        request_data: Vec<u8>,
    },
    RequestDataExtended {
        request_data: Vec<u8>,
    },
    ResponseDataShort {
        response_data_length: usize,
    },
    ResponseDataExtended {
        response_data_length: usize,
    },
    BothDataShort {
        request_data: Vec<u8>,
        response_data_length: usize,
    },
    BothDataExtended {
        request_data: Vec<u8>,
        response_data_length: usize,
    },
}
impl Data {
    /// Chooses the shortest encoding case able to carry the given request data and expected
    /// response length.
    ///
    /// Empty request data and an expected response length of 0 are both taken to mean "absent".
    pub fn new(request_data: Vec<u8>, response_data_length: Option<usize>) -> Self {
        let response_data_length = response_data_length.filter(|l| *l > 0);
        let extended = request_data.len() > SHORT_MAX_REQUEST_LENGTH
            || response_data_length.map(|l| l > SHORT_MAX_RESPONSE_LENGTH).unwrap_or(false);
        match (request_data.is_empty(), response_data_length, extended) {
            (true, None, _) => Self::NoData,
            (false, None, false) => Self::RequestDataShort { request_data },
            (false, None, true) => Self::RequestDataExtended { request_data },
            (true, Some(response_data_length), false) => Self::ResponseDataShort { response_data_length },
            (true, Some(response_data_length), true) => Self::ResponseDataExtended { response_data_length },
            (false, Some(response_data_length), false) => Self::BothDataShort { request_data, response_data_length },
            (false, Some(response_data_length), true) => Self::BothDataExtended { request_data, response_data_length },
        }
    }

    pub fn response_data_length(&self) -> Option<usize> {
        match self {
            Self::NoData => None,
            Self::RequestDataShort { .. } => None,
            Self::RequestDataExtended { .. } => None,
            Self::ResponseDataShort { response_data_length } => Some(*response_data_length),
            Self::ResponseDataExtended { response_data_length } => Some(*response_data_length),
            Self::BothDataShort { response_data_length, .. } => Some(*response_data_length),
            Self::BothDataExtended { response_data_length, .. } => Some(*response_data_length),
        }
    }

    pub fn request_data(&self) -> Option<&[u8]> {
        match self {
            Self::NoData => None,
            Self::RequestDataShort { request_data } => Some(request_data.as_slice()),
            Self::RequestDataExtended { request_data } => Some(request_data.as_slice()),
            Self::ResponseDataShort { .. } => None,
            Self::ResponseDataExtended { .. } => None,
            Self::BothDataShort { request_data, .. } => Some(request_data.as_slice()),
            Self::BothDataExtended { request_data, .. } => Some(request_data.as_slice()),
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(
            self,
            Self::RequestDataExtended { .. } | Self::ResponseDataExtended { .. } | Self::BothDataExtended { .. }
        )
    }

    fn encode_into(&self, output: &mut Vec<u8>) -> Result<(), MalformedReason> {
        fn short_lc(request_data: &[u8]) -> Result<u8, MalformedReason> {
            if request_data.is_empty() {
                return Err(MalformedReason::EmptyRequestData);
            }
            u8::try_from(request_data.len())
                .map_err(|_| MalformedReason::RequestDataTooLong {
                    maximum: SHORT_MAX_REQUEST_LENGTH,
                    obtained: request_data.len(),
                })
        }
        fn extended_lc(request_data: &[u8]) -> Result<[u8; 2], MalformedReason> {
            if request_data.is_empty() {
                return Err(MalformedReason::EmptyRequestData);
            }
            u16::try_from(request_data.len())
                .map(|l| l.to_be_bytes())
                .map_err(|_| MalformedReason::RequestDataTooLong {
                    maximum: EXTENDED_MAX_REQUEST_LENGTH,
                    obtained: request_data.len(),
                })
        }
        fn short_le(response_data_length: usize) -> Result<u8, MalformedReason> {
            match response_data_length {
                SHORT_MAX_RESPONSE_LENGTH => Ok(0x00),
                1..=255 => Ok(response_data_length as u8),
                other => Err(MalformedReason::ResponseLengthOutOfRange {
                    maximum: SHORT_MAX_RESPONSE_LENGTH,
                    obtained: other,
                }),
            }
        }
        fn extended_le(response_data_length: usize) -> Result<[u8; 2], MalformedReason> {
            match response_data_length {
                EXTENDED_MAX_RESPONSE_LENGTH => Ok([0x00, 0x00]),
                1..=65535 => Ok((response_data_length as u16).to_be_bytes()),
                other => Err(MalformedReason::ResponseLengthOutOfRange {
                    maximum: EXTENDED_MAX_RESPONSE_LENGTH,
                    obtained: other,
                }),
            }
        }

        match self {
            Data::NoData => {
                // case 1
            },
            Data::RequestDataShort { request_data } => {
                // case 3S: [Lc] [Data]
                output.push(short_lc(request_data)?);
                output.extend(request_data);
            },
            Data::RequestDataExtended { request_data } => {
                // case 3E: [0x00] [LcMSB] [LcLSB] [Data]
                output.push(0x00);
                output.extend(extended_lc(request_data)?);
                output.extend(request_data);
            },
            Data::ResponseDataShort { response_data_length } => {
                // case 2S: [Le]
                output.push(short_le(*response_data_length)?);
            },
            Data::ResponseDataExtended { response_data_length } => {
                // case 2E: [0x00] [LeMSB] [LeLSB]
                output.push(0x00);
                output.extend(extended_le(*response_data_length)?);
            },
            Data::BothDataShort { request_data, response_data_length } => {
                // case 4S: [Lc] [Data] [Le]
                output.push(short_lc(request_data)?);
                output.extend(request_data);
                output.push(short_le(*response_data_length)?);
            },
            Data::BothDataExtended { request_data, response_data_length } => {
                // case 4E: [0x00] [LcMSB] [LcLSB] [Data] [LeMSB] [LeLSB]
                output.push(0x00);
                output.extend(extended_lc(request_data)?);
                output.extend(request_data);
                output.extend(extended_le(*response_data_length)?);
            },
        }
        Ok(())
    }

    fn decode(body: &[u8]) -> Result<Self, MalformedReason> {
        fn short_le(b: u8) -> usize {
            if b == 0x00 { SHORT_MAX_RESPONSE_LENGTH } else { usize::from(b) }
        }
        fn extended_le(msb: u8, lsb: u8) -> usize {
            match u16::from_be_bytes([msb, lsb]) {
                0x0000 => EXTENDED_MAX_RESPONSE_LENGTH,
                other => usize::from(other),
            }
        }
        let mismatch = || MalformedReason::LengthMismatch { obtained: 4 + body.len() };

        if body.is_empty() {
            return Ok(Self::NoData);
        }
        if body.len() == 1 {
            return Ok(Self::ResponseDataShort { response_data_length: short_le(body[0]) });
        }
        if body[0] != 0x00 {
            let lc = usize::from(body[0]);
            if body.len() == 1 + lc {
                return Ok(Self::RequestDataShort { request_data: body[1..].to_vec() });
            }
            if body.len() == 1 + lc + 1 {
                return Ok(Self::BothDataShort {
                    request_data: body[1..1+lc].to_vec(),
                    response_data_length: short_le(body[1+lc]),
                });
            }
            return Err(mismatch());
        }

        // extended length
        if body.len() < 3 {
            return Err(mismatch());
        }
        if body.len() == 3 {
            return Ok(Self::ResponseDataExtended { response_data_length: extended_le(body[1], body[2]) });
        }
        let lc = usize::from(u16::from_be_bytes([body[1], body[2]]));
        if lc == 0 {
            return Err(mismatch());
        }
        if body.len() == 3 + lc {
            Ok(Self::RequestDataExtended { request_data: body[3..].to_vec() })
        } else if body.len() == 3 + lc + 2 {
            Ok(Self::BothDataExtended {
                request_data: body[3..3+lc].to_vec(),
                response_data_length: extended_le(body[3+lc], body[3+lc+1]),
            })
        } else {
            Err(mismatch())
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Apdu {
    pub header: CommandHeader,
    pub data: Data,
}
impl Apdu {
    /// Creates a command APDU, choosing between short and extended length encoding depending on
    /// the amount of request and expected response data.
    pub fn new(header: CommandHeader, request_data: Vec<u8>, response_data_length: Option<usize>) -> Self {
        Self {
            header,
            data: Data::new(request_data, response_data_length),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut ret = Vec::with_capacity(4 + 3 + self.data.request_data().map(|d| d.len()).unwrap_or(0) + 2);
        ret.extend(self.header.to_bytes());
        self.data.encode_into(&mut ret)?;
        Ok(ret)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 4 {
            return Err(MalformedReason::TooShort { obtained: bytes.len() }.into());
        }
        let header = CommandHeader::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let data = Data::decode(&bytes[4..])?;
        Ok(Self { header, data })
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: ResponseTrailer,
}
impl Response {
    pub fn new(data: Vec<u8>, trailer: ResponseTrailer) -> Self {
        Self { data, trailer }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 2 {
            return Err(CodecError::TruncatedResponse { obtained: bytes.len() });
        }

        let data = bytes[..bytes.len() - 2].to_vec();
        let trailer = ResponseTrailer {
            sw1: bytes[bytes.len() - 2],
            sw2: bytes[bytes.len() - 1],
        };
        Ok(Self {
            data,
            trailer,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ret = Vec::with_capacity(self.data.len() + 2);
        ret.extend(&self.data);
        ret.extend(self.trailer.to_bytes());
        ret
    }

    pub fn is_success(&self) -> bool {
        self.trailer == ResponseTrailer::SUCCESS
    }
}
