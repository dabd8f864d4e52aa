//! `EF.DG2`: encoded face images.
//!
//! The data group is a biometric information template group (`7F61`) of biometric information
//! templates (`7F60`), each holding a header (`A1`) and a biometric data block (`5F2E`, or `7F2E`
//! if enciphered). The data block is a facial record in the format of ISO/IEC 19794-5:2005.
//!
//! Enciphered blocks cannot be decoded here; they are skipped, and a data group holding nothing
//! else is reported as [`Error::EncipheredBiometricData`].


use std::fmt;

use crate::lds::Error;
use crate::lds::tlv::{expect_tlv, TlvReader};


const TAG_DG2: u32 = 0x75;
const TAG_TEMPLATE_GROUP: u32 = 0x7F61;
const TAG_TEMPLATE_COUNT: u32 = 0x02;
const TAG_TEMPLATE: u32 = 0x7F60;
const TAG_DATA_BLOCK: u32 = 0x5F2E;
const TAG_DATA_BLOCK_ENCIPHERED: u32 = 0x7F2E;

const FORMAT_IDENTIFIER: &[u8; 4] = b"FAC\0";
const VERSION_2005: &[u8; 4] = b"010\0";

const RECORD_HEADER_LENGTH: usize = 14;
const FACIAL_INFORMATION_LENGTH: usize = 20;
const FEATURE_POINT_LENGTH: usize = 8;
const IMAGE_INFORMATION_LENGTH: usize = 12;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ImageFormat {
    Jpeg,
    Jpeg2000,
}
impl ImageFormat {
    pub fn from_image_data_type(image_data_type: u8) -> Option<Self> {
        match image_data_type {
            0 => Some(Self::Jpeg),
            1 => Some(Self::Jpeg2000),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Jpeg2000 => "image/jp2",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Jpeg2000 => "jp2",
        }
    }
}
impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jpeg => write!(f, "JPEG"),
            Self::Jpeg2000 => write!(f, "JPEG 2000"),
        }
    }
}


/// One face image as stored on the chip.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct FaceImageRecord {
    pub format: ImageFormat,
    pub width: u16,
    pub height: u16,

    /// The face image type (0 basic, 1 full frontal, 2 token frontal).
    pub face_image_type: u8,

    pub encoded: Vec<u8>,
}
impl fmt::Debug for FaceImageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceImageRecord")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("face_image_type", &self.face_image_type)
            .field("encoded", &format_args!("[{} bytes]", self.encoded.len()))
            .finish()
    }
}


fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn take<'a>(input: &'a [u8], length: usize, reason: &'static str) -> Result<(&'a [u8], &'a [u8]), Error> {
    if input.len() < length {
        return Err(Error::BiometricRecord { reason });
    }
    Ok(input.split_at(length))
}


/// Decodes a facial record (the contents of a biometric data block).
pub fn decode_facial_record(block: &[u8]) -> Result<Vec<FaceImageRecord>, Error> {
    let (header, mut rest) = take(block, RECORD_HEADER_LENGTH, "record header truncated")?;
    if &header[0..4] != FORMAT_IDENTIFIER {
        return Err(Error::BiometricRecord { reason: "format identifier is not FAC" });
    }
    if &header[4..8] != VERSION_2005 {
        return Err(Error::BiometricRecord { reason: "unsupported facial record version" });
    }
    let record_length = be_u32(&header[8..12]) as usize;
    if record_length < RECORD_HEADER_LENGTH || record_length > block.len() {
        return Err(Error::BiometricRecord { reason: "record length out of range" });
    }
    rest = &rest[..record_length - RECORD_HEADER_LENGTH];
    let image_count = be_u16(&header[12..14]);

    let mut images = Vec::with_capacity(usize::from(image_count).min(4));
    for _ in 0..image_count {
        // facial information
        let (facial_information, _) = take(rest, FACIAL_INFORMATION_LENGTH, "facial information truncated")?;
        let image_record_length = be_u32(&facial_information[0..4]) as usize;
        let feature_point_count = usize::from(be_u16(&facial_information[4..6]));
        let (image_record, after_image_record) = take(rest, image_record_length, "face image exceeds record")?;
        rest = after_image_record;

        let fixed_length = FACIAL_INFORMATION_LENGTH
            + feature_point_count * FEATURE_POINT_LENGTH
            + IMAGE_INFORMATION_LENGTH;
        if image_record_length < fixed_length {
            return Err(Error::BiometricRecord { reason: "face image record too short" });
        }

        // skip feature points, then image information
        let image_information = &image_record[fixed_length - IMAGE_INFORMATION_LENGTH..fixed_length];
        let face_image_type = image_information[0];
        let image_data_type = image_information[1];
        let format = ImageFormat::from_image_data_type(image_data_type)
            .ok_or(Error::UnsupportedImageFormat { image_data_type })?;
        let width = be_u16(&image_information[2..4]);
        let height = be_u16(&image_information[4..6]);

        images.push(FaceImageRecord {
            format,
            width,
            height,
            face_image_type,
            encoded: image_record[fixed_length..].to_vec(),
        });
    }
    Ok(images)
}


/// Decodes the contents of `EF.DG2` into the face images of all templates, in order.
pub fn decode_dg2(bytes: &[u8]) -> Result<Vec<FaceImageRecord>, Error> {
    let dg2 = expect_tlv(bytes, TAG_DG2)?;
    let group = expect_tlv(dg2.value, TAG_TEMPLATE_GROUP)?;

    let mut images = Vec::new();
    let mut enciphered_blocks = 0usize;
    for child in group.children() {
        let child = child?;
        match child.tag {
            TAG_TEMPLATE_COUNT => {},
            TAG_TEMPLATE => {
                let mut found_block = false;
                for template_child in TlvReader::new(child.value) {
                    let template_child = template_child?;
                    match template_child.tag {
                        TAG_DATA_BLOCK => {
                            images.extend(decode_facial_record(template_child.value)?);
                            found_block = true;
                        },
                        TAG_DATA_BLOCK_ENCIPHERED => {
                            enciphered_blocks += 1;
                            found_block = true;
                        },
                        _ => {},
                    }
                }
                if !found_block {
                    return Err(Error::MissingDataObject { tag: TAG_DATA_BLOCK });
                }
            },
            _ => {},
        }
    }
    if images.is_empty() && enciphered_blocks > 0 {
        return Err(Error::EncipheredBiometricData);
    }
    Ok(images)
}
