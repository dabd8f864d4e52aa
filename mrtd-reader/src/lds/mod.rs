//! Decoding of the Logical Data Structure: the files on a travel document chip.
//!
//! Specified in ICAO Doc 9303 Part 10.


pub mod card_access;
pub mod com;
pub mod dg1;
pub mod dg2;
pub mod tlv;


use std::fmt;

use crate::lds::tlv::Tag;
use crate::mrz;


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    /// The input ends within a data object (or within the tag of a data object).
    Truncated { tag: Option<Tag> },
    InvalidTag,
    InvalidLength { tag: Tag },

    /// The file does not start with a well-formed data object header.
    InvalidFileHeader,
    UnexpectedTag { expected: Tag, obtained: Tag },
    MissingDataObject { tag: Tag },
    InvalidValue { tag: Tag },
    BiometricRecord { reason: &'static str },
    UnsupportedImageFormat { image_data_type: u8 },

    /// The only biometric data blocks are enciphered.
    EncipheredBiometricData,
    Mrz(mrz::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { tag: Some(tag) }
                => write!(f, "data object 0x{:X} extends past the end of its container", tag),
            Self::Truncated { tag: None }
                => write!(f, "data ends within a tag"),
            Self::InvalidTag
                => write!(f, "tag is longer than four bytes"),
            Self::InvalidLength { tag }
                => write!(f, "data object 0x{:X} has an invalid length", tag),
            Self::InvalidFileHeader
                => write!(f, "file does not start with a valid data object header"),
            Self::UnexpectedTag { expected, obtained }
                => write!(f, "expected data object 0x{:X}, obtained 0x{:X}", expected, obtained),
            Self::MissingDataObject { tag }
                => write!(f, "data object 0x{:X} is missing", tag),
            Self::InvalidValue { tag }
                => write!(f, "data object 0x{:X} has an invalid value", tag),
            Self::BiometricRecord { reason }
                => write!(f, "invalid facial biometric record: {}", reason),
            Self::UnsupportedImageFormat { image_data_type }
                => write!(f, "unsupported face image data type {}", image_data_type),
            Self::EncipheredBiometricData
                => write!(f, "biometric data is enciphered"),
            Self::Mrz(e)
                => write!(f, "invalid MRZ: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mrz(e) => Some(e),
            _ => None,
        }
    }
}
impl From<mrz::Error> for Error {
    fn from(value: mrz::Error) -> Self { Self::Mrz(value) }
}


/// Elementary files of an eMRTD.
///
/// `CardAccess` lives in the master file; the others live in the LDS1 application.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FileId {
    CardAccess,
    Com,
    Sod,
    Dg1,
    Dg2,
    Dg3,
    Dg4,
    Dg5,
    Dg6,
    Dg7,
    Dg8,
    Dg9,
    Dg10,
    Dg11,
    Dg12,
    Dg13,
    Dg14,
    Dg15,
    Dg16,
}
impl FileId {
    pub const DATA_GROUPS: [FileId; 16] = [
        Self::Dg1, Self::Dg2, Self::Dg3, Self::Dg4, Self::Dg5, Self::Dg6, Self::Dg7, Self::Dg8,
        Self::Dg9, Self::Dg10, Self::Dg11, Self::Dg12, Self::Dg13, Self::Dg14, Self::Dg15, Self::Dg16,
    ];

    /// The data group number, if this is a data group.
    pub fn data_group_number(&self) -> Option<u8> {
        Self::DATA_GROUPS.iter()
            .position(|dg| dg == self)
            .map(|index| (index + 1) as u8)
    }

    /// The file identifier used with SELECT.
    pub fn fid(&self) -> u16 {
        match self {
            Self::CardAccess => 0x011C,
            Self::Com => 0x011E,
            Self::Sod => 0x011D,
            dg => 0x0100 | u16::from(dg.data_group_number().unwrap_or(0)),
        }
    }

    /// The tag of the data object that makes up the file, if it is fixed.
    pub fn tag(&self) -> Option<u8> {
        let tag = match self {
            Self::CardAccess => return None, // SET OF, universal
            Self::Com => 0x60,
            Self::Sod => 0x77,
            Self::Dg1 => 0x61,
            Self::Dg2 => 0x75,
            Self::Dg3 => 0x63,
            Self::Dg4 => 0x76,
            Self::Dg5 => 0x65,
            Self::Dg6 => 0x66,
            Self::Dg7 => 0x67,
            Self::Dg8 => 0x68,
            Self::Dg9 => 0x69,
            Self::Dg10 => 0x6A,
            Self::Dg11 => 0x6B,
            Self::Dg12 => 0x6C,
            Self::Dg13 => 0x6D,
            Self::Dg14 => 0x6E,
            Self::Dg15 => 0x6F,
            Self::Dg16 => 0x70,
        };
        Some(tag)
    }

    /// Finds the data group whose file carries the given tag.
    pub fn from_data_group_tag(tag: u8) -> Option<Self> {
        Self::DATA_GROUPS.iter()
            .copied()
            .find(|dg| dg.tag() == Some(tag))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CardAccess => "EF.CardAccess",
            Self::Com => "EF.COM",
            Self::Sod => "EF.SOD",
            Self::Dg1 => "EF.DG1",
            Self::Dg2 => "EF.DG2",
            Self::Dg3 => "EF.DG3",
            Self::Dg4 => "EF.DG4",
            Self::Dg5 => "EF.DG5",
            Self::Dg6 => "EF.DG6",
            Self::Dg7 => "EF.DG7",
            Self::Dg8 => "EF.DG8",
            Self::Dg9 => "EF.DG9",
            Self::Dg10 => "EF.DG10",
            Self::Dg11 => "EF.DG11",
            Self::Dg12 => "EF.DG12",
            Self::Dg13 => "EF.DG13",
            Self::Dg14 => "EF.DG14",
            Self::Dg15 => "EF.DG15",
            Self::Dg16 => "EF.DG16",
        }
    }
}
impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
