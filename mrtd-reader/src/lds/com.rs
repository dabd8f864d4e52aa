//! `EF.COM`: LDS version information and the list of present data groups.


use crate::lds::{Error, FileId};
use crate::lds::tlv::{expect_tlv, find_value};


const TAG_COM: u32 = 0x60;
const TAG_LDS_VERSION: u32 = 0x5F01;
const TAG_UNICODE_VERSION: u32 = 0x5F36;
const TAG_DATA_GROUP_LIST: u32 = 0x5C;


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Com {
    /// LDS version as stored, `aabb` for version `aa.bb` (e.g. `0107`).
    pub lds_version: String,

    /// Unicode version as stored, `aabbcc` for version `aa.bb.cc` (e.g. `040000`).
    pub unicode_version: String,

    /// Tags of the data groups present on the chip, in the order listed.
    pub data_group_tags: Vec<u8>,
}
impl Com {
    /// The data groups present on the chip. Unknown tags are skipped.
    pub fn data_groups(&self) -> Vec<FileId> {
        self.data_group_tags.iter()
            .filter_map(|tag| FileId::from_data_group_tag(*tag))
            .collect()
    }

    pub fn contains(&self, file: FileId) -> bool {
        file.tag()
            .map(|tag| self.data_group_tags.contains(&tag))
            .unwrap_or(false)
    }
}


fn digit_string(value: &[u8], tag: u32, length: usize) -> Result<String, Error> {
    if value.len() != length || !value.iter().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidValue { tag });
    }
    Ok(value.iter().map(|b| char::from(*b)).collect())
}


/// Decodes the contents of `EF.COM`.
pub fn decode_com(bytes: &[u8]) -> Result<Com, Error> {
    let com = expect_tlv(bytes, TAG_COM)?;
    let lds_version = digit_string(find_value(com.value, TAG_LDS_VERSION)?, TAG_LDS_VERSION, 4)?;
    let unicode_version = digit_string(find_value(com.value, TAG_UNICODE_VERSION)?, TAG_UNICODE_VERSION, 6)?;
    let data_group_tags = find_value(com.value, TAG_DATA_GROUP_LIST)?.to_vec();
    Ok(Com {
        lds_version,
        unicode_version,
        data_group_tags,
    })
}
