//! `EF.DG1`: the machine-readable zone.


use crate::lds::Error;
use crate::lds::tlv::{expect_tlv, find_value};
use crate::mrz::MrzRecord;


const TAG_DG1: u32 = 0x61;
const TAG_MRZ: u32 = 0x5F1F;


/// Decodes the contents of `EF.DG1` into an MRZ record.
///
/// Check digit mismatches are recorded in the record, not reported as errors.
pub fn decode_dg1(bytes: &[u8]) -> Result<MrzRecord, Error> {
    let dg1 = expect_tlv(bytes, TAG_DG1)?;
    let mrz = find_value(dg1.value, TAG_MRZ)?;
    Ok(MrzRecord::from_bytes(mrz)?)
}
