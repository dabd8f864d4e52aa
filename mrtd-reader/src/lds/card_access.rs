//! `EF.CardAccess`: the security infos readable without access control.


use tracing::debug;

use crate::lds::Error;
use crate::lds::tlv::{expect_tlv, TlvReader};
use crate::pace::PaceParameters;
use crate::pace::asn1::PaceInfo;


/// Tag of a universal SET OF.
const TAG_SET: u32 = 0x31;


/// Decodes the PACE parameters advertised in `EF.CardAccess`.
///
/// Entries that are not `PaceInfo` structures with a PACE protocol OID are skipped. An empty
/// file or an empty set yields an empty list.
pub fn decode_card_access(bytes: &[u8]) -> Result<Vec<PaceParameters>, Error> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let security_infos = expect_tlv(bytes, TAG_SET)?;
    let mut ret = Vec::new();
    for (entry_index, security_info) in TlvReader::new(security_infos.value).enumerate() {
        let security_info = security_info?;
        let pace_info: PaceInfo = match rasn::ber::decode(security_info.raw) {
            Ok(pi) => pi,
            Err(e) => {
                debug!("EF.CardAccess entry {} is not a PaceInfo: {}", entry_index, e);
                continue;
            },
        };
        match PaceParameters::from_pace_info(&pace_info) {
            Some(params) => ret.push(params),
            None => debug!("EF.CardAccess entry {} is not a PACE protocol", entry_index),
        }
    }
    Ok(ret)
}
