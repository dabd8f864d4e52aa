//! ASN.1 structures relevant to PACE.


use rasn::{AsnType, Decode, Decoder, Encode};
use rasn::types::ObjectIdentifier;


/// An item of PACE-related security information in the `EF.CardAccess` file on the travel document
/// chip.
///
/// The content of `EF.CardAccess` is a SET OF SecurityInfo structures. Each starts with an OID
/// specifying the protocol, but items for other protocols need not adhere to this structure, so
/// decoding an entry as `PaceInfo` may fail and the OID still has to be checked afterwards.
///
/// Specified in ICAO Doc 9303 Part 11 § 9.2.1.
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
pub struct PaceInfo {
    pub protocol: ObjectIdentifier,
    pub version: u32,
    pub parameter_id: Option<u32>,
}
impl PaceInfo {
    pub fn new(
        protocol: ObjectIdentifier,
        version: u32,
        parameter_id: Option<u32>,
    ) -> Self {
        Self {
            protocol,
            version,
            parameter_id,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::PaceInfo;
    use hex_literal::hex;

    #[test]
    fn test_decode_pace_info() {
        let encoded = hex!("30 12 06 0A 04 00 7F 00 07 02 02 04 02 02 02 01 02 02 01 0D");
        let info: PaceInfo = rasn::ber::decode(&encoded).unwrap();
        assert_eq!(&info.protocol[..], &[0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 2]);
        assert_eq!(info.version, 2);
        assert_eq!(info.parameter_id, Some(13));

        let without_parameter_id = hex!("30 0F 06 0A 04 00 7F 00 07 02 02 04 02 02 02 01 02");
        let info: PaceInfo = rasn::ber::decode(&without_parameter_id).unwrap();
        assert_eq!(info.parameter_id, None);
    }
}
