//! Object identifiers relevant to PACE.
//!
//! All PACE protocols live under `id-PACE` (`0.4.0.127.0.7.2.2.4`), followed by one arc for the
//! key agreement and mapping and one arc for the cipher suite.


/// `id-PACE`
pub const PACE_OID_PREFIX: [u32; 9] = [0, 4, 0, 127, 0, 7, 2, 2, 4];

pub const MAPPING_DH_GM: u32 = 1;
pub const MAPPING_ECDH_GM: u32 = 2;
pub const MAPPING_DH_IM: u32 = 3;
pub const MAPPING_ECDH_IM: u32 = 4;
// 5 is unused (theoretically DH-CAM)
pub const MAPPING_ECDH_CAM: u32 = 6;

pub const CIPHER_3DES_CBC_CBC: u32 = 1;
pub const CIPHER_AES_CBC_CMAC_128: u32 = 2;
pub const CIPHER_AES_CBC_CMAC_192: u32 = 3;
pub const CIPHER_AES_CBC_CMAC_256: u32 = 4;


/// Assembles the arcs of a PACE protocol OID.
pub fn protocol_arcs(mapping_arc: u32, cipher_arc: u32) -> Vec<u32> {
    let mut arcs = PACE_OID_PREFIX.to_vec();
    arcs.push(mapping_arc);
    arcs.push(cipher_arc);
    arcs
}

/// Splits a PACE protocol OID into its mapping and cipher arcs.
///
/// Returns `None` if the OID is not a complete PACE protocol OID.
pub fn split_protocol(arcs: &[u32]) -> Option<(u32, u32)> {
    match arcs.strip_prefix(&PACE_OID_PREFIX[..])? {
        [mapping_arc, cipher_arc] => Some((*mapping_arc, *cipher_arc)),
        _ => None,
    }
}
