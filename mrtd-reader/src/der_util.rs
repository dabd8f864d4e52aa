//! Utility functions for Distinguished Encoding Rules.


/// Encode an ASN.1 DER primitive value length.
pub fn encode_primitive_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // single-byte encoding
        output.push(length as u8);
    } else {
        // 0b1nnn_nnnn and then n additional bytes that actually specify the length
        // (big-endian)
        let length_bytes = length.to_be_bytes();
        let leading_zeroes = length_bytes.iter()
            .take_while(|b| **b == 0x00)
            .count();
        let trimmed_length_slice = &length_bytes[leading_zeroes..];
        output.push(0b1000_0000 | (trimmed_length_slice.len() as u8));
        output.extend(trimmed_length_slice);
    }
}


/// Decode an ASN.1 DER primitive value length.
///
/// The length must be at the beginning of the input slice.
///
/// Returns a tuple `(length, rest)` where `rest` is the rest of the input slice once the length has
/// been removed.
pub fn try_decode_primitive_length(input: &[u8]) -> Option<(usize, &[u8])> {
    let (&start_byte, rest) = input.split_first()?;
    let start_lower_bits = start_byte & 0b0111_1111;
    if start_byte & 0b1000_0000 != 0 {
        // multiple bytes
        let length_byte_count: usize = start_lower_bits.into();
        if length_byte_count == 0 {
            // indefinite length is not DER
            return None;
        }
        if length_byte_count > rest.len() {
            // that will never fit
            return None;
        }
        let mut length: usize = 0;
        for length_byte in &rest[..length_byte_count] {
            length = length.checked_mul(256)?
                .checked_add(usize::from(*length_byte))?;
        }
        Some((length, &rest[length_byte_count..]))
    } else {
        Some((start_lower_bits.into(), rest))
    }
}


/// Appends a complete tag-length-value triple to the output.
///
/// The tag is taken verbatim; multi-byte tags are passed as their full encoding.
pub fn encode_tlv(output: &mut Vec<u8>, tag: &[u8], value: &[u8]) {
    output.extend(tag);
    encode_primitive_length(output, value.len());
    output.extend(value);
}


/// Encode an object identifier value into bytes using DER encoding rules.
///
/// No tag or length is encoded, only the actual value. Returns `None` if the arcs do not form a
/// valid object identifier.
pub fn oid_to_der_bytes(arcs: &[u32]) -> Option<Vec<u8>> {
    fn encode_arc(ret: &mut Vec<u8>, arc: u32) {
        // base-128, most significant group first, all but the last group with the top bit set
        let mut groups = [0u8; 5];
        let mut group_count = 0;
        let mut remaining = arc;
        loop {
            groups[group_count] = (remaining & 0b0111_1111) as u8;
            group_count += 1;
            remaining >>= 7;
            if remaining == 0 {
                break;
            }
        }
        for i in (0..group_count).rev() {
            let top_bit = if i > 0 { 0b1000_0000 } else { 0 };
            ret.push(groups[i] | top_bit);
        }
    }

    if arcs.len() < 2 || arcs[0] > 2 {
        return None;
    }
    if arcs[0] < 2 && arcs[1] > 39 {
        return None;
    }

    let mut ret = Vec::new();
    let first_arc_pair = (40*arcs[0]).checked_add(arcs[1])?;
    encode_arc(&mut ret, first_arc_pair);

    for arc in arcs.iter().skip(2) {
        encode_arc(&mut ret, *arc);
    }

    Some(ret)
}


/// Decode the value of a DER-encoded object identifier into its arcs.
pub fn der_bytes_to_oid(bytes: &[u8]) -> Option<Vec<u32>> {
    let mut values = Vec::new();
    let mut current: u32 = 0;
    let mut in_progress = false;
    for &b in bytes {
        current = current.checked_mul(128)?
            | u32::from(b & 0b0111_1111);
        in_progress = b & 0b1000_0000 != 0;
        if !in_progress {
            values.push(current);
            current = 0;
        }
    }
    if in_progress || values.is_empty() {
        return None;
    }

    let first_pair = values[0];
    let (first, second) = if first_pair < 40 {
        (0, first_pair)
    } else if first_pair < 80 {
        (1, first_pair - 40)
    } else {
        (2, first_pair - 80)
    };
    let mut arcs = Vec::with_capacity(values.len() + 1);
    arcs.push(first);
    arcs.push(second);
    arcs.extend(&values[1..]);
    Some(arcs)
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_lengths() {
        let mut buf = Vec::new();
        encode_primitive_length(&mut buf, 0x7F);
        encode_primitive_length(&mut buf, 0x80);
        encode_primitive_length(&mut buf, 0x1234);
        assert_eq!(buf, hex!("7F 81 80 82 12 34"));

        assert_eq!(try_decode_primitive_length(&hex!("7F AA")), Some((0x7F, &hex!("AA")[..])));
        assert_eq!(try_decode_primitive_length(&hex!("82 12 34")), Some((0x1234, &[][..])));
        assert_eq!(try_decode_primitive_length(&hex!("82 12")), None);
        assert_eq!(try_decode_primitive_length(&hex!("80")), None);
        assert_eq!(try_decode_primitive_length(&[]), None);
    }

    #[test]
    fn test_oid() {
        // id-PACE-ECDH-GM-AES-CBC-CMAC-128
        let arcs = [0, 4, 0, 127, 0, 7, 2, 2, 4, 2, 2];
        let bytes = oid_to_der_bytes(&arcs).unwrap();
        assert_eq!(bytes, hex!("04 00 7F 00 07 02 02 04 02 02"));
        assert_eq!(der_bytes_to_oid(&bytes).unwrap(), arcs);

        assert_eq!(oid_to_der_bytes(&[2, 999, 3]).unwrap(), hex!("88 37 03"));
        assert_eq!(der_bytes_to_oid(&hex!("88 37 03")).unwrap(), [2, 999, 3]);

        assert_eq!(oid_to_der_bytes(&[1]), None);
        assert_eq!(oid_to_der_bytes(&[1, 40]), None);
        assert_eq!(der_bytes_to_oid(&hex!("04 80")), None);
    }

    #[test]
    fn test_tlv() {
        let mut buf = Vec::new();
        encode_tlv(&mut buf, &[0x7F, 0x49], &hex!("06 01 00"));
        assert_eq!(buf, hex!("7F49 03 060100"));
    }
}
