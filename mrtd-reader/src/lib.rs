//! Reading of ICAO 9303 electronic machine-readable travel documents.
//!
//! The [`scan`] module drives a whole read: it establishes access to the chip through PACE or BAC
//! ([`access`]), reads the data groups through Secure Messaging ([`secure_messaging`],
//! [`iso7816::file`]) and decodes them ([`lds`], [`mrz`]).


pub mod access;
pub mod bac;
pub mod crypt;
pub mod der_util;
pub mod iso7816;
pub mod lds;
pub mod mrz;
pub mod pace;
pub mod scan;
pub mod secure_messaging;


use std::fmt::Write;


/// Formats a buffer as a classic hex dump with offsets and an ASCII column.
pub fn hexdump(buf: &[u8]) -> String {
    let mut ret = String::with_capacity(buf.len() / 16 * 78 + 78);
    for (line_index, line) in buf.chunks(16).enumerate() {
        let _ = write!(ret, "{:08X}  ", line_index * 16);

        for i in 0..16 {
            match line.get(i) {
                Some(b) => { let _ = write!(ret, " {:02X}", b); },
                None => ret.push_str("   "),
            }
        }

        ret.push_str(" |");
        for &b in line {
            if b >= b' ' && b <= b'~' {
                ret.push(char::from(b));
            } else {
                ret.push('.');
            }
        }
        ret.push_str("|\n");
    }
    ret
}
