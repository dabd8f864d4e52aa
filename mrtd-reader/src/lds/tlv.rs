//! Borrowing reader for BER-TLV encoded data.


use crate::der_util::try_decode_primitive_length;
use crate::lds::Error;


/// A tag, with all of its bytes packed big-endian (e.g. `0x5F1F`).
pub type Tag = u32;


/// One tag-length-value triple, borrowed from the input.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Tlv<'a> {
    pub tag: Tag,

    /// The value, without tag and length.
    pub value: &'a [u8],

    /// The complete encoding, including tag and length.
    pub raw: &'a [u8],
}
impl<'a> Tlv<'a> {
    /// Whether the constructed bit is set in the first tag byte.
    pub fn is_constructed(&self) -> bool {
        self.raw.first().map(|b| b & 0x20 != 0).unwrap_or(false)
    }

    /// Iterates over the data objects contained in the value.
    pub fn children(&self) -> TlvReader<'a> {
        TlvReader::new(self.value)
    }
}


fn read_tag(input: &[u8]) -> Result<(Tag, &[u8]), Error> {
    let (&first, mut rest) = input.split_first()
        .ok_or(Error::Truncated { tag: None })?;
    let mut tag = Tag::from(first);
    if first & 0x1F == 0x1F {
        loop {
            let (&next, next_rest) = rest.split_first()
                .ok_or(Error::Truncated { tag: None })?;
            if tag > 0x00FF_FFFF {
                return Err(Error::InvalidTag);
            }
            tag = (tag << 8) | Tag::from(next);
            rest = next_rest;
            if next & 0x80 == 0 {
                break;
            }
        }
    }
    Ok((tag, rest))
}


/// Reads one data object from the start of the input, returning it and the bytes following it.
///
/// Fails instead of reading past the end of the input.
pub fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8]), Error> {
    let (tag, after_tag) = read_tag(input)?;
    let (length, after_length) = try_decode_primitive_length(after_tag)
        .ok_or(Error::InvalidLength { tag })?;
    if length > after_length.len() {
        return Err(Error::Truncated { tag: Some(tag) });
    }
    let header_length = input.len() - after_length.len();
    let tlv = Tlv {
        tag,
        value: &after_length[..length],
        raw: &input[..header_length + length],
    };
    Ok((tlv, &after_length[length..]))
}


/// Reads a data object that must carry the given tag. Trailing bytes are ignored.
pub fn expect_tlv(input: &[u8], tag: Tag) -> Result<Tlv<'_>, Error> {
    let (tlv, _rest) = read_tlv(input)?;
    if tlv.tag != tag {
        return Err(Error::UnexpectedTag { expected: tag, obtained: tlv.tag });
    }
    Ok(tlv)
}


/// Returns the value of the first data object with the given tag in a sequence of data objects.
pub fn find_value(input: &[u8], tag: Tag) -> Result<&[u8], Error> {
    for tlv in TlvReader::new(input) {
        let tlv = tlv?;
        if tlv.tag == tag {
            return Ok(tlv.value);
        }
    }
    Err(Error::MissingDataObject { tag })
}


/// Iterates over consecutive data objects.
///
/// Stops after the first error.
#[derive(Clone, Debug)]
pub struct TlvReader<'a> {
    rest: &'a [u8],
}
impl<'a> TlvReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { rest: input }
    }
}
impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<Tlv<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match read_tlv(self.rest) {
            Ok((tlv, rest)) => {
                self.rest = rest;
                Some(Ok(tlv))
            },
            Err(e) => {
                self.rest = &[];
                Some(Err(e))
            },
        }
    }
}
