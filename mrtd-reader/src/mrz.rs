//! Machine-readable zones and the BAC seed derived from them.
//!
//! Three form factors are defined: TD1 (credit-card size), TD2 (old German ID card size, ISO 216
//! size A7) and TD3 (passport, ISO 216 size B7).
//!
//! The TD1 encoding is:
//! ```plain
//! TTSSSNNNNNNNNNCOOOOOOOOOOOOOOO
//! BBBBBBDXEEEEEEFAAAPPPPPPPPPPPG
//! IIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! ```
//! with
//! * `TT`: type of document (right-padded with `<`)
//! * `SSS`: issuing state or organization (right-padded with `<`)
//! * `NNNNNNNNN`: first 9 characters of document number (right-padded with `<`)
//! * `C`: check digit of document number, or `<` if document number is longer than 9 characters
//! * `OOOOOOOOOOOOOOO`: optional data (right-padded with `<`); if document number is longer than 9
//!   characters, begins with remaining characters of document number followed by check digit
//!   followed by `<`
//! * `BBBBBB`: date of birth as YYMMDD
//! * `D`: check digit of date of birth
//! * `X`: sex (`F`, `M`, or `<` for unspecified)
//! * `EEEEEE`: date of expiry as YYMMDD
//! * `F`: check digit of date of expiry
//! * `AAA`: nationality
//! * `PPPPPPPPPPP`: optional data (right-padded with `<`)
//! * `G`: composite check digit of `NNNNNNNNNCOOOOOOOOOOOOOOOBBBBBBDEEEEEEFPPPPPPPPPPP`
//! * `IIIIIIIIIIIIIIIIIIIIIIIIIIIIII`: name (possibly truncated):
//!   1. primary identifier (components separated by `<`)
//!   2. if there is a secondary identifier: `<<`
//!   3. secondary identifier (components separated by `<`)
//!   4. padding with `<`
//!
//! The TD2 encoding is:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOG
//! ```
//! The fields are as with TD1, except the composite check digit `G` is calculated from
//! `NNNNNNNNNCBBBBBBDEEEEEEFOOOOOOO`.
//!
//! The TD3 encoding is:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOOOOOOOOQG
//! ```
//! The fields are as with TD1, except:
//! * `NNNNNNNNN` (passport number) cannot be longer than 9 characters
//! * `Q` is a check digit of `OOOOOOOOOOOOOO`
//! * `G` (composite check digit) is calculated from
//!   `NNNNNNNNNCBBBBBBDEEEEEEFOOOOOOOOOOOOOOQ`


use std::fmt;
use std::ops::Range;

use smallstr::SmallString;


const TD1_LENGTH: usize = 3 * 30;
const TD2_LENGTH: usize = 2 * 36;
const TD3_LENGTH: usize = 2 * 44;


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    InvalidLength { obtained: usize },
    InvalidCharacter { position: usize, character: char },
    DocumentNumberLength { obtained: usize },
    InvalidDate { field: &'static str },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength { obtained }
                => write!(f, "MRZ has {} characters; expected {}, {} or {}", obtained, TD1_LENGTH, TD2_LENGTH, TD3_LENGTH),
            Self::InvalidCharacter { position, character }
                => write!(f, "invalid MRZ character {:?} at position {}", character, position),
            Self::DocumentNumberLength { obtained }
                => write!(f, "document number has invalid length {}", obtained),
            Self::InvalidDate { field }
                => write!(f, "{} is not a YYMMDD date", field),
        }
    }
}
impl std::error::Error for Error {
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Variant {
    Td1,
    Td2,
    Td3,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Gender {
    Female,
    Male,
    Unspecified,
}
impl Gender {
    fn from_mrz(b: u8) -> Self {
        match b {
            b'F' => Self::Female,
            b'M' => Self::Male,
            _ => Self::Unspecified,
        }
    }
}
impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Female => write!(f, "F"),
            Self::Male => write!(f, "M"),
            Self::Unspecified => write!(f, "X"),
        }
    }
}


/// Computes the check digit of an MRZ field.
///
/// Digits count with their value, letters `A` to `Z` as 10 to 35 and the filler `<` as 0; the
/// weights 7, 3, 1 repeat over the field.
pub fn check_digit(data: &[u8]) -> u8 {
    const WEIGHTS: [u32; 3] = [7, 3, 1];

    let sum: u32 = data.iter()
        .zip(WEIGHTS.iter().cycle())
        .map(|(&b, &weight)| {
            let value = match b {
                b'0'..=b'9' => u32::from(b - b'0'),
                b'A'..=b'Z' => u32::from(b - b'A') + 10,
                _ => 0,
            };
            value * weight
        })
        .sum();
    (sum % 10) as u8
}

fn check_digit_matches(data: &[u8], recorded: u8) -> bool {
    let recorded_value = match recorded {
        b'0'..=b'9' => recorded - b'0',
        b'<' => 0,
        _ => return false,
    };
    check_digit(data) == recorded_value
}

fn is_mrz_character(b: u8) -> bool {
    b.is_ascii_digit() || b.is_ascii_uppercase() || b == b'<'
}

/// `YYMMDD`; an unknown month or day is recorded as `00`, so only the digits are checked.
fn is_date(value: &str) -> bool {
    value.len() == 6 && value.bytes().all(|b| b.is_ascii_digit())
}

fn strip_filler(field: &[u8]) -> &str {
    let end = field.iter().rposition(|b| *b != b'<').map(|i| i + 1).unwrap_or(0);
    // fields are validated to be ASCII before slicing
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

fn filler_to_space(field: &str) -> String {
    field.split('<')
        .filter(|component| !component.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}


/// The three MRZ fields from which the BAC keys (and the PACE MRZ password) are derived.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BacSeed {
    document_number: SmallString<[u8; 22]>,
    date_of_birth: SmallString<[u8; 6]>,
    date_of_expiry: SmallString<[u8; 6]>,
}
impl BacSeed {
    /// Creates a seed from its parts.
    ///
    /// The document number is upper-cased, spaces become `<` and numbers shorter than 9 characters
    /// are padded with `<`. Dates are `YYMMDD`.
    pub fn new(document_number: &str, date_of_birth: &str, date_of_expiry: &str) -> Result<Self, Error> {
        let mut normalized_number: SmallString<[u8; 22]> = SmallString::new();
        for (position, c) in document_number.trim().chars().enumerate() {
            let c = if c == ' ' { '<' } else { c.to_ascii_uppercase() };
            if !c.is_ascii() || !is_mrz_character(c as u8) {
                return Err(Error::InvalidCharacter { position, character: c });
            }
            normalized_number.push(c);
        }
        let trimmed_length = normalized_number.trim_end_matches('<').len();
        if trimmed_length == 0 || normalized_number.len() > 22 {
            return Err(Error::DocumentNumberLength { obtained: normalized_number.len() });
        }
        while normalized_number.len() < 9 {
            normalized_number.push('<');
        }

        if !is_date(date_of_birth) {
            return Err(Error::InvalidDate { field: "date of birth" });
        }
        if !is_date(date_of_expiry) {
            return Err(Error::InvalidDate { field: "date of expiry" });
        }

        Ok(Self {
            document_number: normalized_number,
            date_of_birth: SmallString::from_str(date_of_birth),
            date_of_expiry: SmallString::from_str(date_of_expiry),
        })
    }

    /// Extracts the seed from the text of a complete MRZ.
    pub fn from_mrz(text: &str) -> Result<Self, Error> {
        let record = MrzRecord::parse(text)?;
        Self::from_record(&record)
    }

    pub fn from_record(record: &MrzRecord) -> Result<Self, Error> {
        Self::new(&record.document_number, &record.date_of_birth, &record.date_of_expiry)
    }

    pub fn document_number(&self) -> &str { &self.document_number }
    pub fn date_of_birth(&self) -> &str { &self.date_of_birth }
    pub fn date_of_expiry(&self) -> &str { &self.date_of_expiry }

    /// The MRZ key: document number, date of birth and date of expiry, each followed by its check
    /// digit.
    pub fn mrz_key(&self) -> String {
        let mut ret = String::with_capacity(22 + 1 + 6 + 1 + 6 + 1);
        for field in [self.document_number.as_str(), self.date_of_birth.as_str(), self.date_of_expiry.as_str()] {
            ret.push_str(field);
            ret.push(char::from(b'0' + check_digit(field.as_bytes())));
        }
        ret
    }
}


/// A field protected by an MRZ check digit.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CheckedField {
    DocumentNumber,
    DateOfBirth,
    DateOfExpiry,
    OptionalData,
    Composite,
}

/// The check digits as recorded in the MRZ, as ASCII characters.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RawCheckDigits {
    pub document_number: u8,
    pub date_of_birth: u8,
    pub date_of_expiry: u8,
    /// Only TD3 protects its optional data with a separate check digit.
    pub optional_data: Option<u8>,
    pub composite: u8,
}

/// The fields whose check digits did not match.
///
/// A mismatch does not prevent decoding.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CheckDigitReport {
    pub mismatches: Vec<CheckedField>,
}
impl CheckDigitReport {
    pub fn is_valid(&self) -> bool {
        self.mismatches.is_empty()
    }
}


/// The decoded contents of a machine-readable zone.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MrzRecord {
    pub variant: Variant,

    /// Document code, e.g. `P` for passports.
    pub document_code: SmallString<[u8; 2]>,

    /// Issuing state or organization.
    pub issuing_state: SmallString<[u8; 3]>,

    /// Primary identifier (surname); components separated by spaces.
    pub primary_identifier: String,

    /// Secondary identifier (given names); components separated by spaces.
    pub secondary_identifier: String,

    /// Can be alphanumeric. Without filler characters.
    pub document_number: SmallString<[u8; 22]>,

    pub nationality: SmallString<[u8; 3]>,
    pub date_of_birth: SmallString<[u8; 6]>,
    pub gender: Gender,
    pub date_of_expiry: SmallString<[u8; 6]>,

    /// Optional data; for TD1, both optional data fields concatenated.
    pub optional_data: String,

    pub check_digits: RawCheckDigits,
    pub check_digit_report: CheckDigitReport,
}
impl MrzRecord {
    /// Parses the text of an MRZ, ignoring line breaks and other whitespace.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let compact: Vec<u8> = text.bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        Self::from_bytes(&compact)
    }

    /// Parses an MRZ stored without line separators, as it is in DG1.
    pub fn from_bytes(mrz: &[u8]) -> Result<Self, Error> {
        if let Some((position, &b)) = mrz.iter().enumerate().find(|(_, b)| !is_mrz_character(**b)) {
            return Err(Error::InvalidCharacter { position, character: char::from(b) });
        }

        match mrz.len() {
            TD1_LENGTH => Ok(Self::parse_td1(mrz)),
            TD2_LENGTH => Ok(Self::parse_td2_td3(mrz, Variant::Td2)),
            TD3_LENGTH => Ok(Self::parse_td2_td3(mrz, Variant::Td3)),
            other => Err(Error::InvalidLength { obtained: other }),
        }
    }

    fn split_name(name_field: &[u8]) -> (String, String) {
        let name = strip_filler(name_field);
        match name.split_once("<<") {
            Some((primary, secondary)) => (filler_to_space(primary), filler_to_space(secondary)),
            None => (filler_to_space(name), String::new()),
        }
    }

    fn verify(
        mrz: &[u8],
        document_number: &[u8],
        check_digits: &RawCheckDigits,
        dates: (Range<usize>, Range<usize>),
        optional_data: Option<Range<usize>>,
        composite: &[Range<usize>],
    ) -> CheckDigitReport {
        let mut report = CheckDigitReport::default();
        if !check_digit_matches(document_number, check_digits.document_number) {
            report.mismatches.push(CheckedField::DocumentNumber);
        }
        if !check_digit_matches(&mrz[dates.0], check_digits.date_of_birth) {
            report.mismatches.push(CheckedField::DateOfBirth);
        }
        if !check_digit_matches(&mrz[dates.1], check_digits.date_of_expiry) {
            report.mismatches.push(CheckedField::DateOfExpiry);
        }
        if let (Some(range), Some(digit)) = (optional_data, check_digits.optional_data) {
            // an empty optional data field may carry a filler instead of a check digit
            let all_filler = mrz[range.clone()].iter().all(|b| *b == b'<');
            if !(all_filler && digit == b'<') && !check_digit_matches(&mrz[range], digit) {
                report.mismatches.push(CheckedField::OptionalData);
            }
        }
        let composite_data: Vec<u8> = composite.iter()
            .flat_map(|range| mrz[range.clone()].iter().copied())
            .collect();
        if !check_digit_matches(&composite_data, check_digits.composite) {
            report.mismatches.push(CheckedField::Composite);
        }
        report
    }

    fn parse_td1(mrz: &[u8]) -> Self {
        let mut document_number_field = mrz[5..14].to_vec();
        let mut document_number_check = mrz[14];
        let mut optional_data_1 = &mrz[15..30];
        if document_number_check == b'<' {
            // long document number continues in the optional data, followed by its check digit
            let continuation_length = optional_data_1.iter()
                .position(|b| *b == b'<')
                .unwrap_or(optional_data_1.len());
            if continuation_length > 0 {
                document_number_field.extend(&optional_data_1[..continuation_length-1]);
                document_number_check = optional_data_1[continuation_length-1];
                optional_data_1 = &optional_data_1[continuation_length..];
            }
        }

        let check_digits = RawCheckDigits {
            document_number: document_number_check,
            date_of_birth: mrz[36],
            date_of_expiry: mrz[44],
            optional_data: None,
            composite: mrz[59],
        };
        let check_digit_report = Self::verify(
            mrz,
            &document_number_field,
            &check_digits,
            (30..36, 38..44),
            None,
            &[5..30, 30..37, 38..45, 48..59],
        );
        let (primary_identifier, secondary_identifier) = Self::split_name(&mrz[60..90]);

        let mut optional_data = String::from(strip_filler(optional_data_1));
        let optional_data_2 = strip_filler(&mrz[48..59]);
        if !optional_data_2.is_empty() {
            if !optional_data.is_empty() {
                optional_data.push('<');
            }
            optional_data.push_str(optional_data_2);
        }

        Self {
            variant: Variant::Td1,
            document_code: SmallString::from_str(strip_filler(&mrz[0..2])),
            issuing_state: SmallString::from_str(strip_filler(&mrz[2..5])),
            primary_identifier,
            secondary_identifier,
            document_number: SmallString::from_str(strip_filler(&document_number_field)),
            nationality: SmallString::from_str(strip_filler(&mrz[45..48])),
            date_of_birth: SmallString::from_str(strip_filler(&mrz[30..36])),
            gender: Gender::from_mrz(mrz[37]),
            date_of_expiry: SmallString::from_str(strip_filler(&mrz[38..44])),
            optional_data,
            check_digits,
            check_digit_report,
        }
    }

    fn parse_td2_td3(mrz: &[u8], variant: Variant) -> Self {
        let line_length = mrz.len() / 2;
        let (first_line, second_line) = mrz.split_at(line_length);
        let l = line_length;

        // second line offsets are identical up to the optional data
        let (optional_data_range, optional_check, composite) = match variant {
            Variant::Td3 => (l+28..l+42, Some(second_line[42]), second_line[43]),
            _ => (l+28..l+35, None, second_line[35]),
        };
        let check_digits = RawCheckDigits {
            document_number: second_line[9],
            date_of_birth: second_line[19],
            date_of_expiry: second_line[27],
            optional_data: optional_check,
            composite,
        };
        let composite_end = match variant {
            Variant::Td3 => l+43,
            _ => l+35,
        };
        let check_digit_report = Self::verify(
            mrz,
            &second_line[0..9],
            &check_digits,
            (l+13..l+19, l+21..l+27),
            optional_check.map(|_| optional_data_range.clone()),
            &[l..l+10, l+13..l+20, l+21..composite_end],
        );
        let (primary_identifier, secondary_identifier) = Self::split_name(&first_line[5..]);

        Self {
            variant,
            document_code: SmallString::from_str(strip_filler(&first_line[0..2])),
            issuing_state: SmallString::from_str(strip_filler(&first_line[2..5])),
            primary_identifier,
            secondary_identifier,
            document_number: SmallString::from_str(strip_filler(&second_line[0..9])),
            nationality: SmallString::from_str(strip_filler(&second_line[10..13])),
            date_of_birth: SmallString::from_str(strip_filler(&second_line[13..19])),
            gender: Gender::from_mrz(second_line[20]),
            date_of_expiry: SmallString::from_str(strip_filler(&second_line[21..27])),
            optional_data: String::from(strip_filler(&mrz[optional_data_range])),
            check_digits,
            check_digit_report,
        }
    }
}
