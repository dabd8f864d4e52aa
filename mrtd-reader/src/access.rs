//! Establishing access to the LDS1 application: PACE, with fallback to BAC or plaintext access.


use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::bac;
use crate::iso7816::apdu::{Apdu, CommandHeader, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::file::{self, read_binary, read_file, ReadError, ReadOptions};
use crate::lds::FileId;
use crate::lds::card_access::decode_card_access;
use crate::mrz::BacSeed;
use crate::pace::{self, Mapping, PaceParameters};
use crate::secure_messaging::{SecureMessaging, SessionKeys};


/// Application identifier of the LDS1 eMRTD application.
pub const LDS1_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Security status not satisfied.
const SW_SECURITY_STATUS: ResponseTrailer = ResponseTrailer::new(0x69, 0x82);


/// How access to the chip was obtained.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum AccessMethod {
    Pace(PaceParameters),
    Bac,

    /// The chip granted access without authentication.
    Plaintext,
}
impl AccessMethod {
    pub fn is_secure_messaging(&self) -> bool {
        !matches!(self, Self::Plaintext)
    }
}
impl fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pace(params) => write!(f, "PACE ({:?} {:?}, {:?})", params.key_agreement, params.mapping, params.suite),
            Self::Bac => write!(f, "BAC"),
            Self::Plaintext => write!(f, "plaintext"),
        }
    }
}


#[derive(Debug)]
pub enum Error {
    /// Transport failure, cancellation or a failure of the established Secure Messaging session.
    Communication(CommunicationError),

    /// The chip refused the selection of the LDS1 application.
    SelectApplication { response: Response },

    Bac(bac::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication(e)
                => write!(f, "communication error: {}", e),
            Self::SelectApplication { response }
                => write!(f, "selecting the eMRTD application failed with response code 0x{:04X}", response.trailer.to_word()),
            Self::Bac(e)
                => write!(f, "BAC failed: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Communication(e) => Some(e),
            Self::SelectApplication { .. } => None,
            Self::Bac(e) => Some(e),
        }
    }
}
impl From<CommunicationError> for Error {
    fn from(value: CommunicationError) -> Self { Self::Communication(value) }
}
impl From<bac::Error> for Error {
    fn from(value: bac::Error) -> Self {
        match value {
            // losing the chip is not an authentication failure
            bac::Error::Communication(e) if is_fatal(&e) => Self::Communication(e),
            other => Self::Bac(other),
        }
    }
}


/// The card through which the application can now be read, and how access was obtained.
pub struct AccessOutcome {
    pub card: Box<dyn SmartCard>,
    pub method: AccessMethod,
}


/// Whether a communication error must end the scan instead of triggering a fallback.
fn is_fatal(error: &CommunicationError) -> bool {
    matches!(error, CommunicationError::Transport(_) | CommunicationError::Canceled)
}


/// Reads and decodes `EF.CardAccess` from the master file.
///
/// Absence or malformation of the file means PACE is unavailable; only fatal communication
/// errors are returned.
fn read_pace_parameters(card: &mut dyn SmartCard) -> Result<Vec<PaceParameters>, CommunicationError> {
    let card_access = match read_file(card, FileId::CardAccess.fid(), &ReadOptions::default()) {
        Ok(f) => f,
        Err(ReadError::ChipDisconnected(e)) => return Err(CommunicationError::Transport(e)),
        Err(ReadError::Communication(e)) if is_fatal(&e) => return Err(e),
        Err(e) => {
            debug!("EF.CardAccess not readable: {}", e);
            return Ok(Vec::new());
        },
    };
    match decode_card_access(card_access.as_bytes()) {
        Ok(params) => Ok(params),
        Err(e) => {
            warn!("EF.CardAccess is malformed: {}", e);
            Ok(Vec::new())
        },
    }
}


/// Selects the LDS1 application by its AID.
pub fn select_application(card: &mut dyn SmartCard) -> Result<(), Error> {
    let request = Apdu::new(
        CommandHeader::new(0x00, 0xA4, 0x04, 0x0C), // SELECT by DF name, no response data
        LDS1_AID.to_vec(),
        None,
    );
    let response = card.communicate(&request)?;
    if !response.is_success() {
        return Err(Error::SelectApplication { response });
    }
    Ok(())
}


/// Checks whether `EF.COM` can be read without authentication.
///
/// This is a compatibility heuristic for chips without access control, not a security decision.
fn probe_plaintext_access(card: &mut dyn SmartCard) -> Result<bool, CommunicationError> {
    match file::select_file(card, FileId::Com.fid()) {
        Ok(()) => {},
        Err(ReadError::ChipDisconnected(e)) => return Err(CommunicationError::Transport(e)),
        Err(ReadError::Communication(e)) => return Err(e),
        Err(e) => {
            debug!("EF.COM not selectable without authentication: {}", e);
            return Ok(false);
        },
    }
    let response = read_binary(card, 0, 1)?;
    if response.trailer == SW_SECURITY_STATUS {
        debug!("EF.COM requires authentication");
    }
    Ok(response.is_success() && !response.data.is_empty())
}


/// Attempts PACE with the first advertised parameter set.
///
/// Returns `Ok(None)` if PACE is unavailable or fails in a way that allows falling back to BAC.
fn try_pace(card: &mut dyn SmartCard, seed: &BacSeed) -> Result<Option<(PaceParameters, SessionKeys)>, CommunicationError> {
    let all_params = read_pace_parameters(card)?;
    let Some(params) = all_params.iter().find(|p| p.mapping == Mapping::Generic).or(all_params.first()) else {
        debug!("chip does not advertise PACE");
        return Ok(None);
    };

    match pace::establish(card, params, seed) {
        Ok(keys) => Ok(Some((params.clone(), keys))),
        Err(pace::Error::Communication(e)) if is_fatal(&e) => Err(e),
        Err(e) => {
            warn!("PACE failed, falling back: {}", e);
            Ok(None)
        },
    }
}


/// Establishes access to the LDS1 application.
///
/// PACE is attempted if `EF.CardAccess` advertises it; if it is not advertised or fails, the
/// application is selected and, unless `EF.COM` turns out to be readable without authentication,
/// BAC is performed. Failure of BAC is final.
#[instrument(skip_all)]
pub fn establish(mut card: Box<dyn SmartCard>, seed: &BacSeed) -> Result<AccessOutcome, Error> {
    if let Some((params, keys)) = try_pace(card.as_mut(), seed)? {
        let mut secure_card: Box<dyn SmartCard> = Box::new(SecureMessaging::new(card, keys));
        select_application(secure_card.as_mut())?;
        info!("access established using PACE");
        return Ok(AccessOutcome {
            card: secure_card,
            method: AccessMethod::Pace(params),
        });
    }

    select_application(card.as_mut())?;

    if probe_plaintext_access(card.as_mut())? {
        info!("chip grants plaintext access; skipping BAC");
        return Ok(AccessOutcome {
            card,
            method: AccessMethod::Plaintext,
        });
    }

    let keys = bac::establish(card.as_mut(), seed)?;
    info!("access established using BAC");
    Ok(AccessOutcome {
        card: Box::new(SecureMessaging::new(card, keys)),
        method: AccessMethod::Bac,
    })
}
