//! Reading a travel document from start to finish.
//!
//! A [`Scanner`] admits at most one scan at a time and runs it on a worker thread. The scan opens
//! the channel, establishes access, reads `EF.DG1` and `EF.DG2` and picks the first face image as
//! the portrait, reporting [`ScanProgress`] milestones along the way.


use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, instrument, warn};

use crate::access::{self, AccessMethod};
use crate::bac;
use crate::iso7816::apdu::{CodecError, Response};
use crate::iso7816::card::{Availability, CancelToken, ChannelCard, CommunicationError, SmartCard, Transport, TransportError};
use crate::iso7816::file::{read_file, ReadError, ReadOptions};
use crate::lds::{self, FileId};
use crate::lds::dg1::decode_dg1;
use crate::lds::dg2::{decode_dg2, ImageFormat};
use crate::mrz::{BacSeed, MrzRecord};
use crate::secure_messaging;


/// Milestones of a scan, reported in this order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ScanProgress {
    /// The chip is being accessed.
    Access,

    /// The personal data and face image have been read.
    PersonalInfo,

    /// The portrait has been extracted.
    Photo,

    /// The result has been assembled.
    Verification,
}


/// Failures that are neither authentication nor transport problems.
#[derive(Debug)]
pub enum ProtocolFailure {
    Codec(CodecError),
    SelectApplication { response: Response },
    File(ReadError),
    WorkerPanicked,
}
impl fmt::Display for ProtocolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e)
                => write!(f, "{}", e),
            Self::SelectApplication { response }
                => write!(f, "selecting the eMRTD application failed with response code 0x{:04X}", response.trailer.to_word()),
            Self::File(e)
                => write!(f, "{}", e),
            Self::WorkerPanicked
                => write!(f, "scan worker panicked"),
        }
    }
}


#[derive(Debug)]
pub enum ScanError {
    /// No contactless reader exists.
    UnsupportedHardware,

    /// The contactless reader is switched off.
    Disabled,

    /// Another scan is in flight.
    ConcurrentScanRejected,

    Canceled,

    /// PACE was unavailable or failed, and BAC failed too.
    AuthenticationFailed(bac::Error),

    /// A protected response failed verification after access was established.
    SecureMessagingIntegrityError(secure_messaging::Error),

    /// The chip was lost mid-protocol.
    ChipDisconnected(TransportError),

    MalformedLds { file: FileId, error: lds::Error },

    ShortRead { file: FileId, declared: usize, obtained: usize },

    Protocol(ProtocolFailure),
}
impl ScanError {
    /// Whether the user should present the document again.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ChipDisconnected(_))
    }

    fn from_read(file: FileId, error: ReadError) -> Self {
        match error {
            ReadError::ChipDisconnected(e) => Self::ChipDisconnected(e),
            ReadError::Communication(e) => e.into(),
            ReadError::ShortRead { declared, obtained, .. } => Self::ShortRead { file, declared, obtained },
            ReadError::MalformedHeader { .. } => Self::MalformedLds { file, error: lds::Error::InvalidFileHeader },
            other => Self::Protocol(ProtocolFailure::File(other)),
        }
    }
}
impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedHardware
                => write!(f, "this device has no contactless reader"),
            Self::Disabled
                => write!(f, "the contactless reader is disabled"),
            Self::ConcurrentScanRejected
                => write!(f, "another scan is already in progress"),
            Self::Canceled
                => write!(f, "scan canceled"),
            Self::AuthenticationFailed(e)
                => write!(f, "authentication with the chip failed: {}", e),
            Self::SecureMessagingIntegrityError(e)
                => write!(f, "secure messaging failed: {}", e),
            Self::ChipDisconnected(_)
                => write!(f, "lost connection to the chip"),
            Self::MalformedLds { file, error }
                => write!(f, "{} is malformed: {}", file, error),
            Self::ShortRead { file, declared, obtained }
                => write!(f, "{} declares {} bytes but only {} were delivered", file, declared, obtained),
            Self::Protocol(e)
                => write!(f, "protocol error: {}", e),
        }
    }
}
impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AuthenticationFailed(e) => Some(e),
            Self::SecureMessagingIntegrityError(e) => Some(e),
            Self::ChipDisconnected(e) => Some(e),
            Self::MalformedLds { error, .. } => Some(error),
            Self::Protocol(ProtocolFailure::Codec(e)) => Some(e),
            Self::Protocol(ProtocolFailure::File(e)) => Some(e),
            _ => None,
        }
    }
}
impl From<CommunicationError> for ScanError {
    fn from(value: CommunicationError) -> Self {
        match value {
            CommunicationError::Codec(e) => Self::Protocol(ProtocolFailure::Codec(e)),
            CommunicationError::Transport(e) => Self::ChipDisconnected(e),
            CommunicationError::SecureMessaging(e) => Self::SecureMessagingIntegrityError(e),
            CommunicationError::Canceled => Self::Canceled,
        }
    }
}
impl From<access::Error> for ScanError {
    fn from(value: access::Error) -> Self {
        match value {
            access::Error::Communication(e) => e.into(),
            access::Error::SelectApplication { response } => Self::Protocol(ProtocolFailure::SelectApplication { response }),
            access::Error::Bac(e) => Self::AuthenticationFailed(e),
        }
    }
}


/// Options of a scan.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanOptions {
    /// Quality from 0.0 to 1.0 with which the caller should re-encode the portrait.
    ///
    /// The portrait is always returned as stored on the chip.
    pub image_quality: f32,

    pub read: ReadOptions,
}
impl ScanOptions {
    /// Creates options with the given image quality, clamped to `0.0..=1.0`.
    pub fn new(image_quality: f32) -> Self {
        Self {
            image_quality: clamp_quality(image_quality),
            read: ReadOptions::default(),
        }
    }
}
impl Default for ScanOptions {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn clamp_quality(quality: f32) -> f32 {
    if quality.is_nan() {
        1.0
    } else {
        quality.clamp(0.0, 1.0)
    }
}


/// The face image chosen as the document holder's portrait, still encoded.
#[derive(Clone, PartialEq)]
pub struct Portrait {
    pub format: ImageFormat,
    pub width: u16,
    pub height: u16,
    pub encoded: Vec<u8>,
    pub quality: f32,
}
impl fmt::Debug for Portrait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portrait")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("encoded", &format_args!("[{} bytes]", self.encoded.len()))
            .field("quality", &self.quality)
            .finish()
    }
}


#[derive(Clone, Debug, PartialEq)]
pub struct ScanResult {
    pub mrz: MrzRecord,
    pub portrait: Portrait,
    pub access: AccessMethod,
}


/// Everything a single scan owns.
pub struct ScanSession {
    pub seed: BacSeed,
    pub options: ScanOptions,
    pub cancel: CancelToken,
    progress: Sender<ScanProgress>,
}
impl ScanSession {
    pub fn new(seed: BacSeed, options: ScanOptions, cancel: CancelToken, progress: Sender<ScanProgress>) -> Self {
        Self {
            seed,
            options,
            cancel,
            progress,
        }
    }

    fn emit(&self, milestone: ScanProgress) {
        debug!(?milestone, "scan progress");
        // nobody listening is fine
        let _ = self.progress.send(milestone);
    }
}


fn read_data_group(card: &mut dyn SmartCard, file: FileId, options: &ReadOptions) -> Result<Vec<u8>, ScanError> {
    read_file(card, file.fid(), options)
        .map(|f| f.into_bytes())
        .map_err(|e| ScanError::from_read(file, e))
}


/// Runs one scan on the calling thread.
///
/// The channel is opened here and closed when the scan ends, however it ends.
#[instrument(skip_all)]
pub fn run_scan(transport: &mut dyn Transport, session: &ScanSession) -> Result<ScanResult, ScanError> {
    session.emit(ScanProgress::Access);
    session.cancel.check()?;

    let channel = transport.open()
        .map_err(ScanError::ChipDisconnected)?;
    let card: Box<dyn SmartCard> = Box::new(ChannelCard::new(channel, session.cancel.clone()));

    let access::AccessOutcome { mut card, method } = access::establish(card, &session.seed)?;
    session.cancel.check()?;

    let dg1 = read_data_group(card.as_mut(), FileId::Dg1, &session.options.read)?;
    let mrz = decode_dg1(&dg1)
        .map_err(|error| ScanError::MalformedLds { file: FileId::Dg1, error })?;
    if !mrz.check_digit_report.is_valid() {
        warn!(mismatches = ?mrz.check_digit_report.mismatches, "MRZ check digits do not match");
    }

    let dg2 = read_data_group(card.as_mut(), FileId::Dg2, &session.options.read)?;
    let face_images = decode_dg2(&dg2)
        .map_err(|error| ScanError::MalformedLds { file: FileId::Dg2, error })?;
    drop(card);
    session.emit(ScanProgress::PersonalInfo);

    let first_image = face_images.into_iter().next()
        .ok_or(ScanError::MalformedLds {
            file: FileId::Dg2,
            error: lds::Error::MissingDataObject { tag: 0x5F2E },
        })?;
    let portrait = Portrait {
        format: first_image.format,
        width: first_image.width,
        height: first_image.height,
        encoded: first_image.encoded,
        quality: session.options.image_quality,
    };
    session.emit(ScanProgress::Photo);

    let result = ScanResult {
        mrz,
        portrait,
        access: method,
    };
    session.emit(ScanProgress::Verification);
    info!(access = %result.access, "scan complete");
    Ok(result)
}


/// Releases the in-flight slot when the worker finishes, even by panicking.
struct InFlightGuard {
    in_flight: Arc<AtomicBool>,
    active_cancel: Arc<Mutex<Option<CancelToken>>>,
}
impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut active = self.active_cancel.lock().unwrap_or_else(PoisonError::into_inner);
        *active = None;
        self.in_flight.store(false, Ordering::SeqCst);
    }
}


/// A scan running on its worker thread.
pub struct ScanHandle {
    progress: Receiver<ScanProgress>,
    cancel: CancelToken,
    worker: JoinHandle<Result<ScanResult, ScanError>>,
}
impl ScanHandle {
    /// The milestones reached so far; the channel closes when the scan ends.
    pub fn progress(&self) -> &Receiver<ScanProgress> {
        &self.progress
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the scan to end.
    pub fn wait(self) -> Result<ScanResult, ScanError> {
        self.worker.join()
            .unwrap_or(Err(ScanError::Protocol(ProtocolFailure::WorkerPanicked)))
    }
}


/// Admits scans one at a time.
#[derive(Clone, Debug, Default)]
pub struct Scanner {
    in_flight: Arc<AtomicBool>,
    active_cancel: Arc<Mutex<Option<CancelToken>>>,
}
impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scanning(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Starts a scan on a worker thread.
    ///
    /// Fails immediately if the reader is unavailable or another scan is in flight.
    pub fn start(&self, mut transport: Box<dyn Transport>, seed: BacSeed, options: ScanOptions) -> Result<ScanHandle, ScanError> {
        match transport.availability() {
            Availability::Ready => {},
            Availability::Unsupported => return Err(ScanError::UnsupportedHardware),
            Availability::Disabled => return Err(ScanError::Disabled),
        }

        if self.in_flight.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(ScanError::ConcurrentScanRejected);
        }
        let cancel = CancelToken::new();
        {
            let mut active = self.active_cancel.lock().unwrap_or_else(PoisonError::into_inner);
            *active = Some(cancel.clone());
        }
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            active_cancel: Arc::clone(&self.active_cancel),
        };

        let options = ScanOptions {
            image_quality: clamp_quality(options.image_quality),
            ..options
        };
        let (progress_tx, progress_rx) = mpsc::channel();
        let session = ScanSession::new(seed, options, cancel.clone(), progress_tx);
        let worker = thread::spawn(move || {
            let _guard = guard;
            let result = run_scan(transport.as_mut(), &session);
            if let Err(e) = &result {
                warn!(error = %e, "scan failed");
            }
            result
        });

        Ok(ScanHandle {
            progress: progress_rx,
            cancel,
            worker,
        })
    }

    /// Runs a scan to completion, passing progress to `on_progress` as it happens.
    pub fn scan<F: FnMut(ScanProgress)>(
        &self,
        transport: Box<dyn Transport>,
        seed: BacSeed,
        options: ScanOptions,
        mut on_progress: F,
    ) -> Result<ScanResult, ScanError> {
        let handle = self.start(transport, seed, options)?;
        for milestone in handle.progress().iter() {
            on_progress(milestone);
        }
        handle.wait()
    }

    /// Cancels the scan in flight, if any.
    pub fn cancel(&self) {
        let active = self.active_cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = active.as_ref() {
            info!("canceling scan");
            cancel.cancel();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_clamped() {
        assert_eq!(ScanOptions::new(1.5).image_quality, 1.0);
        assert_eq!(ScanOptions::new(-0.2).image_quality, 0.0);
        assert_eq!(ScanOptions::new(0.25).image_quality, 0.25);
        assert_eq!(ScanOptions::new(f32::NAN).image_quality, 1.0);
        assert_eq!(ScanOptions::default().image_quality, 1.0);
    }

    #[test]
    fn test_disconnect_classification() {
        let error: ScanError = CommunicationError::Transport(TransportError::Disconnected).into();
        assert!(error.is_disconnect());
        let error: ScanError = CommunicationError::Canceled.into();
        assert!(matches!(error, ScanError::Canceled));
        assert!(!error.is_disconnect());

        let error = ScanError::from_read(FileId::Dg1, ReadError::ShortRead { file_id: 0x0101, declared: 10, obtained: 4 });
        assert!(matches!(error, ScanError::ShortRead { file: FileId::Dg1, declared: 10, obtained: 4 }));
    }
}
