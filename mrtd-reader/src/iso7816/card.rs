//! Smart cards and the byte transports that carry their APDUs.


use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use crate::iso7816::apdu::{self, Apdu, Response};
use crate::secure_messaging;


/// Errors reported by a byte transport.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TransportError {
    /// The chip left the field or the channel was otherwise torn down.
    Disconnected,

    /// The round trip did not complete within the transport's own deadline.
    Timeout,

    /// Any other failure reported by the underlying reader.
    Io(String),
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "chip disconnected"),
            Self::Timeout => write!(f, "transceive timed out"),
            Self::Io(message) => write!(f, "transport I/O error: {}", message),
        }
    }
}
impl std::error::Error for TransportError {
}


#[derive(Debug)]
pub enum CommunicationError {
    Codec(apdu::CodecError),
    Transport(TransportError),
    SecureMessaging(secure_messaging::Error),
    Canceled,
}
impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "APDU codec error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::SecureMessaging(e) => write!(f, "Secure Messaging error: {}", e),
            Self::Canceled => write!(f, "operation canceled"),
        }
    }
}
impl std::error::Error for CommunicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::SecureMessaging(e) => Some(e),
            Self::Canceled => None,
        }
    }
}
impl From<apdu::CodecError> for CommunicationError {
    fn from(value: apdu::CodecError) -> Self { Self::Codec(value) }
}
impl From<TransportError> for CommunicationError {
    fn from(value: TransportError) -> Self { Self::Transport(value) }
}
impl From<secure_messaging::Error> for CommunicationError {
    fn from(value: secure_messaging::Error) -> Self { Self::SecureMessaging(value) }
}


/// A smart card compatible with ISO/IEC 7816.
pub trait SmartCard: Send {
    /// Send a request APDU to the smart card and receive a response APDU.
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError>;

    /// The largest number of response data bytes worth requesting in one READ BINARY.
    fn max_response_data_length(&self) -> usize {
        apdu::SHORT_MAX_RESPONSE_LENGTH
    }
}
impl<SC: SmartCard + ?Sized> SmartCard for Box<SC> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        (**self).communicate(request)
    }

    fn max_response_data_length(&self) -> usize {
        (**self).max_response_data_length()
    }
}


/// Whether the contactless hardware can be used at the moment.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Availability {
    Ready,

    /// No contactless reader exists.
    Unsupported,

    /// A reader exists but is switched off.
    Disabled,
}


/// The layer that discovers a contactless chip and hands out a channel to it.
pub trait Transport: Send {
    fn availability(&self) -> Availability;

    fn open(&mut self) -> Result<Box<dyn Channel>, TransportError>;
}


/// A raw bidirectional byte channel to a chip.
///
/// `transceive` blocks until the chip answers or the transport gives up.
pub trait Channel: Send {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn close(&mut self);
}


/// A flag shared between a scan and whoever may want to cancel it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), CommunicationError> {
        if self.is_canceled() {
            Err(CommunicationError::Canceled)
        } else {
            Ok(())
        }
    }
}


/// A [`SmartCard`] talking plain APDUs over a [`Channel`].
///
/// Cancellation is checked before every round trip. The channel is closed exactly once, when this
/// value is dropped.
pub struct ChannelCard {
    channel: Box<dyn Channel>,
    cancel: CancelToken,
    closed: bool,
}
impl ChannelCard {
    pub fn new(channel: Box<dyn Channel>, cancel: CancelToken) -> Self {
        Self {
            channel,
            cancel,
            closed: false,
        }
    }

    fn close(&mut self) {
        if !self.closed {
            debug!("closing chip channel");
            self.channel.close();
            self.closed = true;
        }
    }
}
impl SmartCard for ChannelCard {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        self.cancel.check()?;
        if self.closed {
            return Err(TransportError::Disconnected.into());
        }

        let out_buf = request.to_bytes()?;
        trace!("sending to chip:\n{}", crate::hexdump(&out_buf));
        let in_buf = self.channel.transceive(&out_buf)?;
        trace!("received from chip:\n{}", crate::hexdump(&in_buf));
        Ok(Response::from_slice(&in_buf)?)
    }
}
impl Drop for ChannelCard {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use hex_literal::hex;
    use crate::iso7816::apdu::CommandHeader;

    struct RecordingChannel {
        closes: Arc<Mutex<usize>>,
        reply: Vec<u8>,
    }
    impl Channel for RecordingChannel {
        fn transceive(&mut self, _command: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(self.reply.clone())
        }

        fn close(&mut self) {
            *self.closes.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_channel_card_cancel_and_close() {
        let closes = Arc::new(Mutex::new(0));
        let cancel = CancelToken::new();
        let channel = RecordingChannel { closes: Arc::clone(&closes), reply: hex!("9000").to_vec() };
        let mut card = ChannelCard::new(Box::new(channel), cancel.clone());

        let select = Apdu::new(CommandHeader::new(0x00, 0xA4, 0x02, 0x0C), vec![0x01, 0x1E], None);
        let response = card.communicate(&select).unwrap();
        assert!(response.is_success());

        cancel.cancel();
        assert!(matches!(card.communicate(&select), Err(CommunicationError::Canceled)));

        drop(card);
        assert_eq!(*closes.lock().unwrap(), 1);
    }

    #[test]
    fn test_channel_card_truncated_response() {
        let closes = Arc::new(Mutex::new(0));
        let channel = RecordingChannel { closes, reply: vec![0x90] };
        let mut card = ChannelCard::new(Box::new(channel), CancelToken::new());
        let read = Apdu::new(CommandHeader::new(0x00, 0xB0, 0x00, 0x00), vec![], Some(4));
        assert!(matches!(
            card.communicate(&read),
            Err(CommunicationError::Codec(apdu::CodecError::TruncatedResponse { obtained: 1 })),
        ));
    }
}
