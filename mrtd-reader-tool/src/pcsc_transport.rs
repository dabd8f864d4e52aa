//! PC/SC reader as a contactless transport.


use std::ffi::{CStr, CString};

use mrtd_reader::iso7816::card::{Availability, Channel, Transport, TransportError};
use tracing::{debug, warn};


fn map_error(error: pcsc::Error) -> TransportError {
    match error {
        pcsc::Error::NoSmartcard
            | pcsc::Error::RemovedCard
            | pcsc::Error::ResetCard
            | pcsc::Error::UnpoweredCard
            | pcsc::Error::UnresponsiveCard
            | pcsc::Error::ReaderUnavailable
            => TransportError::Disconnected,
        pcsc::Error::Timeout
            => TransportError::Timeout,
        other
            => TransportError::Io(other.to_string()),
    }
}


/// One reader of a PC/SC context.
pub struct PcscTransport {
    context: pcsc::Context,
    reader: CString,
}
impl PcscTransport {
    pub fn new(context: pcsc::Context, reader: CString) -> Self {
        Self {
            context,
            reader,
        }
    }

    fn reader_present(&self) -> Result<bool, pcsc::Error> {
        let buf_len = self.context.list_readers_len()?;
        let mut buf = vec![0u8; buf_len];
        let reader: &CStr = &self.reader;
        let present = self.context.list_readers(&mut buf)?
            .any(|name| name == reader);
        Ok(present)
    }
}
impl Transport for PcscTransport {
    fn availability(&self) -> Availability {
        match self.reader_present() {
            Ok(true) => Availability::Ready,
            Ok(false) => Availability::Unsupported,
            Err(pcsc::Error::NoReadersAvailable) => Availability::Unsupported,
            Err(e) => {
                warn!("failed to query PC/SC readers: {}", e);
                Availability::Disabled
            },
        }
    }

    fn open(&mut self) -> Result<Box<dyn Channel>, TransportError> {
        let card = self.context.connect(&self.reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
            .map_err(map_error)?;
        debug!("connected to card");
        Ok(Box::new(PcscChannel { card: Some(card) }))
    }
}


struct PcscChannel {
    card: Option<pcsc::Card>,
}
impl Channel for PcscChannel {
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let card = self.card.as_mut()
            .ok_or(TransportError::Disconnected)?;
        let mut in_buf = vec![0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = card.transmit(command, &mut in_buf)
            .map_err(map_error)?;
        Ok(response.to_vec())
    }

    fn close(&mut self) {
        if let Some(card) = self.card.take() {
            if let Err((_card, e)) = card.disconnect(pcsc::Disposition::LeaveCard) {
                warn!("failed to disconnect from card: {}", e);
            }
        }
    }
}
