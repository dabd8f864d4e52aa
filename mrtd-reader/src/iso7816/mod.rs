//! Functionality defined by ISO/IEC 7816.


pub mod apdu;
pub mod card;
pub mod file;
