//! EEBL0 Serial Bootloader.
//!
//! Host side of the EEBL0 UART bootloader: firmware images are padded to the
//! fixed flash geometry and erased, programmed, verified or read back one
//! 64 byte page at a time.

use std::io::ErrorKind as IoErrorKind;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod image;
pub mod protocol;
pub mod session;

pub use image::{Image, ImageError};
pub use protocol::{Command, IMAGE_SIZE, PAGE_COUNT, PAGE_SIZE};
pub use session::Session;

/// Identification string of this loader
pub const WELCOME: &str = "EEBL0";

/// Fetch the loader identification string
pub fn welcome() -> &'static str {
    WELCOME
}

/// Byte level serial port used to talk to the bootloader
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> SerialPort<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

/// Opens and closes named serial ports
pub trait Connector<E> {
    type Port: SerialPort<E>;

    /// Open the named port with the provided settings
    fn open(&mut self, name: &str, settings: &PortSettings) -> Result<Self::Port, E>;

    /// Release a previously opened port
    fn close(&mut self, port: Self::Port) {
        drop(port)
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Line settings applied when opening a port
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct PortSettings {
    pub baud: usize,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl PortSettings {
    /// 115200 baud, 8N1, as expected by the bootloader
    pub const EEBL0: PortSettings = PortSettings {
        baud: 115_200,
        data_bits: 8,
        parity: Parity::None,
        stop_bits: 1,
    };
}

/// Connection status of a [`Session`]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Status {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Failure,
}

impl Status {
    /// Human readable status
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Connecting => "CONNECTING",
            Status::Connected => "CONNECTED",
            Status::Disconnecting => "DISCONNECTING",
            Status::Disconnected => "DISCONNECTED",
            Status::Failure => "FAILURE",
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unable to allocate firmware buffer")]
    AllocationFailure,

    #[error("firmware source unavailable: {0:?}")]
    ImageSourceUnavailable(IoErrorKind),

    #[error("failed to open serial port: {0:?}")]
    TransportOpenFailure(SerialError),

    #[error("failed to write to serial port: {0:?}")]
    TransportWriteFailure(SerialError),

    #[error("failed to read from serial port: {0:?}")]
    TransportReadFailure(SerialError),

    #[error("device not connected")]
    NotConnected,
}

impl<SerialError> Error<SerialError> {
    /// Fault reported to the session sink for this error, if any
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Error::InvalidArgument(_) => Some(Fault::InvalidArgument),
            Error::AllocationFailure => Some(Fault::AllocationFailure),
            Error::ImageSourceUnavailable(_) => Some(Fault::ImageSourceUnavailable),
            Error::TransportOpenFailure(_) => Some(Fault::TransportOpenFailure),
            Error::TransportWriteFailure(_) => Some(Fault::TransportWriteFailure),
            Error::TransportReadFailure(_) => Some(Fault::TransportReadFailure),
            Error::NotConnected => None,
        }
    }
}

impl<SerialError> From<ImageError> for Error<SerialError> {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::Unavailable(kind) => Error::ImageSourceUnavailable(kind),
            ImageError::Allocation => Error::AllocationFailure,
        }
    }
}

/// Internal fault kinds delivered to a [`FaultSink`]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Fault {
    InvalidArgument,
    AllocationFailure,
    ImageSourceUnavailable,
    TransportOpenFailure,
    TransportWriteFailure,
    TransportReadFailure,
}

impl Fault {
    /// Stable numeric code for the fault
    pub fn code(&self) -> i32 {
        match self {
            Fault::InvalidArgument => 1,
            Fault::AllocationFailure => 2,
            Fault::ImageSourceUnavailable => 3,
            Fault::TransportOpenFailure => 4,
            Fault::TransportWriteFailure => 5,
            Fault::TransportReadFailure => 6,
        }
    }
}

/// Notification hook for internal faults.
///
/// Sinks are informed once per fault and cannot influence the operation,
/// the error is always returned to the caller as well.
pub trait FaultSink {
    fn notify(&mut self, fault: Fault);
}

impl<F> FaultSink for F
where
    F: FnMut(Fault),
{
    fn notify(&mut self, fault: Fault) {
        self(fault)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 100,
            poll_delay_ms: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(Status::Connecting.as_str(), "CONNECTING");
        assert_eq!(Status::Connected.as_str(), "CONNECTED");
        assert_eq!(Status::Disconnecting.as_str(), "DISCONNECTING");
        assert_eq!(Status::Disconnected.as_str(), "DISCONNECTED");
        assert_eq!(Status::Failure.to_string(), "FAILURE");
    }

    #[test]
    fn not_connected_is_not_a_fault() {
        let e: Error<()> = Error::NotConnected;
        assert_eq!(e.fault(), None);

        let e: Error<()> = Error::TransportReadFailure(());
        assert_eq!(e.fault(), Some(Fault::TransportReadFailure));
        assert_eq!(Fault::TransportReadFailure.code(), 6);
    }

    #[test]
    fn image_errors_convert() {
        let e: Error<()> = ImageError::Allocation.into();
        assert_eq!(e, Error::AllocationFailure);

        let e: Error<()> = ImageError::Unavailable(IoErrorKind::NotFound).into();
        assert_eq!(e.fault(), Some(Fault::ImageSourceUnavailable));
    }

    #[test]
    fn closures_are_sinks() {
        let mut seen = Vec::new();
        {
            let mut sink = |f: Fault| seen.push(f.code());
            sink.notify(Fault::InvalidArgument);
        }
        assert_eq!(seen, vec![1]);
    }
}
