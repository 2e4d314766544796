use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, FlowControl, Parity as SerialParity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};
use serial_core::{Error as SerialError, ErrorKind as SerialErrorKind};

use crate::{Connector, Error, Options, Parity, PortSettings, Session};

/// Opens bootloader ports using the linux tty interface
#[derive(Clone, Debug)]
pub struct LinuxConnector {
    /// Timeout for each underlying tty read, bounded by the session poll period
    pub read_timeout: Duration,
}

impl LinuxConnector {
    pub fn new(options: &Options) -> Self {
        Self {
            read_timeout: Duration::from_millis(options.poll_delay_ms.max(1) as u64),
        }
    }

    fn open_port(&self, name: &str, settings: &PortSettings) -> Result<Serial, SerialError> {
        // Open port
        let mut port = Serial::open(Path::new(name))?;

        // Apply settings
        let mut s = port.0.read_settings()?;

        s.set_char_size(match settings.data_bits {
            5 => CharSize::Bits5,
            6 => CharSize::Bits6,
            7 => CharSize::Bits7,
            8 => CharSize::Bits8,
            _ => return Err(SerialError::new(SerialErrorKind::InvalidInput, "data bits")),
        });
        s.set_stop_bits(match settings.stop_bits {
            1 => StopBits::Stop1,
            2 => StopBits::Stop2,
            _ => return Err(SerialError::new(SerialErrorKind::InvalidInput, "stop bits")),
        });
        s.set_baud_rate(BaudRate::from_speed(settings.baud))?;
        s.set_flow_control(FlowControl::FlowNone);
        s.set_parity(match settings.parity {
            Parity::None => SerialParity::ParityNone,
            Parity::Even => SerialParity::ParityEven,
            Parity::Odd => SerialParity::ParityOdd,
        });

        port.0.write_settings(&s)?;
        port.0.set_timeout(self.read_timeout)?;

        Ok(port)
    }
}

impl Connector<IoErrorKind> for LinuxConnector {
    type Port = Serial;

    fn open(&mut self, name: &str, settings: &PortSettings) -> Result<Serial, IoErrorKind> {
        self.open_port(name, settings).map_err(|e| {
            debug!("Serial error: {}", e);
            match e.kind() {
                SerialErrorKind::NoDevice => IoErrorKind::NotFound,
                SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
                SerialErrorKind::Io(kind) => kind,
            }
        })
    }
}

impl Session<LinuxConnector, Delay, IoErrorKind> {
    /// Create a new linux serial port session for the provided port
    pub fn linux(port: &str, options: Options) -> Result<Self, Error<IoErrorKind>> {
        let connector = LinuxConnector::new(&options);

        let mut s = Self::new(connector, Delay {}, options);
        s.set_port(port)?;

        Ok(s)
    }
}
