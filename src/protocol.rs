//! Bootloader wire protocol.
//!
//! Commands are single bytes, single-shot commands are acknowledged with
//! [`UART_ACK`] and page reads return a [`FRAME_SIZE`] byte frame made of a
//! status byte followed by the page data.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::{Error, Options, SerialPort};

/// Successful response / status byte
pub const UART_ACK: u8 = b's';

/// Size of the device flash image in bytes
pub const IMAGE_SIZE: usize = 15104;

/// Size of a flash page in bytes
pub const PAGE_SIZE: usize = 64;

/// Number of pages in a flash image
pub const PAGE_COUNT: usize = IMAGE_SIZE / PAGE_SIZE;

/// Size of a page response (status byte + page data)
pub const FRAME_SIZE: usize = PAGE_SIZE + 1;

/// Value used to pad images to [`IMAGE_SIZE`]
pub const PAD_BYTE: u8 = 0xFF;

const _: () = assert!(IMAGE_SIZE % PAGE_SIZE == 0);

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Bootloader welcome
    Welcome = 0x00,

    /// Query flash size
    Size = b'#' as isize,

    /// Leave the bootloader and start the application
    RunApp = b'a' as isize,

    /// Erase the application flash
    Erase = b'e' as isize,

    /// Write the next page of flash
    ProgramPage = b'p' as isize,

    /// Read back the next page of flash
    VerifyPage = b'v' as isize,
}

impl Command {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Borrowed view of a connected port used to exchange frames
pub struct Link<'a, P, D, E> {
    port: &'a mut P,
    delay: &'a mut D,
    options: &'a Options,
    _err: PhantomData<E>,
}

impl<'a, P, D, E> Link<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: &'a mut P, delay: &'a mut D, options: &'a Options) -> Self {
        Self {
            port,
            delay,
            options,
            _err: PhantomData,
        }
    }

    /// Send a command byte
    pub fn command(&mut self, command: Command) -> Result<(), Error<E>> {
        trace!("Sending command {:?}", command);
        self.send(&[command.byte()])
    }

    /// Write and flush raw bytes
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b)).map_err(Error::TransportWriteFailure)?;
        }
        block!(self.port.flush()).map_err(Error::TransportWriteFailure)?;

        Ok(())
    }

    /// Read up to `buff.len()` bytes, waiting at most the response timeout.
    ///
    /// Returns the number of bytes received, which is less than requested
    /// when the device stops responding.
    pub fn receive(&mut self, buff: &mut [u8]) -> Result<usize, Error<E>> {
        let mut n = 0;
        let mut t = 0;

        while n < buff.len() {
            match self.port.read() {
                Ok(v) => {
                    buff[n] = v;
                    n += 1;
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => {
                    error!("Serial read error: {:?}", e);
                    return Err(Error::TransportReadFailure(e));
                }
            }

            // Each poll counts for at least 1ms so a zero poll period still times out
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);

            if t > self.options.response_timeout_ms {
                debug!("Receive timeout ({} of {} bytes)", n, buff.len());
                break;
            }
        }

        Ok(n)
    }

    /// Read a single acknowledgement byte, true if it was [`UART_ACK`]
    pub fn await_ack(&mut self) -> Result<bool, Error<E>> {
        let mut rx = [0u8; 1];

        match self.receive(&mut rx)? {
            1 if rx[0] == UART_ACK => Ok(true),
            1 => {
                debug!("Received unexpected value: 0x{:02x}", rx[0]);
                Ok(false)
            }
            _ => {
                debug!("No response from bootloader");
                Ok(false)
            }
        }
    }

    /// Request the next page frame into `page`.
    ///
    /// Returns false, leaving `page` untouched, unless a complete frame with
    /// a success status was received.
    pub fn read_page(&mut self, page: &mut [u8; PAGE_SIZE]) -> Result<bool, Error<E>> {
        let mut frame = [0u8; FRAME_SIZE];

        self.command(Command::VerifyPage)?;

        let n = self.receive(&mut frame)?;
        if n != FRAME_SIZE {
            debug!("Short page frame ({} of {} bytes)", n, FRAME_SIZE);
            return Ok(false);
        }
        if frame[0] != UART_ACK {
            debug!("Page status: 0x{:02x}", frame[0]);
            return Ok(false);
        }

        page.copy_from_slice(&frame[1..]);
        Ok(true)
    }

    /// Write the next page and await its acknowledgement
    pub fn write_page(&mut self, page: &[u8]) -> Result<bool, Error<E>> {
        if page.len() != PAGE_SIZE {
            return Err(Error::InvalidArgument("page"));
        }

        self.command(Command::ProgramPage)?;
        self.send(page)?;

        self.await_ack()
    }
}
