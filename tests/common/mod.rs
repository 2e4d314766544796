//! Scripted in-memory bootloader for session tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::ErrorKind as IoErrorKind;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use eebl0_loader::protocol::{IMAGE_SIZE, PAGE_COUNT, PAGE_SIZE, UART_ACK};
use eebl0_loader::{Connector, Fault, Options, PortSettings, Session};

pub type Shared = Rc<RefCell<Device>>;

pub type MockSession = Session<MockConnector, NoDelay, IoErrorKind>;

/// Simulated bootloader state
pub struct Device {
    pub flash: Vec<u8>,

    /// Command bytes received, excluding page payloads
    pub commands: Vec<u8>,
    /// Every byte received
    pub sent: Vec<u8>,
    /// Ports opened with their settings
    pub opened: Vec<(String, PortSettings)>,
    pub closes: usize,

    pub fail_open: bool,
    pub fail_write: bool,
    pub fail_read: bool,
    pub silent: bool,

    pub erase_ack: u8,
    pub run_ack: u8,
    pub page_status: u8,
    /// Page at which program acknowledgements turn negative
    pub program_nack_at: Option<usize>,

    rx: VecDeque<u8>,
    verify_page: usize,
    program_page: usize,
    payload: Option<Vec<u8>>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            flash: vec![0xFF; IMAGE_SIZE],
            commands: Vec::new(),
            sent: Vec::new(),
            opened: Vec::new(),
            closes: 0,
            fail_open: false,
            fail_write: false,
            fail_read: false,
            silent: false,
            erase_ack: UART_ACK,
            run_ack: UART_ACK,
            page_status: UART_ACK,
            program_nack_at: None,
            rx: VecDeque::new(),
            verify_page: 0,
            program_page: 0,
            payload: None,
        }
    }
}

impl Device {
    pub fn shared() -> Shared {
        Rc::new(RefCell::new(Device::default()))
    }

    /// Number of times a command byte was received
    pub fn count(&self, command: u8) -> usize {
        self.commands.iter().filter(|c| **c == command).count()
    }

    fn reply(&mut self, data: &[u8]) {
        if !self.silent {
            self.rx.extend(data);
        }
    }

    fn receive(&mut self, b: u8) {
        self.sent.push(b);

        if let Some(mut payload) = self.payload.take() {
            payload.push(b);
            if payload.len() < PAGE_SIZE {
                self.payload = Some(payload);
                return;
            }

            let page = self.program_page;
            self.program_page += 1;

            if self.program_nack_at == Some(page) {
                self.reply(&[b'n']);
                return;
            }

            let offset = page * PAGE_SIZE;
            self.flash[offset..offset + PAGE_SIZE].copy_from_slice(&payload);
            self.reply(&[UART_ACK]);
            return;
        }

        self.commands.push(b);

        match b {
            b'e' => {
                self.flash.iter_mut().for_each(|v| *v = 0xFF);
                self.verify_page = 0;
                self.program_page = 0;
                let ack = self.erase_ack;
                self.reply(&[ack]);
            }
            b'a' => {
                let ack = self.run_ack;
                self.reply(&[ack]);
            }
            b'p' => self.payload = Some(Vec::with_capacity(PAGE_SIZE)),
            b'v' => {
                let offset = self.verify_page * PAGE_SIZE;
                let mut frame = vec![self.page_status];
                frame.extend_from_slice(&self.flash[offset..offset + PAGE_SIZE]);
                self.reply(&frame);
                self.verify_page = (self.verify_page + 1) % PAGE_COUNT;
            }
            _ => (),
        }
    }
}

pub struct MockConnector(pub Shared);

pub struct MockPort(Shared);

impl Connector<IoErrorKind> for MockConnector {
    type Port = MockPort;

    fn open(&mut self, name: &str, settings: &PortSettings) -> Result<MockPort, IoErrorKind> {
        let mut d = self.0.borrow_mut();
        if d.fail_open {
            return Err(IoErrorKind::NotFound);
        }
        d.opened.push((name.to_string(), *settings));

        Ok(MockPort(self.0.clone()))
    }

    fn close(&mut self, _port: MockPort) {
        self.0.borrow_mut().closes += 1;
    }
}

impl Write<u8> for MockPort {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), IoErrorKind> {
        let mut d = self.0.borrow_mut();
        if d.fail_write {
            return Err(nb::Error::Other(IoErrorKind::BrokenPipe));
        }
        d.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), IoErrorKind> {
        Ok(())
    }
}

impl Read<u8> for MockPort {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, IoErrorKind> {
        let mut d = self.0.borrow_mut();
        if d.fail_read {
            return Err(nb::Error::Other(IoErrorKind::TimedOut));
        }
        d.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

/// Create a session bound to the simulated device, recording faults
pub fn session(device: &Shared) -> (MockSession, Rc<RefCell<Vec<Fault>>>) {
    session_with(device, Options::default())
}

/// As [`session`], with explicit session options
pub fn session_with(
    device: &Shared,
    options: Options,
) -> (MockSession, Rc<RefCell<Vec<Fault>>>) {
    let faults = Rc::new(RefCell::new(Vec::new()));
    let f = faults.clone();

    let s = Session::new(MockConnector(device.clone()), NoDelay, options)
        .with_sink(move |fault: Fault| f.borrow_mut().push(fault));

    (s, faults)
}

/// Create a session connected to the simulated device
pub fn connected(device: &Shared) -> (MockSession, Rc<RefCell<Vec<Fault>>>) {
    let (mut s, faults) = session(device);
    s.set_port("COM3").unwrap();
    s.connect().unwrap();
    (s, faults)
}
