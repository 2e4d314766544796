//! Device sessions.
//!
//! A [`Session`] owns the connection to a single bootloader along with the
//! firmware image being flashed, and drives the erase / program / verify
//! exchanges over it.

use core::marker::PhantomData;
use std::path::Path;

use embedded_hal::blocking::delay::DelayMs;

use crate::image::Image;
use crate::protocol::{Command, Link, PAGE_COUNT, PAGE_SIZE};
use crate::{Connector, Error, FaultSink, Options, PortSettings, Status};

pub struct Session<C, D, E>
where
    C: Connector<E>,
{
    name: Option<String>,
    port: Option<C::Port>,
    status: Status,
    image: Option<Image>,

    connector: C,
    delay: D,
    options: Options,
    sink: Option<Box<dyn FaultSink>>,
    _err: PhantomData<E>,
}

impl<C, D, E> Session<C, D, E>
where
    C: Connector<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new, disconnected session
    pub fn new(connector: C, delay: D, options: Options) -> Self {
        Self {
            name: None,
            port: None,
            status: Status::Disconnected,
            image: None,
            connector,
            delay,
            options,
            sink: None,
            _err: PhantomData,
        }
    }

    /// Attach a sink to be notified of internal faults
    pub fn with_sink<S: FaultSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Disconnect and release the session
    pub fn free(self) {
        drop(self)
    }

    /// Set the name of the serial port to connect to
    pub fn set_port(&mut self, name: &str) -> Result<(), Error<E>> {
        if name.is_empty() {
            return Err(self.report(Error::InvalidArgument("port")));
        }

        self.name = Some(name.to_string());
        Ok(())
    }

    /// Fetch the configured serial port name
    pub fn port(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Fetch the connection status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Fetch the loaded firmware image
    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    /// Connect to the bootloader on the configured port
    pub fn connect(&mut self) -> Result<(), Error<E>> {
        if self.port.is_some() {
            debug!("Already connected");
            return Ok(());
        }

        let name = match &self.name {
            Some(n) => n.clone(),
            None => return Err(self.report(Error::InvalidArgument("port"))),
        };

        info!("Connecting to '{}'", name);
        self.status = Status::Connecting;

        match self.connector.open(&name, &PortSettings::EEBL0) {
            Ok(p) => {
                self.port = Some(p);
                self.status = Status::Connected;
                info!("Connected to '{}'", name);
                Ok(())
            }
            Err(e) => {
                error!("Unable to open '{}': {:?}", name, e);
                self.status = Status::Failure;
                Err(self.report(Error::TransportOpenFailure(e)))
            }
        }
    }

    /// Disconnect from the bootloader, a no-op if not connected
    pub fn disconnect(&mut self) {
        if self.release() {
            info!("Disconnected");
        }
    }

    /// Load and pad firmware from a file, replacing any loaded image
    pub fn load_firmware<P: AsRef<Path>>(&mut self, path: P) -> Result<&Image, Error<E>> {
        let image = Image::load(path).map_err(|e| self.report(e.into()))?;

        info!(
            "Loaded {} byte firmware ({} bytes padded)",
            image.source_len(),
            crate::IMAGE_SIZE - image.source_len().min(crate::IMAGE_SIZE)
        );

        Ok(&*self.image.insert(image))
    }

    /// Use an existing image as the session firmware
    pub fn set_image(&mut self, image: Image) {
        self.image = Some(image);
    }

    /// Erase the application flash.
    ///
    /// Returns false if the bootloader did not acknowledge the erase.
    pub fn erase(&mut self) -> Result<bool, Error<E>> {
        let res = self
            .link()
            .and_then(|mut l| single_shot(&mut l, Command::Erase));
        self.complete(res)
    }

    /// Leave the bootloader and start the application
    pub fn run_app(&mut self) -> Result<bool, Error<E>> {
        let res = self
            .link()
            .and_then(|mut l| single_shot(&mut l, Command::RunApp));
        self.complete(res)
    }

    /// Verify the device flash against the loaded image
    pub fn verify(&mut self) -> Result<bool, Error<E>> {
        self.verify_with(|_| ())
    }

    /// Verify the loaded image, calling `on_page` after each matching page
    pub fn verify_with<F: FnMut(usize)>(&mut self, on_page: F) -> Result<bool, Error<E>> {
        let res = self.link_image().and_then(|(mut l, image)| {
            let image = image.ok_or(Error::InvalidArgument("image"))?;
            verify_pages(&mut l, image, on_page)
        });
        self.complete(res)
    }

    /// Verify the device flash against a firmware binary, padded as
    /// for a loaded image
    pub fn verify_from(&mut self, data: &[u8]) -> Result<bool, Error<E>> {
        let image = Image::from_bytes(data).map_err(|e| self.report(e.into()))?;

        let res = self
            .link()
            .and_then(|mut l| verify_pages(&mut l, &image, |_| ()));
        self.complete(res)
    }

    /// Program the loaded image to the device flash
    pub fn program(&mut self) -> Result<bool, Error<E>> {
        self.program_with(|_| ())
    }

    /// Program the loaded image, calling `on_page` after each written page
    pub fn program_with<F: FnMut(usize)>(&mut self, on_page: F) -> Result<bool, Error<E>> {
        let res = self.link_image().and_then(|(mut l, image)| {
            let image = image.ok_or(Error::InvalidArgument("image"))?;
            program_pages(&mut l, image, on_page)
        });
        self.complete(res)
    }

    /// Program a firmware binary, padded as for a loaded image
    pub fn program_from(&mut self, data: &[u8]) -> Result<bool, Error<E>> {
        let image = Image::from_bytes(data).map_err(|e| self.report(e.into()))?;

        let res = self
            .link()
            .and_then(|mut l| program_pages(&mut l, &image, |_| ()));
        self.complete(res)
    }

    /// Read the device flash back into an image.
    ///
    /// Returns `None` if the bootloader rejected or truncated a page.
    pub fn read_firmware(&mut self) -> Result<Option<Image>, Error<E>> {
        self.read_with(|_| ())
    }

    /// Read the device flash, calling `on_page` after each received page
    pub fn read_with<F: FnMut(usize)>(&mut self, on_page: F) -> Result<Option<Image>, Error<E>> {
        let res = self.link().and_then(|mut l| read_pages(&mut l, on_page));
        self.complete(res)
    }

    /// Borrow the connected port as a frame link
    fn link(&mut self) -> Result<Link<'_, C::Port, D, E>, Error<E>> {
        self.link_image().map(|(l, _)| l)
    }

    fn link_image(&mut self) -> Result<(Link<'_, C::Port, D, E>, Option<&Image>), Error<E>> {
        if self.status != Status::Connected {
            return Err(Error::NotConnected);
        }

        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        Ok((
            Link::new(port, &mut self.delay, &self.options),
            self.image.as_ref(),
        ))
    }

    fn complete<T>(&mut self, res: Result<T, Error<E>>) -> Result<T, Error<E>> {
        res.map_err(|e| self.report(e))
    }

    /// Notify the sink of an error where it represents a fault
    fn report(&mut self, e: Error<E>) -> Error<E> {
        if let (Some(f), Some(s)) = (e.fault(), self.sink.as_mut()) {
            s.notify(f);
        }
        e
    }
}

impl<C, D, E> Session<C, D, E>
where
    C: Connector<E>,
{
    /// Close the port if one is held, returning whether it was
    fn release(&mut self) -> bool {
        match self.port.take() {
            Some(p) => {
                self.status = Status::Disconnecting;
                self.connector.close(p);
                self.status = Status::Disconnected;
                true
            }
            None => false,
        }
    }
}

impl<C, D, E> Drop for Session<C, D, E>
where
    C: Connector<E>,
{
    fn drop(&mut self) {
        self.release();
    }
}

fn single_shot<P, D, E>(l: &mut Link<P, D, E>, command: Command) -> Result<bool, Error<E>>
where
    P: crate::SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    l.command(command)?;

    let ok = l.await_ack()?;
    if !ok {
        warn!("{:?} not acknowledged", command);
    }

    Ok(ok)
}

fn verify_pages<P, D, E, F>(
    l: &mut Link<P, D, E>,
    image: &Image,
    mut on_page: F,
) -> Result<bool, Error<E>>
where
    P: crate::SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
    F: FnMut(usize),
{
    let mut rx = [0u8; PAGE_SIZE];

    for (index, expected) in image.pages().enumerate() {
        if !l.read_page(&mut rx)? {
            warn!("Page {} rejected by bootloader", index);
            return Ok(false);
        }

        if let Some(offset) = expected.iter().zip(rx.iter()).position(|(a, b)| a != b) {
            warn!(
                "Page {} mismatch at offset 0x{:04x} (expected 0x{:02x}, read 0x{:02x})",
                index,
                index * PAGE_SIZE + offset,
                expected[offset],
                rx[offset]
            );
            return Ok(false);
        }

        on_page(index);
    }

    debug!("Verified {} pages", PAGE_COUNT);

    Ok(true)
}

fn program_pages<P, D, E, F>(
    l: &mut Link<P, D, E>,
    image: &Image,
    mut on_page: F,
) -> Result<bool, Error<E>>
where
    P: crate::SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
    F: FnMut(usize),
{
    for (index, page) in image.pages().enumerate() {
        if !l.write_page(page)? {
            warn!("Page {} not acknowledged", index);
            return Ok(false);
        }

        on_page(index);
    }

    debug!("Programmed {} pages", PAGE_COUNT);

    Ok(true)
}

fn read_pages<P, D, E, F>(l: &mut Link<P, D, E>, mut on_page: F) -> Result<Option<Image>, Error<E>>
where
    P: crate::SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
    F: FnMut(usize),
{
    let mut data = Vec::new();
    data.try_reserve_exact(crate::IMAGE_SIZE)
        .map_err(|_| Error::AllocationFailure)?;

    let mut rx = [0u8; PAGE_SIZE];

    for index in 0..PAGE_COUNT {
        if !l.read_page(&mut rx)? {
            warn!("Page {} rejected by bootloader", index);
            return Ok(None);
        }
        data.extend_from_slice(&rx);

        on_page(index);
    }

    Ok(Some(Image::from_bytes(&data)?))
}
