//! AVR STK500 Serial Bootloader.
//!
//! Reads and writes the flash of AVR8 boards through the STK500v1
//! (ATmegaBOOT / Optiboot) and STK500v2 (Arduino Mega) bootloaders.
//!
//! A session runs: [`Programmer::open`] (reset and sync),
//! [`Programmer::board_request`], [`Programmer::cpu_signature`], any number of
//! page writes / reads, then [`Programmer::leave_bootloader`] and
//! [`Programmer::close`].

use core::fmt::Debug;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod device;
#[cfg(feature = "serialport")]
pub mod discover;
pub mod error;
pub mod image;
#[cfg(feature = "ihex")]
pub mod intel_hex;
pub mod protocol;

mod link;

pub use device::{CpuInfo, ProgrammerInfo, Signature};
pub use error::{Desync, Error};
pub use image::Page;
pub use protocol::Variant;

use link::Link;
use protocol::Engine;

/// Serial port carrying the bootloader link
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
    fn set_baud(&mut self, baud: u32) -> Result<(), E>;

    /// Time a `read` with nothing to return blocks before `WouldBlock`
    fn read_wait_ms(&self) -> u32 {
        0
    }
}

/// Session state
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionState {
    /// Not opened, or closed
    Closed,
    /// Port configured, bootloader not yet in sync
    Open,
    /// In sync, page operations allowed
    InBootloader,
    /// Unrecoverable failure, only `close` is valid
    Error,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Idle time allowed while receiving one bootloader response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to hold DTR / RTS asserted when resetting the device
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub reset_delay_ms: u32,

    /// Period to wait for bootloader init after reset
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub init_delay_ms: u32,

    /// Attempts per command (defaults to 5 for stk500v1, 3 for stk500v2)
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub retries: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 500,
            poll_delay_ms: 1,
            reset_delay_ms: 50,
            init_delay_ms: 50,
            retries: None,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: SessionState,
    options: Options,
    link: Option<Link<P, D, E>>,
    engine: Engine,
    signature: Option<Signature>,
    cpu: Option<CpuInfo>,
    programmer: Option<ProgrammerInfo>,
    left: bool,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance for the given protocol variant
    pub fn new(port: P, delay: D, variant: Variant, options: Options) -> Self {
        let attempts = options.retries.unwrap_or_else(|| variant.default_attempts());
        let link = Link::new(port, delay, &options);

        Self {
            state: SessionState::Closed,
            options,
            link: Some(link),
            engine: Engine::new(variant, attempts),
            signature: None,
            cpu: None,
            programmer: None,
            left: false,
        }
    }

    /// Fetch the session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn variant(&self) -> Variant {
        self.engine.variant()
    }

    /// Device geometry, once `cpu_signature` has succeeded
    pub fn cpu_info(&self) -> Option<&CpuInfo> {
        self.cpu.as_ref()
    }

    /// Raw signature, once read (also set for unknown devices)
    pub fn signature(&self) -> Option<Signature> {
        self.signature
    }

    /// Bootloader identification, once `board_request` has succeeded
    pub fn programmer_info(&self) -> Option<&ProgrammerInfo> {
        self.programmer.as_ref()
    }

    /// Configure the port, reset the board and synchronise with the bootloader
    pub fn open(&mut self, baud: u32) -> Result<(), Error<E>> {
        if self.state != SessionState::Closed {
            return Err(Error::State(self.state));
        }
        let link = match self.link.as_mut() {
            Some(l) => l,
            None => return Err(Error::State(SessionState::Closed)),
        };

        info!("Opening {} bootloader at {} baud", self.engine.variant(), baud);

        if let Err(e) = link.set_baud(baud) {
            self.state = SessionState::Error;
            return Err(e);
        }
        self.state = SessionState::Open;

        let res = Self::connect(&self.options, &mut self.engine, link);
        match &res {
            Ok(_) => {
                info!("Bootloader connected");
                self.state = SessionState::InBootloader;
                self.left = false;
            }
            Err(e) => {
                error!("Error connecting to bootloader: {}", e);
                self.state = SessionState::Error;
            }
        }

        res
    }

    fn connect(options: &Options, engine: &mut Engine, link: &mut Link<P, D, E>) -> Result<(), Error<E>> {
        if !options.no_reset {
            link.reset(options.reset_delay_ms, options.init_delay_ms)?;
        }

        // Discard anything generated by the reset
        link.drain()?;

        debug!("Awaiting bootloader sync");
        engine.sync(link)
    }

    /// Read the bootloader name and versions
    pub fn board_request(&mut self) -> Result<ProgrammerInfo, Error<E>> {
        let info = self.exec(|engine, link| engine.board_request(link))?;

        debug!(
            "Bootloader '{}' sw {} hw {}",
            info.name,
            info.sw_version_string(),
            info.hw_version
        );
        self.programmer = Some(info.clone());

        Ok(info)
    }

    /// Read the device signature and look up its flash geometry
    pub fn cpu_signature(&mut self) -> Result<CpuInfo, Error<E>> {
        let signature = self.exec(|engine, link| engine.signature(link))?;
        self.signature = Some(signature);

        match device::lookup(signature) {
            Some(cpu) => {
                debug!("Signature {}: {}", signature, cpu.name);
                self.cpu = Some(cpu);
                Ok(cpu)
            }
            None => {
                warn!("Unknown device signature {}", signature);
                self.cpu = None;
                Err(Error::UnknownDevice(signature))
            }
        }
    }

    /// Write one page of flash at the given byte address
    pub fn write_memory(&mut self, data: &[u8], address: u32) -> Result<(), Error<E>> {
        self.check_page(address, data.len())?;

        debug!("Writing {} bytes at 0x{:05x}", data.len(), address);
        self.exec(|engine, link| engine.write_page(link, address, data))
    }

    /// Read `size` bytes of flash from the given byte address
    pub fn read_memory(&mut self, address: u32, size: usize) -> Result<Vec<u8>, Error<E>> {
        self.check_page(address, size)?;

        debug!("Reading {} bytes at 0x{:05x}", size, address);
        self.exec(|engine, link| engine.read_page(link, address, size))
    }

    /// Leave programming mode and start the application.
    ///
    /// Calling this again once the bootloader has been left is a no-op.
    pub fn leave_bootloader(&mut self) -> Result<(), Error<E>> {
        if self.left {
            debug!("Bootloader already left");
            return Ok(());
        }

        info!("Leaving bootloader");
        self.exec(|engine, link| engine.leave(link))?;
        self.left = true;

        Ok(())
    }

    /// Release the serial port, valid from any state
    pub fn close(&mut self) -> Option<P> {
        info!("Closing programmer");

        self.state = SessionState::Closed;
        self.signature = None;
        self.cpu = None;
        self.programmer = None;
        self.left = false;

        self.link.take().map(Link::into_port)
    }

    /// A page must lie within one device page and within flash.
    ///
    /// Page geometry comes from the CPU table, so nothing is sent until
    /// `cpu_signature` has identified the device.
    fn check_page(&self, address: u32, len: usize) -> Result<(), Error<E>> {
        self.ready()?;

        let cpu = match &self.cpu {
            Some(c) => c,
            None => return Err(Error::NoDevice),
        };

        if len == 0
            || address % cpu.page_size as u32 != 0
            || len > cpu.page_size as usize
            || address as u64 + len as u64 > cpu.flash_size as u64
        {
            return Err(Error::Address { address, len });
        }

        Ok(())
    }

    fn ready(&self) -> Result<(), Error<E>> {
        if self.state != SessionState::InBootloader {
            return Err(Error::State(self.state));
        }
        if self.left {
            return Err(Error::BootloaderLeft);
        }
        Ok(())
    }

    /// Run an operation that requires the bootloader, marking the session
    /// failed on fatal errors
    fn exec<T, F>(&mut self, f: F) -> Result<T, Error<E>>
    where
        F: FnOnce(&mut Engine, &mut Link<P, D, E>) -> Result<T, Error<E>>,
    {
        self.ready()?;
        let link = match self.link.as_mut() {
            Some(l) => l,
            None => return Err(Error::State(SessionState::Closed)),
        };

        let res = f(&mut self.engine, link);

        if let Err(e) = &res {
            if e.is_fatal() {
                error!("Fatal programmer error: {}", e);
                self.state = SessionState::Error;
            }
        }

        res
    }
}
