//! STK500v1, as spoken by ATmegaBOOT and Optiboot.
//!
//! Commands are a single opcode followed by parameters and terminated with
//! `CRC_EOP`. Responses are bracketed by `INSYNC` ... `OK`. There is no
//! checksum, a response that does not open with `INSYNC` means the two ends
//! have lost sync.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use super::retry;
use crate::device::{ProgrammerInfo, Signature};
use crate::error::Desync;
use crate::link::Link;
use crate::{Error, SerialPort};

pub const CRC_EOP: u8 = 0x20;

pub const RESP_STK_OK: u8 = 0x10;
pub const RESP_STK_FAILED: u8 = 0x11;
pub const RESP_STK_IN_SYNC: u8 = 0x14;
pub const RESP_STK_NOSYNC: u8 = 0x15;

/// Memory type selector for page commands
pub const MEMTYPE_FLASH: u8 = b'F';

/// Longest sign-on string accepted ("AVR ISP" from ATmegaBOOT)
pub const MAX_SIGN_ON: usize = 16;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Command {
    /// Synchronise with the bootloader
    GetSync = 0x30,
    /// Fetch the programmer name, Optiboot replies with an empty string
    GetSignOn = 0x31,
    /// Read a programmer parameter
    GetParameter = 0x41,
    /// Leave programming mode and start the application
    LeaveProgmode = 0x51,
    /// Set the word address for the next page command
    LoadAddress = 0x55,
    /// Program a page of memory
    ProgPage = 0x64,
    /// Read a page of memory
    ReadPage = 0x74,
    /// Read the three signature bytes
    ReadSign = 0x75,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Parameter {
    HwVersion = 0x80,
    SwMajor = 0x81,
    SwMinor = 0x82,
}

/// Build a command frame
pub fn encode(command: Command, params: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(params.len() + 2);
    frame.push(command as u8);
    frame.extend_from_slice(params);
    frame.push(CRC_EOP);
    frame
}

/// Strip `INSYNC` / `OK` from a response, returning the payload
pub fn decode(response: &[u8]) -> Result<&[u8], Desync> {
    match response.first() {
        Some(&RESP_STK_IN_SYNC) => (),
        Some(&b) => return Err(Desync::NotInSync(b)),
        None => {
            return Err(Desync::Length {
                expected: 2,
                actual: 0,
            })
        }
    }

    if response.len() < 2 {
        return Err(Desync::Length {
            expected: 2,
            actual: response.len(),
        });
    }

    match response[response.len() - 1] {
        RESP_STK_OK => Ok(&response[1..response.len() - 1]),
        b => Err(Desync::NotOk(b)),
    }
}

/// `LOAD_ADDRESS` frame for a byte address.
///
/// Flash is addressed in little-endian 16 bit words, so odd addresses and
/// anything past 128 KiB cannot be expressed.
pub fn load_address(address: u32) -> Option<Vec<u8>> {
    if address % 2 != 0 || address / 2 > 0xFFFF {
        return None;
    }
    let word = (address / 2) as u16;
    Some(encode(Command::LoadAddress, &word.to_le_bytes()))
}

/// `PROG_PAGE` frame writing `data` to flash
pub fn prog_page(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u16;
    let mut params = Vec::with_capacity(data.len() + 3);
    params.extend_from_slice(&len.to_be_bytes());
    params.push(MEMTYPE_FLASH);
    params.extend_from_slice(data);
    encode(Command::ProgPage, &params)
}

/// `READ_PAGE` frame reading `len` bytes of flash
pub fn read_page(len: u16) -> Vec<u8> {
    let l = len.to_be_bytes();
    encode(Command::ReadPage, &[l[0], l[1], MEMTYPE_FLASH])
}

/// STK500v1 protocol engine
pub(crate) struct Stk500v1 {
    attempts: u32,
}

impl Stk500v1 {
    pub fn new(attempts: u32) -> Self {
        Self { attempts }
    }

    /// Send a frame and read back a response carrying `len` payload bytes
    fn exchange<P, D, E>(
        &mut self,
        link: &mut Link<P, D, E>,
        frame: &[u8],
        len: usize,
    ) -> Result<Vec<u8>, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        link.drain()?;

        trace!("v1 tx: {:02x?}", frame);
        link.write_all(frame)?;

        let mut resp = vec![0u8; len + 2];

        // Check the leading byte first so FAILED / NOSYNC fail fast
        resp[0] = link.read_byte()?;
        if resp[0] != RESP_STK_IN_SYNC {
            debug!("Received 0x{:02x} in place of INSYNC", resp[0]);
            return Err(Error::Desync(Desync::NotInSync(resp[0])));
        }
        link.read_exact(&mut resp[1..])?;

        trace!("v1 rx: {:02x?}", resp);
        let payload = decode(&resp).map_err(Error::Desync)?;

        Ok(payload.to_vec())
    }

    /// Send a frame and read a response of unknown length, up to `max` bytes
    fn exchange_until_ok<P, D, E>(
        &mut self,
        link: &mut Link<P, D, E>,
        frame: &[u8],
        max: usize,
    ) -> Result<Vec<u8>, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        link.drain()?;
        link.write_all(frame)?;

        let b = link.read_byte()?;
        if b != RESP_STK_IN_SYNC {
            return Err(Error::Desync(Desync::NotInSync(b)));
        }

        let mut payload = Vec::new();
        loop {
            match link.read_byte()? {
                RESP_STK_OK => return Ok(payload),
                b if payload.len() < max => payload.push(b),
                b => return Err(Error::Desync(Desync::NotOk(b))),
            }
        }
    }

    fn parameter<P, D, E>(&mut self, link: &mut Link<P, D, E>, p: Parameter) -> Result<u8, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let frame = encode(Command::GetParameter, &[p as u8]);
        let v = retry(self.attempts, "get parameter", || self.exchange(link, &frame, 1))?;
        Ok(v[0])
    }

    pub fn sync<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let frame = encode(Command::GetSync, &[]);
        retry(self.attempts, "sync", || self.exchange(link, &frame, 0))?;

        debug!("Bootloader in sync");
        Ok(())
    }

    pub fn board_request<P, D, E>(
        &mut self,
        link: &mut Link<P, D, E>,
    ) -> Result<ProgrammerInfo, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let hw_version = self.parameter(link, Parameter::HwVersion)?;
        let major = self.parameter(link, Parameter::SwMajor)?;
        let minor = self.parameter(link, Parameter::SwMinor)?;

        let frame = encode(Command::GetSignOn, &[]);
        let name = retry(self.attempts, "sign on", || {
            self.exchange_until_ok(link, &frame, MAX_SIGN_ON)
        })?;

        Ok(ProgrammerInfo {
            name: String::from_utf8_lossy(&name).into_owned(),
            sw_version: (major, minor),
            hw_version,
        })
    }

    pub fn signature<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<Signature, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let frame = encode(Command::ReadSign, &[]);
        let s = retry(self.attempts, "read signature", || self.exchange(link, &frame, 3))?;

        Ok(Signature([s[0], s[1], s[2]]))
    }

    pub fn write_page<P, D, E>(
        &mut self,
        link: &mut Link<P, D, E>,
        address: u32,
        data: &[u8],
    ) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let load = load_address(address).ok_or(Error::Address {
            address,
            len: data.len(),
        })?;
        let prog = prog_page(data);

        // The address is re-sent on every attempt, the bootloader may have
        // advanced it while handling a failed one
        retry(self.attempts, "write page", || {
            self.exchange(link, &load, 0)?;
            self.exchange(link, &prog, 0)?;
            Ok(())
        })
    }

    pub fn read_page<P, D, E>(
        &mut self,
        link: &mut Link<P, D, E>,
        address: u32,
        len: usize,
    ) -> Result<Vec<u8>, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let load = load_address(address).ok_or(Error::Address { address, len })?;
        let read = read_page(len as u16);

        retry(self.attempts, "read page", || {
            self.exchange(link, &load, 0)?;
            self.exchange(link, &read, len)
        })
    }

    pub fn leave<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let frame = encode(Command::LeaveProgmode, &[]);
        retry(self.attempts, "leave programming mode", || self.exchange(link, &frame, 0))?;
        Ok(())
    }
}
