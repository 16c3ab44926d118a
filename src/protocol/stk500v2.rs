//! STK500v2, as spoken by the Arduino Mega (wiring) bootloader.
//!
//! Messages are wrapped as
//! `[MESSAGE_START, seq, len_hi, len_lo, TOKEN, body.., checksum]` where the
//! body is `len` bytes long and the checksum is the XOR of every byte before
//! it. Answers echo the sequence number and open with the command they answer
//! followed by a status byte.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;

use super::retry;
use crate::device::{ProgrammerInfo, Signature};
use crate::error::Desync;
use crate::link::Link;
use crate::{Error, SerialPort};

pub const MESSAGE_START: u8 = 0x1B;
pub const TOKEN: u8 = 0x0E;

pub const STATUS_CMD_OK: u8 = 0x00;

/// Start, sequence, two length bytes and token
pub const HEADER_LEN: usize = 5;

/// Largest body accepted from the device
pub const MAX_BODY_LEN: usize = 512;

/// Load address flag selecting extended (> 128 KiB) addressing
pub const LOAD_EXTENDED: u32 = 0x8000_0000;

/// ISP "read signature byte" instruction carried by `SPI_MULTI`
pub const ISP_READ_SIGNATURE: u8 = 0x30;

/// Offset of the answer byte in an `SPI_MULTI` answer
const SPI_MULTI_RESULT: usize = 3;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Command {
    /// Synchronise and fetch the programmer name
    SignOn = 0x01,
    /// Read a programmer parameter
    GetParameter = 0x03,
    /// Set the word address for the next flash command
    LoadAddress = 0x06,
    /// Leave programming mode and start the application
    LeaveProgmodeIsp = 0x11,
    /// Program a page of flash
    ProgramFlashIsp = 0x13,
    /// Read a page of flash
    ReadFlashIsp = 0x14,
    /// Raw ISP instruction, used here to read signature bytes
    SpiMulti = 0x1D,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Parameter {
    HwVersion = 0x90,
    SwMajor = 0x91,
    SwMinor = 0x92,
}

/// XOR of all bytes
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |c, b| c ^ b)
}

/// Build a message frame
pub fn encode(seq: u8, command: Command, params: &[u8]) -> Vec<u8> {
    let len = (params.len() + 1) as u16;
    let l = len.to_be_bytes();

    let mut frame = Vec::with_capacity(HEADER_LEN + params.len() + 2);
    frame.extend_from_slice(&[MESSAGE_START, seq, l[0], l[1], TOKEN, command as u8]);
    frame.extend_from_slice(params);
    frame.push(checksum(&frame));

    frame
}

/// Validate a received header, returning the body length
pub fn body_len(header: &[u8; HEADER_LEN]) -> Result<usize, Desync> {
    if header[0] != MESSAGE_START {
        return Err(Desync::Start(header[0]));
    }
    if header[4] != TOKEN {
        return Err(Desync::Token(header[4]));
    }

    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if len == 0 || len > MAX_BODY_LEN {
        return Err(Desync::Length {
            expected: MAX_BODY_LEN,
            actual: len,
        });
    }

    Ok(len)
}

/// Validate a complete frame against the expected sequence number,
/// returning the message body
pub fn decode(frame: &[u8], expected_seq: u8) -> Result<&[u8], Desync> {
    if frame.len() < HEADER_LEN + 1 {
        return Err(Desync::Length {
            expected: HEADER_LEN + 1,
            actual: frame.len(),
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&frame[..HEADER_LEN]);
    let len = body_len(&header)?;

    if frame.len() != HEADER_LEN + len + 1 {
        return Err(Desync::Length {
            expected: HEADER_LEN + len + 1,
            actual: frame.len(),
        });
    }

    let (data, check) = frame.split_at(frame.len() - 1);
    let expected = checksum(data);
    if check[0] != expected {
        return Err(Desync::Checksum {
            expected,
            actual: check[0],
        });
    }

    if frame[1] != expected_seq {
        return Err(Desync::Sequence {
            expected: expected_seq,
            actual: frame[1],
        });
    }

    Ok(&frame[HEADER_LEN..HEADER_LEN + len])
}

/// Check a message body answers `command` successfully, returning the
/// payload following the status byte
pub fn answer(body: &[u8], command: Command) -> Result<&[u8], Desync> {
    if body.len() < 2 {
        return Err(Desync::Length {
            expected: 2,
            actual: body.len(),
        });
    }
    if body[0] != command as u8 {
        return Err(Desync::Answer {
            expected: command as u8,
            actual: body[0],
        });
    }
    if body[1] != STATUS_CMD_OK {
        return Err(Desync::Status(body[1]));
    }

    Ok(&body[2..])
}

/// `LOAD_ADDRESS` parameters for a byte address (big-endian word address)
pub fn load_address(address: u32) -> Option<[u8; 4]> {
    if address % 2 != 0 {
        return None;
    }
    Some(((address / 2) | LOAD_EXTENDED).to_be_bytes())
}

/// `PROGRAM_FLASH_ISP` parameters.
///
/// The mode, delay and ISP instruction bytes are ignored by the bootloader
/// and sent as zero.
pub fn program_flash(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u16;
    let mut params = Vec::with_capacity(data.len() + 9);
    params.extend_from_slice(&len.to_be_bytes());
    params.extend_from_slice(&[0u8; 7]);
    params.extend_from_slice(data);
    params
}

/// `READ_FLASH_ISP` parameters
pub fn read_flash(len: u16) -> [u8; 3] {
    let l = len.to_be_bytes();
    [l[0], l[1], 0x20]
}

/// `SPI_MULTI` parameters reading signature byte `index`
pub fn read_signature(index: u8) -> [u8; 7] {
    [4, 4, 0, ISP_READ_SIGNATURE, 0, index, 0]
}

/// STK500v2 protocol engine
pub(crate) struct Stk500v2 {
    attempts: u32,
    sequence: u8,
    sign_on: Option<String>,
}

impl Stk500v2 {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            sequence: 0,
            sign_on: None,
        }
    }

    /// Send one command and return the payload of its answer
    fn transact<P, D, E>(
        &mut self,
        link: &mut Link<P, D, E>,
        command: Command,
        params: &[u8],
    ) -> Result<Vec<u8>, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        link.drain()?;

        self.sequence = self.sequence.wrapping_add(1);
        let seq = self.sequence;

        let frame = encode(seq, command, params);
        trace!("v2 tx: {:02x?}", frame);
        link.write_all(&frame)?;

        let mut header = [0u8; HEADER_LEN];
        header[0] = link.read_byte()?;
        if header[0] != MESSAGE_START {
            debug!("Received 0x{:02x} in place of message start", header[0]);
            return Err(Error::Desync(Desync::Start(header[0])));
        }
        link.read_exact(&mut header[1..])?;

        let len = body_len(&header).map_err(Error::Desync)?;

        let mut resp = vec![0u8; HEADER_LEN + len + 1];
        resp[..HEADER_LEN].copy_from_slice(&header);
        link.read_exact(&mut resp[HEADER_LEN..])?;
        trace!("v2 rx: {:02x?}", resp);

        let body = decode(&resp, seq).map_err(Error::Desync)?;
        let payload = answer(body, command).map_err(Error::Desync)?;

        Ok(payload.to_vec())
    }

    fn parameter<P, D, E>(&mut self, link: &mut Link<P, D, E>, p: Parameter) -> Result<u8, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let v = retry(self.attempts, "get parameter", || {
            self.transact(link, Command::GetParameter, &[p as u8])
        })?;

        v.first()
            .copied()
            .ok_or(Error::Desync(Desync::Length {
                expected: 1,
                actual: 0,
            }))
    }

    pub fn sync<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        let body = retry(self.attempts, "sign on", || {
            self.transact(link, Command::SignOn, &[])
        })?;

        // [name_len, name..]
        let name = match body.split_first() {
            Some((&n, rest)) => &rest[..(n as usize).min(rest.len())],
            None => &[][..],
        };
        let name = String::from_utf8_lossy(name).into_owned();
        debug!("Signed on to '{}'", name);

        self.sign_on = Some(name);

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

        Ok(ProgrammerInfo {
            name: self.sign_on.clone().unwrap_or_default(),
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
        let mut sig = [0u8; 3];

        for (i, s) in sig.iter_mut().enumerate() {
            let params = read_signature(i as u8);
            let a = retry(self.attempts, "read signature", || {
                self.transact(link, Command::SpiMulti, &params)
            })?;

            *s = *a.get(SPI_MULTI_RESULT).ok_or(Error::Desync(Desync::Length {
                expected: SPI_MULTI_RESULT + 1,
                actual: a.len(),
            }))?;
        }

        Ok(Signature(sig))
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
        let prog = program_flash(data);

        retry(self.attempts, "write page", || {
            self.transact(link, Command::LoadAddress, &load)?;
            self.transact(link, Command::ProgramFlashIsp, &prog)?;
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
        let read = read_flash(len as u16);

        retry(self.attempts, "read page", || {
            self.transact(link, Command::LoadAddress, &load)?;
            let mut data = self.transact(link, Command::ReadFlashIsp, &read)?;

            // Data is followed by a second status byte
            if data.len() != len + 1 {
                return Err(Error::Desync(Desync::Length {
                    expected: len + 1,
                    actual: data.len(),
                }));
            }
            match data.pop() {
                Some(STATUS_CMD_OK) => Ok(data),
                Some(s) => Err(Error::Desync(Desync::Status(s))),
                None => Err(Error::Timeout),
            }
        })
    }

    pub fn leave<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        retry(self.attempts, "leave programming mode", || {
            self.transact(link, Command::LeaveProgmodeIsp, &[1, 1])
        })?;
        Ok(())
    }
}
