//! Simulated AVR bootloader behind a mock serial port
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use avr_stk500_loader::{Options, Programmer, SerialPort, Variant};

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct MockError;

/// Misbehaviour applied to successive responses
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Fault {
    /// v1: NOSYNC in place of INSYNC, v2: checksum flipped
    Corrupt,
    /// Command handled, no response sent
    Silent,
    /// v2: previous sequence number echoed
    StaleSequence,
}

pub struct Device {
    pub variant: Variant,
    /// Rate the bootloader listens at
    pub baud: u32,
    pub signature: [u8; 3],
    pub sign_on: String,
    pub hw_version: u8,
    pub sw_version: (u8, u8),
    pub flash: Vec<u8>,

    pub faults: VecDeque<Fault>,
    /// Bytes emitted by the board coming out of reset
    pub reset_noise: Vec<u8>,
    pub disconnected: bool,
    /// Polls that see nothing before each response byte arrives
    pub byte_gap: u32,
    /// Time an empty read blocks in the port
    pub read_wait_ms: u32,
    /// Total time spent blocked in empty reads
    pub port_waited: u64,

    pub port_baud: u32,
    pub frames: Vec<Vec<u8>>,
    pub resets: u32,
    pub left: bool,

    rx: Vec<u8>,
    tx: VecDeque<u8>,
    word_address: u32,
    dtr: bool,
    gap_left: u32,
}

impl Device {
    /// Uno style board running ATmegaBOOT at 57600
    pub fn atmega328p() -> Self {
        Self::new(Variant::Stk500v1, 57600, [0x1E, 0x95, 0x0F], 32 * 1024, "AVR ISP")
    }

    /// Uno style board running Optiboot at 115200
    pub fn optiboot() -> Self {
        Self::new(Variant::Stk500v1, 115200, [0x1E, 0x95, 0x0F], 32 * 1024, "")
    }

    /// Mega 2560 running the stk500v2 bootloader
    pub fn atmega2560() -> Self {
        Self::new(Variant::Stk500v2, 115200, [0x1E, 0x98, 0x01], 256 * 1024, "AVRISP_2")
    }

    pub fn new(variant: Variant, baud: u32, signature: [u8; 3], flash: usize, sign_on: &str) -> Self {
        Self {
            variant,
            baud,
            signature,
            sign_on: sign_on.to_string(),
            hw_version: 2,
            sw_version: (2, 10),
            flash: vec![0xFF; flash],
            faults: VecDeque::new(),
            reset_noise: vec![],
            disconnected: false,
            byte_gap: 0,
            read_wait_ms: 0,
            port_waited: 0,
            port_baud: 0,
            frames: vec![],
            resets: 0,
            left: false,
            rx: vec![],
            tx: VecDeque::new(),
            word_address: 0,
            dtr: false,
            gap_left: 0,
        }
    }

    pub fn fail_next(&mut self, fault: Fault, n: usize) {
        for _ in 0..n {
            self.faults.push_back(fault);
        }
    }

    /// Frames received with the given command byte
    pub fn frames_with(&self, command: u8) -> Vec<&Vec<u8>> {
        let offset = match self.variant {
            Variant::Stk500v1 => 0,
            Variant::Stk500v2 => 5,
        };
        self.frames
            .iter()
            .filter(|f| f.get(offset) == Some(&command))
            .collect()
    }

    fn receive(&mut self, b: u8) {
        if self.port_baud != self.baud {
            // Garbled on the wire, the bootloader never sees a valid frame
            return;
        }
        self.rx.push(b);

        match self.variant {
            Variant::Stk500v1 => self.parse_v1(),
            Variant::Stk500v2 => self.parse_v2(),
        }
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.rx.clear();
        self.tx.clear();
        self.left = false;
        let noise = self.reset_noise.clone();
        self.tx.extend(noise);
    }

    fn write_flash(&mut self, data: &[u8]) {
        let a = self.word_address as usize * 2;
        self.flash[a..a + data.len()].copy_from_slice(data);
    }

    fn read_flash(&self, len: usize) -> Vec<u8> {
        let a = self.word_address as usize * 2;
        self.flash[a..a + len].to_vec()
    }

    fn parse_v1(&mut self) {
        let needed = match self.rx[0] {
            0x30 | 0x31 | 0x51 | 0x75 => 2,
            0x41 => 3,
            0x55 => 4,
            0x74 => 5,
            0x64 if self.rx.len() >= 3 => 5 + u16::from_be_bytes([self.rx[1], self.rx[2]]) as usize,
            0x64 => return,
            _ => {
                self.rx.clear();
                self.respond_v1(vec![0x15]);
                return;
            }
        };
        if self.rx.len() < needed {
            return;
        }

        let frame: Vec<u8> = self.rx.drain(..needed).collect();
        self.frames.push(frame.clone());

        if frame[needed - 1] != 0x20 {
            self.respond_v1(vec![0x15]);
            return;
        }

        let payload: Vec<u8> = match frame[0] {
            0x30 => vec![],
            0x31 => self.sign_on.as_bytes().to_vec(),
            0x41 => match frame[1] {
                0x80 => vec![self.hw_version],
                0x81 => vec![self.sw_version.0],
                0x82 => vec![self.sw_version.1],
                _ => vec![0],
            },
            0x51 => {
                self.left = true;
                vec![]
            }
            0x55 => {
                self.word_address = u16::from_le_bytes([frame[1], frame[2]]) as u32;
                vec![]
            }
            0x64 => {
                self.write_flash(&frame[4..needed - 1]);
                vec![]
            }
            0x74 => {
                let len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
                self.read_flash(len)
            }
            0x75 => self.signature.to_vec(),
            _ => unreachable!(),
        };

        let mut resp = vec![0x14];
        resp.extend(payload);
        resp.push(0x10);
        self.respond_v1(resp);
    }

    fn respond_v1(&mut self, mut resp: Vec<u8>) {
        match self.faults.pop_front() {
            None => (),
            Some(Fault::Silent) => return,
            Some(Fault::Corrupt) | Some(Fault::StaleSequence) => resp[0] = 0x15,
        }
        self.tx.extend(resp);
    }

    fn parse_v2(&mut self) {
        // Hunt for the start of a message
        while !self.rx.is_empty() && self.rx[0] != 0x1B {
            self.rx.remove(0);
        }
        if self.rx.len() < 5 {
            return;
        }
        let len = u16::from_be_bytes([self.rx[2], self.rx[3]]) as usize;
        if self.rx.len() < 5 + len + 1 {
            return;
        }

        let frame: Vec<u8> = self.rx.drain(..5 + len + 1).collect();
        self.frames.push(frame.clone());

        let check = frame[..frame.len() - 1].iter().fold(0, |c, b| c ^ b);
        if frame[4] != 0x0E || check != frame[frame.len() - 1] {
            // Bootloader drops bad frames silently
            return;
        }

        let seq = frame[1];
        let body = &frame[5..5 + len];
        let cmd = body[0];

        let answer: Vec<u8> = match cmd {
            0x01 => {
                let mut a = vec![0x01, 0x00, self.sign_on.len() as u8];
                a.extend(self.sign_on.as_bytes());
                a
            }
            0x03 => {
                let v = match body[1] {
                    0x90 => self.hw_version,
                    0x91 => self.sw_version.0,
                    0x92 => self.sw_version.1,
                    _ => 0,
                };
                vec![0x03, 0x00, v]
            }
            0x06 => {
                let a = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
                self.word_address = a & 0x7FFF_FFFF;
                vec![0x06, 0x00]
            }
            0x11 => {
                self.left = true;
                vec![0x11, 0x00]
            }
            0x13 => {
                let n = u16::from_be_bytes([body[1], body[2]]) as usize;
                let data = body[10..10 + n].to_vec();
                self.write_flash(&data);
                vec![0x13, 0x00]
            }
            0x14 => {
                let n = u16::from_be_bytes([body[1], body[2]]) as usize;
                let mut a = vec![0x14, 0x00];
                a.extend(self.read_flash(n));
                a.push(0x00);
                a
            }
            0x1D => vec![0x1D, 0x00, 0x00, body[4], 0x00, self.signature[body[6] as usize], 0x00],
            _ => vec![cmd, 0xC9],
        };

        self.respond_v2(seq, answer);
    }

    fn respond_v2(&mut self, seq: u8, answer: Vec<u8>) {
        let fault = self.faults.pop_front();
        let seq = match fault {
            Some(Fault::Silent) => return,
            Some(Fault::StaleSequence) => seq.wrapping_sub(1),
            _ => seq,
        };

        let len = (answer.len() as u16).to_be_bytes();
        let mut resp = vec![0x1B, seq, len[0], len[1], 0x0E];
        resp.extend(answer);
        let mut check = resp.iter().fold(0, |c, b| c ^ b);
        if fault == Some(Fault::Corrupt) {
            check ^= 0xFF;
        }
        resp.push(check);

        self.tx.extend(resp);
    }
}

pub struct MockPort(pub Rc<RefCell<Device>>);

impl Read<u8> for MockPort {
    type Error = MockError;

    fn read(&mut self) -> nb::Result<u8, MockError> {
        let mut d = self.0.borrow_mut();
        if d.disconnected {
            return Err(nb::Error::Other(MockError));
        }
        if d.tx.is_empty() || d.gap_left > 0 {
            let wait = d.read_wait_ms as u64;
            d.gap_left = d.gap_left.saturating_sub(1);
            d.port_waited += wait;
            return Err(nb::Error::WouldBlock);
        }
        d.gap_left = d.byte_gap;
        d.tx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for MockPort {
    type Error = MockError;

    fn write(&mut self, word: u8) -> nb::Result<(), MockError> {
        let mut d = self.0.borrow_mut();
        if d.disconnected {
            return Err(nb::Error::Other(MockError));
        }
        d.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), MockError> {
        Ok(())
    }
}

impl SerialPort<MockError> for MockPort {
    fn set_rts(&mut self, _level: bool) -> Result<(), MockError> {
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), MockError> {
        let mut d = self.0.borrow_mut();
        // Reset on release, as the auto-reset capacitor recharges
        if d.dtr && !level {
            d.reset();
        }
        d.dtr = level;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), MockError> {
        self.0.borrow_mut().port_baud = baud;
        Ok(())
    }

    fn read_wait_ms(&self) -> u32 {
        self.0.borrow().read_wait_ms
    }
}

/// Delay that only advances a virtual clock
#[derive(Clone, Default)]
pub struct MockDelay(pub Rc<Cell<u64>>);

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.0.set(self.0.get() + ms as u64);
    }
}

pub type TestProgrammer = Programmer<MockPort, MockDelay, MockError>;

pub fn options() -> Options {
    Options {
        response_timeout_ms: 20,
        ..Options::default()
    }
}

pub fn programmer(device: Device, options: Options) -> (TestProgrammer, Rc<RefCell<Device>>, MockDelay) {
    let variant = device.variant;
    let device = Rc::new(RefCell::new(device));
    let delay = MockDelay::default();

    let p = Programmer::new(MockPort(device.clone()), delay.clone(), variant, options);

    (p, device, delay)
}

/// Programmer opened at the device's baud rate
pub fn connected(device: Device) -> (TestProgrammer, Rc<RefCell<Device>>) {
    let baud = device.baud;
    let (mut p, d, _) = programmer(device, options());
    p.open(baud).expect("open");
    (p, d)
}
