//! STK500 protocol variants
//!
//! Both variants expose the same operations; [`Engine`] dispatches to the one
//! selected when the programmer is constructed.

use core::fmt::{self, Debug};
use core::str::FromStr;

use embedded_hal::blocking::delay::DelayMs;

use crate::device::{ProgrammerInfo, Signature};
use crate::link::Link;
use crate::{Error, SerialPort};

pub mod stk500v1;
pub mod stk500v2;

pub(crate) use stk500v1::Stk500v1;
pub(crate) use stk500v2::Stk500v2;

/// Bootloader protocol variant
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Variant {
    /// ATmegaBOOT / Optiboot (Uno, Nano, Duemilanove...)
    Stk500v1,
    /// Arduino stk500v2 bootloader (Mega 1280 / 2560)
    Stk500v2,
}

impl Variant {
    /// Baud rate the stock bootloader runs at.
    ///
    /// Optiboot speaks STK500v1 at 115200, override the baud rate for it.
    pub fn default_baud(&self) -> u32 {
        match self {
            Variant::Stk500v1 => 57600,
            Variant::Stk500v2 => 115200,
        }
    }

    /// Attempts per command before a failure is reported
    pub fn default_attempts(&self) -> u32 {
        match self {
            Variant::Stk500v1 => 5,
            Variant::Stk500v2 => 3,
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stk500v1" | "v1" | "arduino" => Ok(Variant::Stk500v1),
            "stk500v2" | "v2" | "wiring" => Ok(Variant::Stk500v2),
            _ => Err(format!("unsupported programmer '{}' (expected stk500v1 or stk500v2)", s)),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Stk500v1 => write!(f, "stk500v1"),
            Variant::Stk500v2 => write!(f, "stk500v2"),
        }
    }
}

/// Selected protocol engine
pub(crate) enum Engine {
    V1(Stk500v1),
    V2(Stk500v2),
}

impl Engine {
    pub fn new(variant: Variant, attempts: u32) -> Self {
        match variant {
            Variant::Stk500v1 => Engine::V1(Stk500v1::new(attempts)),
            Variant::Stk500v2 => Engine::V2(Stk500v2::new(attempts)),
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            Engine::V1(_) => Variant::Stk500v1,
            Engine::V2(_) => Variant::Stk500v2,
        }
    }

    pub fn sync<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        match self {
            Engine::V1(e) => e.sync(link),
            Engine::V2(e) => e.sync(link),
        }
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
        match self {
            Engine::V1(e) => e.board_request(link),
            Engine::V2(e) => e.board_request(link),
        }
    }

    pub fn signature<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<Signature, Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        match self {
            Engine::V1(e) => e.signature(link),
            Engine::V2(e) => e.signature(link),
        }
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
        match self {
            Engine::V1(e) => e.write_page(link, address, data),
            Engine::V2(e) => e.write_page(link, address, data),
        }
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
        match self {
            Engine::V1(e) => e.read_page(link, address, len),
            Engine::V2(e) => e.read_page(link, address, len),
        }
    }

    pub fn leave<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: Debug,
    {
        match self {
            Engine::V1(e) => e.leave(link),
            Engine::V2(e) => e.leave(link),
        }
    }
}

/// Run `f` up to `attempts` times, retrying immediately on timeout or desync
pub(crate) fn retry<T, E, F>(attempts: u32, what: &str, mut f: F) -> Result<T, Error<E>>
where
    E: Debug,
    F: FnMut() -> Result<T, Error<E>>,
{
    let mut last = Error::Timeout;

    for attempt in 1..=attempts.max(1) {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() => {
                debug!("{} attempt {}/{} failed: {}", what, attempt, attempts, e);
                last = e;
            }
            Err(e) => return Err(e),
        }
    }

    warn!("{} failed after {} attempts", what, attempts);
    Err(last)
}
