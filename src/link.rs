//! Byte level access to the bootloader over a polled serial port

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::{Error, Options, SerialPort};

/// Upper bound on bytes discarded by a single drain, a babbling line must not
/// stall the programmer forever
const MAX_DRAIN: usize = 4096;

pub(crate) struct Link<P, D, E> {
    port: P,
    delay: D,
    response_timeout_ms: u32,
    poll_delay_ms: u32,
    /// Idle time spent on the current response
    waited: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> Link<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    pub fn new(port: P, delay: D, options: &Options) -> Self {
        Self {
            port,
            delay,
            response_timeout_ms: options.response_timeout_ms,
            poll_delay_ms: options.poll_delay_ms.max(1),
            waited: 0,
            _err: PhantomData,
        }
    }

    pub fn into_port(self) -> P {
        self.port
    }

    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error<E>> {
        self.port.set_baud(baud)?;
        Ok(())
    }

    /// Pulse DTR / RTS to reset the board into its bootloader
    pub fn reset(&mut self, hold_ms: u32, settle_ms: u32) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(hold_ms);

        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;

        self.delay.delay_ms(settle_ms);

        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        // The response window opens once the command is out
        self.waited = 0;

        Ok(())
    }

    /// Read the next byte of a response.
    ///
    /// Idle time, including any time the port blocks in `read`, is charged
    /// to a single budget per response rather than per byte.
    pub fn read_byte(&mut self) -> Result<u8, Error<E>> {
        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.poll_delay_ms);
            self.waited = self
                .waited
                .saturating_add(self.poll_delay_ms + self.port.read_wait_ms());

            if self.waited > self.response_timeout_ms {
                debug!("Receive timeout");
                return Err(Error::Timeout);
            }
        }
    }

    pub fn read_exact(&mut self, buff: &mut [u8]) -> Result<(), Error<E>> {
        for b in buff.iter_mut() {
            *b = self.read_byte()?;
        }
        Ok(())
    }

    /// Discard anything already waiting in the receive path
    pub fn drain(&mut self) -> Result<usize, Error<E>> {
        let mut n = 0;

        while n < MAX_DRAIN {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }

        if n > 0 {
            debug!("Discarded {} stale bytes", n);
        }

        Ok(n)
    }
}
