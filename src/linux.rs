use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl, Parity,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::{Options, Programmer, SerialPort, Variant};

/// Port level read timeout, short so response polling stays in control
const PORT_TIMEOUT_MS: u32 = 1;

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        SerialErrorKind::NoDevice => IoErrorKind::NotFound,
        SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        SerialErrorKind::Io(k) => k,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), IoErrorKind> {
        let mut settings = self.0.read_settings().map_err(io_kind)?;
        settings
            .set_baud_rate(BaudRate::from_speed(baud as usize))
            .map_err(io_kind)?;
        self.0.write_settings(&settings).map_err(io_kind)
    }

    fn read_wait_ms(&self) -> u32 {
        PORT_TIMEOUT_MS
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance.
    ///
    /// The port is configured 8N1 at the variant's default baud rate,
    /// `open` applies the rate actually used.
    pub fn linux<P: AsRef<Path>>(
        port: P,
        variant: Variant,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(variant.default_baud() as usize))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(Duration::from_millis(PORT_TIMEOUT_MS as u64))?;

        // Return instance
        Ok(Self::new(port, Delay {}, variant, options))
    }
}
