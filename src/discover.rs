//! Serial port discovery for USB attached Arduino boards

use serialport::{SerialPortInfo, SerialPortType};

/// USB bridges found on Arduino boards, as (vid, pid, name)
pub const KNOWN_BRIDGES: &[(u16, u16, &str)] = &[
    (0x1A86, 0x7523, "CH340"),
    (0x2341, 0x0043, "Arduino Uno"),
];

/// First port in `ports` attached through a known bridge
pub fn select(ports: &[SerialPortInfo]) -> Option<&SerialPortInfo> {
    ports.iter().find(|p| match &p.port_type {
        SerialPortType::UsbPort(usb) => KNOWN_BRIDGES
            .iter()
            .any(|(vid, pid, _)| usb.vid == *vid && usb.pid == *pid),
        _ => false,
    })
}

/// Enumerate serial ports and return the name of the first known board
pub fn find_port() -> Result<Option<String>, serialport::Error> {
    let ports = serialport::available_ports()?;
    debug!("Found {} serial ports", ports.len());

    Ok(select(&ports).map(|p| {
        info!("Found board on {}", p.port_name);
        p.port_name.clone()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb(name: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: None,
                product: None,
            }),
        }
    }

    #[test]
    fn selects_known_bridge() {
        let ports = vec![
            SerialPortInfo {
                port_name: "/dev/ttyS0".to_string(),
                port_type: SerialPortType::Unknown,
            },
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyUSB1", 0x1A86, 0x7523),
            usb("/dev/ttyACM0", 0x2341, 0x0043),
        ];

        assert_eq!(select(&ports).map(|p| p.port_name.as_str()), Some("/dev/ttyUSB1"));
        assert_eq!(select(&ports[3..]).map(|p| p.port_name.as_str()), Some("/dev/ttyACM0"));
    }

    #[test]
    fn no_known_bridge() {
        let ports = vec![usb("/dev/ttyUSB0", 0x0403, 0x6001)];
        assert!(select(&ports).is_none());
        assert!(select(&[]).is_none());
    }
}
