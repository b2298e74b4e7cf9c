//! Low-level serial device access.
//!
//! The device is opened raw: 8N1, no flow control, no line discipline. The
//! read timeout doubles as the reader thread's tick, so a blocked read
//! resurfaces quickly enough to notice a termination request.

use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

pub fn open_port(
    device: &str,
    baud: u32,
    read_tick: Duration,
) -> anyhow::Result<Box<dyn SerialPort>> {
    let port = serialport::new(device, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(read_tick)
        .open()?;
    Ok(port)
}

/// Distinguish "no data within the tick" from a real device error.
pub fn is_idle_read(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
