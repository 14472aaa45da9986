//! Device infrastructure: the serial controller and the port scanner used
//! by the `devgate` binary.

pub mod port_scanner;
pub mod serial_controller;

pub use port_scanner::SerialPortScanner;
pub use serial_controller::{SerialControllerFactory, SerialDeviceController};
