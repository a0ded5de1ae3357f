//! Byte channels the debugger protocol runs over.

use {
    crate::{
        error::HypervisorError,
        platform::{AccessSize, Platform},
    },
    alloc::{collections::VecDeque, sync::Arc},
    spin::Mutex,
};

/// A byte channel to the debugger.
///
/// Every method takes the platform so that port I/O goes through the same seam as the rest of
/// the engine.
pub trait Transport: Send {
    fn send(&mut self, platform: &dyn Platform, bytes: &[u8]) -> Result<(), HypervisorError>;

    /// Waits for the next byte. `Ok(None)` means nothing arrived before the byte timeout.
    fn receive(&mut self, platform: &dyn Platform) -> Result<Option<u8>, HypervisorError>;

    /// Whether a byte is ready to be received.
    fn has_input(&mut self, platform: &dyn Platform) -> bool;
}

const UART_DATA: u16 = 0;
const UART_INTERRUPT_ENABLE: u16 = 1;
const UART_FIFO_CONTROL: u16 = 2;
const UART_LINE_CONTROL: u16 = 3;
const UART_MODEM_CONTROL: u16 = 4;
const UART_LINE_STATUS: u16 = 5;

const LINE_STATUS_DATA_READY: u32 = 1 << 0;
const LINE_STATUS_TRANSMIT_EMPTY: u32 = 1 << 5;

/// Base clock of the divisor latch.
const UART_CLOCK: u32 = 115_200;

/// A 16550 compatible UART driven by polling.
pub struct Uart16550 {
    port: u16,
    baud: u32,
    /// Line status polls before a byte is given up on.
    byte_timeout: u32,
}

impl Uart16550 {
    pub fn new(port: u16, baud: u32, byte_timeout: u32) -> Self {
        Self { port, baud: baud.clamp(1, UART_CLOCK), byte_timeout: byte_timeout.max(1) }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn out8(&self, platform: &dyn Platform, register: u16, value: u8) {
        platform.port_write(self.port.wrapping_add(register), AccessSize::Byte, u32::from(value));
    }

    fn in8(&self, platform: &dyn Platform, register: u16) -> u32 {
        platform.port_read(self.port.wrapping_add(register), AccessSize::Byte)
    }

    /// Programs the line as 8N1 at the configured speed with interrupts off.
    #[allow(clippy::identity_op)]
    pub fn initialize(&self, platform: &dyn Platform) {
        let divisor = (UART_CLOCK / self.baud) as u16;

        self.out8(platform, UART_INTERRUPT_ENABLE, 0x00); // Disable all interrupts
        self.out8(platform, UART_LINE_CONTROL, 0x80); // DLAB
        self.out8(platform, UART_DATA, divisor as u8); // Set divisor LOW
        self.out8(platform, UART_INTERRUPT_ENABLE, (divisor >> 8) as u8); // Set divisor HIGH
        self.out8(platform, UART_LINE_CONTROL, 0x03); // 8 data bits, 1 stop bit, no parity, DISABLE DLAB
        self.out8(platform, UART_FIFO_CONTROL, 0xC7); // Enable and clear FIFOs, 14 byte threshold
        self.out8(platform, UART_MODEM_CONTROL, 0x03); // Request to send, Data terminal ready

        log::info!("Serial port {:#x} ready at {} baud", self.port, self.baud);
    }
}

impl Transport for Uart16550 {
    fn send(&mut self, platform: &dyn Platform, bytes: &[u8]) -> Result<(), HypervisorError> {
        for byte in bytes {
            let mut polls = 0;
            while self.in8(platform, UART_LINE_STATUS) & LINE_STATUS_TRANSMIT_EMPTY == 0 {
                polls += 1;
                if polls >= self.byte_timeout {
                    return Err(HypervisorError::LinkDown);
                }
                core::hint::spin_loop();
            }
            self.out8(platform, UART_DATA, *byte);
        }
        Ok(())
    }

    fn receive(&mut self, platform: &dyn Platform) -> Result<Option<u8>, HypervisorError> {
        for _ in 0..self.byte_timeout {
            if self.has_input(platform) {
                return Ok(Some(self.in8(platform, UART_DATA) as u8));
            }
            core::hint::spin_loop();
        }
        Ok(None)
    }

    fn has_input(&mut self, platform: &dyn Platform) -> bool {
        self.in8(platform, UART_LINE_STATUS) & LINE_STATUS_DATA_READY != 0
    }
}

/// One end of an in-memory channel.
///
/// Nothing can arrive while the only thread waits for input, so an empty queue reports
/// [`HypervisorError::LinkDown`] instead of blocking.
#[derive(Clone)]
pub struct LoopbackSerial {
    incoming: Arc<Mutex<VecDeque<u8>>>,
    outgoing: Arc<Mutex<VecDeque<u8>>>,
}

impl LoopbackSerial {
    /// Two connected ends: bytes sent on one are received on the other.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Mutex::new(VecDeque::new()));
        let b = Arc::new(Mutex::new(VecDeque::new()));
        (Self { incoming: a.clone(), outgoing: b.clone() }, Self { incoming: b, outgoing: a })
    }

    /// Sends without a platform, for the debugger side of a test.
    pub fn inject(&self, bytes: &[u8]) {
        self.outgoing.lock().extend(bytes.iter().copied());
    }

    /// Takes everything received so far.
    pub fn take_received(&self) -> alloc::vec::Vec<u8> {
        self.incoming.lock().drain(..).collect()
    }
}

impl Transport for LoopbackSerial {
    fn send(&mut self, _platform: &dyn Platform, bytes: &[u8]) -> Result<(), HypervisorError> {
        self.inject(bytes);
        Ok(())
    }

    fn receive(&mut self, _platform: &dyn Platform) -> Result<Option<u8>, HypervisorError> {
        self.incoming.lock().pop_front().map(Some).ok_or(HypervisorError::LinkDown)
    }

    fn has_input(&mut self, _platform: &dyn Platform) -> bool {
        !self.incoming.lock().is_empty()
    }
}
