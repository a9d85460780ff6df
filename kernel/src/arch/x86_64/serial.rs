// =============================================================================
// NanoCore — COM1 Serial Log Sink
// =============================================================================
//
// The 16550 UART at I/O port 0x3F8 is the kernel's log output. It needs no
// memory mapping and no driver stack, so it works from the first instruction
// after boot.
//
//   Port    │ Read              │ Write
//   ────────┼───────────────────┼──────────────────
//   +0      │ RX data           │ TX data / divisor low
//   +1      │ IRQ enable        │ IRQ enable / divisor high
//   +2      │ IRQ identity      │ FIFO control
//   +3      │ line control      │ line control
//   +4      │ modem control     │ modem control
//   +5      │ line status       │ -
//
// Output is polled: each byte waits for the transmit holding register.
// `klog` serialises whole records, so lines from different tasks never
// interleave.
//
// =============================================================================

use spin::Mutex;
use x86_64::instructions::port::Port;

/// Base I/O port for COM1.
const COM1_BASE: u16 = 0x3F8;

const DATA_REG: u16 = 0;
const INT_ENABLE_REG: u16 = 1;
const FIFO_CTRL_REG: u16 = 2;
const LINE_CTRL_REG: u16 = 3;
const MODEM_CTRL_REG: u16 = 4;
const LINE_STATUS_REG: u16 = 5;

/// Transmit holding register empty.
const LSR_TX_EMPTY: u8 = 1 << 5;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Configure 115200 baud, 8N1, FIFOs on, interrupts off.
    ///
    /// Returns `false` if the loopback self-test failed; output is then
    /// silently lost.
    pub fn init(&mut self) -> bool {
        self.write_port(INT_ENABLE_REG, 0x00);
        self.write_port(LINE_CTRL_REG, 0x80); // DLAB on
        self.write_port(DATA_REG, 0x01); // divisor 1 = 115200 baud
        self.write_port(INT_ENABLE_REG, 0x00);
        self.write_port(LINE_CTRL_REG, 0x03); // 8N1, DLAB off
        self.write_port(FIFO_CTRL_REG, 0xC7);
        self.write_port(MODEM_CTRL_REG, 0x1E); // loopback

        self.write_port(DATA_REG, 0xAE);
        if self.read_port(DATA_REG) != 0xAE {
            return false;
        }
        self.write_port(MODEM_CTRL_REG, 0x0F);
        true
    }

    pub fn write_byte(&mut self, byte: u8) {
        while self.read_port(LINE_STATUS_REG) & LSR_TX_EMPTY == 0 {
            core::hint::spin_loop();
        }
        self.write_port(DATA_REG, byte);
    }

    /// Write `s`, turning `\n` into `\r\n` for serial terminals.
    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    fn read_port(&mut self, offset: u16) -> u8 {
        let mut port = Port::<u8>::new(self.base + offset);
        // SAFETY: COM1 registers; reading has no effect beyond the UART.
        unsafe { port.read() }
    }

    fn write_port(&mut self, offset: u16, value: u8) {
        let mut port = Port::<u8>::new(self.base + offset);
        // SAFETY: as above.
        unsafe { port.write(value) }
    }
}

static COM1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

/// `klog` sink writing to COM1.
pub struct SerialSink;

pub static SERIAL_SINK: SerialSink = SerialSink;

impl SerialSink {
    pub fn init(&self) -> bool {
        COM1.lock().init()
    }
}

impl klog::Sink for SerialSink {
    fn write_str(&self, s: &str) {
        COM1.lock().write_string(s);
    }
}
