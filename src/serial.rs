use x86_64::instructions::port::Port;
use core::fmt;
use spin::Mutex;
use lazy_static::lazy_static;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    data: Port<u8>,
    int_en: Port<u8>,
    fifo_ctrl: Port<u8>,
    line_ctrl: Port<u8>,
    modem_ctrl: Port<u8>,
    line_sts: Port<u8>,
}

impl SerialPort {
    pub fn new(base: u16) -> Self {
        Self {
            data: Port::new(base),
            int_en: Port::new(base + 1),
            fifo_ctrl: Port::new(base + 2),
            line_ctrl: Port::new(base + 3),
            modem_ctrl: Port::new(base + 4),
            line_sts: Port::new(base + 5),
        }
    }

    pub fn init(&mut self) {
        unsafe {
            self.int_en.write(0x00);     // We poll, never take UART interrupts
            self.line_ctrl.write(0x80);  // DLAB on
            self.data.write(0x03);       // Divisor 3 -> 38400 baud
            self.int_en.write(0x00);
            self.line_ctrl.write(0x03);  // 8N1
            self.fifo_ctrl.write(0xC7);  // FIFO on, cleared, 14-byte threshold
            self.modem_ctrl.write(0x03); // DTR + RTS, OUT2 left off
        }
    }

    fn is_transmit_empty(&mut self) -> bool {
        unsafe { self.line_sts.read() & 0x20 != 0 }
    }

    pub fn send(&mut self, data: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe { self.data.write(data); }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            // Terminals expect CRLF.
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = SerialPort::new(COM1);
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// Writes one line. Callers mask interrupts; the logger does.
pub fn write_line(line: &str) {
    use core::fmt::Write;
    let mut port = SERIAL1.lock();
    let _ = port.write_str(line);
    let _ = port.write_str("\n");
}

/// Last-resort output for the panic handler: steals the port if another
/// core died while holding it.
pub fn write_fmt_forced(args: fmt::Arguments) {
    use core::fmt::Write;
    if let Some(mut port) = SERIAL1.try_lock() {
        let _ = port.write_fmt(args);
        return;
    }
    let mut port = SerialPort::new(COM1);
    let _ = port.write_fmt(args);
}
