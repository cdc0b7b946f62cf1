//! Serial port capability consumed by the protocol engines
//!
//! The engines never talk to a concrete serial device; they drive a
//! [`SerialPort`] trait object. This keeps the OS-specific port code out of
//! the protocol layer and lets the AVR109 engine hand a *different* port
//! object back to the caller after the target re-enumerates.

use std::{io, time::Duration};

use crate::error::Error;

/// Modem input line levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemStatus {
    pub cts: bool,
    pub dsr: bool,
    pub dcd: bool,
}

/// A byte-duplex serial link to a target board
///
/// Reads are bounded by the port timeout; an expired read surfaces
/// `io::ErrorKind::TimedOut`, which the engines map to their receive-timeout
/// error. Implementations must tolerate `open` on an already-open port (as a
/// no-op) and may implement `flush` and `drain` as no-ops.
pub trait SerialPort: Send {
    /// Open the port, blocking until it is usable (implementations should
    /// give up after about a second)
    fn open(&mut self) -> Result<(), Error>;

    /// Close the port
    fn close(&mut self) -> Result<(), Error>;

    /// Whether the port is currently open
    fn is_open(&self) -> bool;

    /// The configured baud rate
    fn baud_rate(&self) -> u32;

    /// Reconfigure the baud rate
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error>;

    /// The current read timeout
    fn timeout(&self) -> Duration;

    /// Set the read timeout
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Set the level of the DTR pin
    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error>;

    /// Set the level of the RTS pin
    fn write_request_to_send(&mut self, level: bool) -> Result<(), Error>;

    /// Assert or clear the break condition
    fn set_break(&mut self, level: bool) -> Result<(), Error>;

    /// Read the modem input lines
    fn modem_status(&mut self) -> Result<ModemStatus, Error>;

    /// Read available bytes, waiting at most the configured timeout
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all bytes
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Flush pending output
    fn flush(&mut self) -> Result<(), Error>;

    /// Block until queued output has left the device
    fn drain(&mut self) -> Result<(), Error>;

    /// Discard any unread input
    fn clear_input(&mut self) -> Result<(), Error>;
}

/// Adapter so a [`SerialPort`] can feed `io::Read` consumers (the SLIP
/// decoder)
pub(crate) struct PortReader<'a>(pub &'a mut dyn SerialPort);

impl io::Read for PortReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Parameters handed to the reconnect callback when a target re-enumerates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectParams {
    /// Baud rate the replacement port must be configured to
    pub baud_rate: u32,
}

/// Caller-supplied hook producing a replacement port after the target
/// drops off the bus (1200-baud touch targets re-enumerate under a new
/// device path).
pub type ReconnectFn<'a> = dyn FnMut(ReconnectParams) -> Result<Box<dyn SerialPort>, Error> + 'a;

/// How long we give the reconnect callback to produce a port
pub(crate) const RECONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Invoke the reconnect callback, bounding it to [`RECONNECT_TIMEOUT`].
pub(crate) fn reconnect(
    cb: &mut ReconnectFn<'_>,
    params: ReconnectParams,
) -> Result<Box<dyn SerialPort>, Error> {
    let started = std::time::Instant::now();

    let port = cb(params).map_err(|e| match e {
        Error::ReconnectTimeout(t) => Error::ReconnectTimeout(t),
        other => Error::ReconnectRejected(other.to_string()),
    })?;

    if started.elapsed() > RECONNECT_TIMEOUT {
        return Err(Error::ReconnectTimeout(RECONNECT_TIMEOUT));
    }

    Ok(port)
}

#[cfg(feature = "serialport")]
pub use native::NativePort;

#[cfg(feature = "serialport")]
mod native {
    use std::{
        io::{self, Read as _, Write as _},
        time::Duration,
    };

    use serialport::SerialPort as _;

    use super::SerialPort;
    use crate::error::{ConnectionError, Error};

    /// [`SerialPort`] backed by the `serialport` crate
    ///
    /// The OS handle is dropped on `close` and re-created on `open`, so the
    /// same object can survive a target re-enumeration under the same
    /// device path.
    pub struct NativePort {
        name: String,
        baud: u32,
        timeout: Duration,
        inner: Option<Box<dyn serialport::SerialPort>>,
    }

    impl NativePort {
        /// Create a port for `name` without opening it
        pub fn new(name: &str, baud: u32) -> Self {
            Self {
                name: name.to_string(),
                baud,
                timeout: Duration::from_secs(1),
                inner: None,
            }
        }
    }

    fn serial_to_io(err: serialport::Error) -> io::Error {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => io::Error::new(kind, err.description),
            _ => io::Error::other(err.description),
        }
    }

    impl SerialPort for NativePort {
        fn open(&mut self) -> Result<(), Error> {
            if self.inner.is_some() {
                return Ok(());
            }

            let port = serialport::new(&self.name, self.baud)
                .flow_control(serialport::FlowControl::None)
                .timeout(self.timeout)
                .open()
                .map_err(|e| ConnectionError::IoOpen(serial_to_io(e)))?;
            self.inner = Some(port);

            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            self.inner = None;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.inner.is_some()
        }

        fn baud_rate(&self) -> u32 {
            self.baud
        }

        fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
            if let Some(port) = self.inner.as_mut() {
                port.set_baud_rate(baud)
                    .map_err(|e| ConnectionError::IoWrite(serial_to_io(e)))?;
            }
            self.baud = baud;

            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
            if let Some(port) = self.inner.as_mut() {
                port.set_timeout(timeout)
                    .map_err(|e| ConnectionError::IoWrite(serial_to_io(e)))?;
            }
            self.timeout = timeout;

            Ok(())
        }

        fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error> {
            self.port()?
                .write_data_terminal_ready(level)
                .map_err(|e| ConnectionError::IoWrite(serial_to_io(e)).into())
        }

        fn write_request_to_send(&mut self, level: bool) -> Result<(), Error> {
            self.port()?
                .write_request_to_send(level)
                .map_err(|e| ConnectionError::IoWrite(serial_to_io(e)).into())
        }

        fn set_break(&mut self, level: bool) -> Result<(), Error> {
            let port = self.port()?;
            let result = if level {
                port.set_break()
            } else {
                port.clear_break()
            };

            result.map_err(|e| ConnectionError::IoWrite(serial_to_io(e)).into())
        }

        fn modem_status(&mut self) -> Result<super::ModemStatus, Error> {
            let port = self.port()?;

            let status = super::ModemStatus {
                cts: port
                    .read_clear_to_send()
                    .map_err(|e| ConnectionError::IoRead(serial_to_io(e)))?,
                dsr: port
                    .read_data_set_ready()
                    .map_err(|e| ConnectionError::IoRead(serial_to_io(e)))?,
                dcd: port
                    .read_carrier_detect()
                    .map_err(|e| ConnectionError::IoRead(serial_to_io(e)))?,
            };

            Ok(status)
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inner.as_mut() {
                Some(port) => port.read(buf),
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "port closed")),
            }
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
            self.port()?
                .write_all(data)
                .map_err(|e| ConnectionError::IoWrite(e).into())
        }

        fn flush(&mut self) -> Result<(), Error> {
            self.port()?
                .flush()
                .map_err(|e| ConnectionError::IoWrite(e).into())
        }

        fn drain(&mut self) -> Result<(), Error> {
            // The OS write buffer is the only queue we control
            self.flush()
        }

        fn clear_input(&mut self) -> Result<(), Error> {
            self.port()?
                .clear(serialport::ClearBuffer::Input)
                .map_err(|e| ConnectionError::IoRead(serial_to_io(e)).into())
        }
    }

    impl NativePort {
        fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, Error> {
            self.inner.as_mut().ok_or_else(|| {
                ConnectionError::IoWrite(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "port closed",
                ))
                .into()
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Scripted in-memory port used by the engine tests

    use std::{
        collections::VecDeque,
        io,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::{ModemStatus, SerialPort};
    use crate::error::Error;

    /// Observable side effects of a session, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum PortEvent {
        Open,
        Close,
        Dtr(bool),
        Rts(bool),
        Baud(u32),
        ClearInput,
    }

    /// One request/reply exchange: once `expect` has been written the
    /// `reply` bytes become readable.
    #[derive(Debug, Clone)]
    pub struct Exchange {
        pub expect: Vec<u8>,
        pub reply: Vec<u8>,
    }

    impl Exchange {
        pub fn new(expect: impl Into<Vec<u8>>, reply: impl Into<Vec<u8>>) -> Self {
            Self {
                expect: expect.into(),
                reply: reply.into(),
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct Recording {
        pub events: Vec<PortEvent>,
        pub written: Vec<u8>,
    }

    /// Scripted port: matches writes against a queue of [`Exchange`]s and
    /// serves the scripted replies to subsequent reads. Reads with nothing
    /// queued return `TimedOut` immediately rather than sleeping.
    pub struct ScriptedPort {
        script: VecDeque<Exchange>,
        pending: Vec<u8>,
        rx: VecDeque<u8>,
        baud: u32,
        timeout: Duration,
        open: bool,
        pub recording: Arc<Mutex<Recording>>,
    }

    impl ScriptedPort {
        pub fn new(baud: u32, script: Vec<Exchange>) -> Self {
            Self {
                script: script.into(),
                pending: Vec::new(),
                rx: VecDeque::new(),
                baud,
                timeout: Duration::from_secs(1),
                open: true,
                recording: Arc::new(Mutex::new(Recording::default())),
            }
        }

        fn match_script(&mut self) {
            while let Some(exchange) = self.script.front() {
                if self.pending.len() < exchange.expect.len() {
                    // Partial frame so far; it must still be a prefix
                    assert!(
                        exchange.expect.starts_with(&self.pending),
                        "unexpected bytes written: got {:02x?}, expected prefix of {:02x?}",
                        self.pending,
                        exchange.expect
                    );
                    return;
                }

                assert_eq!(
                    &self.pending[..exchange.expect.len()],
                    &exchange.expect[..],
                    "unexpected bytes written"
                );

                self.pending.drain(..exchange.expect.len());
                let exchange = self.script.pop_front().unwrap();
                self.rx.extend(exchange.reply);
            }
        }
    }

    impl SerialPort for ScriptedPort {
        fn open(&mut self) -> Result<(), Error> {
            self.open = true;
            self.recording.lock().unwrap().events.push(PortEvent::Open);
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            self.open = false;
            self.recording.lock().unwrap().events.push(PortEvent::Close);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn baud_rate(&self) -> u32 {
            self.baud
        }

        fn set_baud_rate(&mut self, baud: u32) -> Result<(), Error> {
            self.baud = baud;
            self.recording
                .lock()
                .unwrap()
                .events
                .push(PortEvent::Baud(baud));
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
            self.timeout = timeout;
            Ok(())
        }

        fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), Error> {
            self.recording
                .lock()
                .unwrap()
                .events
                .push(PortEvent::Dtr(level));
            Ok(())
        }

        fn write_request_to_send(&mut self, level: bool) -> Result<(), Error> {
            self.recording
                .lock()
                .unwrap()
                .events
                .push(PortEvent::Rts(level));
            Ok(())
        }

        fn set_break(&mut self, _level: bool) -> Result<(), Error> {
            Ok(())
        }

        fn modem_status(&mut self) -> Result<ModemStatus, Error> {
            Ok(ModemStatus::default())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"));
            }

            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }

            Ok(n)
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
            self.recording
                .lock()
                .unwrap()
                .written
                .extend_from_slice(data);
            self.pending.extend_from_slice(data);
            self.match_script();
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn drain(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn clear_input(&mut self) -> Result<(), Error> {
            // Input is deliberately retained: scripted replies are queued at
            // write time, before the engine has had a chance to read them.
            self.recording
                .lock()
                .unwrap()
                .events
                .push(PortEvent::ClearInput);
            Ok(())
        }
    }
}
