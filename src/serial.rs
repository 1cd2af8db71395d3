//! Serial command channel to the haptic actuator.
//!
//! The actuator enumerates as an ordinary serial port (a USB adapter or a
//! bound RFCOMM device such as `/dev/rfcomm0`) whose name is not known ahead
//! of time. [`SerialChannel`] finds it by probing: open the candidate with the
//! fixed line settings and write the `"0 0"` handshake (both motors off). The
//! first candidate that accepts both becomes the connection.
//!
//! # Failure model
//!
//! I/O faults stay inside this module. A failed probe closes that candidate
//! and moves on; a failed write closes the connection and the next send runs
//! discovery again. Callers only ever see `bool` results, so the experiment
//! keeps running with no device attached.

use std::io::Write;
use std::time::Duration;

use log::{debug, info, warn};
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::errors::Result;

/// Written to each candidate port right after it opens.
pub const HANDSHAKE: &str = "0 0";

/// Fixed line settings for the actuator link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub write_timeout: Duration,
}

impl LineConfig {
    /// 9600 baud, 8N1, 5 s write timeout.
    pub const DEFAULT: LineConfig = LineConfig {
        baud_rate: 9600,
        data_bits: DataBits::Eight,
        parity: Parity::None,
        stop_bits: StopBits::One,
        write_timeout: Duration::from_millis(5000),
    };
}

impl Default for LineConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// An open, writable serial connection.
pub trait SerialLink: Write + Send {}
impl<T: Write + Send> SerialLink for T {}

/// Platform access to serial ports.
pub trait PortBackend: Send {
    /// Names of ports the OS currently exposes, in enumeration order.
    fn list_candidate_ports(&self) -> Result<Vec<String>>;
    /// Open `name` with `config` applied.
    fn open_port(&self, name: &str, config: &LineConfig) -> Result<Box<dyn SerialLink>>;
}

/// [`PortBackend`] over the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortBackend for SystemPorts {
    fn list_candidate_ports(&self) -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn open_port(&self, name: &str, config: &LineConfig) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(name, config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .flow_control(FlowControl::None)
            .timeout(config.write_timeout)
            .open()?;
        Ok(Box::new(port))
    }
}

fn write_line(link: &mut dyn SerialLink, message: &str) -> std::io::Result<()> {
    link.write_all(message.as_bytes())?;
    link.write_all(b"\n")?;
    link.flush()
}

/// Try one candidate port.
///
/// Returns the live link when the port opens and accepts the handshake. On
/// any failure the handle (if one was opened) is dropped before returning.
pub fn probe_port(
    backend: &dyn PortBackend,
    name: &str,
    config: &LineConfig,
) -> Option<Box<dyn SerialLink>> {
    let mut link = match backend.open_port(name, config) {
        Ok(link) => link,
        Err(e) => {
            debug!("probe failed to open: port={}, error={}", name, e);
            return None;
        }
    };

    if let Err(e) = write_line(link.as_mut(), HANDSHAKE) {
        debug!("probe handshake failed: port={}, error={}", name, e);
        return None;
    }
    Some(link)
}

/// Something that accepts actuator commands.
pub trait CommandSink {
    /// Deliver `message`; `false` means it was dropped.
    fn dispatch(&mut self, message: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disabled,
    Closed,
    Open { port: String },
}

struct OpenLink {
    port: String,
    link: Box<dyn SerialLink>,
}

/// Owns at most one serial connection and opens it on demand.
pub struct SerialChannel<B: PortBackend = SystemPorts> {
    backend: B,
    config: LineConfig,
    preferred_port: Option<String>,
    disabled: bool,
    open: Option<OpenLink>,
}

impl SerialChannel<SystemPorts> {
    pub fn system(preferred_port: Option<String>) -> Self {
        Self::new(SystemPorts, preferred_port)
    }
}

impl<B: PortBackend> SerialChannel<B> {
    pub fn new(backend: B, preferred_port: Option<String>) -> Self {
        Self {
            backend,
            config: LineConfig::DEFAULT,
            preferred_port: preferred_port.filter(|p| !p.is_empty()),
            disabled: false,
            open: None,
        }
    }

    /// Turn the kill switch on or off. Disabling closes an open connection.
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
        if disabled {
            self.close();
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.port.as_str())
    }

    pub fn state(&self) -> ChannelState {
        match (&self.open, self.disabled) {
            (_, true) => ChannelState::Disabled,
            (Some(open), false) => ChannelState::Open {
                port: open.port.clone(),
            },
            (None, false) => ChannelState::Closed,
        }
    }

    /// Make sure a connection is open, discovering the device if needed.
    ///
    /// The preferred port is probed first, then every enumerated port in
    /// order (skipping the preferred one). Returns whether a connection is
    /// open afterwards.
    pub fn open(&mut self) -> bool {
        if self.disabled {
            return false;
        }
        if self.open.is_some() {
            return true;
        }

        if let Some(preferred) = self.preferred_port.clone() {
            if self.try_adopt(&preferred) {
                return true;
            }
            warn!("preferred serial port unavailable: port={}", preferred);
        }

        let candidates = match self.backend.list_candidate_ports() {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("serial port enumeration failed: {}", e);
                Vec::new()
            }
        };

        for name in candidates {
            if self.preferred_port.as_deref() == Some(name.as_str()) {
                continue;
            }
            if self.try_adopt(&name) {
                return true;
            }
        }

        warn!("no serial device answered the handshake");
        false
    }

    fn try_adopt(&mut self, name: &str) -> bool {
        match probe_port(&self.backend, name, &self.config) {
            Some(link) => {
                info!("serial device connected: port={}", name);
                self.open = Some(OpenLink {
                    port: name.to_string(),
                    link,
                });
                true
            }
            None => false,
        }
    }

    /// Write `message` as one line, opening the connection first if needed.
    ///
    /// With no device the message is dropped. A write failure closes the
    /// connection so the next send starts discovery again.
    pub fn send(&mut self, message: &str) -> bool {
        if self.disabled {
            return false;
        }
        if !self.open() {
            debug!("serial message dropped (no device): {:?}", message);
            return false;
        }

        let Some(open) = self.open.as_mut() else {
            return false;
        };
        match write_line(open.link.as_mut(), message) {
            Ok(()) => {
                debug!("serial sent: port={}, message={:?}", open.port, message);
                true
            }
            Err(e) => {
                warn!("serial write failed: port={}, error={}", open.port, e);
                self.close();
                false
            }
        }
    }

    /// Close the connection if one is open.
    pub fn close(&mut self) {
        if let Some(mut open) = self.open.take() {
            if let Err(e) = open.link.flush() {
                debug!("serial flush on close failed: port={}, error={}", open.port, e);
            }
            info!("serial device closed: port={}", open.port);
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: PortBackend> CommandSink for SerialChannel<B> {
    fn dispatch(&mut self, message: &str) -> bool {
        self.send(message)
    }
}

impl<B: PortBackend> Drop for SerialChannel<B> {
    fn drop(&mut self) {
        self.close();
    }
}
