//! Runs a [`SerialChannel`] on its own thread.
//!
//! Discovery and writes can block for the full write timeout. The host's
//! frame loop hands commands to the worker through a queue instead, so a
//! missing or stalled device never holds up a frame.

use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::errors::Result;
use crate::serial::{CommandSink, PortBackend, SerialChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Open,
    Send(String),
    Shutdown,
}

/// Handle to the serial worker thread. Dropping it drains the queue, closes
/// the port and joins the thread.
pub struct SerialWorker {
    tx: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl SerialWorker {
    pub fn spawn<B: PortBackend + 'static>(mut channel: SerialChannel<B>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkerCommand>();
        let handle = thread::Builder::new()
            .name("serial-worker".into())
            .spawn(move || {
                for command in rx {
                    match command {
                        WorkerCommand::Open => {
                            channel.open();
                        }
                        WorkerCommand::Send(message) => {
                            channel.send(&message);
                        }
                        WorkerCommand::Shutdown => break,
                    }
                }
                debug!("serial worker exiting");
                channel.close();
            })?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Queue a discovery attempt.
    pub fn open(&self) -> bool {
        self.tx.send(WorkerCommand::Open).is_ok()
    }

    /// Queue a message. Returns `false` only if the worker has gone away.
    pub fn send(&self, message: &str) -> bool {
        self.tx.send(WorkerCommand::Send(message.to_string())).is_ok()
    }

    /// Stop the worker after it has processed everything already queued.
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("serial worker panicked");
            }
        }
    }
}

impl CommandSink for SerialWorker {
    fn dispatch(&mut self, message: &str) -> bool {
        self.send(message)
    }
}

impl Drop for SerialWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
