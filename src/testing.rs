//! Host doubles for the platform seams.

use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::platform::{ImageSlot, ImageWriter, Power};
use crate::telemetry::Telemetry;
use crate::transport::{Method, Request, Response, Transport, TransportError};

enum Scripted {
    Reply { status: u16, body: Vec<u8> },
    /// Serves `body`, then the connection drops.
    Broken { status: u16, body: Vec<u8> },
    Timeout,
}

struct BrokenBody {
    body: Cursor<Vec<u8>>,
}

impl Read for BrokenBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.body.read(buf)? {
            0 => Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            n => Ok(n),
        }
    }
}

#[derive(Default)]
struct TransportLog {
    script: VecDeque<Scripted>,
    requests: Vec<(Method, String)>,
}

/// Answers requests from a script, in order.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<TransportLog>>,
}

impl FakeTransport {
    pub fn respond(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.inner.lock().unwrap().script.push_back(Scripted::Reply {
            status,
            body: body.into(),
        });
    }

    pub fn respond_then_break(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.inner.lock().unwrap().script.push_back(Scripted::Broken {
            status,
            body: body.into(),
        });
    }

    pub fn fail_with_timeout(&self) {
        self.inner.lock().unwrap().script.push_back(Scripted::Timeout);
    }

    pub fn requests(&self) -> Vec<(Method, String)> {
        self.inner.lock().unwrap().requests.clone()
    }
}

impl Transport for FakeTransport {
    fn open(&mut self, request: &Request<'_>) -> Result<Response<'_>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .requests
            .push((request.method, request.url.to_string()));
        match inner.script.pop_front() {
            Some(Scripted::Reply { status, body }) => Ok(Response {
                status,
                content_length: Some(body.len() as u64),
                body: Box::new(Cursor::new(body)),
            }),
            Some(Scripted::Broken { status, body }) => Ok(Response {
                status,
                content_length: None,
                body: Box::new(BrokenBody {
                    body: Cursor::new(body),
                }),
            }),
            Some(Scripted::Timeout) => Err(TransportError::Timeout),
            None => Err(TransportError::Connect("nothing scripted".into())),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SlotLog {
    pub begun: usize,
    pub written: Vec<u8>,
    pub finalized: bool,
    pub activated: bool,
    pub aborted: usize,
    pub marked_valid: usize,
    pub fail_activation: bool,
    pub pending_verify: bool,
}

#[derive(Clone, Default)]
pub struct FakeSlot {
    log: Arc<Mutex<SlotLog>>,
}

impl FakeSlot {
    pub fn log(&self) -> SlotLog {
        self.log.lock().unwrap().clone()
    }

    pub fn fail_activation(&self) {
        self.log.lock().unwrap().fail_activation = true;
    }

    /// Boots into a freshly activated image awaiting confirmation.
    pub fn set_running_pending_verify(&self, pending: bool) {
        self.log.lock().unwrap().pending_verify = pending;
    }
}

struct FakeWriter {
    log: Arc<Mutex<SlotLog>>,
    activated: bool,
}

impl ImageSlot for FakeSlot {
    fn begin(&mut self, _size_hint: Option<u64>) -> anyhow::Result<Box<dyn ImageWriter + '_>> {
        let mut log = self.log.lock().unwrap();
        log.begun += 1;
        log.written.clear();
        Ok(Box::new(FakeWriter {
            log: self.log.clone(),
            activated: false,
        }))
    }

    fn running_pending_verify(&mut self) -> anyhow::Result<bool> {
        Ok(self.log.lock().unwrap().pending_verify)
    }

    fn mark_running_valid(&mut self) -> anyhow::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.marked_valid += 1;
        log.pending_verify = false;
        Ok(())
    }
}

impl ImageWriter for FakeWriter {
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.log.lock().unwrap().written.extend_from_slice(chunk);
        Ok(())
    }

    fn finalize(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().finalized = true;
        Ok(())
    }

    fn activate(mut self: Box<Self>) -> anyhow::Result<()> {
        let mut log = self.log.lock().unwrap();
        if log.fail_activation {
            anyhow::bail!("boot partition rejected");
        }
        log.activated = true;
        drop(log);
        self.activated = true;
        Ok(())
    }
}

impl Drop for FakeWriter {
    fn drop(&mut self) {
        if !self.activated {
            self.log.lock().unwrap().aborted += 1;
        }
    }
}

#[derive(Clone, Default)]
pub struct FakePower {
    restarts: Arc<AtomicUsize>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl FakePower {
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Power for FakePower {
    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    fn deep_sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    telemetry: Mutex<Vec<Value>>,
    attributes: Mutex<Vec<Value>>,
    attribute_requests: AtomicUsize,
}

impl RecordingTelemetry {
    pub fn telemetry(&self) -> Vec<Value> {
        self.telemetry.lock().unwrap().clone()
    }

    pub fn attributes(&self) -> Vec<Value> {
        self.attributes.lock().unwrap().clone()
    }

    pub fn attribute_requests(&self) -> usize {
        self.attribute_requests.load(Ordering::SeqCst)
    }
}

impl Telemetry for RecordingTelemetry {
    fn publish_telemetry(&self, payload: &str) -> anyhow::Result<()> {
        self.telemetry
            .lock()
            .unwrap()
            .push(serde_json::from_str(payload)?);
        Ok(())
    }

    fn publish_attributes(&self, payload: &str) -> anyhow::Result<()> {
        self.attributes
            .lock()
            .unwrap()
            .push(serde_json::from_str(payload)?);
        Ok(())
    }

    fn request_attributes(&self, _shared_keys: &[&str]) -> anyhow::Result<()> {
        self.attribute_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
