use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use super::controller::{FirmwareStatus, Outcome, UpdateController};
use crate::platform::{ImageSlot, Power};
use crate::transport::Transport;

pub enum UpdateEvent {
    /// Raw shared-attribute JSON from the cloud.
    Attributes(String),
    /// Ask the cloud for the firmware attributes again.
    CheckNow,
    Status(SyncSender<FirmwareStatus>),
}

/// Sending side of the update task. Cheap to clone.
#[derive(Clone)]
pub struct UpdateHandle {
    tx: Sender<UpdateEvent>,
}

impl UpdateHandle {
    pub fn new(tx: Sender<UpdateEvent>) -> Self {
        Self { tx }
    }

    pub fn attributes(&self, payload: String) -> bool {
        self.tx.send(UpdateEvent::Attributes(payload)).is_ok()
    }

    pub fn check_now(&self) -> bool {
        self.tx.send(UpdateEvent::CheckNow).is_ok()
    }

    /// `None` when the task is gone or busy past `timeout`.
    pub fn status(&self, timeout: Duration) -> Option<FirmwareStatus> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx.send(UpdateEvent::Status(reply_tx)).ok()?;
        reply_rx.recv_timeout(timeout).ok()
    }
}

pub fn spawn<T, S, P>(
    controller: UpdateController<T, S, P>,
    events: Receiver<UpdateEvent>,
) -> anyhow::Result<JoinHandle<()>>
where
    T: Transport + 'static,
    S: ImageSlot + 'static,
    P: Power + 'static,
{
    let handle = thread::Builder::new()
        .name("fw-update".into())
        .stack_size(16 * 1024)
        .spawn(move || run(controller, events))?;
    Ok(handle)
}

/// Owns the controller: confirms the running image, then serves events and
/// wakes for the pending retry. Returns once every handle is dropped.
pub fn run<T: Transport, S: ImageSlot, P: Power>(
    mut controller: UpdateController<T, S, P>,
    events: Receiver<UpdateEvent>,
) {
    controller.confirm_boot();
    controller.request_attributes();

    let mut backlog = VecDeque::new();
    loop {
        let event = match backlog.pop_front() {
            Some(event) => Some(event),
            None => match controller.next_retry_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match events.recv_timeout(wait) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match events.recv() {
                    Ok(event) => Some(event),
                    Err(_) => break,
                },
            },
        };

        match event {
            None => log_outcome(controller.retry_due(Instant::now())),
            Some(UpdateEvent::Attributes(payload)) => {
                let payload = newest_attributes(payload, &events, &mut backlog);
                log_outcome(controller.handle_attributes(&payload, Instant::now()));
            }
            Some(UpdateEvent::CheckNow) => controller.request_attributes(),
            Some(UpdateEvent::Status(reply)) => {
                let _ = reply.try_send(controller.status());
            }
        }
    }
    info!("Update task stopped");
}

/// Collapses queued attribute pushes to the newest one. Other events keep
/// their order in `backlog`.
fn newest_attributes(
    mut payload: String,
    events: &Receiver<UpdateEvent>,
    backlog: &mut VecDeque<UpdateEvent>,
) -> String {
    let mut dropped = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            UpdateEvent::Attributes(newer) => {
                payload = newer;
                dropped += 1;
            }
            other => backlog.push_back(other),
        }
    }
    if dropped > 0 {
        info!("Skipped {} superseded attribute push(es)", dropped);
    }
    payload
}

fn log_outcome(outcome: Outcome) {
    match outcome {
        Outcome::Deferred { attempt, retry_at } => info!(
            "Update deferred after attempt {}, next try in {:?}",
            attempt,
            retry_at.saturating_duration_since(Instant::now())
        ),
        Outcome::Failed(e) => warn!("Update failed: {}", e),
        Outcome::Rejected(reason) => warn!("Update rejected: {}", reason),
        Outcome::Restarting => info!("Update applied"),
        Outcome::Ignored | Outcome::AlreadyCurrent | Outcome::NothingDue => {}
    }
}
