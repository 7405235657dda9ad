//! Deep-sleep policy and the idle countdown.
//!
//! The policy record is owned by a single service thread. Everything else
//! talks to it through a [`SleepHandle`]. Only an expiry from the currently
//! armed countdown may put the device to sleep. Forced sleep cancels the
//! countdown first so the two paths never both fire.

use std::io;
use std::ops::RangeInclusive;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;

use crate::line_store::{LineRecord, LineStore, Lines};
use crate::platform::Power;

pub const INTERVAL_RANGE_MS: RangeInclusive<u64> = 1_000..=604_800_000;
pub const IDLE_TIMEOUT_RANGE_MS: RangeInclusive<u64> = 100..=86_400_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyRecord {
    /// Timer wakeup after deep sleep. Zero means not configured.
    pub interval_ms: u64,
    /// How long the device stays awake after startup before sleeping.
    pub idle_timeout_ms: u64,
    pub enabled: bool,
}

impl LineRecord for PolicyRecord {
    const LINES: usize = 3;

    fn from_lines(lines: &Lines) -> Option<Self> {
        Some(Self {
            interval_ms: lines.parse(0).unwrap_or(0),
            idle_timeout_ms: lines.parse(1).unwrap_or(0),
            enabled: lines.get(2) == Some("1"),
        })
    }

    fn to_lines(&self) -> Vec<String> {
        vec![
            self.interval_ms.to_string(),
            self.idle_timeout_ms.to_string(),
            if self.enabled { "1" } else { "0" }.to_string(),
        ]
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to persist sleep policy: {0}")]
    Persist(#[from] io::Error),
    #[error("no deep-sleep interval set")]
    NoInterval,
    #[error("deep sleep is disabled")]
    Disabled,
    #[error("sleep service stopped")]
    ServiceStopped,
}

type Reply<T> = SyncSender<Result<T, PolicyError>>;

pub enum SleepRequest {
    SetInterval(u64, Reply<PolicyRecord>),
    SetIdleTimeout(u64, Reply<PolicyRecord>),
    SetEnabled(bool, Reply<PolicyRecord>),
    Status(Reply<PolicyRecord>),
    /// Startup is finished, the idle countdown may run from now on.
    StartCountdown,
    CountdownExpired { generation: u64 },
    ForceSleep(Reply<u64>),
}

enum CountdownControl {
    Arm { generation: u64, wait: Duration },
    Cancel,
}

/// The one thread that times idle countdowns. Re-arming moves its deadline.
struct Countdown {
    control: Sender<CountdownControl>,
    thread: JoinHandle<()>,
}

fn run_countdown(control: Receiver<CountdownControl>, requests: Sender<SleepRequest>) {
    let mut armed: Option<(u64, Instant)> = None;
    loop {
        let next = match armed {
            Some((_, deadline)) => {
                control.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => control.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(CountdownControl::Arm { generation, wait }) => {
                armed = Some((generation, Instant::now() + wait));
            }
            Ok(CountdownControl::Cancel) => armed = None,
            Err(RecvTimeoutError::Timeout) => {
                if let Some((generation, _)) = armed.take() {
                    if requests
                        .send(SleepRequest::CountdownExpired { generation })
                        .is_err()
                    {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

pub struct SleepService<P> {
    policy: PolicyRecord,
    store: LineStore,
    power: P,
    requests: Sender<SleepRequest>,
    ready: bool,
    generation: u64,
    armed: Option<u64>,
    countdown: Option<Countdown>,
}

impl<P: Power> SleepService<P> {
    pub fn new(policy: PolicyRecord, store: LineStore, power: P, requests: Sender<SleepRequest>) -> Self {
        Self {
            policy,
            store,
            power,
            requests,
            ready: false,
            generation: 0,
            armed: None,
            countdown: None,
        }
    }

    pub fn policy(&self) -> PolicyRecord {
        self.policy
    }

    pub fn handle(&mut self, request: SleepRequest) {
        match request {
            SleepRequest::SetInterval(ms, reply) => {
                self.policy.interval_ms = ms;
                info!("deepsleep interval set to {} ms", ms);
                let _ = reply.send(self.persist());
            }
            SleepRequest::SetIdleTimeout(ms, reply) => {
                self.policy.idle_timeout_ms = ms;
                info!("New idle timeout set to {} ms", ms);
                let result = self.persist();
                if self.policy.enabled {
                    self.arm();
                }
                let _ = reply.send(result);
            }
            SleepRequest::SetEnabled(enabled, reply) => {
                if enabled && self.policy.interval_ms == 0 {
                    let _ = reply.send(Err(PolicyError::NoInterval));
                    return;
                }
                self.policy.enabled = enabled;
                info!("deepsleep enabled={}", enabled);
                let result = self.persist();
                if enabled {
                    self.arm();
                } else {
                    self.disarm();
                }
                let _ = reply.send(result);
            }
            SleepRequest::Status(reply) => {
                let _ = reply.send(Ok(self.policy));
            }
            SleepRequest::StartCountdown => {
                self.ready = true;
                self.arm();
            }
            SleepRequest::CountdownExpired { generation } => self.countdown_expired(generation),
            SleepRequest::ForceSleep(reply) => {
                self.disarm();
                let interval_ms = self.policy.interval_ms;
                if interval_ms == 0 {
                    let _ = reply.send(Err(PolicyError::NoInterval));
                    return;
                }
                if !self.policy.enabled {
                    info!("Force-sleep requested but deep-sleep disabled");
                    let _ = reply.send(Err(PolicyError::Disabled));
                    return;
                }
                let _ = reply.send(Ok(interval_ms));
                info!("Force-sleep: entering deep sleep for {} ms", interval_ms);
                self.power.deep_sleep(Duration::from_millis(interval_ms));
            }
        }
    }

    /// Memory keeps the new value even if the write fails.
    fn persist(&self) -> Result<PolicyRecord, PolicyError> {
        match self.store.save(&self.policy) {
            Ok(()) => Ok(self.policy),
            Err(e) => {
                error!(
                    "Failed to persist sleep config to {}: {}",
                    self.store.path().display(),
                    e
                );
                Err(PolicyError::Persist(e))
            }
        }
    }

    fn arm(&mut self) {
        self.disarm();
        if !self.ready {
            info!("Idle countdown deferred until startup completes");
            return;
        }
        if !self.policy.enabled {
            info!("start_idle_countdown requested but deep-sleep disabled");
            return;
        }
        if self.policy.idle_timeout_ms == 0 {
            info!("idle_timeout_ms == 0, not starting countdown");
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        let wait = Duration::from_millis(self.policy.idle_timeout_ms);
        let Some(control) = self.countdown_control() else {
            return;
        };
        if control.send(CountdownControl::Arm { generation, wait }).is_err() {
            error!("Idle countdown thread is gone");
            self.countdown = None;
            return;
        }
        info!("idle_countdown: waiting {} ms before sleeping", wait.as_millis());
        self.armed = Some(generation);
    }

    /// Starts the countdown thread on first use.
    fn countdown_control(&mut self) -> Option<&Sender<CountdownControl>> {
        if self.countdown.is_none() {
            let (control, rx) = mpsc::channel();
            let requests = self.requests.clone();
            let spawned = thread::Builder::new()
                .name("sleep-countdown".into())
                .stack_size(4 * 1024)
                .spawn(move || run_countdown(rx, requests));
            match spawned {
                Ok(thread) => self.countdown = Some(Countdown { control, thread }),
                Err(e) => {
                    error!("Failed to create idle countdown: {}", e);
                    return None;
                }
            }
        }
        self.countdown.as_ref().map(|countdown| &countdown.control)
    }

    fn disarm(&mut self) {
        if self.armed.take().is_some() {
            if let Some(countdown) = &self.countdown {
                let _ = countdown.control.send(CountdownControl::Cancel);
            }
            info!("idle_countdown cancelled");
        }
    }

    fn countdown_expired(&mut self, generation: u64) {
        if self.armed != Some(generation) {
            warn!(
                "Sleep request from countdown {} is not the armed one; ignoring",
                generation
            );
            return;
        }
        self.armed = None;
        if !self.policy.enabled {
            info!("idle_countdown expired but deep-sleep is disabled; not sleeping");
            return;
        }
        if self.policy.interval_ms == 0 {
            info!("idle_countdown expired but no interval is set; not sleeping");
            return;
        }
        info!("Entering deep sleep for {} ms", self.policy.interval_ms);
        self.power
            .deep_sleep(Duration::from_millis(self.policy.interval_ms));
    }

    pub fn run(mut self, requests: Receiver<SleepRequest>) {
        for request in requests {
            self.handle(request);
        }
    }
}

/// Client side of the sleep service.
#[derive(Clone)]
pub struct SleepHandle {
    tx: Sender<SleepRequest>,
}

impl SleepHandle {
    fn call<T>(&self, request: impl FnOnce(Reply<T>) -> SleepRequest) -> Result<T, PolicyError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(request(reply_tx))
            .map_err(|_| PolicyError::ServiceStopped)?;
        reply_rx.recv().map_err(|_| PolicyError::ServiceStopped)?
    }

    pub fn set_interval(&self, ms: u64) -> Result<PolicyRecord, PolicyError> {
        self.call(|reply| SleepRequest::SetInterval(ms, reply))
    }

    pub fn set_idle_timeout(&self, ms: u64) -> Result<PolicyRecord, PolicyError> {
        self.call(|reply| SleepRequest::SetIdleTimeout(ms, reply))
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<PolicyRecord, PolicyError> {
        self.call(|reply| SleepRequest::SetEnabled(enabled, reply))
    }

    pub fn status(&self) -> Result<PolicyRecord, PolicyError> {
        self.call(SleepRequest::Status)
    }

    pub fn start_idle_countdown(&self) {
        if self.tx.send(SleepRequest::StartCountdown).is_err() {
            error!("Sleep service stopped, idle countdown not started");
        }
    }

    /// Cancels the countdown and sleeps now. Returns the interval on
    /// hosts where sleeping returns.
    pub fn force_sleep(&self) -> Result<u64, PolicyError> {
        self.call(SleepRequest::ForceSleep)
    }
}

pub fn spawn<P: Power + 'static>(store: LineStore, power: P) -> anyhow::Result<SleepHandle> {
    let policy = match store.load::<PolicyRecord>() {
        Ok(Some(policy)) => policy,
        Ok(None) => PolicyRecord::default(),
        Err(e) => {
            error!("Failed to read {}: {}", store.path().display(), e);
            PolicyRecord::default()
        }
    };
    info!(
        "Loaded sleep policy: interval={} ms idle={} ms enabled={}",
        policy.interval_ms, policy.idle_timeout_ms, policy.enabled
    );
    let (tx, rx) = mpsc::channel();
    let service = SleepService::new(policy, store, power, tx.clone());
    thread::Builder::new()
        .name("sleep-policy".into())
        .stack_size(8 * 1024)
        .spawn(move || service.run(rx))?;
    Ok(SleepHandle { tx })
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::testing::FakePower;

    fn enabled_policy(idle_timeout_ms: u64) -> PolicyRecord {
        PolicyRecord {
            interval_ms: 60_000,
            idle_timeout_ms,
            enabled: true,
        }
    }

    fn service(
        dir: &tempfile::TempDir,
        policy: PolicyRecord,
    ) -> (SleepService<FakePower>, FakePower, Receiver<SleepRequest>) {
        let (tx, rx) = mpsc::channel();
        let power = FakePower::default();
        let store = LineStore::new(dir.path().join("sleep.txt"));
        (SleepService::new(policy, store, power.clone(), tx), power, rx)
    }

    fn wait_for_sleep(power: &FakePower) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !power.sleeps().is_empty() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn policy_round_trips_with_foreign_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = LineStore::new(dir.path().join("sleep.txt"));
        std::fs::write(store.path(), "1\n2\n0\nextra line\n").unwrap();
        let policy = enabled_policy(30_000);
        store.save(&policy).unwrap();
        assert_eq!(store.load::<PolicyRecord>().unwrap(), Some(policy));
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "60000\n30000\n1\nextra line\n"
        );
    }

    #[test]
    fn countdown_waits_for_startup() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _power, _rx) = service(&dir, enabled_policy(60_000));
        let (reply, _answer) = mpsc::sync_channel(1);
        service.handle(SleepRequest::SetIdleTimeout(60_000, reply));
        assert_eq!(service.armed, None);

        service.handle(SleepRequest::StartCountdown);
        assert_eq!(service.armed, Some(1));
    }

    #[test]
    fn only_armed_countdown_may_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, power, _rx) = service(&dir, enabled_policy(60_000));
        service.handle(SleepRequest::StartCountdown);

        service.handle(SleepRequest::CountdownExpired { generation: 7 });
        assert!(power.sleeps().is_empty());

        service.handle(SleepRequest::CountdownExpired { generation: 1 });
        assert_eq!(power.sleeps(), vec![Duration::from_millis(60_000)]);

        // The same countdown cannot fire twice.
        service.handle(SleepRequest::CountdownExpired { generation: 1 });
        assert_eq!(power.sleeps().len(), 1);
    }

    #[test]
    fn rearming_reuses_one_countdown_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, power, rx) = service(&dir, enabled_policy(60_000));
        service.handle(SleepRequest::StartCountdown);
        let worker = service.countdown.as_ref().unwrap().thread.thread().id();

        for extra in 0..50 {
            let (reply, _answer) = mpsc::sync_channel(1);
            service.handle(SleepRequest::SetIdleTimeout(60_000 + extra, reply));
        }
        let countdown = service.countdown.as_ref().unwrap();
        assert_eq!(countdown.thread.thread().id(), worker);
        assert!(!countdown.thread.is_finished());
        assert_eq!(service.armed, Some(51));

        // Only the latest deadline fires.
        let (reply, _answer) = mpsc::sync_channel(1);
        service.handle(SleepRequest::SetIdleTimeout(100, reply));
        let expired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let SleepRequest::CountdownExpired { generation } = expired else {
            panic!("expected a countdown expiry");
        };
        assert_eq!(generation, 52);
        service.handle(SleepRequest::CountdownExpired { generation });
        assert_eq!(power.sleeps(), vec![Duration::from_millis(60_000)]);
    }

    #[test]
    fn forced_sleep_cancels_countdown() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, power, _rx) = service(&dir, enabled_policy(60_000));
        service.handle(SleepRequest::StartCountdown);

        let (reply, answer) = mpsc::sync_channel(1);
        service.handle(SleepRequest::ForceSleep(reply));
        assert_eq!(answer.recv().unwrap().unwrap(), 60_000);

        service.handle(SleepRequest::CountdownExpired { generation: 1 });
        assert_eq!(power.sleeps().len(), 1);
    }

    #[test]
    fn expired_countdown_puts_device_to_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let store = LineStore::new(dir.path().join("sleep.txt"));
        store.save(&enabled_policy(50)).unwrap();
        let power = FakePower::default();
        let handle = spawn(store, power.clone()).unwrap();

        handle.start_idle_countdown();
        assert!(wait_for_sleep(&power));
        assert_eq!(power.sleeps(), vec![Duration::from_millis(60_000)]);
    }

    #[test]
    fn disabling_stops_countdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = LineStore::new(dir.path().join("sleep.txt"));
        store.save(&enabled_policy(200)).unwrap();
        let power = FakePower::default();
        let handle = spawn(store, power.clone()).unwrap();

        handle.start_idle_countdown();
        let policy = handle.set_enabled(false).unwrap();
        assert!(!policy.enabled);
        thread::sleep(Duration::from_millis(400));
        handle.status().unwrap();
        assert!(power.sleeps().is_empty());
    }

    #[test]
    fn enabling_requires_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = LineStore::new(dir.path().join("sleep.txt"));
        let handle = spawn(store.clone(), FakePower::default()).unwrap();

        assert!(matches!(
            handle.set_enabled(true),
            Err(PolicyError::NoInterval)
        ));
        assert!(store.read(3).unwrap().is_none());
        assert!(matches!(handle.force_sleep(), Err(PolicyError::NoInterval)));
    }

    #[test]
    fn failed_write_still_updates_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = LineStore::new(dir.path().join("missing-dir").join("sleep.txt"));
        let handle = spawn(store, FakePower::default()).unwrap();

        assert!(matches!(
            handle.set_interval(5_000),
            Err(PolicyError::Persist(_))
        ));
        assert_eq!(handle.status().unwrap().interval_ms, 5_000);
    }
}
