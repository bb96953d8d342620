use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::client::MarstekClient;
use super::sink::{AvailabilitySink, TelemetrySink};
use super::structs::{ConnectionConfig, PollState};
use super::transport::Transport;
use super::MarstekError;
use crate::config::{MarstekDeviceConfig, FRAME_KEYS};

/// Consecutive failed poll cycles before the meter is reported unavailable
pub const FAILURE_THRESHOLD: u32 = 5;
pub const UNAVAILABLE_REASON: &str = "No response from meter";

#[derive(Debug)]
pub enum PollOutcome {
    /// No request frame could be built from the current settings
    Skipped,
    Failed(MarstekError),
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SettingsImpact {
    pub rebuild_frame: bool,
    pub restart_timer: bool,
}

pub enum PollerCommand {
    Settings(MarstekDeviceConfig),
    Stop,
}

/// Polling state machine of one meter
pub struct DevicePoller {
    settings: MarstekDeviceConfig,
    connection: ConnectionConfig,
    client: MarstekClient,
    state: PollState,
    telemetry: Arc<dyn TelemetrySink>,
    availability: Arc<dyn AvailabilitySink>,
    log_prefix: String,
}

fn log_prefix(settings: &MarstekDeviceConfig) -> String {
    format!("[{}@{}:{}]", settings.name, settings.host, settings.port)
}

impl DevicePoller {
    pub fn new(
        settings: MarstekDeviceConfig,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn TelemetrySink>,
        availability: Arc<dyn AvailabilitySink>,
    ) -> Self {
        let prefix = log_prefix(&settings);
        let mut poller = DevicePoller {
            connection: settings.connection(),
            client: MarstekClient::new(transport).with_log_prefix(prefix.clone()),
            settings,
            state: PollState::default(),
            telemetry,
            availability,
            log_prefix: prefix,
        };
        poller.rebuild_frame();
        poller
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn cached_frame(&self) -> Option<&[u8]> {
        self.client.cached_frame()
    }

    fn rebuild_frame(&mut self) {
        self.client.invalidate();
        match self.settings.identity() {
            Ok(identity) => {
                self.client.frame_for(&identity);
            }
            Err(e) => {
                error!("{} Failed to build payload: {e}", self.log_prefix);
            }
        }
    }

    /// Take over new settings, rebuilding the frame if the identity or host changed
    pub fn apply_settings(&mut self, settings: MarstekDeviceConfig) -> SettingsImpact {
        let changed = self.settings.changed_keys(&settings);
        let impact = SettingsImpact {
            rebuild_frame: changed.iter().any(|k| FRAME_KEYS.contains(k)),
            restart_timer: !changed.is_empty(),
        };

        if !changed.is_empty() {
            info!("{} Settings changed: {}", self.log_prefix, changed.join(", "));
        }

        self.settings = settings;
        self.connection = self.settings.connection();
        self.log_prefix = log_prefix(&self.settings);
        self.client.set_log_prefix(self.log_prefix.clone());

        if impact.rebuild_frame {
            self.rebuild_frame();
        }

        impact
    }

    /// Run one poll cycle and update the availability bookkeeping
    pub async fn poll_once(&mut self) -> PollOutcome {
        if self.client.cached_frame().is_none() {
            self.rebuild_frame();
        }

        let result = match self.client.cached_frame() {
            Some(frame) => self.client.request_frame(&self.connection, frame).await,
            None => return PollOutcome::Skipped,
        };

        match result {
            Err(e) => {
                self.state.consecutive_failures += 1;
                if self.connection.debug {
                    info!("{} Polling error: {e}", self.log_prefix);
                }

                if self.state.consecutive_failures >= FAILURE_THRESHOLD && self.state.available {
                    warn!("{} {} failed polls in a row, marking unavailable", self.log_prefix, self.state.consecutive_failures);
                    self.availability.set_unavailable(UNAVAILABLE_REASON).await;
                    self.state.available = false;
                }
                PollOutcome::Failed(e)
            }
            Ok(record) => {
                if !self.state.available {
                    info!("{} Meter is responding again", self.log_prefix);
                }
                self.state.consecutive_failures = 0;
                self.state.available = true;
                self.availability.set_available().await;
                self.telemetry.publish_telemetry(&record).await;
                self.state.last_poll_time = Some(Utc::now());
                PollOutcome::Published
            }
        }
    }

    /// Poll until stopped.
    ///
    /// Every (re)start polls right away and then every `poll_interval_seconds`. Commands are
    /// only looked at between cycles, a running cycle always completes.
    pub async fn run(mut self, mut control: Receiver<PollerCommand>) {
        info!("{} Polling started", self.log_prefix);

        loop {
            self.poll_once().await;

            let period = self.connection.poll_interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let restart = loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                    command = control.recv() => {
                        match command {
                            Some(PollerCommand::Settings(settings)) => {
                                if self.apply_settings(settings).restart_timer {
                                    break true;
                                }
                            }
                            Some(PollerCommand::Stop) | None => break false,
                        }
                    }
                }
            };

            if !restart {
                break;
            }
            debug!("{} Restarting poll timer", self.log_prefix);
        }

        info!("{} Polling stopped", self.log_prefix);
    }
}

/// Handle of a poller running on its own task
pub struct PollerHandle {
    sender: Sender<PollerCommand>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    pub fn spawn(poller: DevicePoller) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let join = tokio::spawn(poller.run(receiver));
        PollerHandle { sender, join }
    }

    pub async fn update(&self, settings: MarstekDeviceConfig) {
        let _ = self.sender.send(PollerCommand::Settings(settings)).await;
    }

    /// Ask the poller to stop after its current cycle and wait for it
    pub async fn stop(self) {
        let _ = self.sender.send(PollerCommand::Stop).await;
        let _ = self.join.await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_marstek::client::tests::{meter_reply, ScriptedTransport};
    use crate::metering_marstek::structs::TelemetryRecord;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Telemetry(Option<i64>),
        Available,
        Unavailable(String),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn publish_telemetry(&self, record: &TelemetryRecord) {
            self.events.lock().unwrap().push(Event::Telemetry(record.total_power()));
        }
    }

    #[async_trait]
    impl AvailabilitySink for RecordingSink {
        async fn set_available(&self) {
            self.events.lock().unwrap().push(Event::Available);
        }

        async fn set_unavailable(&self, reason: &str) {
            self.events.lock().unwrap().push(Event::Unavailable(reason.to_string()));
        }
    }

    fn settings() -> MarstekDeviceConfig {
        MarstekDeviceConfig::new("garage".to_string(), "192.168.1.50".to_string(),
                                 "HMG50".to_string(), "HME-4".to_string(),
                                 "AA:BB:CC:DD:EE:FF".to_string(), "001122334455".to_string())
    }

    fn poller(transport: Arc<ScriptedTransport>, sink: Arc<RecordingSink>) -> DevicePoller {
        let mut s = settings();
        s.retries = 0;
        DevicePoller::new(s, transport, sink.clone(), sink)
    }

    #[tokio::test]
    async fn test_failures_below_threshold_then_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(MarstekError::Timeout(1500)),
            Err(MarstekError::Timeout(1500)),
            Err(MarstekError::MalformedResponse("Response too short".to_string())),
            Err(MarstekError::Timeout(1500)),
            Ok(meter_reply(230)),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poller(transport, sink.clone());

        for n in 1..=4 {
            assert!(matches!(poller.poll_once().await, PollOutcome::Failed(_)));
            assert_eq!(poller.state().consecutive_failures, n);
            assert!(sink.events().is_empty(), "availability touched after failure {n}");
        }

        assert!(matches!(poller.poll_once().await, PollOutcome::Published));
        assert_eq!(poller.state().consecutive_failures, 0);
        assert!(poller.state().available);
        assert!(poller.state().last_poll_time.is_some());
        assert_eq!(sink.events(), vec![Event::Available, Event::Telemetry(Some(230))]);
    }

    #[tokio::test]
    async fn test_unavailable_reported_once() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let sink = Arc::new(RecordingSink::default());
        let mut poller = poller(transport.clone(), sink.clone());

        for _ in 0..8 {
            poller.poll_once().await;
        }
        assert!(!poller.state().available);
        assert_eq!(poller.state().consecutive_failures, 8);
        assert_eq!(sink.events(), vec![Event::Unavailable(UNAVAILABLE_REASON.to_string())]);
        assert!(poller.state().last_poll_time.is_none());

        transport.push(Ok(meter_reply(5)));
        poller.poll_once().await;
        assert!(poller.state().available);
        assert_eq!(sink.events().last(), Some(&Event::Telemetry(Some(5))));

        for _ in 0..5 {
            poller.poll_once().await;
        }
        let unavailable = sink.events().iter().filter(|e| matches!(e, Event::Unavailable(_))).count();
        assert_eq!(unavailable, 2);
    }

    #[tokio::test]
    async fn test_retries_per_cycle() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(MarstekError::Timeout(1500)),
            Err(MarstekError::Timeout(1500)),
            Ok(meter_reply(7)),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let mut poller = DevicePoller::new(settings(), transport.clone(), sink.clone(), sink.clone());

        assert!(matches!(poller.poll_once().await, PollOutcome::Published));
        assert_eq!(transport.call_count(), 3);
        assert_eq!(poller.state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_invalid_identity_skips_cycle() {
        let transport = Arc::new(ScriptedTransport::new(vec![]).then_always(meter_reply(1)));
        let sink = Arc::new(RecordingSink::default());
        let mut bad = settings();
        bad.battery_mac = "not a mac".to_string();
        let mut poller = DevicePoller::new(bad, transport.clone(), sink.clone(), sink.clone());

        assert!(poller.cached_frame().is_none());
        assert!(matches!(poller.poll_once().await, PollOutcome::Skipped));
        assert_eq!(transport.call_count(), 0);
        assert_eq!(poller.state().consecutive_failures, 0);

        let impact = poller.apply_settings(settings());
        assert!(impact.rebuild_frame);
        assert!(poller.cached_frame().is_some());
        assert!(matches!(poller.poll_once().await, PollOutcome::Published));
    }

    #[tokio::test]
    async fn test_settings_impact() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let sink = Arc::new(RecordingSink::default());
        let mut poller = DevicePoller::new(settings(), transport, sink.clone(), sink);
        let frame = poller.cached_frame().unwrap().to_vec();

        let mut s = settings();
        s.poll_interval_seconds = 30;
        s.timeout_ms = 3000;
        let impact = poller.apply_settings(s.clone());
        assert_eq!(impact, SettingsImpact { rebuild_frame: false, restart_timer: true });
        assert_eq!(poller.cached_frame(), Some(frame.as_slice()));

        assert_eq!(poller.apply_settings(s.clone()), SettingsImpact::default());

        s.ct_type = "HME-3".to_string();
        let impact = poller.apply_settings(s);
        assert_eq!(impact, SettingsImpact { rebuild_frame: true, restart_timer: true });
        assert_ne!(poller.cached_frame(), Some(frame.as_slice()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fires_immediately_and_on_interval() {
        let transport = Arc::new(ScriptedTransport::new(vec![]).then_always(meter_reply(3)));
        let sink = Arc::new(RecordingSink::default());
        let poller = DevicePoller::new(settings(), transport.clone(), sink.clone(), sink.clone());
        let handle = PollerHandle::spawn(poller);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.call_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.call_count(), 2);

        /* A new interval restarts the timer with an immediate poll */
        let mut s = settings();
        s.poll_interval_seconds = 20;
        handle.update(s).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.call_count(), 3);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(transport.call_count(), 3);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.call_count(), 4);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.call_count(), 4);
    }
}
