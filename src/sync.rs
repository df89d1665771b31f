//! Eventual consistency with the backend: refresh resources when change notifications arrive, and
//! poll periodically as a backstop for missed notifications.
use std::{
    collections::BTreeSet,
    sync::{
        mpsc::{self, RecvTimeoutError, TryRecvError},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    configuration_store::{ConfigStore, Source},
    model::Resource,
    Error, Result,
};

/// "Something changed" signal for one backend table. The payload is opaque and only logged.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub table: String,
    pub payload: serde_json::Value,
}

impl ChangeNotification {
    pub fn new(table: impl Into<String>) -> ChangeNotification {
        ChangeNotification {
            table: table.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Returns `false` once it no longer wants notifications.
pub type ChangeListener = Box<dyn Fn(&ChangeNotification) -> bool + Send + Sync>;

/// A publish/subscribe channel keyed by table name. Delivery is at-least-once with no ordering
/// guarantee. Implement this over whatever realtime transport the application uses.
pub trait ChangeFeed {
    fn subscribe(&self, listener: ChangeListener) -> Result<()>;
}

/// In-process [`ChangeFeed`]. Useful when notifications are received by application code and
/// forwarded by hand.
#[derive(Default)]
pub struct LocalChangeFeed {
    listeners: Mutex<Vec<ChangeListener>>,
}

impl LocalChangeFeed {
    pub fn new() -> LocalChangeFeed {
        LocalChangeFeed::default()
    }

    /// Deliver `notification` to every listener. Returns the number of listeners still
    /// subscribed.
    pub fn publish(&self, notification: &ChangeNotification) -> usize {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| listener(notification));
        listeners.len()
    }
}

impl ChangeFeed for LocalChangeFeed {
    fn subscribe(&self, listener: ChangeListener) -> Result<()> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
        Ok(())
    }
}

/// Something that can re-resolve a resource.
pub trait RefreshTarget: Send + Sync {
    fn refresh(&self, resource: Resource) -> Result<Source>;
}

impl RefreshTarget for ConfigStore {
    fn refresh(&self, resource: Resource) -> Result<Source> {
        ConfigStore::refresh(self, resource)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Refresh everything when no notification arrived for this long. `None` disables polling.
    pub poll_interval: Option<Duration>,
    /// Random delay added on top of each poll interval.
    pub poll_jitter: Duration,
    /// Cap for the poll interval after consecutive failed refreshes.
    pub max_backoff: Duration,
}

impl SyncConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(30);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            poll_interval: Some(SyncConfig::DEFAULT_POLL_INTERVAL),
            poll_jitter: SyncConfig::DEFAULT_POLL_JITTER,
            max_backoff: SyncConfig::DEFAULT_MAX_BACKOFF,
        }
    }
}

enum Message {
    Changed(Resource),
    Stop,
}

/// A background thread that keeps a [`RefreshTarget`] in sync.
///
/// Use [`Client::start_sync`](crate::Client::start_sync) to get an instance of it. Dropping it
/// leaves the thread running; call [`SyncSubscriber::stop`] or [`SyncSubscriber::shutdown`].
pub struct SyncSubscriber {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the sync thread.
    sender: mpsc::Sender<Message>,
}

impl SyncSubscriber {
    pub fn start(
        feed: &dyn ChangeFeed,
        target: Arc<dyn RefreshTarget>,
        config: SyncConfig,
    ) -> Result<SyncSubscriber> {
        let (sender, receiver) = mpsc::channel::<Message>();

        let listener = {
            let sender = sender.clone();
            Box::new(move |notification: &ChangeNotification| {
                match Resource::from_table(&notification.table) {
                    Some(resource) => {
                        log::trace!(target: "flagkit",
                                    resource:display = resource,
                                    payload:serde = notification.payload;
                                    "received change notification");
                        // Fails once the sync thread has exited, which unsubscribes us.
                        sender.send(Message::Changed(resource)).is_ok()
                    }
                    None => {
                        log::trace!(target: "flagkit",
                                    table = notification.table.as_str();
                                    "ignoring notification for unrelated table");
                        true
                    }
                }
            })
        };
        feed.subscribe(listener)?;

        let join_handle = std::thread::Builder::new()
            .name("flagkit-sync".to_owned())
            .spawn(move || run(receiver, target, config))?;

        Ok(SyncSubscriber {
            join_handle,
            sender,
        })
    }

    /// Stop the sync thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited). Ignoring it as there's nothing
        // useful we can do.
        let _ = self.sender.send(Message::Stop);
    }

    /// Stop the sync thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::SyncThreadPanicked)?;
        Ok(())
    }
}

fn run(receiver: mpsc::Receiver<Message>, target: Arc<dyn RefreshTarget>, config: SyncConfig) {
    let mut failures = 0u32;
    loop {
        let message = match next_poll(&config, failures) {
            Some(timeout) => receiver.recv_timeout(timeout),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        let resources: BTreeSet<Resource> = match message {
            Ok(Message::Changed(resource)) => {
                // Collapse a burst of notifications into one refresh per resource.
                let mut resources = BTreeSet::from([resource]);
                loop {
                    match receiver.try_recv() {
                        Ok(Message::Changed(resource)) => {
                            resources.insert(resource);
                        }
                        Ok(Message::Stop) => return,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break,
                    }
                }
                resources
            }
            Ok(Message::Stop) => {
                log::debug!(target: "flagkit", "sync thread received stop command");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                log::debug!(target: "flagkit", "polling for configuration changes");
                Resource::ALL.into()
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!(target: "flagkit", "all senders dropped, sync thread exiting");
                return;
            }
        };

        let mut healthy = true;
        for resource in resources {
            match target.refresh(resource) {
                Ok(Source::Live) => {}
                Ok(source) => {
                    log::debug!(target: "flagkit",
                                resource:display = resource,
                                source:serde = source;
                                "refresh fell back");
                    healthy = false;
                }
                Err(err) => {
                    log::warn!(target: "flagkit", resource:display = resource; "refresh failed: {}", err);
                    healthy = false;
                }
            }
        }
        failures = if healthy { 0 } else { failures.saturating_add(1) };
    }
}

/// How long to wait for a notification before polling, given consecutive failed rounds.
fn next_poll(config: &SyncConfig, failures: u32) -> Option<Duration> {
    let interval = config.poll_interval?;
    Some(jitter(
        backoff(interval, failures, config.max_backoff),
        config.poll_jitter,
    ))
}

/// `interval * 2^failures`, capped at `max` (but never below `interval`).
fn backoff(interval: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    interval
        .checked_mul(factor)
        .unwrap_or(max)
        .min(max.max(interval))
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Mutex},
        time::Duration,
    };

    use super::{
        backoff, ChangeFeed, ChangeNotification, LocalChangeFeed, RefreshTarget, SyncConfig,
        SyncSubscriber,
    };
    use crate::{configuration_store::Source, model::Resource, Result};

    struct Recorder {
        refreshed: Mutex<mpsc::Sender<Resource>>,
        outcome: Result<Source>,
    }

    impl RefreshTarget for Recorder {
        fn refresh(&self, resource: Resource) -> Result<Source> {
            let _ = self.refreshed.lock().unwrap().send(resource);
            self.outcome.clone()
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::Receiver<Resource>) {
        let (sender, receiver) = mpsc::channel();
        let recorder = Recorder {
            refreshed: Mutex::new(sender),
            outcome: Ok(Source::Live),
        };
        (Arc::new(recorder), receiver)
    }

    fn no_polling() -> SyncConfig {
        SyncConfig {
            poll_interval: None,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn notification_refreshes_matching_resource() {
        let feed = LocalChangeFeed::new();
        let (target, refreshed) = recorder();
        let sync = SyncSubscriber::start(&feed, target, no_polling()).unwrap();

        assert_eq!(feed.publish(&ChangeNotification::new("experiments")), 1);
        assert_eq!(
            refreshed.recv_timeout(Duration::from_secs(5)).unwrap(),
            Resource::Experiments
        );

        sync.shutdown().unwrap();
    }

    #[test]
    fn unrelated_tables_are_ignored() {
        let feed = LocalChangeFeed::new();
        let (target, refreshed) = recorder();
        let sync = SyncSubscriber::start(&feed, target, no_polling()).unwrap();

        feed.publish(&ChangeNotification::new("quiz_questions"));
        assert!(refreshed.recv_timeout(Duration::from_millis(100)).is_err());

        sync.shutdown().unwrap();
    }

    #[test]
    fn polls_everything_when_idle() {
        let feed = LocalChangeFeed::new();
        let (target, refreshed) = recorder();
        let sync = SyncSubscriber::start(
            &feed,
            target,
            SyncConfig {
                poll_interval: Some(Duration::from_millis(20)),
                poll_jitter: Duration::ZERO,
                max_backoff: Duration::from_secs(1),
            },
        )
        .unwrap();

        let mut seen: Vec<Resource> = (0..3)
            .map(|_| refreshed.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, Resource::ALL.to_vec());

        sync.shutdown().unwrap();
    }

    #[test]
    fn listener_unsubscribes_after_shutdown() {
        let feed = LocalChangeFeed::new();
        let (target, _refreshed) = recorder();
        SyncSubscriber::start(&feed, target, no_polling())
            .unwrap()
            .shutdown()
            .unwrap();

        assert_eq!(feed.publish(&ChangeNotification::new("feature_flags")), 0);
    }

    #[test]
    fn custom_feed_receives_listener() {
        struct Capture(Mutex<Option<super::ChangeListener>>);
        impl ChangeFeed for Capture {
            fn subscribe(&self, listener: super::ChangeListener) -> Result<()> {
                *self.0.lock().unwrap() = Some(listener);
                Ok(())
            }
        }

        let feed = Capture(Mutex::new(None));
        let (target, refreshed) = recorder();
        let sync = SyncSubscriber::start(&feed, target, no_polling()).unwrap();

        let listener = feed.0.lock().unwrap().take().unwrap();
        assert!(listener(&ChangeNotification::new("remote_config")));
        assert_eq!(
            refreshed.recv_timeout(Duration::from_secs(5)).unwrap(),
            Resource::RemoteConfig
        );

        sync.shutdown().unwrap();
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let interval = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        assert_eq!(backoff(interval, 0, max), interval);
        assert_eq!(backoff(interval, 1, max), Duration::from_secs(120));
        assert_eq!(backoff(interval, 3, max), Duration::from_secs(480));
        assert_eq!(backoff(interval, 4, max), max);
        assert_eq!(backoff(interval, u32::MAX, max), max);
        assert_eq!(backoff(interval, 2, Duration::from_secs(1)), interval);
    }
}
