//! Glue between device sessions and the message broker.
//!
//! Inbound command topics are parsed, transformed and queued on the owning
//! session. Device state flows the other way as per-key and aggregate
//! publications, which a single dispatcher task hands to the [`Messenger`].

use crate::dps::{DpKey, DpMap, DpValue, dps_to_json};
use crate::error::{Result, TuyaError};
use crate::registry::{DeviceRegistry, Target};
use crate::session::{SessionCommand, SessionHandle, SessionOptions, StateUpdate};
use crate::supervisor::WorkerSupervisor;
use crate::transport::Connector;
use futures_core::Stream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub const DEFAULT_BASE_TOPIC: &str = "tuya";

const PUBLICATION_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 256;

/// Publish/subscribe capability of the broker connection.
///
/// Implementations must tolerate concurrent calls; the bridge itself only
/// publishes from its dispatcher task.
pub trait Messenger: Clone + Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: &str) -> impl Future<Output = Result<()>> + Send;

    fn subscribe(&self, filter: &str) -> impl Future<Output = Result<()>> + Send;
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// An outbound state message waiting for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
}

/// Topic layout under a configurable base.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    base: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

impl TopicScheme {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `<base>/<name>/dps/<key>/state`
    pub fn state_topic(&self, name: &str, key: DpKey) -> String {
        format!("{}/{}/dps/{}/state", self.base, name, key)
    }

    /// `<base>/<name>/dps/state`
    pub fn aggregate_topic(&self, name: &str) -> String {
        format!("{}/{}/dps/state", self.base, name)
    }

    /// `<base>/<name>/dps/<key>/command`
    pub fn command_topic(&self, name: &str, key: DpKey) -> String {
        format!("{}/{}/dps/{}/command", self.base, name, key)
    }

    /// Subscription filter for every command topic of `name`.
    pub fn command_filter(&self, name: &str) -> String {
        format!("{}/{}/dps/+/command", self.base, name)
    }

    /// Splits a command topic into device name and DP key.
    pub fn parse_command<'a>(&self, topic: &'a str) -> Result<(&'a str, DpKey)> {
        let invalid = || TuyaError::InvalidTopic(topic.to_string());
        let rest = topic
            .strip_prefix(self.base.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(invalid)?;

        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(name), Some("dps"), Some(key), Some("command"), None) if !name.is_empty() => {
                let key = key.trim().parse::<DpKey>().map_err(|_| invalid())?;
                Ok((name, key))
            }
            _ => Err(invalid()),
        }
    }
}

/// Which state messages get published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicConvention {
    pub per_key: bool,
    pub aggregate: bool,
}

impl Default for TopicConvention {
    fn default() -> Self {
        Self {
            per_key: true,
            aggregate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Broker to device
    Inbound,
    /// Device to broker
    Outbound,
}

/// A pure value-in, value-out conversion.
pub type ValueTransform = Arc<dyn Fn(DpValue) -> DpValue + Send + Sync>;

/// Transforms keyed by (device or sub-device name, DP key, direction).
#[derive(Clone, Default)]
pub struct TransformTable {
    entries: HashMap<(String, DpKey, Direction), ValueTransform>,
}

impl std::fmt::Debug for TransformTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl TransformTable {
    pub fn register<F>(&mut self, name: &str, key: DpKey, direction: Direction, transform: F)
    where
        F: Fn(DpValue) -> DpValue + Send + Sync + 'static,
    {
        self.entries
            .insert((name.to_string(), key, direction), Arc::new(transform));
    }

    pub fn apply(&self, name: &str, key: DpKey, direction: Direction, value: DpValue) -> DpValue {
        match self.entries.get(&(name.to_string(), key, direction)) {
            Some(transform) => transform(value),
            None => value,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Broker-facing settings of the bridge.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    pub topics: TopicScheme,
    pub convention: TopicConvention,
    pub transforms: TransformTable,
}

/// Routes commands to sessions and state to publications.
pub struct BridgeRouter {
    registry: DeviceRegistry,
    options: BridgeOptions,
    sessions: HashMap<String, SessionHandle>,
    publications: mpsc::Sender<Publication>,
}

impl BridgeRouter {
    pub fn new(
        registry: DeviceRegistry,
        options: BridgeOptions,
        sessions: HashMap<String, SessionHandle>,
        publications: mpsc::Sender<Publication>,
    ) -> Self {
        Self {
            registry,
            options,
            sessions,
            publications,
        }
    }

    /// Subscription filters for every device and sub-device name.
    pub fn subscriptions(&self) -> Vec<String> {
        self.registry
            .names()
            .map(|name| self.options.topics.command_filter(name))
            .collect()
    }

    /// Handles one message from a command topic.
    ///
    /// Empty payloads are ignored. Unknown names and malformed topics are
    /// reported as errors for the caller to log; nothing is queued for them.
    pub fn on_inbound_command(&self, topic: &str, raw: &[u8]) -> Result<()> {
        let (name, key) = self.options.topics.parse_command(topic)?;
        let target = self
            .registry
            .by_name(name)
            .ok_or_else(|| TuyaError::DeviceNotFound(name.to_string()))?;

        let text = String::from_utf8_lossy(raw);
        let Some(value) = DpValue::parse_command(&text) else {
            debug!("Ignoring empty command on {}", topic);
            return Ok(());
        };
        let value = self
            .options
            .transforms
            .apply(name, key, Direction::Inbound, value);

        let sub_id = match target {
            Target::Device(_) => None,
            Target::SubDevice(_, sub) => Some(sub.id.clone()),
        };
        let device = target.device();
        let session = self
            .sessions
            .get(&device.id)
            .ok_or_else(|| TuyaError::DeviceNotFound(device.name.clone()))?;

        debug!("Command {} -> {}={}", name, key, value);
        session.submit(SessionCommand::SetDps {
            sub_id,
            dps: DpMap::from([(key, value)]),
        })
    }

    /// Queues the publications for a state update. Never waits: when the
    /// queue is full the message is dropped with a warning.
    pub fn on_device_state(&self, update: &StateUpdate) {
        let name = update.name.as_str();
        let transforms = &self.options.transforms;
        let topics = &self.options.topics;

        if self.options.convention.per_key {
            for (key, value) in &update.reported {
                let value = transforms.apply(name, *key, Direction::Outbound, value.clone());
                self.enqueue(topics.state_topic(name, *key), value.to_string());
            }
        }

        if self.options.convention.aggregate {
            let snapshot: DpMap = update
                .snapshot
                .iter()
                .map(|(key, value)| {
                    let value = transforms.apply(name, *key, Direction::Outbound, value.clone());
                    (*key, value)
                })
                .collect();
            self.enqueue(topics.aggregate_topic(name), dps_to_json(&snapshot).to_string());
        }
    }

    fn enqueue(&self, topic: String, payload: String) {
        match self.publications.try_send(Publication { topic, payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(p)) => {
                warn!("Publication queue full, dropping message for {}", p.topic);
            }
            Err(mpsc::error::TrySendError::Closed(p)) => {
                debug!("Dispatcher gone, dropping message for {}", p.topic);
            }
        }
    }
}

/// The single task calling [`Messenger::publish`]. Runs until every sender of
/// the queue is gone and the queue is empty.
pub async fn dispatch<M: Messenger>(messenger: M, mut queue: mpsc::Receiver<Publication>) {
    while let Some(publication) = queue.recv().await {
        debug!("PUBLISH {} = {}", publication.topic, publication.payload);
        if let Err(e) = messenger
            .publish(&publication.topic, &publication.payload)
            .await
        {
            warn!("Publishing to {} failed: {}", publication.topic, e);
        }
    }
    debug!("Publication dispatcher stopped");
}

/// A running bridge: device workers plus the routing tasks around them.
pub struct Bridge<C: Connector> {
    supervisor: WorkerSupervisor<C>,
    cancel_token: CancellationToken,
    tracker: TaskTracker,
}

impl<C: Connector> Bridge<C> {
    /// Subscribes the command topics and starts every worker and routing task.
    pub async fn start<M, S>(
        registry: DeviceRegistry,
        connector: C,
        session_options: SessionOptions,
        options: BridgeOptions,
        messenger: M,
        inbound: S,
    ) -> Result<Self>
    where
        M: Messenger,
        S: Stream<Item = InboundMessage> + Send + 'static,
    {
        let mut supervisor = WorkerSupervisor::new(registry.clone(), connector, session_options);
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
        let (pub_tx, pub_rx) = mpsc::channel(PUBLICATION_QUEUE);

        let sessions = supervisor.start_all(events_tx);
        let router = Arc::new(BridgeRouter::new(registry, options, sessions, pub_tx));

        for filter in router.subscriptions() {
            messenger.subscribe(&filter).await?;
            info!("Subscribed to {}", filter);
        }

        let cancel_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(dispatch(messenger, pub_rx));

        let state_router = router.clone();
        let state_cancel = cancel_token.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = state_cancel.cancelled() => break,
                    update = events_rx.recv() => match update {
                        Some(update) => state_router.on_device_state(&update),
                        None => break,
                    },
                }
            }
        });

        let command_cancel = cancel_token.clone();
        tracker.spawn(async move {
            let mut inbound = std::pin::pin!(inbound);
            loop {
                tokio::select! {
                    _ = command_cancel.cancelled() => break,
                    msg = inbound.next() => match msg {
                        Some(msg) => {
                            if let Err(e) = router.on_inbound_command(&msg.topic, &msg.payload) {
                                warn!("Rejected command on {}: {}", msg.topic, e);
                            }
                        }
                        None => {
                            debug!("Inbound message stream ended");
                            break;
                        }
                    },
                }
            }
        });
        tracker.close();

        Ok(Self {
            supervisor,
            cancel_token,
            tracker,
        })
    }

    pub fn supervisor(&self) -> &WorkerSupervisor<C> {
        &self.supervisor
    }

    /// Stops the workers, then the routing tasks, within `window`.
    ///
    /// Publications already queued are still handed to the messenger.
    pub async fn shutdown(mut self, window: Duration) {
        info!("Shutting down bridge");
        self.supervisor.stop_all(window).await;
        self.cancel_token.cancel();
        if timeout(window, self.tracker.wait()).await.is_err() {
            warn!("Bridge tasks did not stop within {}ms", window.as_millis());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        published: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Messenger for Recorder {
        async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
            self.published
                .lock()
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }

        async fn subscribe(&self, _filter: &str) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::from_json(
            r#"[
                {"name": "socket", "id": "s1", "ip": "h", "key": "0123456789abcdef", "version": 3.3},
                {"name": "gw1", "id": "g1", "ip": "h", "key": "0123456789abcdef", "version": 3.4,
                 "subDevices": [{"name": "trv", "id": "t1", "cid": "6666ccccddddeeee"}]}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn topics_round_trip() {
        let topics = TopicScheme::new("home/tuya/");
        assert_eq!(topics.state_topic("socket", 1), "home/tuya/socket/dps/1/state");
        assert_eq!(topics.aggregate_topic("socket"), "home/tuya/socket/dps/state");
        assert_eq!(topics.command_filter("trv"), "home/tuya/trv/dps/+/command");

        let topic = topics.command_topic("trv", 2);
        assert_eq!(topics.parse_command(&topic).unwrap(), ("trv", 2));
    }

    #[test]
    fn malformed_command_topics_are_rejected() {
        let topics = TopicScheme::default();
        for topic in [
            "tuya/socket/dps/x/command",
            "tuya/socket/dps/1/state",
            "tuya/socket/dps/1/command/extra",
            "other/socket/dps/1/command",
            "tuya//dps/1/command",
        ] {
            assert!(
                matches!(topics.parse_command(topic), Err(TuyaError::InvalidTopic(_))),
                "{}",
                topic
            );
        }
    }

    #[test]
    fn transforms_apply_per_name_key_and_direction() {
        let mut table = TransformTable::default();
        table.register("trv", 2, Direction::Outbound, |v| match v {
            DpValue::Int(i) => DpValue::Int(i / 10),
            other => other,
        });
        assert_eq!(
            table.apply("trv", 2, Direction::Outbound, DpValue::Int(220)),
            DpValue::Int(22)
        );
        assert_eq!(
            table.apply("trv", 2, Direction::Inbound, DpValue::Int(220)),
            DpValue::Int(220)
        );
        assert_eq!(
            table.apply("gw1", 2, Direction::Outbound, DpValue::Int(220)),
            DpValue::Int(220)
        );
    }

    #[test]
    fn state_updates_become_publications() {
        let (pub_tx, mut pub_rx) = mpsc::channel(16);
        let router = BridgeRouter::new(registry(), BridgeOptions::default(), HashMap::new(), pub_tx);

        router.on_device_state(&StateUpdate {
            id: "t1".into(),
            name: "trv".into(),
            reported: DpMap::from([(2, DpValue::Int(220))]),
            snapshot: DpMap::from([(2, DpValue::Int(220)), (3, DpValue::Bool(true))]),
        });

        let per_key = pub_rx.try_recv().unwrap();
        assert_eq!(per_key.topic, "tuya/trv/dps/2/state");
        assert_eq!(per_key.payload, "220");
        let aggregate = pub_rx.try_recv().unwrap();
        assert_eq!(aggregate.topic, "tuya/trv/dps/state");
        assert_eq!(aggregate.payload, r#"{"2":220,"3":true}"#);
        assert!(pub_rx.try_recv().is_err());
    }

    #[test]
    fn convention_selects_published_topics() {
        let (pub_tx, mut pub_rx) = mpsc::channel(16);
        let options = BridgeOptions {
            convention: TopicConvention {
                per_key: false,
                aggregate: true,
            },
            ..Default::default()
        };
        let router = BridgeRouter::new(registry(), options, HashMap::new(), pub_tx);
        router.on_device_state(&StateUpdate {
            id: "s1".into(),
            name: "socket".into(),
            reported: DpMap::from([(1, DpValue::Bool(true))]),
            snapshot: DpMap::from([(1, DpValue::Bool(true))]),
        });
        assert_eq!(pub_rx.try_recv().unwrap().topic, "tuya/socket/dps/state");
        assert!(pub_rx.try_recv().is_err());
    }

    #[test]
    fn full_publication_queue_drops_instead_of_blocking() {
        let (pub_tx, mut pub_rx) = mpsc::channel(1);
        let router = BridgeRouter::new(registry(), BridgeOptions::default(), HashMap::new(), pub_tx);
        router.on_device_state(&StateUpdate {
            id: "s1".into(),
            name: "socket".into(),
            reported: DpMap::from([(1, DpValue::Bool(true)), (2, DpValue::Int(5))]),
            snapshot: DpMap::new(),
        });
        assert!(pub_rx.try_recv().is_ok());
        assert!(pub_rx.try_recv().is_err());
    }

    #[test]
    fn commands_reach_the_owning_session() {
        let (pub_tx, _pub_rx) = mpsc::channel(16);
        let (gw_handle, mut gw_queue) = SessionHandle::detached("g1");
        let sessions = HashMap::from([("g1".to_string(), gw_handle)]);
        let router = BridgeRouter::new(registry(), BridgeOptions::default(), sessions, pub_tx);

        router
            .on_inbound_command("tuya/trv/dps/2/command", b"21.5")
            .unwrap();
        assert_eq!(
            gw_queue.try_recv().unwrap(),
            SessionCommand::SetDps {
                sub_id: Some("t1".into()),
                dps: DpMap::from([(2, DpValue::Int(21))]),
            }
        );

        router
            .on_inbound_command("tuya/gw1/dps/1/command", b"ON")
            .unwrap();
        assert_eq!(
            gw_queue.try_recv().unwrap(),
            SessionCommand::SetDps {
                sub_id: None,
                dps: DpMap::from([(1, DpValue::Bool(true))]),
            }
        );

        router.on_inbound_command("tuya/trv/dps/2/command", b"").unwrap();
        assert!(gw_queue.try_recv().is_err());

        assert!(matches!(
            router.on_inbound_command("tuya/lamp/dps/1/command", b"on"),
            Err(TuyaError::DeviceNotFound(_))
        ));
        assert!(matches!(
            router.on_inbound_command("tuya/trv/state", b"on"),
            Err(TuyaError::InvalidTopic(_))
        ));
        // socket has no running session in this router
        assert!(router.on_inbound_command("tuya/socket/dps/1/command", b"on").is_err());
    }

    #[test]
    fn inbound_transforms_run_before_queueing() {
        let (pub_tx, _pub_rx) = mpsc::channel(16);
        let (handle, mut queue) = SessionHandle::detached("s1");
        let mut options = BridgeOptions::default();
        options
            .transforms
            .register("socket", 1, Direction::Inbound, |v| match v {
                DpValue::Str(s) if s == "toggle" => DpValue::Bool(true),
                other => other,
            });
        let sessions = HashMap::from([("s1".to_string(), handle)]);
        let router = BridgeRouter::new(registry(), options, sessions, pub_tx);

        router
            .on_inbound_command("tuya/socket/dps/1/command", b"toggle")
            .unwrap();
        assert_eq!(
            queue.try_recv().unwrap(),
            SessionCommand::SetDps {
                sub_id: None,
                dps: DpMap::from([(1, DpValue::Bool(true))]),
            }
        );
    }

    #[tokio::test]
    async fn dispatcher_publishes_in_order_then_stops() {
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.send(Publication {
                topic: format!("t/{}", i),
                payload: i.to_string(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        dispatch(recorder.clone(), rx).await;
        let published = recorder.published.lock().clone();
        assert_eq!(
            published,
            vec![
                ("t/0".to_string(), "0".to_string()),
                ("t/1".to_string(), "1".to_string()),
                ("t/2".to_string(), "2".to_string()),
            ]
        );
    }
}
