//! Per-device connection lifecycle.
//!
//! A [`DeviceSession`] owns one device's connection from start to shutdown:
//! connect, negotiate a session key when the generation needs one, then poll,
//! heartbeat, forward commands and report state until the connection fails,
//! at which point it backs off and starts over. It talks to the rest of the
//! bridge only through channels.

use crate::codec::FrameCodec;
use crate::dps::{DpMap, parse_payload};
use crate::error::{Result, TuyaError};
use crate::handshake::HandshakeNegotiator;
use crate::protocol::{CommandType, Frame};
use crate::registry::Device;
use crate::subdevice::SubDeviceRouter;
use crate::transport::{Connector, read_frame};
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;

const COMMAND_QUEUE: usize = 32;
const INFLIGHT_WINDOW: usize = 32;
const MAX_BAD_FRAMES: u32 = 5;
const IDLE_HEARTBEATS: u32 = 3;
const JITTER_PERCENT: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
}

/// How a report updates the stored DP snapshot of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPolicy {
    /// Reported keys overwrite, other keys are kept
    #[default]
    Merge,
    /// The report becomes the whole snapshot
    Replace,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub snapshot_policy: SnapshotPolicy,
    pub drain_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(9),
            connect_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(600),
            snapshot_policy: SnapshotPolicy::Merge,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// Work handed to a session by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Write DPs to the device, or to one of its sub-devices by identifier
    SetDps { sub_id: Option<String>, dps: DpMap },
    /// Query status now instead of waiting for the next poll
    Refresh,
}

/// State reported by a device or one of its sub-devices.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub id: String,
    pub name: String,
    /// DPs carried by the frame that triggered this update
    pub reported: DpMap,
    /// Current snapshot after applying the report
    pub snapshot: DpMap,
}

/// Capped exponential reconnect delay.
///
/// The schedule itself is deterministic; [`Backoff::jitter`] spreads the
/// actual sleeps.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next attempt; each call counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(31));
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Adds up to ten percent of random extra delay.
    pub fn jitter(delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let span = millis.saturating_mul(JITTER_PERCENT) / 100;
        if span == 0 {
            return delay;
        }
        delay.saturating_add(Duration::from_millis(rand::rng().random_range(0..=span)))
    }
}

/// Caller side of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    device_id: String,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A handle backed by a bare queue instead of a running session.
    #[cfg(test)]
    pub(crate) fn detached(device_id: &str) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (_, state) = watch::channel(SessionState::Ready);
        let handle = Self {
            device_id: device_id.to_string(),
            commands: tx,
            state,
        };
        (handle, rx)
    }

    /// Queues a command without waiting. A full queue is reported instead of
    /// blocking the caller.
    pub fn submit(&self, command: SessionCommand) -> Result<()> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TuyaError::QueueFull(self.device_id.clone()),
            mpsc::error::TrySendError::Closed(_) => TuyaError::Offline,
        })
    }
}

/// Per-connection bookkeeping, rebuilt on every reconnect.
struct Wire<S> {
    writer: WriteHalf<S>,
    codec: FrameCodec,
    seqno: u32,
    inflight: VecDeque<u32>,
    write_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite> Wire<S> {
    async fn send(&mut self, cmd: CommandType, payload: &Value) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        let frame = Frame::new(self.seqno, cmd, body);
        let bytes = self.codec.encode(&frame)?;
        debug!("Sending cmd=0x{:02x} seq={} ({} bytes)", frame.cmd, frame.seqno, bytes.len());

        timeout(self.write_timeout, self.writer.write_all(&bytes))
            .await
            .map_err(|_| TuyaError::Timeout)??;

        if self.inflight.len() == INFLIGHT_WINDOW {
            self.inflight.pop_front();
        }
        self.inflight.push_back(self.seqno);
        self.seqno = self.seqno.wrapping_add(1);
        Ok(())
    }
}

impl<S> Wire<S> {
    fn expects(&self, seqno: u32) -> bool {
        self.inflight.contains(&seqno)
    }
}

pub struct DeviceSession<C: Connector> {
    device: Arc<Device>,
    router: SubDeviceRouter,
    connector: C,
    options: SessionOptions,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<StateUpdate>,
    state: watch::Sender<SessionState>,
    snapshots: HashMap<String, DpMap>,
    backoff: Backoff,
}

impl<C: Connector> DeviceSession<C> {
    pub fn new(
        device: Arc<Device>,
        connector: C,
        options: SessionOptions,
        events: mpsc::Sender<StateUpdate>,
    ) -> (Self, SessionHandle) {
        Self::with_router(SubDeviceRouter::new(device), connector, options, events)
    }

    /// Builds a session around an existing router (tests inject clocks this
    /// way).
    pub fn with_router(
        router: SubDeviceRouter,
        connector: C,
        options: SessionOptions,
        events: mpsc::Sender<StateUpdate>,
    ) -> (Self, SessionHandle) {
        let device = router.device().clone();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let mut options = options;
        // Per-device interval wins over the bridge-wide default
        if let Some(poll) = device.poll_interval {
            options.poll_interval = poll;
        }
        let handle = SessionHandle {
            device_id: device.id.clone(),
            commands: tx,
            state: state_rx,
        };
        let session = Self {
            backoff: Backoff::new(options.reconnect_min, options.reconnect_max),
            device,
            router,
            connector,
            options,
            commands: rx,
            events,
            state: state_tx,
            snapshots: HashMap::new(),
        };
        (session, handle)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Drives the session until `cancel` fires or every handle is dropped.
    ///
    /// Connection failures never end the loop; they only lengthen the wait
    /// before the next attempt.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Starting session for {} ({}:{}, protocol {})",
            self.device.name, self.device.address, self.device.port, self.device.generation
        );

        loop {
            self.set_state(SessionState::Connecting);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.connect() => res,
            };

            match attempt {
                Ok((stream, codec, seqno)) => match self.serve(stream, codec, seqno, &cancel).await {
                    Ok(()) => break,
                    Err(e) if matches!(e, TuyaError::KeyOrVersionError) => warn!(
                        "Device {} possibly has key or version mismatch: {}",
                        self.device.name, e
                    ),
                    Err(e) => warn!("Connection to {} lost: {}", self.device.name, e),
                },
                Err(e) => warn!("Connecting to {} failed: {}", self.device.name, e),
            }

            self.set_state(SessionState::Reconnecting);
            let delay = self.backoff.next_delay();
            warn!(
                "Waiting {}s before reconnecting to {} (fail count: {})",
                delay.as_secs(),
                self.device.name,
                self.backoff.failures()
            );
            if !self.wait_for_backoff(Backoff::jitter(delay), &cancel).await {
                break;
            }
        }

        self.set_state(SessionState::Disconnected);
        debug!("Session for {} exited", self.device.name);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    async fn connect(&self) -> Result<(C::Stream, FrameCodec, u32)> {
        let device = &self.device;
        let limit = self.options.connect_timeout;
        debug!("Connecting to {} at {}:{}", device.name, device.address, device.port);

        let mut stream = timeout(limit, self.connector.connect(&device.address, device.port))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| TuyaError::ConnectionFailed(e.to_string()))?;

        // Sequence numbers restart with every connection
        let mut seqno = 1u32;
        let key = if device.generation.requires_handshake() {
            self.set_state(SessionState::Handshaking);
            let negotiator = HandshakeNegotiator::new(&device.local_key, device.generation, limit)?;
            negotiator.negotiate(&mut stream, &mut seqno).await?.to_vec()
        } else {
            device.local_key.clone()
        };

        let codec = FrameCodec::new(&key, device.generation)?;
        Ok((stream, codec, seqno))
    }

    /// Returns false when the session should stop instead of reconnecting.
    async fn wait_for_backoff(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                _ = cancel.cancelled() => return false,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => debug!(
                        "Dropping command for offline device {}: {:?}",
                        self.device.name, cmd
                    ),
                    None => return false,
                },
            }
        }
    }

    /// Runs one established connection. `Ok` means the session should stop;
    /// `Err` means reconnect.
    async fn serve(
        &mut self,
        stream: C::Stream,
        codec: FrameCodec,
        seqno: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (mut reader, writer) = tokio::io::split(stream);
        let read_timeout = self.options.connect_timeout;
        let mut wire = Wire {
            writer,
            codec,
            seqno,
            inflight: VecDeque::with_capacity(INFLIGHT_WINDOW),
            write_timeout: self.options.connect_timeout,
        };

        // Reader Task
        let (frame_tx, mut frame_rx) = mpsc::channel::<Result<Vec<u8>>>(16);
        let connection = cancel.child_token();
        let reader_cancel = connection.clone();
        let _stop_reader = connection.drop_guard();
        let name = self.device.name.clone();
        tokio::spawn(async move {
            loop {
                let res = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    res = read_frame(&mut reader, read_timeout) => res,
                };
                let failed = res.is_err();
                if frame_tx.send(res).await.is_err() || failed {
                    break;
                }
            }
            debug!("Reader task for {} stopped", name);
        });

        self.set_state(SessionState::Ready);
        self.backoff.reset();
        info!("Device {} ready", self.device.name);

        let beat = self.options.heartbeat_interval;
        let mut poll = interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval_at(Instant::now() + beat, beat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_rx = Instant::now();
        let mut bad_frames = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain(&mut wire).await;
                    return Ok(());
                }
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = self.execute(&mut wire, cmd).await {
                            if e.is_transport() {
                                return Err(e);
                            }
                            warn!("Command for {} not sent: {}", self.device.name, e);
                        }
                    }
                    None => {
                        debug!("All handles for {} dropped, stopping session", self.device.name);
                        return Ok(());
                    }
                },
                _ = poll.tick() => self.query(&mut wire).await?,
                _ = heartbeat.tick() => {
                    if last_rx.elapsed() > beat * IDLE_HEARTBEATS {
                        return Err(TuyaError::Timeout);
                    }
                    let (cmd, payload) = self.router.heartbeat();
                    wire.send(cmd, &payload).await?;
                }
                raw = frame_rx.recv() => {
                    let raw = raw.ok_or_else(|| TuyaError::Io("reader stopped".to_string()))??;
                    last_rx = Instant::now();
                    self.handle_frame(&wire, &raw, &mut bad_frames)?;
                }
            }
        }
    }

    async fn execute<S>(&mut self, wire: &mut Wire<S>, cmd: SessionCommand) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        match cmd {
            SessionCommand::SetDps { sub_id, dps } => {
                match self.router.control(sub_id.as_deref(), &dps) {
                    Ok((cmd, payload)) => wire.send(cmd, &payload).await,
                    Err(e) => {
                        warn!("Dropping command for {}: {}", self.device.name, e);
                        Ok(())
                    }
                }
            }
            SessionCommand::Refresh => self.query(wire).await,
        }
    }

    async fn query<S>(&mut self, wire: &mut Wire<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        for (cmd, payload) in self.router.queries() {
            wire.send(cmd, &payload).await?;
        }
        Ok(())
    }

    /// Flushes queued commands for at most the drain timeout.
    async fn drain<S>(&mut self, wire: &mut Wire<S>)
    where
        S: AsyncRead + AsyncWrite,
    {
        let window = self.options.drain_timeout;
        let flushed = timeout(window, async {
            while let Ok(cmd) = self.commands.try_recv() {
                if self.execute(wire, cmd).await.is_err() {
                    break;
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("Drain window for {} elapsed", self.device.name);
        }
    }

    fn handle_frame<S>(&mut self, wire: &Wire<S>, raw: &[u8], bad_frames: &mut u32) -> Result<()> {
        let frame = match wire.codec.decode(raw) {
            Ok(frame) => frame,
            Err(e) if e.is_desync() => return Err(e.into()),
            Err(e) => {
                *bad_frames += 1;
                warn!(
                    "Discarding frame from {} ({}/{}): {}",
                    self.device.name, bad_frames, MAX_BAD_FRAMES, e
                );
                debug!("Frame bytes: {}", hex::encode(raw));
                if *bad_frames >= MAX_BAD_FRAMES {
                    return Err(TuyaError::KeyOrVersionError);
                }
                return Ok(());
            }
        };
        *bad_frames = 0;

        debug!(
            "Received cmd=0x{:02x} seq={} retcode={:?} ({} bytes) from {}",
            frame.cmd,
            frame.seqno,
            frame.retcode,
            frame.payload.len(),
            self.device.name
        );

        if frame.command() != Some(CommandType::Status) && !wire.expects(frame.seqno) {
            debug!("Discarding reply with unknown seq {} from {}", frame.seqno, self.device.name);
            return Ok(());
        }
        if frame.payload.is_empty() {
            return Ok(());
        }

        let payload = match parse_payload(&frame.payload) {
            Ok(v) => v,
            Err(_) => {
                debug!(
                    "Non-JSON payload from {}: {}",
                    self.device.name,
                    String::from_utf8_lossy(&frame.payload)
                );
                return Ok(());
            }
        };

        for routed in self.router.demux(&payload) {
            if routed.dps.is_empty() {
                continue;
            }
            let snapshot = self.apply(&routed.id, &routed.dps);
            let update = StateUpdate {
                id: routed.id,
                name: routed.name,
                reported: routed.dps,
                snapshot,
            };
            if let Err(mpsc::error::TrySendError::Full(u)) = self.events.try_send(update) {
                warn!("State queue full, dropping update for {}", u.name);
            }
        }
        Ok(())
    }

    fn apply(&mut self, id: &str, reported: &DpMap) -> DpMap {
        let snapshot = self.snapshots.entry(id.to_string()).or_default();
        match self.options.snapshot_policy {
            SnapshotPolicy::Merge => {
                snapshot.extend(reported.iter().map(|(k, v)| (*k, v.clone())));
            }
            SnapshotPolicy::Replace => *snapshot = reported.clone(),
        }
        snapshot.clone()
    }
}
