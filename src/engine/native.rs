//! Native backend built on `str0m`.
//!
//! `str0m` is sans-IO: it never touches a socket or a clock. This module owns
//! the UDP socket and drives the `Rtc` state machine with it, the same way the
//! classic poll loop does:
//!
//! 1. Drain `poll_output` until it yields a timeout, sending every transmit
//!    and reacting to events along the way.
//! 2. Wait for either an incoming datagram or that timeout.
//! 3. Feed whichever happened back in with `handle_input`.
//!
//! Until the transport is up the loop runs inline inside `negotiate`, so a
//! timeout or cancellation of the caller simply stops driving it. Once
//! connected, the `Rtc` moves into a spawned task and the engine keeps only a
//! command channel to it.

use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use async_trait::async_trait;
use str0m::{
    change::{SdpAnswer, SdpPendingOffer},
    channel::ChannelId,
    media::{Direction, MediaKind},
    net::{Protocol, Receive},
    Candidate, Event, IceConnectionState, Input, Output, Rtc,
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::config::{MediaConstraints, SessionConfig};
use crate::engine::{
    Backend, EngineError, EngineEvent, EngineProvider, TransportEngine, TransportStats,
};
use crate::model::control::{ControlFrame, ControlMessage};
use crate::model::description::{LocalDescription, RemoteDescription};
use crate::util::select_host_address;

/// Label of the data channel carrying [`ControlFrame`]s.
pub const CONTROL_CHANNEL: &str = "control";

const DATAGRAM_SIZE: usize = 2000;

/// Creates [`NativeEngine`]s bound to one local address.
#[derive(Debug, Clone, Default)]
pub struct NativeProvider {
    bind: Option<IpAddr>,
}

impl NativeProvider {
    /// Binds each session to the host's routable address.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds each session to `ip` instead, e.g. `127.0.0.1` for same-host peers.
    pub fn with_bind_address(ip: IpAddr) -> Self {
        Self { bind: Some(ip) }
    }
}

#[async_trait]
impl EngineProvider for NativeProvider {
    fn backend(&self) -> Backend {
        Backend::Native
    }

    async fn create(&self, config: &SessionConfig) -> Result<Box<dyn TransportEngine>, EngineError> {
        let ip = match self.bind {
            Some(ip) => ip,
            None => select_host_address()?,
        };

        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let local_addr = socket.local_addr()?;
        info!("Bound UDP port: {}", local_addr);

        // Host candidate only; configured ICE servers are not used for gathering.
        let mut rtc = Rtc::builder().build();
        let candidate = Candidate::host(local_addr, "udp")
            .map_err(|e| EngineError::Configuration(format!("host candidate: {}", e)))?;
        if rtc.add_local_candidate(candidate).is_none() {
            return Err(EngineError::Configuration(format!(
                "host candidate {} rejected",
                local_addr
            )));
        }

        let counters = Arc::new(Counters::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            rtc,
            socket,
            local_addr,
            buf: vec![0; DATAGRAM_SIZE],
            control: None,
            outbox: VecDeque::new(),
            counters: counters.clone(),
        };

        Ok(Box::new(NativeEngine {
            media: config.media_constraints,
            phase: Phase::Ready(driver),
            counters,
            events_tx,
            events_rx: Some(events_rx),
        }))
    }
}

#[derive(Debug, Default)]
struct Counters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Counters {
    fn sent(&self, n: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn received(&self, n: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Where the engine is in its life. The `Rtc` lives in whichever variant
/// currently owns the driver.
enum Phase {
    Ready(Driver),
    AwaitingAnswer(Driver, SdpPendingOffer),
    Checking(Driver),
    /// `accept_answer` consumed the pending offer and failed.
    Rejected(Driver),
    Running(Actor),
    Released,
}

struct Actor {
    commands: mpsc::Sender<Command>,
    _task: JoinHandle<()>,
}

enum Command {
    Send(Vec<u8>, oneshot::Sender<Result<(), EngineError>>),
}

pub struct NativeEngine {
    media: MediaConstraints,
    phase: Phase,
    counters: Arc<Counters>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

#[async_trait]
impl TransportEngine for NativeEngine {
    async fn create_offer(&mut self) -> Result<LocalDescription, EngineError> {
        let mut driver = match std::mem::replace(&mut self.phase, Phase::Released) {
            Phase::Ready(driver) => driver,
            Phase::Released => return Err(EngineError::Released),
            other => {
                self.phase = other;
                return Err(EngineError::Fatal("offer already created".into()));
            }
        };

        let mut change = driver.rtc.sdp_api();
        let cid = change.add_channel(CONTROL_CHANNEL.to_string());
        if self.media.audio {
            change.add_media(MediaKind::Audio, Direction::SendRecv, None, None, None);
        }
        if self.media.video {
            change.add_media(MediaKind::Video, Direction::SendRecv, None, None, None);
        }

        let Some((offer, pending)) = change.apply() else {
            self.phase = Phase::Ready(driver);
            return Err(EngineError::Fatal("failed to apply sdp change".into()));
        };

        debug!("Requested control channel with ID: {:?}", cid);
        let sdp = offer.to_sdp_string();
        self.phase = Phase::AwaitingAnswer(driver, pending);

        Ok(LocalDescription::new(sdp))
    }

    async fn negotiate(&mut self, remote: &RemoteDescription) -> Result<(), EngineError> {
        let answer = SdpAnswer::from_sdp_string(remote.as_str())
            .map_err(|e| EngineError::MalformedDescription(e.to_string()))?;

        let driver = match std::mem::replace(&mut self.phase, Phase::Released) {
            Phase::AwaitingAnswer(mut driver, pending) => {
                if let Err(e) = driver.rtc.sdp_api().accept_answer(pending, answer) {
                    self.phase = Phase::Rejected(driver);
                    return Err(EngineError::MalformedDescription(e.to_string()));
                }
                info!("Answer accepted, waiting for ICE connection");
                driver
            }
            Phase::Checking(driver) => {
                // A previous attempt timed out after the answer was applied.
                debug!("Resuming connectivity checks");
                driver
            }
            Phase::Running(actor) => {
                self.phase = Phase::Running(actor);
                return Ok(());
            }
            Phase::Ready(driver) => {
                self.phase = Phase::Ready(driver);
                return Err(EngineError::Fatal("no offer to answer".into()));
            }
            Phase::Rejected(driver) => {
                self.phase = Phase::Rejected(driver);
                return Err(EngineError::MalformedDescription(
                    "offer was consumed by a rejected answer".into(),
                ));
            }
            Phase::Released => return Err(EngineError::Released),
        };

        // Park the driver before the first await so a dropped future leaves it
        // with the engine.
        self.phase = Phase::Checking(driver);
        let Phase::Checking(driver) = &mut self.phase else {
            return Err(EngineError::Released);
        };

        drive_until_connected(driver, &self.events_tx).await?;

        if let Phase::Checking(driver) = std::mem::replace(&mut self.phase, Phase::Released) {
            let (tx, rx) = mpsc::channel(16);
            let task = tokio::spawn(run(driver, rx, self.events_tx.clone()));
            self.phase = Phase::Running(Actor {
                commands: tx,
                _task: task,
            });
        }

        Ok(())
    }

    fn cancel_negotiation(&mut self) {
        if let Phase::Checking(driver) = &self.phase {
            debug!(
                "Negotiation on {} abandoned, keeping ICE agent",
                driver.local_addr
            );
        }
    }

    async fn send_control(&mut self, message: ControlMessage) -> Result<(), EngineError> {
        let Phase::Running(actor) = &self.phase else {
            return Err(EngineError::Fatal("transport not connected".into()));
        };

        let bytes = ControlFrame::new(message)
            .encode()
            .map_err(|e| EngineError::Fatal(e.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        actor
            .commands
            .send(Command::Send(bytes, reply_tx))
            .await
            .map_err(|_| EngineError::Fatal("transport task stopped".into()))?;

        reply_rx
            .await
            .map_err(|_| EngineError::Fatal("transport task stopped".into()))?
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.take()
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    fn release(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Released) {
            Phase::Ready(mut driver)
            | Phase::AwaitingAnswer(mut driver, _)
            | Phase::Checking(mut driver)
            | Phase::Rejected(mut driver) => {
                driver.rtc.disconnect();
                info!("Released engine on {}", driver.local_addr);
            }
            // Dropping the command sender stops the task, which disconnects.
            Phase::Running(actor) => drop(actor),
            Phase::Released => {}
        }
    }

    fn is_released(&self) -> bool {
        matches!(self.phase, Phase::Released)
    }
}

/// What one round of polling produced.
enum Polled {
    Timeout(Instant),
    Event(DriverEvent),
}

/// Events the engine cares about, distilled from `str0m::Event`.
#[derive(Debug)]
enum DriverEvent {
    Connected,
    Disconnected,
    Remote(ControlMessage),
}

struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    buf: Vec<u8>,
    control: Option<ChannelId>,
    /// Encoded frames waiting for the control channel to open.
    outbox: VecDeque<Vec<u8>>,
    counters: Arc<Counters>,
}

impl Driver {
    /// Drain output until the `Rtc` asks to be woken up later, or an event
    /// worth reporting shows up.
    async fn poll(&mut self) -> Result<Polled, EngineError> {
        loop {
            let output = self
                .rtc
                .poll_output()
                .map_err(|e| EngineError::Fatal(e.to_string()))?;

            match output {
                Output::Timeout(instant) => return Ok(Polled::Timeout(instant)),
                Output::Transmit(transmit) => {
                    match self
                        .socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await
                    {
                        Ok(n) => self.counters.sent(n),
                        Err(e) => warn!("UDP send to {} failed: {}", transmit.destination, e),
                    }
                }
                Output::Event(event) => {
                    if let Some(event) = self.handle_event(event)? {
                        return Ok(Polled::Event(event));
                    }
                }
            }
        }
    }

    /// Wait for a datagram or the deadline, whichever comes first, and feed
    /// it to the `Rtc`.
    async fn wait(&mut self, deadline: Instant) -> Result<(), EngineError> {
        let received = tokio::select! {
            res = self.socket.recv_from(&mut self.buf) => Some(res?),
            _ = tokio::time::sleep_until(deadline.into()) => None,
        };

        let now = Instant::now();
        let input = match received {
            Some((n, source)) => {
                self.counters.received(n);
                // Preparse to figure out the multiplexing of all protocols on
                // one UDP port. Anything unrecognised is dropped.
                let Ok(contents) = (&self.buf[..n]).try_into() else {
                    debug!("Dropping unrecognised datagram from {}", source);
                    return Ok(());
                };
                Input::Receive(
                    now,
                    Receive {
                        proto: Protocol::Udp,
                        source,
                        destination: self.local_addr,
                        contents,
                    },
                )
            }
            None => Input::Timeout(now),
        };

        self.rtc
            .handle_input(input)
            .map_err(|e| EngineError::Fatal(e.to_string()))
    }

    fn handle_event(&mut self, event: Event) -> Result<Option<DriverEvent>, EngineError> {
        match event {
            Event::Connected => {
                info!("Transport connected on {}", self.local_addr);
                Ok(Some(DriverEvent::Connected))
            }
            Event::IceConnectionStateChange(state) => {
                info!("ICE Connection State: {:?}", state);
                if state == IceConnectionState::Disconnected {
                    return Ok(Some(DriverEvent::Disconnected));
                }
                Ok(None)
            }
            Event::ChannelOpen(cid, label) => {
                info!("Channel opened - Name: '{}', ID: {:?}", label, cid);
                if label == CONTROL_CHANNEL {
                    self.control = Some(cid);
                    self.flush_outbox()?;
                }
                Ok(None)
            }
            Event::ChannelData(data) => {
                if Some(data.id) != self.control {
                    debug!("Ignoring data on channel {:?}", data.id);
                    return Ok(None);
                }
                match ControlFrame::decode(&data.data) {
                    Ok(frame) => {
                        debug!(
                            "Control frame sent at {} (latency {})",
                            frame.timestamp(),
                            frame.latency()
                        );
                        Ok(Some(DriverEvent::Remote(frame.message)))
                    }
                    Err(e) => {
                        warn!("Undecodable control frame: {}", e);
                        Ok(None)
                    }
                }
            }
            other => {
                debug!("Event (other): {:?}", other);
                Ok(None)
            }
        }
    }

    fn queue_control(&mut self, bytes: Vec<u8>) -> Result<(), EngineError> {
        self.outbox.push_back(bytes);
        self.flush_outbox()
    }

    fn flush_outbox(&mut self) -> Result<(), EngineError> {
        let Some(mut channel) = self.control.and_then(|id| self.rtc.channel(id)) else {
            debug!("Control channel not open, {} frame(s) queued", self.outbox.len());
            return Ok(());
        };

        while let Some(bytes) = self.outbox.pop_front() {
            channel
                .write(true, &bytes)
                .map_err(|e| EngineError::Fatal(e.to_string()))?;
        }
        Ok(())
    }
}

async fn drive_until_connected(
    driver: &mut Driver,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<(), EngineError> {
    loop {
        match driver.poll().await? {
            Polled::Timeout(deadline) => driver.wait(deadline).await?,
            Polled::Event(DriverEvent::Connected) => return Ok(()),
            Polled::Event(DriverEvent::Disconnected) => {
                return Err(EngineError::Fatal("ICE disconnected before connecting".into()))
            }
            Polled::Event(DriverEvent::Remote(message)) => {
                let _ = events.send(EngineEvent::Remote(message));
            }
        }
    }
}

/// Body of the task that owns the `Rtc` once connected.
async fn run(
    mut driver: Driver,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    loop {
        if !driver.rtc.is_alive() {
            let _ = events.send(EngineEvent::Disconnected);
            break;
        }

        let deadline = match driver.poll().await {
            Ok(Polled::Timeout(deadline)) => deadline,
            Ok(Polled::Event(DriverEvent::Connected)) => continue,
            Ok(Polled::Event(DriverEvent::Disconnected)) => {
                warn!("Disconnecting due to ICE state change");
                driver.rtc.disconnect();
                let _ = events.send(EngineEvent::Disconnected);
                break;
            }
            Ok(Polled::Event(DriverEvent::Remote(message))) => {
                let _ = events.send(EngineEvent::Remote(message));
                continue;
            }
            Err(e) => {
                driver.rtc.disconnect();
                let _ = events.send(EngineEvent::Fatal(e.to_string()));
                break;
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(bytes, reply)) => {
                    let _ = reply.send(driver.queue_control(bytes));
                }
                None => {
                    info!("Engine released, disconnecting {}", driver.local_addr);
                    driver.rtc.disconnect();
                    break;
                }
            },
            res = driver.wait(deadline) => {
                if let Err(e) = res {
                    driver.rtc.disconnect();
                    let _ = events.send(EngineEvent::Fatal(e.to_string()));
                    break;
                }
            }
        }
    }
}
