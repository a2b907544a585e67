//! Connection supervisor.
//!
//! One cooperative loop per device owns the transport, the frame decoder and
//! the dispatcher. Each iteration runs at most one install step, then waits
//! for either a host command or transport bytes. All writes go through
//! [`Supervisor::deliver`], which drops non-installer frames while an install
//! reserves the link. An install waiting on an upload token fails once the
//! configured token timeout passes.
//!
//! Events are queued without waiting; when the host stops draining them the
//! newest are dropped so that the device link keeps being served.

use crate::config::{Config, ReconnectPolicy};
use crate::error::ClientError;
use crate::stream::Connector;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wristlink_core::{
    AppMessageHandler, ConnectionState, DeviceEvent, Dispatch, Dispatcher, InstallRequest,
    InstallSource, Origin, Outgoing, SampleStore,
};
use wristlink_protocol::{endpoint, AppCommand, Decoded, Decoder, Dict, Encoder, Frame};

/// Default capacity for the command and event channels.
const CHANNEL_CAPACITY: usize = 256;

/// Host requests handled inside the loop.
#[derive(Debug)]
pub enum Command {
    Install(InstallRequest),
    AppMessage {
        command: AppCommand,
        uuid: Uuid,
        dict: Dict,
    },
    StartApp {
        uuid: Uuid,
        start: bool,
    },
    Send(Frame),
    Quit,
}

/// Cloneable handle for sending commands to a running supervisor.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    commands: mpsc::Sender<Command>,
}

impl DeviceHandle {
    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::SupervisorStopped)
    }

    /// Queues an install. Ignored by the device loop if one is running.
    pub async fn install(&self, request: InstallRequest) -> Result<(), ClientError> {
        self.send(Command::Install(request)).await
    }

    pub async fn push(&self, uuid: Uuid, dict: Dict) -> Result<(), ClientError> {
        self.send(Command::AppMessage {
            command: AppCommand::Push,
            uuid,
            dict,
        })
        .await
    }

    pub async fn request(&self, uuid: Uuid, dict: Dict) -> Result<(), ClientError> {
        self.send(Command::AppMessage {
            command: AppCommand::Request,
            uuid,
            dict,
        })
        .await
    }

    pub async fn start_app(&self, uuid: Uuid) -> Result<(), ClientError> {
        self.send(Command::StartApp { uuid, start: true }).await
    }

    pub async fn stop_app(&self, uuid: Uuid) -> Result<(), ClientError> {
        self.send(Command::StartApp { uuid, start: false }).await
    }

    /// Writes a raw frame through the loop.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ClientError> {
        self.send(Command::Send(frame)).await
    }

    /// Closes the transport and ends the loop.
    pub async fn quit(&self) -> Result<(), ClientError> {
        self.send(Command::Quit).await
    }
}

enum SessionEnd {
    Quit,
    Lost(ClientError),
}

/// Owns one device connection and its reconnects.
pub struct Supervisor<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    token_timeout: Duration,
    read_buffer_size: usize,
    dispatcher: Dispatcher,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<DeviceEvent>,
}

impl<C: Connector> Supervisor<C> {
    /// Creates a supervisor with its command handle and event receiver.
    pub fn new(
        connector: C,
        config: &Config,
        store: Arc<dyn SampleStore>,
        source: Arc<dyn InstallSource>,
    ) -> (Self, DeviceHandle, mpsc::Receiver<DeviceEvent>) {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let supervisor = Self {
            connector,
            policy: config.connection.reconnect_policy(),
            connect_timeout: config.connection.connect_timeout(),
            token_timeout: config.connection.token_timeout(),
            read_buffer_size: config.connection.read_buffer_size(),
            dispatcher: Dispatcher::new(config.features.dispatcher_config(), store, source),
            commands: command_rx,
            events: event_tx,
        };
        (
            supervisor,
            DeviceHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Registers the handler for an app's messages.
    pub fn register_handler(&mut self, uuid: Uuid, handler: Box<dyn AppMessageHandler>) {
        self.dispatcher.register_handler(uuid, handler);
    }

    /// Runs until quit, or until reconnecting gives up.
    pub async fn run(mut self) -> Result<(), ClientError> {
        let mut attempt = 0u32;

        loop {
            self.emit(DeviceEvent::Connection {
                state: ConnectionState::Connecting,
            });
            info!("Connecting to {}", self.connector.describe());

            let connected =
                match tokio::time::timeout(self.connect_timeout, self.connector.connect()).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Timeout),
                };

            let error = match connected {
                Ok(stream) => {
                    attempt = 0;
                    match self.session(stream).await {
                        SessionEnd::Quit => {
                            info!("Disconnected from {}", self.connector.describe());
                            self.disconnected();
                            return Ok(());
                        }
                        SessionEnd::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };

            let lost = self.dispatcher.connection_lost();
            self.emit_all(lost.events);

            if !error.is_retryable() {
                error!("Connection to {} failed: {}", self.connector.describe(), error);
                self.disconnected();
                return Err(error);
            }

            attempt += 1;
            if attempt > self.policy.attempts {
                warn!(
                    "Giving up on {} after {} reconnect attempts",
                    self.connector.describe(),
                    self.policy.attempts
                );
                self.disconnected();
                return Err(ClientError::ReconnectExhausted {
                    attempts: self.policy.attempts,
                });
            }

            let delay = self.policy.delay(attempt);
            warn!(
                "Connection to {} lost ({}), reconnect {}/{} in {:?}",
                self.connector.describe(),
                error,
                attempt,
                self.policy.attempts,
                delay
            );
            self.emit(DeviceEvent::Connection {
                state: ConnectionState::WaitingReconnect,
            });

            if self.wait_reconnect(delay).await {
                self.disconnected();
                return Ok(());
            }
        }
    }

    /// Sleeps out a reconnect delay. Returns true if quit was requested.
    async fn wait_reconnect(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands.recv() => match command {
                    None | Some(Command::Quit) => return true,
                    Some(command) => warn!("Not connected, dropping {:?}", command),
                },
            }
        }
    }

    async fn session(&mut self, stream: C::Stream) -> SessionEnd {
        let mode = self.connector.mode();
        let encoder = Encoder::new(mode);
        let mut decoder = Decoder::new(mode);
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; self.read_buffer_size];

        let started = self.dispatcher.connection_started();
        if let Err(e) = self.deliver(&mut writer, &encoder, started).await {
            return SessionEnd::Lost(e);
        }

        // (wait id, deadline) for the token the install is blocked on.
        let mut token_deadline: Option<(u64, Instant)> = None;

        loop {
            if self.dispatcher.install_runnable() {
                let step = self.dispatcher.step_install();
                if let Err(e) = self.deliver(&mut writer, &encoder, step).await {
                    return SessionEnd::Lost(e);
                }
            }
            let runnable = self.dispatcher.install_runnable();

            token_deadline = match (self.dispatcher.install_token_wait(), token_deadline) {
                (Some(wait), Some((armed, deadline))) if wait == armed => Some((armed, deadline)),
                (Some(wait), _) => Some((wait, Instant::now() + self.token_timeout)),
                (None, _) => None,
            };
            let deadline = token_deadline.map(|(_, deadline)| deadline);

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let command = match command {
                        None | Some(Command::Quit) => {
                            let _ = writer.shutdown().await;
                            return SessionEnd::Quit;
                        }
                        Some(command) => command,
                    };
                    let out = self.handle_command(command);
                    if let Err(e) = self.deliver(&mut writer, &encoder, out).await {
                        return SessionEnd::Lost(e);
                    }
                }

                result = reader.read(&mut buf) => {
                    let n = match result {
                        Ok(0) => return SessionEnd::Lost(ClientError::ConnectionClosed),
                        Ok(n) => n,
                        Err(e) => return SessionEnd::Lost(ClientError::Io(e)),
                    };
                    decoder.extend(&buf[..n]);

                    while let Some(decoded) = decoder.decode_frame() {
                        match decoded {
                            Decoded::Frame(frame) => {
                                debug!(
                                    "Received {} bytes on {}",
                                    frame.payload.len(),
                                    endpoint::name(frame.endpoint)
                                );
                                let out = self.dispatcher.handle_frame(&frame);
                                if let Err(e) = self.deliver(&mut writer, &encoder, out).await {
                                    return SessionEnd::Lost(e);
                                }
                            }
                            Decoded::Resync { discarded } => {
                                warn!("Stream out of sync, discarded {} bytes", discarded);
                            }
                        }
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let out = self.dispatcher.install_timed_out();
                    if let Err(e) = self.deliver(&mut writer, &encoder, out).await {
                        return SessionEnd::Lost(e);
                    }
                }

                _ = std::future::ready(()), if runnable => {}
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Dispatch {
        let frame = match command {
            Command::Install(request) => return self.dispatcher.install(request),
            Command::AppMessage { command, uuid, dict } => {
                self.dispatcher.app_message(command, uuid, dict)
            }
            Command::StartApp { uuid, start } => self.dispatcher.app_start(uuid, start),
            Command::Send(frame) => Ok(frame),
            Command::Quit => return Dispatch::default(),
        };

        match frame {
            Ok(frame) => Dispatch {
                outgoing: vec![Outgoing {
                    frame,
                    origin: Origin::Dispatcher,
                }],
                events: Vec::new(),
            },
            Err(e) => {
                warn!("Cannot build command frame: {}", e);
                Dispatch::default()
            }
        }
    }

    /// The single write path.
    async fn deliver<W>(
        &mut self,
        writer: &mut W,
        encoder: &Encoder,
        dispatch: Dispatch,
    ) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        for outgoing in dispatch.outgoing {
            let frame = outgoing.frame;
            if outgoing.origin == Origin::Dispatcher && self.dispatcher.reserves_link() {
                debug!(
                    "Install in progress, dropping write to {}",
                    endpoint::name(frame.endpoint)
                );
                continue;
            }

            let bytes = match encoder.encode_frame(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Cannot encode frame for {}: {}", frame.endpoint, e);
                    continue;
                }
            };
            debug!(
                "Sending {} bytes to {}",
                frame.payload.len(),
                endpoint::name(frame.endpoint)
            );
            writer.write_all(&bytes).await?;
        }
        writer.flush().await?;

        self.emit_all(dispatch.events);
        Ok(())
    }

    fn emit(&self, event: DeviceEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => debug!("Event receiver dropped"),
        }
    }

    fn emit_all(&self, events: Vec<DeviceEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn disconnected(&self) {
        self.emit(DeviceEvent::Connection {
            state: ConnectionState::NotConnected,
        });
    }
}

/// Reads one frame from a stream, for tools and tests that play the device.
pub async fn read_frame<R>(reader: &mut R, decoder: &mut Decoder) -> Result<Frame, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match decoder.decode_frame() {
            Some(Decoded::Frame(frame)) => return Ok(frame),
            Some(Decoded::Resync { discarded }) => {
                warn!("Stream out of sync, discarded {} bytes", discarded);
            }
            None => {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Err(ClientError::ConnectionClosed);
                }
                decoder.extend(&buf[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;
    use wristlink_core::{
        InstallKind, Installable, MemoryInstallSource, MemorySampleStore, Outcome,
    };
    use wristlink_protocol::{BinaryType, TransportMode};

    struct DuplexConnector {
        streams: Mutex<VecDeque<DuplexStream>>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream, ClientError> {
            self.streams.lock().await.pop_front().ok_or_else(|| {
                ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "no device",
                ))
            })
        }

        fn mode(&self) -> TransportMode {
            TransportMode::Serial
        }

        fn describe(&self) -> String {
            "duplex".to_string()
        }
    }

    /// The far end of a duplex pipe, playing the watch.
    struct FakeDevice {
        stream: DuplexStream,
        decoder: Decoder,
    }

    impl FakeDevice {
        async fn recv(&mut self) -> Frame {
            tokio::time::timeout(
                Duration::from_secs(2),
                read_frame(&mut self.stream, &mut self.decoder),
            )
            .await
            .expect("timed out waiting for frame")
            .unwrap()
        }

        async fn send(&mut self, frame: Frame) {
            self.stream
                .write_all(&frame.encode().unwrap())
                .await
                .unwrap();
        }

        async fn send_version(&mut self, version: &str) {
            let mut payload = vec![1, 0, 0, 0, 0];
            let mut name = [0u8; 32];
            name[..version.len()].copy_from_slice(version.as_bytes());
            payload.extend_from_slice(&name);
            payload.extend_from_slice(&[0u8; 10]);
            self.send(Frame::new(endpoint::FIRMWARE_VERSION, payload))
                .await;
        }
    }

    fn test_config(attempts: u32) -> Config {
        let mut config = Config::default();
        config.connection.reconnect_attempts = attempts;
        config.connection.reconnect_initial_delay_ms = 1;
        config.connection.reconnect_max_delay_ms = 4;
        config.features.sync_time_on_connect = false;
        config.features.report_datalog_sessions = false;
        config
    }

    struct Harness {
        devices: Vec<FakeDevice>,
        handle: DeviceHandle,
        events: mpsc::Receiver<DeviceEvent>,
        task: JoinHandle<Result<(), ClientError>>,
        source: Arc<MemoryInstallSource>,
    }

    fn start(connections: usize, attempts: u32) -> Harness {
        start_with(connections, test_config(attempts))
    }

    fn start_with(connections: usize, config: Config) -> Harness {
        let mut streams = VecDeque::new();
        let mut devices = Vec::new();
        for _ in 0..connections {
            let (near, far) = tokio::io::duplex(64 * 1024);
            streams.push_back(near);
            devices.push(FakeDevice {
                stream: far,
                decoder: Decoder::new(TransportMode::Serial),
            });
        }
        let connector = DuplexConnector {
            streams: Mutex::new(streams),
        };
        let source = Arc::new(MemoryInstallSource::new());
        let (supervisor, handle, events) = Supervisor::new(
            connector,
            &config,
            Arc::new(MemorySampleStore::new()),
            source.clone(),
        );
        let task = tokio::spawn(supervisor.run());
        Harness {
            devices,
            handle,
            events,
            task,
            source,
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_initializes_and_answers_ping() {
        let mut h = start(1, 0);
        let device = &mut h.devices[0];

        let request = device.recv().await;
        assert_eq!(request.endpoint, endpoint::FIRMWARE_VERSION);
        assert_eq!(&request.payload[..], &[0]);

        device.send_version("v3.12.3").await;
        let logs = device.recv().await;
        assert_eq!(logs.endpoint, endpoint::APP_LOGS);

        device
            .send(Frame::new(endpoint::PING, vec![0, 0, 0, 0, 7]))
            .await;
        let pong = device.recv().await;
        assert_eq!(&pong.payload[..], &[1, 0, 0, 0, 7]);

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut h.events).await;
            let done = matches!(event, DeviceEvent::Ping { .. });
            seen.push(event);
            if done {
                break;
            }
        }
        assert_eq!(
            seen[0],
            DeviceEvent::Connection {
                state: ConnectionState::Connecting
            }
        );
        assert!(seen.contains(&DeviceEvent::Connection {
            state: ConnectionState::Initialized
        }));
        assert!(seen
            .iter()
            .any(|e| matches!(e, DeviceEvent::VersionInfo(v) if v.major == 3)));

        h.handle.quit().await.unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reconnects_and_reinitializes() {
        let mut h = start(2, 3);
        let mut first = h.devices.remove(0);
        assert_eq!(first.recv().await.endpoint, endpoint::FIRMWARE_VERSION);
        drop(first);

        let second = &mut h.devices[0];
        let request = second.recv().await;
        assert_eq!(request.endpoint, endpoint::FIRMWARE_VERSION);

        let mut waited = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), h.events.recv()).await
        {
            if event
                == (DeviceEvent::Connection {
                    state: ConnectionState::WaitingReconnect,
                })
            {
                waited = true;
                break;
            }
        }
        assert!(waited);

        h.handle.quit().await.unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        let mut h = start(0, 2);
        let result = h.task.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::ReconnectExhausted { attempts: 2 })
        ));

        let mut last = None;
        while let Some(event) = h.events.recv().await {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(DeviceEvent::Connection {
                state: ConnectionState::NotConnected
            })
        );
    }

    #[tokio::test]
    async fn test_resync_then_next_frame() {
        let mut h = start(1, 0);
        let device = &mut h.devices[0];
        device.recv().await;

        device.stream.write_all(&[0xff, 0xff, 0x00, 0x30]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        device
            .send(Frame::new(endpoint::PING, vec![0, 0, 0, 0, 1]))
            .await;
        let pong = device.recv().await;
        assert_eq!(&pong.payload[..], &[1, 0, 0, 0, 1]);

        h.handle.quit().await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_legacy_install_reserves_link() {
        let mut h = start(1, 0);
        h.source.insert("app.bin", vec![0x5a; 10]);
        let uuid = Uuid::from_u128(0x42);
        let device = &mut h.devices[0];

        device.recv().await;
        device.send_version("v2.9.1").await;
        device.recv().await;

        h.handle
            .install(InstallRequest {
                kind: InstallKind::App,
                uuid,
                app_id: None,
                installables: vec![Installable::new("app.bin", BinaryType::Binary, 10)],
                metadata: None,
            })
            .await
            .unwrap();

        let delete = device.recv().await;
        assert_eq!(delete.endpoint, endpoint::APP_MANAGER);
        assert_eq!(delete.payload[0], 2);

        device
            .send(Frame::new(endpoint::APP_MANAGER, vec![2, 0, 0, 0, 1]))
            .await;
        assert_eq!(&device.recv().await.payload[..], &[5]);

        device
            .send(Frame::new(
                endpoint::APP_MANAGER,
                vec![1, 0, 0, 0, 8, 0, 0, 0, 0],
            ))
            .await;
        let init = device.recv().await;
        assert_eq!(init.endpoint, endpoint::PUT_BYTES);
        assert_eq!(&init.payload[..], &[1, 0, 0, 0, 10, 5, 0]);

        // Held back while the upload owns the link.
        h.handle
            .push(uuid, Dict::new().with(1, "dropped"))
            .await
            .unwrap();
        device
            .send(Frame::new(endpoint::PING, vec![0, 0, 0, 0, 3]))
            .await;

        device
            .send(Frame::new(endpoint::PUT_BYTES, vec![1, 0, 0, 0, 9]))
            .await;
        let chunk = device.recv().await;
        assert_eq!(chunk.endpoint, endpoint::PUT_BYTES);
        assert_eq!(&chunk.payload[..9], &[2, 0, 0, 0, 9, 0, 0, 0, 10]);
        assert_eq!(&chunk.payload[9..], &[0x5a; 10]);

        h.handle.quit().await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    /// Walks a 2.x watch through an app install up to the first PutBytes init.
    async fn install_until_init(h: &mut Harness) {
        h.source.insert("app.bin", vec![0x5a; 10]);
        let device = &mut h.devices[0];

        device.recv().await;
        device.send_version("v2.9.1").await;
        device.recv().await;

        h.handle
            .install(InstallRequest {
                kind: InstallKind::App,
                uuid: Uuid::from_u128(0x42),
                app_id: None,
                installables: vec![Installable::new("app.bin", BinaryType::Binary, 10)],
                metadata: None,
            })
            .await
            .unwrap();

        device.recv().await;
        device
            .send(Frame::new(endpoint::APP_MANAGER, vec![2, 0, 0, 0, 1]))
            .await;
        device.recv().await;
        device
            .send(Frame::new(
                endpoint::APP_MANAGER,
                vec![1, 0, 0, 0, 8, 0, 0, 0, 0],
            ))
            .await;
        let init = device.recv().await;
        assert_eq!(&init.payload[..], &[1, 0, 0, 0, 10, 5, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_install() {
        let mut config = test_config(0);
        config.connection.token_timeout_secs = 1;
        let mut h = start_with(1, config);
        install_until_init(&mut h).await;

        loop {
            match next_event(&mut h.events).await {
                DeviceEvent::InstallFinished { outcome, reason } => {
                    assert_eq!(outcome, Outcome::Failure);
                    assert_eq!(reason.as_deref(), Some("TOKEN_TIMEOUT"));
                    break;
                }
                _ => continue,
            }
        }

        // No token was granted, so nothing to abort; the link is free again.
        let device = &mut h.devices[0];
        device
            .send(Frame::new(endpoint::PING, vec![0, 0, 0, 0, 5]))
            .await;
        let pong = device.recv().await;
        assert_eq!(pong.endpoint, endpoint::PING);
        assert_eq!(&pong.payload[..], &[1, 0, 0, 0, 5]);

        h.handle.quit().await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_token_rearms_timeout() {
        let mut config = test_config(0);
        config.connection.token_timeout_secs = 1;
        let mut h = start_with(1, config);
        install_until_init(&mut h).await;
        let device = &mut h.devices[0];

        tokio::time::sleep(Duration::from_millis(800)).await;
        device
            .send(Frame::new(endpoint::PUT_BYTES, vec![1, 0, 0, 0, 9]))
            .await;
        let chunk = device.recv().await;
        assert_eq!(&chunk.payload[..5], &[2, 0, 0, 0, 9]);

        // Past the first deadline but inside the one armed for the chunk.
        tokio::time::sleep(Duration::from_millis(800)).await;
        device
            .send(Frame::new(endpoint::PUT_BYTES, vec![1, 0, 0, 0, 9]))
            .await;
        let commit = device.recv().await;
        assert_eq!(commit.endpoint, endpoint::PUT_BYTES);
        assert_eq!(commit.payload[0], 3);

        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, DeviceEvent::InstallFinished { .. }));
        }

        h.handle.quit().await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_undrained_events_do_not_stall_link() {
        let mut h = start(1, 0);
        let device = &mut h.devices[0];
        device.recv().await;
        device.send_version("v3.12.3").await;
        device.recv().await;

        // Every ping queues an event nobody reads.
        for n in 0..(CHANNEL_CAPACITY as u32 + 50) {
            let cookie = n.to_be_bytes();
            let mut payload = vec![0];
            payload.extend_from_slice(&cookie);
            device.send(Frame::new(endpoint::PING, payload)).await;
            let pong = device.recv().await;
            assert_eq!(pong.payload[0], 1);
            assert_eq!(&pong.payload[1..], &cookie);
        }

        h.handle.quit().await.unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_across_fragmented_reads() {
        let wire = Frame::new(endpoint::PING, vec![0, 0, 0, 0, 7])
            .encode()
            .unwrap();
        let mut reader = tokio_test::io::Builder::new()
            .read(&wire[..3])
            .read(&wire[3..])
            .build();
        let mut decoder = Decoder::new(TransportMode::Serial);

        let frame = read_frame(&mut reader, &mut decoder).await.unwrap();
        assert_eq!(frame.endpoint, endpoint::PING);
        assert_eq!(&frame.payload[..], &[0, 0, 0, 0, 7]);
        assert_eq!(decoder.buffered(), 0);

        let err = read_frame(&mut reader, &mut decoder).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
    }
}
