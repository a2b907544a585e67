//! Endpoint dispatcher: turns inbound frames into replies, installer input
//! and device events.
//!
//! The dispatcher owns all per-connection protocol state (generation,
//! transaction counter, datalog sessions, the installer) and is driven from
//! a single loop, so none of it needs locking.

use crate::datalog::DatalogRegistry;
use crate::error::CoreError;
use crate::events::{AppManagementKind, ConnectionState, DeviceEvent, Outcome};
use crate::install::{InstallRequest, InstallSource, InstallStep, Installer};
use crate::store::SampleStore;
use chrono::{Local, Offset};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wristlink_protocol::control::{self, AppManagerResponse, REMOTE_OS_ANDROID};
use wristlink_protocol::putbytes::PutBytesResponse;
use wristlink_protocol::{
    datalog, AppCommand, AppMessage, DeviceMessage, Dict, Frame, ProtocolGeneration,
    TransactionCounter,
};

/// Reply and events produced by a per-app handler.
#[derive(Debug, Default)]
pub struct HandlerResponse {
    /// Sent back to the app as Push messages.
    pub replies: Vec<Dict>,
    pub events: Vec<DeviceEvent>,
}

/// Handles application messages for one app UUID.
pub trait AppMessageHandler: Send {
    fn handle(&mut self, uuid: Uuid, dict: &Dict) -> HandlerResponse;

    /// Called when the device reports the app started.
    fn on_start(&mut self, _uuid: Uuid) -> HandlerResponse {
        HandlerResponse::default()
    }
}

/// Adapts a closure into an [`AppMessageHandler`].
pub struct FnHandler<F>(pub F);

impl<F> AppMessageHandler for FnHandler<F>
where
    F: FnMut(Uuid, &Dict) -> HandlerResponse + Send,
{
    fn handle(&mut self, uuid: Uuid, dict: &Dict) -> HandlerResponse {
        (self.0)(uuid, dict)
    }
}

/// Who issued an outgoing frame. Installer frames may be written while an
/// install reserves the link; dispatcher frames may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Dispatcher,
    Installer,
}

#[derive(Debug, Clone)]
pub struct Outgoing {
    pub frame: Frame,
    pub origin: Origin,
}

/// Frames to write and events to emit.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub outgoing: Vec<Outgoing>,
    pub events: Vec<DeviceEvent>,
}

impl Dispatch {
    fn send(&mut self, frame: Frame) {
        self.outgoing.push(Outgoing {
            frame,
            origin: Origin::Dispatcher,
        });
    }

    fn absorb(&mut self, step: InstallStep) {
        self.outgoing
            .extend(step.frames.into_iter().map(|frame| Outgoing {
                frame,
                origin: Origin::Installer,
            }));
        self.events.extend(step.events);
    }

    fn event(&mut self, event: DeviceEvent) {
        self.events.push(event);
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.outgoing.iter().map(|o| &o.frame)
    }
}

/// Behavior switches.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub sync_time_on_connect: bool,
    pub enable_app_logs: bool,
    pub report_datalog_sessions: bool,
    pub ack_unhandled_app_messages: bool,
    pub timezone: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sync_time_on_connect: true,
            enable_app_logs: false,
            report_datalog_sessions: true,
            ack_unhandled_app_messages: false,
            timezone: None,
        }
    }
}

pub struct Dispatcher {
    config: DispatcherConfig,
    generation: ProtocolGeneration,
    transactions: TransactionCounter,
    handlers: HashMap<Uuid, Box<dyn AppMessageHandler>>,
    datalog: DatalogRegistry,
    installer: Installer,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn SampleStore>,
        source: Arc<dyn InstallSource>,
    ) -> Self {
        Self {
            config,
            generation: ProtocolGeneration::default(),
            transactions: TransactionCounter::new(),
            handlers: HashMap::new(),
            datalog: DatalogRegistry::new(store),
            installer: Installer::new(source),
        }
    }

    /// Registers the handler for an app UUID, replacing any previous one.
    pub fn register_handler(&mut self, uuid: Uuid, handler: Box<dyn AppMessageHandler>) {
        self.handlers.insert(uuid, handler);
    }

    pub fn unregister_handler(&mut self, uuid: &Uuid) -> bool {
        self.handlers.remove(uuid).is_some()
    }

    pub fn has_handler(&self, uuid: &Uuid) -> bool {
        self.handlers.contains_key(uuid)
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    /// Whether non-installer writes must be held back.
    pub fn reserves_link(&self) -> bool {
        self.installer.reserves_link()
    }

    /// Frames to send after the transport (re)connects.
    pub fn connection_started(&mut self) -> Dispatch {
        let mut out = Dispatch::default();
        out.event(DeviceEvent::Connection {
            state: ConnectionState::Connected,
        });
        out.send(control::firmware_version_request());
        out
    }

    /// Ends a running install when the transport is lost.
    pub fn connection_lost(&mut self) -> Dispatch {
        let mut out = Dispatch::default();
        if self.installer.is_active() {
            // The abort frame can no longer be delivered.
            let step = self.installer.abort("connection lost");
            out.events.extend(step.events);
        }
        out
    }

    /// Starts an install. A request made while another install runs is
    /// dropped with a warning.
    pub fn install(&mut self, request: InstallRequest) -> Dispatch {
        let mut out = Dispatch::default();
        match self.installer.install(request, self.generation) {
            Ok(step) => out.absorb(step),
            Err(CoreError::InstallInProgress) => {
                warn!("Install requested while another is running; ignoring");
            }
            Err(e) => {
                warn!("Cannot start install: {}", e);
                out.event(DeviceEvent::InstallFinished {
                    outcome: Outcome::Failure,
                    reason: Some(e.reason().to_string()),
                });
            }
        }
        out
    }

    pub fn install_runnable(&self) -> bool {
        self.installer.is_runnable()
    }

    /// Runs one installer step.
    pub fn step_install(&mut self) -> Dispatch {
        let mut out = Dispatch::default();
        out.absorb(self.installer.step());
        out
    }

    /// The current wait for an upload token, see [`Installer::token_wait`].
    pub fn install_token_wait(&self) -> Option<u64> {
        self.installer.token_wait()
    }

    /// Fails the install whose token did not arrive in time.
    pub fn install_timed_out(&mut self) -> Dispatch {
        let mut out = Dispatch::default();
        out.absorb(self.installer.token_timeout());
        out
    }

    /// Builds an outgoing Push or Request with the next transaction id.
    pub fn app_message(
        &mut self,
        command: AppCommand,
        uuid: Uuid,
        dict: Dict,
    ) -> Result<Frame, CoreError> {
        let id = self.transactions.next_id();
        let message = match command {
            AppCommand::Request => AppMessage::request(uuid, id, dict),
            _ => AppMessage::push(uuid, id, dict),
        };
        Ok(message.to_frame()?)
    }

    /// Starts or stops an app on the watch.
    pub fn app_start(&mut self, uuid: Uuid, start: bool) -> Result<Frame, CoreError> {
        let id = self.transactions.next_id();
        Ok(control::app_start(self.generation, uuid, start, id)?)
    }

    /// Dispatches one inbound frame.
    pub fn handle_frame(&mut self, frame: &Frame) -> Dispatch {
        let mut out = Dispatch::default();
        let message = match DeviceMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Dropping frame on endpoint {} ({} bytes): {}",
                    frame.endpoint,
                    frame.payload.len(),
                    e
                );
                return out;
            }
        };

        match message {
            DeviceMessage::Version(info) => {
                self.generation = info.generation();
                info!(
                    "Firmware {} ({:?} generation, hardware {})",
                    info.firmware,
                    self.generation,
                    info.hardware_revision.as_deref().unwrap_or("unknown")
                );
                if self.config.sync_time_on_connect {
                    out.send(self.time_frame());
                }
                out.send(control::enable_app_logs(self.config.enable_app_logs));
                if self.config.report_datalog_sessions {
                    out.send(datalog::report_sessions());
                }
                out.event(DeviceEvent::VersionInfo(info));
                out.event(DeviceEvent::Connection {
                    state: ConnectionState::Initialized,
                });
            }
            DeviceMessage::PhoneVersionRequest => {
                out.send(control::phone_version_reply(REMOTE_OS_ANDROID));
            }
            DeviceMessage::Ping { cookie } => {
                out.send(control::pong(cookie));
                out.event(DeviceEvent::Ping { cookie });
            }
            DeviceMessage::Application(payload) => self.handle_app_message(&payload, &mut out),
            DeviceMessage::PutBytes(PutBytesResponse::Token(token)) => {
                debug!("Upload token {:#010x}", token);
                self.installer.deliver_token(token);
            }
            DeviceMessage::PutBytes(PutBytesResponse::Failure { command, .. }) => {
                out.absorb(self.installer.deliver_upload_failure(command));
            }
            DeviceMessage::AppManager(response) => self.handle_app_manager(response, &mut out),
            DeviceMessage::AppFetch(request) => {
                info!("App fetch request for {} (app id {})", request.uuid, request.app_id);
                out.event(DeviceEvent::AppFetchRequest {
                    uuid: request.uuid,
                    app_id: request.app_id,
                });
            }
            DeviceMessage::AppRunState { started, uuid } => {
                if !started {
                    out.event(DeviceEvent::AppStopped { uuid });
                } else if let Some(handler) = self.handlers.get_mut(&uuid) {
                    let response = handler.on_start(uuid);
                    self.apply_handler_response(uuid, response, &mut out);
                } else {
                    out.event(DeviceEvent::AppManagement {
                        kind: AppManagementKind::Start,
                        outcome: Outcome::Success,
                        uuid: Some(uuid),
                    });
                    out.event(DeviceEvent::AppStarted { uuid });
                }
            }
            DeviceMessage::BlobDb { token, status } => {
                debug!("BlobDB token {} status {}", token, status);
            }
            DeviceMessage::Datalog(message) => {
                let outcome = self.datalog.handle_message(message);
                if let Some(reply) = outcome.reply {
                    out.send(reply);
                }
                out.events.extend(outcome.events);
            }
            DeviceMessage::System { code } => {
                debug!("System message {}", code);
            }
            DeviceMessage::AppLog(entry) => out.event(DeviceEvent::AppLog(entry)),
            DeviceMessage::Unhandled { endpoint, command } => {
                debug!(
                    "Unhandled message on endpoint {} (command {:?})",
                    endpoint, command
                );
            }
        }
        out
    }

    fn time_frame(&self) -> Frame {
        let now = Local::now();
        let offset = now.offset().fix().local_minus_utc();
        let timezone = self.config.timezone.as_deref().unwrap_or("UTC");
        control::set_time(self.generation, now.timestamp(), offset, timezone)
    }

    fn handle_app_manager(&mut self, response: AppManagerResponse, out: &mut Dispatch) {
        match response {
            AppManagerResponse::BankStatus {
                slot_count,
                apps,
                free_slot,
            } => {
                debug!(
                    "App bank: {} of {} slots used, free slot {:?}",
                    apps.len(),
                    slot_count,
                    free_slot
                );
                self.installer.deliver_slot(free_slot);
            }
            AppManagerResponse::Uuids(uuids) => {
                debug!("{} apps installed", uuids.len());
                out.send(control::app_bank_status_request());
            }
            AppManagerResponse::Result { success, .. } => {
                match self.installer.deliver_app_manager_result(success) {
                    Some(step) => out.absorb(step),
                    None => {
                        out.event(DeviceEvent::AppManagement {
                            kind: AppManagementKind::Delete,
                            outcome: Outcome::from_success(success),
                            uuid: None,
                        });
                        if success {
                            out.send(control::app_info_request());
                        }
                    }
                }
            }
        }
    }

    fn handle_app_message(&mut self, payload: &[u8], out: &mut Dispatch) {
        let header = match AppMessage::decode_header(payload) {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping application message: {}", e);
                return;
            }
        };
        self.transactions.observe(header.transaction_id);

        if !header.command.carries_dict() {
            debug!(
                "{:?} for transaction {} from {}",
                header.command, header.transaction_id, header.uuid
            );
            return;
        }

        let mut body = header.body;
        let dict = Dict::decode(&mut body);
        let ack = AppMessage::ack(header.uuid, header.transaction_id);

        if let Some(handler) = self.handlers.get_mut(&header.uuid) {
            let response = match &dict {
                Ok(dict) => handler.handle(header.uuid, dict),
                Err(e) => {
                    warn!("Undecodable dict from {}: {}", header.uuid, e);
                    HandlerResponse::default()
                }
            };
            match ack.to_frame() {
                Ok(frame) => out.send(frame),
                Err(e) => warn!("Cannot encode ack: {}", e),
            }
            self.apply_handler_response(header.uuid, response, out);
            return;
        }

        match dict {
            Ok(dict) => out.event(DeviceEvent::AppMessage {
                uuid: header.uuid,
                transaction_id: header.transaction_id,
                dict: dict.to_json(),
            }),
            Err(e) => warn!("Undecodable dict from {}: {}", header.uuid, e),
        }
        if self.config.ack_unhandled_app_messages {
            match ack.to_frame() {
                Ok(frame) => out.send(frame),
                Err(e) => warn!("Cannot encode ack: {}", e),
            }
        }
    }

    fn apply_handler_response(&mut self, uuid: Uuid, response: HandlerResponse, out: &mut Dispatch) {
        for reply in response.replies {
            let id = self.transactions.next_id();
            match AppMessage::push(uuid, id, reply).to_frame() {
                Ok(frame) => out.send(frame),
                Err(e) => warn!("Cannot encode reply to {}: {}", uuid, e),
            }
        }
        out.events.extend(response.events);
    }
}
