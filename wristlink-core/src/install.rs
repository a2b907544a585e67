//! Install state machine.
//!
//! ```text
//! UNKNOWN -> WAIT_SLOT -> START_INSTALL -> WAIT_TOKEN -> UPLOAD_CHUNK -> UPLOAD_COMMIT
//!         -> WAIT_COMMIT -> UPLOAD_COMPLETE -> (START_INSTALL | APP_REFRESH) -> UNKNOWN
//! ```
//!
//! The machine never blocks. The connection loop calls [`Installer::step`]
//! whenever [`Installer::is_runnable`] holds and feeds device replies in
//! through the `deliver_*` methods. Tokens are correlated by last value
//! wins: whatever token arrived most recently is used for the next request.

use crate::error::CoreError;
use crate::events::{DeviceEvent, Outcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wristlink_protocol::control::{self, AppMetadata};
use wristlink_protocol::putbytes;
use wristlink_protocol::{stm32_crc32, BinaryType, Frame, ProtocolGeneration, CHUNK_SIZE};

/// File name sent with a language pack upload.
const LANGUAGE_FILE_NAME: &str = "lang";

/// What is being installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallKind {
    Firmware,
    Language,
    App,
}

/// One binary of an install, as enumerated from the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installable {
    pub file_name: String,
    pub binary_type: BinaryType,
    pub size: u32,
    /// STM32 CRC32 from the manifest; computed from the data when absent.
    #[serde(default)]
    pub crc32: Option<u32>,
    /// Whole-file CRC32C checked before the upload starts.
    #[serde(default)]
    pub crc32c: Option<u32>,
}

impl Installable {
    pub fn new(file_name: impl Into<String>, binary_type: BinaryType, size: u32) -> Self {
        Self {
            file_name: file_name.into(),
            binary_type,
            size,
            crc32: None,
            crc32c: None,
        }
    }
}

/// A request to install a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub kind: InstallKind,
    pub uuid: Uuid,
    /// Set when answering the watch's app fetch request.
    pub app_id: Option<u32>,
    pub installables: Vec<Installable>,
    pub metadata: Option<AppMetadata>,
}

/// Provides installable contents.
pub trait InstallSource: Send + Sync {
    fn load(&self, installable: &Installable) -> Result<Vec<u8>, CoreError>;
}

/// Installables held in memory, keyed by file name.
#[derive(Debug, Default)]
pub struct MemoryInstallSource {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryInstallSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file_name: impl Into<String>, data: Vec<u8>) {
        self.files.lock().insert(file_name.into(), data);
    }
}

impl InstallSource for MemoryInstallSource {
    fn load(&self, installable: &Installable) -> Result<Vec<u8>, CoreError> {
        self.files
            .lock()
            .get(&installable.file_name)
            .cloned()
            .ok_or_else(|| CoreError::InstallableNotFound {
                name: installable.file_name.clone(),
            })
    }
}

/// Installables read from files under a directory.
#[derive(Debug, Clone)]
pub struct FsInstallSource {
    dir: PathBuf,
}

impl FsInstallSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl InstallSource for FsInstallSource {
    fn load(&self, installable: &Installable) -> Result<Vec<u8>, CoreError> {
        let path = self.dir.join(&installable.file_name);
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::InstallableNotFound {
                    name: installable.file_name.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    Unknown,
    WaitSlot,
    StartInstall,
    WaitToken,
    UploadChunk,
    UploadCommit,
    WaitCommit,
    UploadComplete,
    AppRefresh,
}

/// Slot state of the running install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Unset,
    /// The device reported no free slot.
    NoneFree,
    /// Slot index (legacy) or app id (modern).
    Allocated(u32),
}

/// Frames to write and events to emit after an installer call.
#[derive(Debug, Default)]
pub struct InstallStep {
    pub frames: Vec<Frame>,
    pub events: Vec<DeviceEvent>,
}

impl InstallStep {
    fn frame(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
            events: Vec::new(),
        }
    }
}

struct InstallSession {
    kind: InstallKind,
    generation: ProtocolGeneration,
    installables: Vec<Installable>,
    phase: InstallPhase,
    slot: Slot,
    token: Option<u32>,
    /// Most recent token of the current upload, kept for the abort.
    last_token: Option<u32>,
    index: usize,
    data: Vec<u8>,
    crc: u32,
    bytes_written: usize,
    refresh_sent: bool,
}

/// Drives at most one install at a time.
pub struct Installer {
    source: std::sync::Arc<dyn InstallSource>,
    session: Option<InstallSession>,
    blobdb_token: u16,
    /// Bumped every time a written frame leaves the session owing a token.
    token_waits: u64,
}

impl Installer {
    pub fn new(source: std::sync::Arc<dyn InstallSource>) -> Self {
        Self {
            source,
            session: None,
            blobdb_token: 0,
            token_waits: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn phase(&self) -> InstallPhase {
        self.session
            .as_ref()
            .map_or(InstallPhase::Unknown, |s| s.phase)
    }

    /// Whether [`Installer::step`] would make progress now.
    pub fn is_runnable(&self) -> bool {
        match &self.session {
            None => false,
            Some(s) => match s.phase {
                InstallPhase::Unknown => false,
                InstallPhase::WaitSlot => s.slot != Slot::Unset,
                InstallPhase::WaitToken | InstallPhase::WaitCommit => s.token.is_some(),
                InstallPhase::AppRefresh => !s.refresh_sent,
                _ => true,
            },
        }
    }

    /// Identifies the current wait for a device token, if the session is
    /// blocked on one. A new wait gets a new value.
    pub fn token_wait(&self) -> Option<u64> {
        let session = self.session.as_ref()?;
        let waiting = matches!(
            session.phase,
            InstallPhase::WaitToken | InstallPhase::WaitCommit
        ) && session.token.is_none();
        waiting.then_some(self.token_waits)
    }

    /// The device did not answer an upload request in time.
    pub fn token_timeout(&mut self) -> InstallStep {
        if self.token_wait().is_none() {
            return InstallStep::default();
        }
        warn!("Timed out waiting for upload token in {:?}", self.phase());
        self.finish(Err(CoreError::TokenTimeout))
    }

    /// Whether writes not issued by the installer must be held back. Only
    /// the legacy generation reserves the link, and not while waiting for
    /// a slot.
    pub fn reserves_link(&self) -> bool {
        match &self.session {
            Some(s) => !s.generation.is_modern() && s.phase != InstallPhase::WaitSlot,
            None => false,
        }
    }

    /// Starts an install. Fails with [`CoreError::InstallInProgress`] if one
    /// is already running; the running install is not disturbed.
    pub fn install(
        &mut self,
        request: InstallRequest,
        generation: ProtocolGeneration,
    ) -> Result<InstallStep, CoreError> {
        if self.session.is_some() {
            return Err(CoreError::InstallInProgress);
        }

        let modern_app = generation.is_modern() && request.kind == InstallKind::App;
        if modern_app && request.app_id.is_none() {
            // The watch answers with an app fetch request carrying the app id.
            info!("Installing metadata for {}", request.uuid);
            let metadata = request.metadata.unwrap_or_else(|| AppMetadata {
                uuid: request.uuid,
                name: String::new(),
                flags: 0,
                icon_id: 0,
                app_version: 0,
                sdk_version: 0,
            });
            self.blobdb_token = self.blobdb_token.wrapping_add(1);
            return Ok(InstallStep {
                frames: vec![
                    control::install_metadata(self.blobdb_token, &metadata),
                    control::app_start(generation, request.uuid, true, 0)?,
                ],
                events: Vec::new(),
            });
        }

        if request.installables.is_empty() {
            return Err(CoreError::EmptyInstall);
        }

        let (phase, slot, frames) = match request.kind {
            InstallKind::Firmware => {
                info!("Starting firmware installation");
                (
                    InstallPhase::StartInstall,
                    Slot::Allocated(0),
                    vec![control::firmware_start(), control::get_time()],
                )
            }
            InstallKind::Language => (
                InstallPhase::StartInstall,
                Slot::Allocated(0),
                vec![control::get_time()],
            ),
            InstallKind::App => match request.app_id {
                Some(app_id) if generation.is_modern() => (
                    InstallPhase::StartInstall,
                    Slot::Allocated(app_id),
                    vec![control::app_fetch_ack()],
                ),
                _ => (
                    InstallPhase::WaitSlot,
                    Slot::Unset,
                    vec![control::app_delete_legacy(request.uuid)],
                ),
            },
        };

        info!(
            "Install of {} ({} installables) starting in {:?}",
            request.uuid,
            request.installables.len(),
            phase
        );
        self.session = Some(InstallSession {
            kind: request.kind,
            generation,
            installables: request.installables,
            phase,
            slot,
            token: None,
            last_token: None,
            index: 0,
            data: Vec::new(),
            crc: 0,
            bytes_written: 0,
            refresh_sent: false,
        });

        Ok(InstallStep {
            frames,
            events: Vec::new(),
        })
    }

    /// Records a token from the device. A later token overwrites an
    /// unconsumed earlier one.
    pub fn deliver_token(&mut self, token: u32) {
        if let Some(session) = self.session.as_mut() {
            if session.token.is_some() {
                debug!("Token {} replaces unconsumed token", token);
            }
            session.token = Some(token);
            session.last_token = Some(token);
        }
    }

    /// Records the free slot found by a bank status query.
    pub fn deliver_slot(&mut self, slot: Option<u32>) {
        if let Some(session) = self.session.as_mut() {
            session.slot = match slot {
                Some(slot) => Slot::Allocated(slot),
                None => Slot::NoneFree,
            };
        }
    }

    /// The device rejected an upload request.
    pub fn deliver_upload_failure(&mut self, command: u8) -> InstallStep {
        if self.session.is_none() {
            return InstallStep::default();
        }
        warn!("Upload request {} rejected by device", command);
        self.finish(Err(CoreError::UploadRejected { command }))
    }

    /// Handles an app manager remove/refresh result. Returns `None` when no
    /// install is running.
    ///
    /// While waiting for a slot the result only means the old copy is gone
    /// (or was never there), so it triggers the slot query. Otherwise it is
    /// the outcome of the refresh that ends a legacy app install.
    pub fn deliver_app_manager_result(&mut self, success: bool) -> Option<InstallStep> {
        let phase = self.session.as_ref()?.phase;
        if phase == InstallPhase::WaitSlot {
            return Some(InstallStep::frame(control::app_info_request()));
        }

        if success {
            let mut step = self.finish(Ok(()));
            step.frames.push(control::app_info_request());
            Some(step)
        } else {
            Some(self.finish(Err(CoreError::UploadRejected {
                command: control::APP_MANAGER_REFRESH,
            })))
        }
    }

    /// Ends the running install as failed, e.g. when the link is lost.
    pub fn abort(&mut self, reason: &str) -> InstallStep {
        if self.session.is_none() {
            return InstallStep::default();
        }
        warn!("Aborting install: {}", reason);
        self.finish_with(Outcome::Failure, Some(reason.to_string()))
    }

    /// Performs one step. Phases that only change state run on until a
    /// phase writes a frame or has to wait.
    pub fn step(&mut self) -> InstallStep {
        let step = self.advance();
        if !step.frames.is_empty() && self.token_wait().is_some() {
            self.token_waits = self.token_waits.wrapping_add(1);
        }
        step
    }

    fn advance(&mut self) -> InstallStep {
        loop {
            let session = match self.session.as_mut() {
                Some(session) => session,
                None => return InstallStep::default(),
            };

            match session.phase {
                InstallPhase::Unknown => return InstallStep::default(),
                InstallPhase::WaitSlot => match session.slot {
                    Slot::Unset => return InstallStep::default(),
                    Slot::NoneFree => return self.finish(Err(CoreError::NoFreeSlot)),
                    Slot::Allocated(_) => session.phase = InstallPhase::StartInstall,
                },
                InstallPhase::StartInstall => return self.start_installable(),
                InstallPhase::WaitToken => {
                    if session.token.is_none() {
                        return InstallStep::default();
                    }
                    session.phase = InstallPhase::UploadChunk;
                }
                InstallPhase::UploadChunk => {
                    let token = match session.token {
                        Some(token) => token,
                        None => {
                            session.phase = InstallPhase::WaitToken;
                            return InstallStep::default();
                        }
                    };
                    let start = session.bytes_written;
                    let end = (start + CHUNK_SIZE).min(session.data.len());
                    if start == end {
                        session.phase = InstallPhase::UploadCommit;
                        continue;
                    }

                    let frame = putbytes::send(token, &session.data[start..end]);
                    session.bytes_written = end;
                    session.token = None;
                    session.phase = InstallPhase::WaitToken;
                    return InstallStep {
                        frames: vec![frame],
                        events: vec![DeviceEvent::InstallProgress {
                            item: session.index,
                            bytes_written: end as u32,
                            total: session.data.len() as u32,
                        }],
                    };
                }
                InstallPhase::UploadCommit => {
                    let token = session.token.unwrap_or_default();
                    let frame = putbytes::commit(token, session.crc);
                    session.token = None;
                    session.phase = InstallPhase::WaitCommit;
                    return InstallStep::frame(frame);
                }
                InstallPhase::WaitCommit => {
                    if session.token.is_none() {
                        return InstallStep::default();
                    }
                    session.phase = InstallPhase::UploadComplete;
                }
                InstallPhase::UploadComplete => {
                    let token = session.token.unwrap_or_default();
                    let frame = putbytes::complete(token);
                    session.index += 1;
                    session.phase = if session.index < session.installables.len() {
                        InstallPhase::StartInstall
                    } else {
                        InstallPhase::AppRefresh
                    };
                    return InstallStep::frame(frame);
                }
                InstallPhase::AppRefresh => {
                    return match (session.kind, session.generation.is_modern()) {
                        (InstallKind::Firmware, _) => {
                            let mut step = self.finish(Ok(()));
                            step.frames.insert(0, control::firmware_complete());
                            step
                        }
                        // The device sends no completion for these.
                        (InstallKind::Language, _) | (InstallKind::App, true) => {
                            self.finish(Ok(()))
                        }
                        (InstallKind::App, false) => {
                            if session.refresh_sent {
                                return InstallStep::default();
                            }
                            session.refresh_sent = true;
                            let slot = match session.slot {
                                Slot::Allocated(slot) => slot,
                                _ => 0,
                            };
                            InstallStep::frame(control::app_refresh(slot))
                        }
                    };
                }
            }
        }
    }

    fn start_installable(&mut self) -> InstallStep {
        let source = self.source.clone();
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return InstallStep::default(),
        };
        let installable = match session.installables.get(session.index) {
            Some(installable) => installable.clone(),
            None => return self.finish(Err(CoreError::EmptyInstall)),
        };

        let data = match source.load(&installable) {
            Ok(data) => data,
            Err(e) => return self.finish(Err(e)),
        };
        if let Some(expected) = installable.crc32c {
            let actual = crc32c::crc32c(&data);
            if actual != expected {
                return self.finish(Err(CoreError::Crc32cMismatch {
                    name: installable.file_name,
                    expected,
                    actual,
                }));
            }
        }
        if data.len() != installable.size as usize {
            warn!(
                "{} is {} bytes, manifest says {}",
                installable.file_name,
                data.len(),
                installable.size
            );
        }

        let (binary_type, file_name) = match session.kind {
            InstallKind::Language => (BinaryType::File, Some(LANGUAGE_FILE_NAME)),
            _ => (installable.binary_type, None),
        };
        let target = match session.slot {
            Slot::Allocated(slot) => slot,
            _ => 0,
        };

        session.crc = installable.crc32.unwrap_or_else(|| stm32_crc32(&data));
        session.bytes_written = 0;
        let frame = putbytes::init(
            session.generation,
            binary_type,
            data.len() as u32,
            target,
            file_name,
        );
        info!(
            "Uploading {} ({} bytes, crc {:#010x})",
            installable.file_name,
            data.len(),
            session.crc
        );
        session.data = data;
        session.token = None;
        session.last_token = None;
        session.phase = InstallPhase::WaitToken;
        InstallStep::frame(frame)
    }

    fn finish(&mut self, result: Result<(), CoreError>) -> InstallStep {
        match result {
            Ok(()) => self.finish_with(Outcome::Success, None),
            Err(e) => {
                warn!("Install failed: {}", e);
                self.finish_with(Outcome::Failure, Some(e.reason().to_string()))
            }
        }
    }

    fn finish_with(&mut self, outcome: Outcome, reason: Option<String>) -> InstallStep {
        let mut step = InstallStep::default();
        if let Some(session) = self.session.take() {
            if outcome == Outcome::Failure {
                if let Some(token) = session.token.or(session.last_token) {
                    step.frames.push(putbytes::abort(token));
                }
            } else {
                info!("Install finished");
            }
            step.events.push(DeviceEvent::InstallFinished { outcome, reason });
        }
        step
    }
}
