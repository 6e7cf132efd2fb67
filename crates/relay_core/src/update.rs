use relay_logging::{relay_debug, relay_info, relay_warn};

use crate::{
    ActiveSessionPointer, AppSignal, DownloadItem, DownloadSessionRecord, DownloadSessionStatus,
    Effect, FailedItem, LifecycleState, Msg, PendingCommand, Phase, RejectReason, SessionKind,
    SessionRelease, SessionSummary,
};

/// Pure update function: applies a message to state and returns any effects.
///
/// A refused user request leaves the state untouched apart from the stored
/// rejection, and yields at most one toast.
pub fn update(mut state: LifecycleState, msg: Msg) -> (LifecycleState, Vec<Effect>) {
    let effects = match msg {
        Msg::ScrapeRequested { key, options } => {
            match can_start(&state, SessionKind::Scrape) {
                Err(reason) => reject(&mut state, reason),
                Ok(()) => {
                    let mut effects = take_over(&mut state, &[]);
                    state.phase = Phase::Starting;
                    state.script_lock = true;
                    state.pointer = Some(ActiveSessionPointer {
                        kind: SessionKind::Scrape,
                        url: key.input_url().to_string(),
                        session_id: None,
                    });
                    state.scrape = Some(key.clone());
                    state.mark_dirty();
                    relay_info!("scrape {} starting", key);
                    effects.push(Effect::RunScript { key, options });
                    effects.push(Effect::Notify(AppSignal::SessionActiveChanged {
                        session_id: None,
                    }));
                    effects
                }
            }
        }
        Msg::DownloadRequested { items, destination } => {
            if items.is_empty() {
                return with(state, RejectReason::EmptyRequest);
            }
            match can_start(&state, SessionKind::Download) {
                Err(reason) => reject(&mut state, reason),
                Ok(()) => {
                    let mut effects = take_over(&mut state, &items);
                    state.phase = Phase::Starting;
                    state.pointer = Some(ActiveSessionPointer {
                        kind: SessionKind::Download,
                        url: items[0].url.clone(),
                        session_id: None,
                    });
                    state.download = Some(DownloadSessionRecord {
                        session_id: None,
                        items: items.clone(),
                        destination: destination.clone(),
                        status: DownloadSessionStatus::Queued,
                        failed_items: Vec::new(),
                    });
                    state.mark_dirty();
                    relay_info!("download of {} item(s) to {} starting", items.len(), destination);
                    effects.push(Effect::StartDownloadSession { items, destination });
                    effects.push(Effect::Notify(AppSignal::SessionActiveChanged {
                        session_id: None,
                    }));
                    effects
                }
            }
        }
        Msg::SessionStarted { session_id } => on_session_started(&mut state, session_id),
        Msg::StartFailed { error } => {
            if state.phase != Phase::Starting || state.kind() != Some(SessionKind::Download) {
                Vec::new()
            } else {
                relay_warn!("download session failed to start: {}", error);
                state.phase = Phase::Failed;
                let failed_items = state
                    .download
                    .as_ref()
                    .map(|record| {
                        record
                            .items
                            .iter()
                            .map(|item| FailedItem {
                                url: item.url.clone(),
                                filename: item.filename.clone(),
                                status: "failed".to_string(),
                                error: Some(error.clone()),
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                state.summary = Some(SessionSummary {
                    kind: SessionKind::Download,
                    session_id: None,
                    phase: Phase::Failed,
                    total: failed_items.len(),
                    completed: 0,
                    failed_items,
                    authoritative: false,
                    error: Some(error.clone()),
                });
                state.mark_dirty();
                vec![
                    Effect::Toast {
                        message: format!("Could not start download: {error}"),
                    },
                    Effect::Notify(AppSignal::SessionActiveChanged { session_id: None }),
                ]
            }
        }
        Msg::PauseRequested => request_command(&mut state, PendingCommand::Pause),
        Msg::ResumeRequested => request_command(&mut state, PendingCommand::Resume),
        Msg::SessionPaused { session_id } => {
            confirm_command(&mut state, &session_id, PendingCommand::Pause)
        }
        Msg::SessionResumed { session_id } => {
            confirm_command(&mut state, &session_id, PendingCommand::Resume)
        }
        Msg::ConfirmTimedOut {
            session_id,
            command,
            request,
        } => {
            if state.pending == Some((command, request)) && state.is_current(&session_id) {
                state.pending = None;
                state.mark_dirty();
                relay_warn!("{} of {} not confirmed in time", command.as_str(), session_id);
                vec![Effect::Toast {
                    message: format!("The backend did not confirm the {}", command.as_str()),
                }]
            } else {
                Vec::new()
            }
        }
        Msg::CommandFailed {
            command,
            request,
            error,
        } => {
            if state.pending == Some((command, request)) {
                state.pending = None;
                state.mark_dirty();
                vec![Effect::Toast {
                    message: format!("Could not {}: {error}", command.as_str()),
                }]
            } else {
                relay_debug!("late {} failure ignored: {}", command.as_str(), error);
                Vec::new()
            }
        }
        Msg::CancelRequested => match live_download_session(&state, "cancel") {
            Err(reason) => reject(&mut state, reason),
            Ok(session_id) => {
                if state.cancel_in_flight {
                    reject(&mut state, RejectReason::CommandInFlight("cancel"))
                } else {
                    state.cancel_in_flight = true;
                    state.mark_dirty();
                    vec![Effect::CancelSession { session_id }]
                }
            }
        },
        Msg::CancelFailed { error } => {
            if state.cancel_in_flight {
                state.cancel_in_flight = false;
                state.mark_dirty();
                vec![Effect::Toast {
                    message: format!("Could not cancel: {error}"),
                }]
            } else {
                Vec::new()
            }
        }
        Msg::CancelAcknowledged { session_id } | Msg::SessionCancelled { session_id } => {
            if !state.is_current(&session_id) {
                Vec::new()
            } else if state.phase.is_live() {
                state.cancel_in_flight = false;
                enter_terminal(&mut state, Phase::Cancelled, session_id)
            } else {
                state.cancel_in_flight = false;
                Vec::new()
            }
        }
        Msg::SessionFinished { session_id } => {
            if state.is_current(&session_id) && state.phase.is_live() {
                enter_terminal(&mut state, Phase::Completed, session_id)
            } else {
                relay_debug!("finished event for {} ignored in {}", session_id, state.phase);
                Vec::new()
            }
        }
        Msg::Reconciled { session_id, report } => {
            if !state.reconciling || !state.is_current(&session_id) {
                Vec::new()
            } else {
                state.reconciling = false;
                let total = report.total();
                if state.phase == Phase::Completed
                    && total > 0
                    && report.failed_items.len() == total
                {
                    state.phase = Phase::Failed;
                }
                if let Some(record) = state.download.as_mut() {
                    record.failed_items = report.failed_items.clone();
                }
                state.summary = Some(SessionSummary {
                    kind: SessionKind::Download,
                    session_id: Some(session_id.clone()),
                    phase: state.phase,
                    total,
                    completed: report.completed,
                    failed_items: report.failed_items,
                    authoritative: true,
                    error: None,
                });
                state.mark_dirty();
                vec![Effect::Notify(AppSignal::SessionActiveChanged {
                    session_id: Some(session_id),
                })]
            }
        }
        Msg::ReconcileFailed { session_id, error } => {
            if !state.reconciling || !state.is_current(&session_id) {
                Vec::new()
            } else {
                // A transport gap, not a user-facing error.
                relay_warn!("reconciliation of {} failed: {}", session_id, error);
                state.reconciling = false;
                let total = state.download.as_ref().map_or(0, |record| record.items.len());
                state.summary = Some(SessionSummary {
                    kind: SessionKind::Download,
                    session_id: Some(session_id.clone()),
                    phase: state.phase,
                    total,
                    completed: 0,
                    failed_items: Vec::new(),
                    authoritative: false,
                    error: None,
                });
                state.mark_dirty();
                vec![Effect::Notify(AppSignal::SessionActiveChanged {
                    session_id: Some(session_id),
                })]
            }
        }
        Msg::SummaryClosed => {
            if state.pointer.is_none() {
                reject(&mut state, RejectReason::NoActiveSession)
            } else if state.phase.is_live() {
                let phase = state.phase.as_str();
                reject(
                    &mut state,
                    RejectReason::InvalidTransition {
                        action: "close",
                        phase,
                    },
                )
            } else if state.reconciling {
                reject(&mut state, RejectReason::StillReconciling)
            } else {
                close(&mut state)
            }
        }
        Msg::SessionPurged { session_id } => match session_id {
            Some(id) if !state.is_current(&id) => {
                vec![Effect::Release(SessionRelease::Download {
                    session_id: Some(id),
                    urls: Vec::new(),
                })]
            }
            _ if state.kind() == Some(SessionKind::Download) => {
                relay_info!("session purged by backend");
                state.reconciling = false;
                close(&mut state)
            }
            _ => Vec::new(),
        },
        Msg::ScrapeItemSeen => {
            if state.phase == Phase::Starting && state.kind() == Some(SessionKind::Scrape) {
                state.phase = Phase::Running;
                state.mark_dirty();
            }
            Vec::new()
        }
        Msg::ScrapeFinished { key, items } => {
            if state.scrape.as_ref() == Some(&key) && state.phase.is_live() {
                state.phase = Phase::Completed;
                state.script_lock = false;
                state.summary = Some(SessionSummary {
                    kind: SessionKind::Scrape,
                    session_id: None,
                    phase: Phase::Completed,
                    total: items,
                    completed: items,
                    failed_items: Vec::new(),
                    authoritative: true,
                    error: None,
                });
                state.mark_dirty();
                relay_info!("scrape {} finished with {} item(s)", key, items);
                vec![Effect::Notify(AppSignal::SessionActiveChanged { session_id: None })]
            } else {
                Vec::new()
            }
        }
        Msg::ScriptRunFailed { key, error } => {
            if state.scrape.as_ref() != Some(&key) || !state.phase.is_live() {
                Vec::new()
            } else {
                state.phase = Phase::Failed;
                state.script_lock = false;
                state.summary = Some(SessionSummary {
                    kind: SessionKind::Scrape,
                    session_id: None,
                    phase: Phase::Failed,
                    total: 0,
                    completed: 0,
                    failed_items: Vec::new(),
                    authoritative: false,
                    error: Some(error.clone()),
                });
                state.mark_dirty();
                vec![
                    Effect::Toast {
                        message: format!("Script failed: {error}"),
                    },
                    Effect::Notify(AppSignal::SessionActiveChanged { session_id: None }),
                ]
            }
        }
        Msg::NoOp => Vec::new(),
    };

    (state, effects)
}

fn with(mut state: LifecycleState, reason: RejectReason) -> (LifecycleState, Vec<Effect>) {
    let effects = reject(&mut state, reason);
    (state, effects)
}

fn reject(state: &mut LifecycleState, reason: RejectReason) -> Vec<Effect> {
    relay_debug!("request rejected: {}", reason);
    let effects = if reason.is_user_visible() {
        vec![Effect::Toast {
            message: capitalize(&reason.to_string()),
        }]
    } else {
        Vec::new()
    };
    state.rejection = Some(reason);
    effects
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn can_start(state: &LifecycleState, kind: SessionKind) -> Result<(), RejectReason> {
    if state.script_lock && kind == SessionKind::Scrape {
        return Err(RejectReason::ScriptRunLocked);
    }
    if state.has_active_session() {
        return Err(RejectReason::SessionActive);
    }
    if state.reconciling {
        return Err(RejectReason::StillReconciling);
    }
    Ok(())
}

/// A new explicit start acknowledges the finished session it replaces.
///
/// A download session is released as on close, except for URLs the new
/// request downloads again. A finished scrape keeps its store record so it
/// can still be continued into a download.
fn take_over(state: &mut LifecycleState, reused: &[DownloadItem]) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(SessionRelease::Download { session_id, urls }) = download_release(state) {
        let urls = urls
            .into_iter()
            .filter(|url| !reused.iter().any(|item| item.url == *url))
            .collect();
        relay_debug!("releasing {:?} on takeover", session_id);
        effects.push(Effect::StopReconcileTicker);
        effects.push(Effect::Release(SessionRelease::Download { session_id, urls }));
    }
    hand_over(state);
    effects
}

fn download_release(state: &LifecycleState) -> Option<SessionRelease> {
    if state.kind() != Some(SessionKind::Download) {
        return None;
    }
    Some(SessionRelease::Download {
        session_id: state.session_id().map(str::to_string),
        urls: state
            .download
            .as_ref()
            .map(|record| record.items.iter().map(|item| item.url.clone()).collect())
            .unwrap_or_default(),
    })
}

fn hand_over(state: &mut LifecycleState) {
    if state.pointer.is_some() {
        relay_debug!("handing over from a {} session", state.phase);
    }
    state.pointer = None;
    state.summary = None;
    state.download = None;
    state.scrape = None;
    state.pending = None;
    state.cancel_in_flight = false;
}

fn live_download_session(
    state: &LifecycleState,
    action: &'static str,
) -> Result<String, RejectReason> {
    if state.pointer.is_none() || !state.phase.is_live() {
        return Err(RejectReason::NoActiveSession);
    }
    if state.kind() == Some(SessionKind::Scrape) {
        return Err(RejectReason::InvalidTransition {
            action,
            phase: "scraping",
        });
    }
    match state.session_id() {
        Some(id) if state.phase != Phase::Starting => Ok(id.to_string()),
        _ => Err(RejectReason::StillStarting),
    }
}

fn request_command(state: &mut LifecycleState, command: PendingCommand) -> Vec<Effect> {
    let session_id = match live_download_session(state, command.as_str()) {
        Ok(id) => id,
        Err(reason) => return reject(state, reason),
    };
    if let Some((pending, _)) = state.pending {
        return reject(state, RejectReason::CommandInFlight(pending.as_str()));
    }
    let expected = match command {
        PendingCommand::Pause => Phase::Running,
        PendingCommand::Resume => Phase::Paused,
    };
    if state.phase != expected {
        let phase = state.phase.as_str();
        return reject(
            state,
            RejectReason::InvalidTransition {
                action: command.as_str(),
                phase,
            },
        );
    }
    state.requests += 1;
    let request = state.requests;
    state.pending = Some((command, request));
    state.mark_dirty();
    let issue = match command {
        PendingCommand::Pause => Effect::PauseSession {
            session_id: session_id.clone(),
            request,
        },
        PendingCommand::Resume => Effect::ResumeSession {
            session_id: session_id.clone(),
            request,
        },
    };
    vec![
        issue,
        Effect::ArmConfirmTimeout {
            session_id,
            command,
            request,
        },
    ]
}

/// Commit a pause/resume on the backend's event, requested or not.
fn confirm_command(
    state: &mut LifecycleState,
    session_id: &str,
    command: PendingCommand,
) -> Vec<Effect> {
    if !state.is_current(session_id) || !matches!(state.phase, Phase::Running | Phase::Paused) {
        return Vec::new();
    }
    let (phase, status) = match command {
        PendingCommand::Pause => (Phase::Paused, DownloadSessionStatus::Paused),
        PendingCommand::Resume => (Phase::Running, DownloadSessionStatus::Downloading),
    };
    state.phase = phase;
    if let Some(record) = state.download.as_mut() {
        record.status = status;
    }
    if state.pending_command() == Some(command) {
        state.pending = None;
    }
    state.mark_dirty();
    Vec::new()
}

fn on_session_started(state: &mut LifecycleState, session_id: String) -> Vec<Effect> {
    if state.kind() != Some(SessionKind::Download) {
        relay_debug!("session {} started with no download pending", session_id);
        return Vec::new();
    }
    match state.phase {
        Phase::Starting => {}
        Phase::Running | Phase::Paused if state.is_current(&session_id) => return Vec::new(),
        _ => {
            relay_warn!("unexpected start of session {} in {}", session_id, state.phase);
            return Vec::new();
        }
    }
    state.phase = Phase::Running;
    let mut url = String::new();
    if let Some(pointer) = state.pointer.as_mut() {
        pointer.session_id = Some(session_id.clone());
        url = pointer.url.clone();
    }
    if let Some(record) = state.download.as_mut() {
        record.session_id = Some(session_id.clone());
        record.status = DownloadSessionStatus::Downloading;
    }
    state.mark_dirty();
    relay_info!("download session {} running", session_id);
    vec![
        Effect::BindSession {
            url,
            session_id: session_id.clone(),
        },
        Effect::StartReconcileTicker {
            session_id: session_id.clone(),
            destination: state.destination(),
        },
        Effect::Notify(AppSignal::SessionActiveChanged {
            session_id: Some(session_id),
        }),
    ]
}

/// Running/paused into completed or cancelled. The summary is only produced
/// once the reconciliation read lands.
fn enter_terminal(state: &mut LifecycleState, phase: Phase, session_id: String) -> Vec<Effect> {
    state.phase = phase;
    state.pending = None;
    state.reconciling = true;
    if let Some(record) = state.download.as_mut() {
        record.status = match phase {
            Phase::Cancelled => DownloadSessionStatus::Cancelled,
            _ => DownloadSessionStatus::Completed,
        };
    }
    state.mark_dirty();
    relay_info!("download session {} {}", session_id, phase);
    vec![
        Effect::StopReconcileTicker,
        Effect::Reconcile {
            session_id: session_id.clone(),
            destination: state.destination(),
        },
        Effect::Notify(AppSignal::SessionActiveChanged {
            session_id: Some(session_id),
        }),
    ]
}

/// The only transition that clears the pointer.
fn close(state: &mut LifecycleState) -> Vec<Effect> {
    let release = match state.kind() {
        Some(SessionKind::Scrape) => state
            .scrape
            .clone()
            .map(|key| SessionRelease::Scrape { key }),
        Some(SessionKind::Download) => download_release(state),
        None => None,
    };
    hand_over(state);
    state.phase = Phase::Closed;
    state.script_lock = false;
    state.mark_dirty();

    let mut effects = vec![Effect::StopReconcileTicker];
    if let Some(release) = release {
        effects.push(Effect::Release(release));
    }
    effects.push(Effect::Notify(AppSignal::SessionActiveChanged { session_id: None }));
    effects
}
