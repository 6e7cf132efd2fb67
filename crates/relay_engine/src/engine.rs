use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};

use relay_core::{
    update, AppSignal, BackendEvent, DownloadItem, Effect, IngestBuffer, LifecycleState,
    MountPlan, Msg, NavigationTarget, OverviewCard, OverviewCardRegistry, PendingCommand, Phase,
    ProgressBus, ProgressMap, ProgressRecord, ProgressStatus, RejectReason, ScrapeDone,
    ScrapeEvent, ScrapeSessionRecord, ScrapeSessionStore, SessionEvent, SessionEventKind,
    SessionKey, SessionRelease, SessionRow, SessionSummary, StoredCard, SubscriptionId,
    TerminalNotice,
};
use relay_logging::{relay_debug, relay_info, relay_trace, relay_warn};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Backend, BackendError, EngineSettings, ReconcileError, ReconciliationReader};

/// Process-wide owner of the progress bus, the scrape store, the card
/// registry and the session lifecycle.
///
/// Cheap to clone; all clones share state. Every mutation happens under one
/// lock that is never held across an await. Methods that issue backend
/// commands spawn onto the current Tokio runtime; without one the command
/// fails as if the backend were unavailable.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    settings: EngineSettings,
    reader: ReconciliationReader,
    shared: Mutex<Shared>,
    signals: broadcast::Sender<AppSignal>,
}

struct Shared {
    bus: ProgressBus,
    ingest: IngestBuffer,
    flush_scheduled: bool,
    scrapes: ScrapeSessionStore,
    cards: OverviewCardRegistry,
    lifecycle: LifecycleState,
    /// Last scrape run, for events that arrive after a hand-over.
    last_scrape: Option<SessionKey>,
    revision: u64,
    ticker: Option<CancellationToken>,
    changed: mpsc::Receiver<String>,
    finished: mpsc::Receiver<TerminalNotice>,
}

impl Shared {
    /// Run one message through the lifecycle reducer.
    fn step(&mut self, msg: Msg) -> (Vec<Effect>, Option<RejectReason>) {
        let state = std::mem::take(&mut self.lifecycle);
        let (mut state, effects) = update(state, msg);
        let rejection = state.take_rejection();
        if state.consume_dirty() {
            self.revision += 1;
        }
        self.lifecycle = state;
        (effects, rejection)
    }

    /// Bring cards in line with the bus after records changed.
    fn project(&mut self) -> Vec<AppSignal> {
        let changed: BTreeSet<String> = self.changed.try_iter().collect();
        for url in &changed {
            if let Some(record) = self.bus.get_progress(url) {
                self.cards.apply_progress(record);
            }
        }

        let mut signals = Vec::new();
        let notices: Vec<TerminalNotice> = self.finished.try_iter().collect();
        for notice in notices {
            if notice.status != ProgressStatus::Completed {
                continue;
            }
            signals.push(AppSignal::CardCompleted {
                url: notice.url.clone(),
            });
            for card in self.cards.prune_completed(&notice.url) {
                relay_debug!("pruned completed card {}", card.id);
                signals.push(AppSignal::CardRemoved { url: card.url });
            }
        }
        signals
    }

    /// Merge durable rows into the bus. A `settled` read is the final word
    /// on its urls and drops their buffered pushes; a live read only
    /// overrides the buffered fields the rows carry.
    fn merge_rows(&mut self, rows: &[SessionRow], settled: bool) -> Vec<AppSignal> {
        for row in rows {
            let patch = row.to_patch();
            self.bus.update_progress(&row.url, &patch);
            if !settled {
                self.ingest.yield_to(&row.url, &patch);
            }
        }
        if settled {
            self.ingest.discard(rows.iter().map(|row| row.url.as_str()));
        }
        self.project()
    }

    /// The scrape an incoming scrape event belongs to.
    fn scrape_target(&self) -> Option<SessionKey> {
        self.lifecycle
            .scrape_key()
            .or(self.last_scrape.as_ref())
            .cloned()
    }

    fn refresh_scrape_card(&mut self, key: &SessionKey) {
        if let Some(record) = self.scrapes.hydrate(key) {
            self.cards.apply_scrape(key.input_url(), &record);
        }
    }
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn Backend>, settings: EngineSettings) -> Self {
        let (changed_tx, changed) = mpsc::channel();
        let (finished_tx, finished) = mpsc::channel();
        let mut bus = ProgressBus::new();
        bus.add_subscriber(move |url, _, _| {
            let _ = changed_tx.send(url.to_string());
        });
        bus.add_terminal_listener(move |notice| {
            let _ = finished_tx.send(notice.clone());
        });

        let (signals, _) = broadcast::channel(settings.signal_capacity.max(1));
        let shared = Shared {
            bus,
            ingest: IngestBuffer::new(),
            flush_scheduled: false,
            scrapes: ScrapeSessionStore::new(settings.select_all),
            cards: OverviewCardRegistry::new(),
            lifecycle: LifecycleState::new(),
            last_scrape: None,
            revision: 0,
            ticker: None,
            changed,
            finished,
        };
        Self {
            inner: Arc::new(Inner {
                backend,
                reader: ReconciliationReader::new(&settings),
                settings,
                shared: Mutex::new(shared),
                signals,
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Application signals: session-active-changed, scrape-store-updated,
    /// card-completed, card-removed and toast-request.
    pub fn subscribe(&self) -> broadcast::Receiver<AppSignal> {
        self.inner.signals.subscribe()
    }

    // ---- ingestion -------------------------------------------------------

    /// Entry point for named backend events. Unknown or malformed payloads
    /// are logged and dropped.
    pub fn ingest_raw(&self, name: &str, payload: Value) {
        match BackendEvent::parse(name, payload) {
            Ok(event) => self.ingest(event),
            Err(err) => relay_warn!("dropping backend event: {}", err),
        }
    }

    pub fn ingest(&self, event: BackendEvent) {
        relay_trace!("ingest {}", event.name());
        match event {
            BackendEvent::Download(event) => {
                let schedule = {
                    let mut shared = self.lock();
                    shared.ingest.push(&event);
                    let schedule = !shared.flush_scheduled;
                    shared.flush_scheduled = true;
                    schedule
                };
                if schedule {
                    self.schedule_flush();
                }
            }
            BackendEvent::Scrape(ScrapeEvent::Item(item)) => self.on_scrape_item(item),
            BackendEvent::Scrape(ScrapeEvent::Done(done)) => {
                let key = self.lock().scrape_target();
                match key {
                    Some(key) => self.finish_scrape(&key, done),
                    None => relay_warn!("scrape_done with no scrape in progress"),
                }
            }
            BackendEvent::Session(event) => self.on_session_event(event),
        }
    }

    /// Apply every buffered progress update now. A pending timer still
    /// fires at the end of its window.
    pub fn flush(&self) {
        self.flush_buffer(false);
    }

    fn flush_buffer(&self, timer: bool) {
        let signals = {
            let mut shared = self.lock();
            if timer {
                shared.flush_scheduled = false;
            }
            let Shared { ingest, bus, .. } = &mut *shared;
            ingest.flush_into(bus);
            shared.project()
        };
        self.emit_all(signals);
    }

    fn schedule_flush(&self) {
        let engine = self.clone();
        let delay = self.inner.settings.flush_interval;
        let spawned = self.spawn("flush timer", async move {
            tokio::time::sleep(delay).await;
            engine.flush_buffer(true);
        });
        if !spawned {
            self.flush_buffer(true);
        }
    }

    fn on_scrape_item(&self, item: DownloadItem) {
        let (key, effects) = {
            let mut shared = self.lock();
            let Some(key) = shared.scrape_target() else {
                relay_debug!("scrape_item {} with no scrape in progress", item.url);
                return;
            };
            if !shared.scrapes.append_item(&key, item) {
                return;
            }
            shared.refresh_scrape_card(&key);
            let (effects, _) = shared.step(Msg::ScrapeItemSeen);
            (key, effects)
        };
        self.emit(AppSignal::ScrapeStoreUpdated { key });
        self.run_effects(effects);
    }

    fn on_session_event(&self, event: SessionEvent) {
        let SessionEvent {
            kind,
            session_id,
            count,
            destination,
        } = event;
        let msg = match (kind, session_id) {
            (SessionEventKind::Purged, session_id) => Msg::SessionPurged { session_id },
            (SessionEventKind::Started, Some(session_id)) => {
                relay_debug!(
                    "session {} started with {:?} item(s) into {:?}",
                    session_id,
                    count,
                    destination
                );
                Msg::SessionStarted { session_id }
            }
            (SessionEventKind::Paused, Some(session_id)) => Msg::SessionPaused { session_id },
            (SessionEventKind::Resumed, Some(session_id)) => Msg::SessionResumed { session_id },
            (SessionEventKind::Cancelled, Some(session_id)) => {
                Msg::SessionCancelled { session_id }
            }
            (SessionEventKind::Finished, Some(session_id)) => {
                Msg::SessionFinished { session_id }
            }
            (SessionEventKind::Cleanup, Some(session_id)) => {
                relay_debug!("backend cleaned up session {}", session_id);
                Msg::NoOp
            }
            (kind, None) => {
                relay_warn!("session event {:?} without a session id", kind);
                Msg::NoOp
            }
        };
        self.dispatch(msg);
    }

    // ---- scrape sessions -------------------------------------------------

    /// Mount a scrape view for `script_name` over `input_url`.
    ///
    /// Returns [`MountPlan::Resume`] with the existing record when discovery
    /// for this key already started; the scraper is only invoked again
    /// with `force_new`.
    pub fn open_scrape(
        &self,
        script_name: &str,
        input_url: &str,
        mut options: Value,
        force_new: bool,
    ) -> Result<MountPlan, RejectReason> {
        let key = SessionKey::new(script_name, input_url);
        if let Value::Object(map) = &mut options {
            map.entry("inputUrl")
                .or_insert_with(|| Value::String(input_url.to_string()));
        }

        let effects = {
            let mut shared = self.lock();
            if let MountPlan::Resume(record) = shared.scrapes.mount_plan(&key, force_new) {
                relay_debug!("resuming scrape {} with {} item(s)", key, record.item_count());
                return Ok(MountPlan::Resume(record));
            }
            let (effects, rejection) = shared.step(Msg::ScrapeRequested {
                key: key.clone(),
                options,
            });
            if let Some(reason) = rejection {
                drop(shared);
                self.run_effects(effects);
                return Err(reason);
            }
            shared.scrapes.begin_run(&key);
            shared.last_scrape = Some(key.clone());
            shared.cards.upsert(OverviewCard::scrape(
                Uuid::new_v4().to_string(),
                input_url,
                script_name,
            ));
            shared.refresh_scrape_card(&key);
            effects
        };
        self.run_effects(effects);
        Ok(MountPlan::Run)
    }

    /// Merge a final scrape payload, from `scrape_done` or `run_script`.
    fn finish_scrape(&self, key: &SessionKey, done: ScrapeDone) {
        let effects = {
            let mut shared = self.lock();
            shared.scrapes.finalize(key, done.items, done.dir);
            shared.scrapes.persist_snapshot(key);
            shared.refresh_scrape_card(key);
            let items = shared
                .scrapes
                .hydrate(key)
                .map_or(0, |record| record.item_count());
            shared
                .step(Msg::ScrapeFinished {
                    key: key.clone(),
                    items,
                })
                .0
        };
        self.emit(AppSignal::ScrapeStoreUpdated { key: key.clone() });
        self.run_effects(effects);
    }

    fn fail_scrape(&self, key: &SessionKey, error: &BackendError) {
        let effects = {
            let mut shared = self.lock();
            shared.scrapes.mark_failed(key, &error.to_string());
            shared.refresh_scrape_card(key);
            shared
                .step(Msg::ScriptRunFailed {
                    key: key.clone(),
                    error: error.to_string(),
                })
                .0
        };
        self.emit(AppSignal::ScrapeStoreUpdated { key: key.clone() });
        self.run_effects(effects);
    }

    /// Pull items the backend recorded for `key` that never reached us as
    /// events. Returns how many were new.
    pub async fn recover_scrape(&self, key: &SessionKey) -> Result<usize, BackendError> {
        let items = self.inner.backend.read_scrape_session(key).await?;
        let added = {
            let mut shared = self.lock();
            let added = shared.scrapes.merge_recovered(key, items);
            if added > 0 {
                shared.refresh_scrape_card(key);
            }
            added
        };
        if added > 0 {
            relay_info!("recovered {} scrape item(s) for {}", added, key);
            self.emit(AppSignal::ScrapeStoreUpdated { key: key.clone() });
        }
        Ok(added)
    }

    /// Copy the live record to the handoff slot, before a view goes away.
    pub fn persist_scrape_snapshot(&self, key: &SessionKey) -> bool {
        self.lock().scrapes.persist_snapshot(key)
    }

    pub fn scrape(&self, key: &SessionKey) -> Option<ScrapeSessionRecord> {
        self.lock().scrapes.hydrate(key)
    }

    pub fn scrape_handoff(&self, key: &SessionKey) -> Option<ScrapeSessionRecord> {
        self.lock().scrapes.handoff(key)
    }

    pub fn toggle_selected(&self, key: &SessionKey, url: &str) -> bool {
        let selected = self.lock().scrapes.toggle_selected(key, url);
        self.emit(AppSignal::ScrapeStoreUpdated { key: key.clone() });
        selected
    }

    pub fn select_all(&self, key: &SessionKey) {
        self.lock().scrapes.select_all_items(key);
        self.emit(AppSignal::ScrapeStoreUpdated { key: key.clone() });
    }

    pub fn clear_selection(&self, key: &SessionKey) {
        self.lock().scrapes.clear_selection(key);
        self.emit(AppSignal::ScrapeStoreUpdated { key: key.clone() });
    }

    pub fn selected_items(&self, key: &SessionKey) -> Vec<DownloadItem> {
        self.lock().scrapes.selected_items(key)
    }

    // ---- download sessions -----------------------------------------------

    pub fn start_download(
        &self,
        items: Vec<DownloadItem>,
        destination: &str,
    ) -> Result<(), RejectReason> {
        let cards: Vec<OverviewCard> = items
            .iter()
            .map(|item| {
                let mut card =
                    OverviewCard::download(Uuid::new_v4().to_string(), &item.url, destination);
                card.filename = item.display_filename();
                card
            })
            .collect();
        self.transition(
            Msg::DownloadRequested {
                items,
                destination: destination.to_string(),
            },
            move |shared| {
                for card in cards {
                    shared.cards.upsert(card);
                }
            },
        )
    }

    /// Continue from a scrape into a download of its selected items.
    pub fn start_download_from_selection(
        &self,
        key: &SessionKey,
        destination: &str,
    ) -> Result<(), RejectReason> {
        let items = self.selected_items(key);
        self.start_download(items, destination)
    }

    pub fn pause(&self) -> Result<(), RejectReason> {
        self.transition(Msg::PauseRequested, |_| {})
    }

    pub fn resume(&self) -> Result<(), RejectReason> {
        self.transition(Msg::ResumeRequested, |_| {})
    }

    /// The session only counts as cancelled once the backend confirms.
    pub fn cancel(&self) -> Result<(), RejectReason> {
        self.transition(Msg::CancelRequested, |_| {})
    }

    /// Acknowledge the summary of a finished session and release it.
    pub fn close_summary(&self) -> Result<(), RejectReason> {
        self.transition(Msg::SummaryClosed, |_| {})
    }

    /// Read the durable record for a session and merge it into the bus.
    /// Returns the merged records of the rows read.
    pub async fn reconcile(
        &self,
        session_id: &str,
        destination: &str,
    ) -> Result<ProgressMap, ReconcileError> {
        self.flush();
        let rows = self
            .inner
            .reader
            .read_rows(self.inner.backend.as_ref(), session_id, destination)
            .await?;
        let (records, signals) = {
            let mut shared = self.lock();
            let signals = shared.merge_rows(&rows, false);
            let records = rows
                .iter()
                .filter_map(|row| {
                    shared
                        .bus
                        .get_progress(&row.url)
                        .map(|record| (row.url.clone(), record.clone()))
                })
                .collect();
            (records, signals)
        };
        self.emit_all(signals);
        Ok(records)
    }

    // ---- queries ---------------------------------------------------------

    pub fn progress(&self, url: &str) -> Option<ProgressRecord> {
        self.lock().bus.get_progress(url).cloned()
    }

    pub fn all_progress(&self) -> ProgressMap {
        self.lock().bus.get_all_progress()
    }

    /// Subscribe to merged progress changes. Runs under the engine lock:
    /// the callback must not call back into the engine.
    pub fn add_progress_subscriber<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: FnMut(&str, &ProgressRecord, &ProgressMap) + Send + 'static,
    {
        self.lock().bus.add_subscriber(subscriber)
    }

    pub fn remove_progress_subscriber(&self, id: SubscriptionId) -> bool {
        self.lock().bus.remove_subscriber(id)
    }

    pub fn cards(&self) -> Vec<OverviewCard> {
        self.lock().cards.cards().to_vec()
    }

    pub fn stored_cards(&self) -> Vec<StoredCard> {
        self.lock().cards.to_stored()
    }

    /// Replace the registry with persisted cards. Returns the number kept.
    pub fn load_cards(&self, stored: Vec<StoredCard>) -> usize {
        let registry = OverviewCardRegistry::load(stored);
        let count = registry.len();
        self.lock().cards = registry;
        count
    }

    /// Snapshot of the lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        self.lock().lifecycle.clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().lifecycle.phase()
    }

    pub fn has_active_session(&self) -> bool {
        self.lock().lifecycle.has_active_session()
    }

    pub fn resume_target(&self) -> Option<NavigationTarget> {
        self.lock().lifecycle.resume_target()
    }

    pub fn summary(&self) -> Option<SessionSummary> {
        self.lock().lifecycle.summary().cloned()
    }

    /// Bumped on every lifecycle change a view would render.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Stop background work.
    pub fn shutdown(&self) {
        if let Some(token) = self.lock().ticker.take() {
            token.cancel();
        }
    }

    // ---- lifecycle plumbing ----------------------------------------------

    fn dispatch(&self, msg: Msg) {
        let effects = self.lock().step(msg).0;
        self.run_effects(effects);
    }

    /// Dispatch a user request; `accepted` runs under the same lock when the
    /// reducer took it.
    fn transition<F>(&self, msg: Msg, accepted: F) -> Result<(), RejectReason>
    where
        F: FnOnce(&mut Shared),
    {
        let (effects, rejection) = {
            let mut shared = self.lock();
            let (effects, rejection) = shared.step(msg);
            if rejection.is_none() {
                accepted(&mut *shared);
            }
            (effects, rejection)
        };
        self.run_effects(effects);
        match rejection {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(&self, effect: Effect) {
        match effect {
            Effect::RunScript { key, options } => {
                let engine = self.clone();
                let task_key = key.clone();
                let spawned = self.spawn("run_script", async move {
                    let key = task_key;
                    let result = engine
                        .inner
                        .backend
                        .run_script(key.script_name(), &options)
                        .await;
                    match result {
                        Ok(done) => engine.finish_scrape(&key, done),
                        Err(err) => {
                            relay_warn!("run_script for {} failed: {}", key, err);
                            engine.fail_scrape(&key, &err);
                        }
                    }
                });
                if !spawned {
                    self.fail_scrape(&key, &BackendError::Unavailable);
                }
            }
            Effect::StartDownloadSession { items, destination } => {
                let engine = self.clone();
                let spawned = self.spawn("start_download_session", async move {
                    let result = engine
                        .inner
                        .backend
                        .start_download_session(&items, &destination)
                        .await;
                    engine.dispatch(match result {
                        Ok(session_id) => Msg::SessionStarted { session_id },
                        Err(err) => Msg::StartFailed {
                            error: err.to_string(),
                        },
                    });
                });
                if !spawned {
                    self.dispatch(Msg::StartFailed {
                        error: BackendError::Unavailable.to_string(),
                    });
                }
            }
            Effect::PauseSession {
                session_id,
                request,
            } => {
                self.spawn_command(PendingCommand::Pause, request, session_id);
            }
            Effect::ResumeSession {
                session_id,
                request,
            } => {
                self.spawn_command(PendingCommand::Resume, request, session_id);
            }
            Effect::ArmConfirmTimeout {
                session_id,
                command,
                request,
            } => {
                let engine = self.clone();
                let wait = self.inner.settings.pause_timeout;
                // Without a runtime the command itself already failed.
                self.spawn("confirm timeout", async move {
                    tokio::time::sleep(wait).await;
                    engine.dispatch(Msg::ConfirmTimedOut {
                        session_id,
                        command,
                        request,
                    });
                });
            }
            Effect::CancelSession { session_id } => {
                let engine = self.clone();
                let spawned = self.spawn("cancel", async move {
                    let msg = engine.cancel_with_fallback(session_id).await;
                    engine.dispatch(msg);
                });
                if !spawned {
                    self.dispatch(Msg::CancelFailed {
                        error: BackendError::Unavailable.to_string(),
                    });
                }
            }
            Effect::BindSession { url, session_id } => {
                let mut shared = self.lock();
                let urls: Vec<String> = match shared.lifecycle.download() {
                    Some(record) => record.items.iter().map(|item| item.url.clone()).collect(),
                    None => vec![url],
                };
                for url in urls {
                    shared.cards.bind_session(&url, &session_id);
                }
            }
            Effect::Reconcile {
                session_id,
                destination,
            } => {
                let engine = self.clone();
                let task_session = session_id.clone();
                let spawned = self.spawn("reconcile", async move {
                    engine.reconcile_terminal(task_session, destination).await;
                });
                if !spawned {
                    self.dispatch(Msg::ReconcileFailed {
                        session_id,
                        error: BackendError::Unavailable.to_string(),
                    });
                }
            }
            Effect::StartReconcileTicker {
                session_id,
                destination,
            } => self.start_ticker(session_id, destination),
            Effect::StopReconcileTicker => {
                if let Some(token) = self.lock().ticker.take() {
                    relay_debug!("reconcile ticker stopped");
                    token.cancel();
                }
            }
            Effect::Release(release) => self.release(release),
            Effect::Toast { message } => {
                relay_info!("toast: {}", message);
                self.emit(AppSignal::ToastRequest { message });
            }
            Effect::Notify(signal) => self.emit(signal),
        }
    }

    fn spawn_command(&self, command: PendingCommand, request: u64, session_id: String) {
        let engine = self.clone();
        let spawned = self.spawn(command.as_str(), async move {
            let backend = engine.inner.backend.as_ref();
            let result = match command {
                PendingCommand::Pause => backend.pause_download_session(&session_id).await,
                PendingCommand::Resume => backend.resume_download_session(&session_id).await,
            };
            if let Err(err) = result {
                relay_warn!("{} of {} failed: {}", command.as_str(), session_id, err);
                engine.dispatch(Msg::CommandFailed {
                    command,
                    request,
                    error: err.to_string(),
                });
            }
        });
        if !spawned {
            self.dispatch(Msg::CommandFailed {
                command,
                request,
                error: BackendError::Unavailable.to_string(),
            });
        }
    }

    /// Forceful cancel first, the softer one if that fails.
    async fn cancel_with_fallback(&self, session_id: String) -> Msg {
        let backend = self.inner.backend.as_ref();
        match backend.force_cancel_download_session(&session_id).await {
            Ok(()) => return Msg::CancelAcknowledged { session_id },
            Err(err) => relay_warn!("force cancel of {} failed: {}", session_id, err),
        }
        match backend.cancel_download_session(&session_id).await {
            Ok(()) => Msg::CancelAcknowledged { session_id },
            Err(err) => {
                relay_warn!("cancel of {} failed: {}", session_id, err);
                Msg::CancelFailed {
                    error: err.to_string(),
                }
            }
        }
    }

    async fn reconcile_terminal(&self, session_id: String, destination: String) {
        self.flush();
        let result = self
            .inner
            .reader
            .read(self.inner.backend.as_ref(), &session_id, &destination)
            .await;
        match result {
            Ok(report) => {
                let signals = self.lock().merge_rows(&report.rows, true);
                self.emit_all(signals);
                self.dispatch(Msg::Reconciled { session_id, report });
            }
            Err(err) => {
                relay_warn!("{}", err);
                self.dispatch(Msg::ReconcileFailed {
                    session_id,
                    error: err.to_string(),
                });
            }
        }
    }

    fn start_ticker(&self, session_id: String, destination: String) {
        let token = CancellationToken::new();
        if let Some(previous) = self.lock().ticker.replace(token.clone()) {
            previous.cancel();
        }
        let engine = self.clone();
        let period = self.inner.settings.reconcile_interval;
        let ticker = token.clone();
        let spawned = self.spawn("reconcile ticker", async move {
            let token = ticker;
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; the session just started.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let read = engine
                            .inner
                            .backend
                            .read_download_session(&session_id, &destination)
                            .await;
                        if token.is_cancelled() {
                            break;
                        }
                        match read {
                            Ok(rows) => {
                                let signals = engine.lock().merge_rows(&rows, false);
                                engine.emit_all(signals);
                            }
                            Err(err) => relay_debug!("tick read of {} failed: {}", session_id, err),
                        }
                    }
                }
            }
            relay_trace!("reconcile ticker for {} exited", session_id);
        });
        if !spawned {
            token.cancel();
        }
    }

    /// Run `task` on the current Tokio runtime. Outside one the task is
    /// dropped and `false` returned.
    fn spawn<F>(&self, what: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
                true
            }
            Err(err) => {
                relay_warn!("cannot run {} without an async runtime: {}", what, err);
                false
            }
        }
    }

    /// Destroy everything held for a closed session.
    fn release(&self, release: SessionRelease) {
        let signals = {
            let mut shared = self.lock();
            match release {
                SessionRelease::Download { session_id, urls } => {
                    let removed = shared.cards.remove(|card| {
                        !card.is_scrape
                            && (urls.contains(&card.url)
                                || (session_id.is_some() && card.session_id == session_id))
                    });
                    let mut forget: BTreeSet<String> = urls.into_iter().collect();
                    forget.extend(removed.iter().map(|card| card.url.clone()));
                    shared.ingest.discard(forget.iter().map(String::as_str));
                    let forgotten = shared.bus.forget(forget.iter().map(String::as_str));
                    relay_info!(
                        "released session {:?}: {} record(s), {} card(s)",
                        session_id,
                        forgotten,
                        removed.len()
                    );
                    removed
                        .into_iter()
                        .map(|card| AppSignal::CardRemoved { url: card.url })
                        .collect::<Vec<_>>()
                }
                SessionRelease::Scrape { key } => {
                    shared.scrapes.remove(&key);
                    if shared.last_scrape.as_ref() == Some(&key) {
                        shared.last_scrape = None;
                    }
                    let input_url = key.input_url().to_string();
                    let removed = shared
                        .cards
                        .remove(|card| card.is_scrape && card.url == input_url);
                    relay_info!("released scrape {}", key);
                    let mut signals: Vec<AppSignal> = removed
                        .into_iter()
                        .map(|card| AppSignal::CardRemoved { url: card.url })
                        .collect();
                    signals.push(AppSignal::ScrapeStoreUpdated { key });
                    signals
                }
            }
        };
        self.emit_all(signals);
    }

    fn emit(&self, signal: AppSignal) {
        relay_trace!("signal {}", signal.name());
        // No receivers is fine.
        let _ = self.inner.signals.send(signal);
    }

    fn emit_all(&self, signals: Vec<AppSignal>) {
        for signal in signals {
            self.emit(signal);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
