//! Save pipelines
//!
//! A save pass collects the state of every registered component (in name
//! order) into one externalization session, saves the settings-saving
//! auxiliaries, then executes the per-storage save sessions. Writes that hit
//! read-only files are handed back to the caller instead of failing the pass.
//!
//! The async variant captures widget state on a UI-owning executor, waits
//! for every capture, and runs storage writes on blocking worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{ComponentStore, RegisteredComponent};
use crate::error::{Result, StoreError};
use crate::storage::manager::ExternalizationSession;
use crate::storage::{ReadOnlyTarget, SaveSession};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identifies one save call chain. Saving again with a token whose save is
/// still running is rejected.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SaveToken(u64);

impl SaveToken {
    pub fn new() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SaveToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters an active save token on drop
struct ActiveSave<'a> {
    store: &'a ComponentStore,
    token: u64,
}

impl Drop for ActiveSave<'_> {
    fn drop(&mut self) {
        self.store.active_saves.lock().remove(&self.token);
    }
}

/// Runs tasks on the context that owns interactive widgets.
pub trait UiExecutor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// Runs UI tasks immediately on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineUiExecutor;

impl UiExecutor for InlineUiExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        task();
    }
}

type UiTask = Box<dyn FnOnce() + Send + 'static>;

/// Sends UI tasks to the thread draining the paired [`UiTaskReceiver`]
#[derive(Clone)]
pub struct ChannelUiExecutor {
    sender: mpsc::Sender<UiTask>,
}

/// UI-thread end of a [`ChannelUiExecutor`]
pub struct UiTaskReceiver {
    receiver: mpsc::Receiver<UiTask>,
}

impl ChannelUiExecutor {
    pub fn new() -> (Self, UiTaskReceiver) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, UiTaskReceiver { receiver })
    }
}

impl UiExecutor for ChannelUiExecutor {
    fn execute(&self, task: UiTask) {
        // A closed UI loop drops the task; the waiting save sees it as cancelled
        if self.sender.send(task).is_err() {
            warn!("UI loop closed, dropping UI task");
        }
    }
}

impl UiTaskReceiver {
    /// Run queued tasks without blocking, returning how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Run tasks until every executor is dropped.
    pub fn run(self) {
        while let Ok(task) = self.receiver.recv() {
            task();
        }
    }
}

/// Component state collected for one pass
struct Collected {
    record: Arc<RegisteredComponent>,
    count: u64,
    state: Result<Option<serde_json::Value>>,
}

impl ComponentStore {
    fn enter_save(&self, token: &SaveToken) -> Result<ActiveSave<'_>> {
        if !self.active_saves.lock().insert(token.0) {
            error!(token = token.0, "Re-entrant save rejected");
            return Err(StoreError::ReentrantSave);
        }
        Ok(ActiveSave {
            store: self,
            token: token.0,
        })
    }

    /// Registered components in name order
    fn sorted_components(&self) -> Vec<Arc<RegisteredComponent>> {
        self.components.read().values().cloned().collect()
    }

    fn needs_save(&self, record: &RegisteredComponent, force: bool) -> bool {
        if force || !record.capabilities.modification_tracked {
            return true;
        }
        let current = record.component.modification_count();
        self.watermark(&record.name) != Some(current)
    }

    fn component_failure(&self, record: &RegisteredComponent, error: StoreError) -> StoreError {
        error!(component = %record.name, error = %error, "Cannot get component state");
        StoreError::ComponentState {
            component: record.name.clone(),
            plugin: record.spec.plugin.clone(),
            message: error.to_string(),
        }
    }

    /// Push collected states into the session; watermarks move only on success.
    fn submit(
        &self,
        session: &mut ExternalizationSession<'_>,
        collected: Vec<Collected>,
        errors: &mut Vec<StoreError>,
    ) {
        for Collected {
            record,
            count,
            state,
        } in collected
        {
            let tree = match state {
                Ok(Some(tree)) => tree,
                Ok(None) => continue,
                Err(e) => {
                    errors.push(self.component_failure(&record, e));
                    continue;
                }
            };
            match session.set_state(&record.sorted_storages, &record.name, tree) {
                Ok(()) => {
                    if record.capabilities.modification_tracked {
                        self.watermarks.write().insert(record.name.clone(), count);
                    }
                }
                Err(e) => {
                    error!(component = %record.name, error = %e, "Cannot externalize component state");
                    errors.push(e);
                }
            }
        }
    }

    fn save_settings_components(&self, token: &SaveToken) {
        let components = self.settings_saving.read().clone();
        for component in components {
            if let Err(e) = component.save(token) {
                error!(component = %component.name(), error = %e, "Settings-saving component failed");
            }
        }
    }

    fn execute_session(
        session: Arc<dyn SaveSession>,
        result: Result<()>,
        readonly_files: &mut Vec<ReadOnlyTarget>,
        errors: &mut Vec<StoreError>,
    ) {
        match result {
            Ok(()) => {}
            Err(StoreError::ReadOnlyModification { file }) => {
                warn!(file = %file, "Save diverted, file is read-only");
                readonly_files.push(ReadOnlyTarget { session, file });
            }
            Err(e) => {
                error!(file = %session.file_spec(), error = %e, "Storage save failed");
                errors.push(e);
            }
        }
    }

    fn finish_save(&self, errors: Vec<StoreError>) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let error = StoreError::SaveFailed(errors);
        error!(error = %error, "Save failed");
        self.listener.save_failed(&error);
        self.report_plugin_fault(&error);
        Err(error)
    }

    /// Synchronous full save pass.
    ///
    /// Read-only targets are appended to `readonly_files`; every other
    /// failure is reported once, after all storages were attempted.
    pub fn save(
        &self,
        token: &SaveToken,
        force: bool,
        readonly_files: &mut Vec<ReadOnlyTarget>,
    ) -> Result<()> {
        let _active = self.enter_save(token)?;
        let mut errors = Vec::new();

        let components = self.sorted_components();
        let session = if components.is_empty() {
            None
        } else {
            self.manager.start_externalization()
        };

        let Some(mut session) = session else {
            self.save_settings_components(token);
            return self.finish_save(errors);
        };

        let collected: Vec<Collected> = components
            .into_iter()
            .filter(|record| self.needs_save(record, force))
            .map(|record| {
                let count = record.component.modification_count();
                let state = record.component.state_tree(&record.name);
                Collected {
                    record,
                    count,
                    state,
                }
            })
            .collect();
        debug!(components = collected.len(), force = force, "Collected component states");
        self.submit(&mut session, collected, &mut errors);
        self.save_settings_components(token);

        let sessions = session.create_save_sessions(force);
        info!(storages = sessions.len(), "Saving storages");
        for session in sessions {
            let result = session.save();
            Self::execute_session(session, result, readonly_files, &mut errors);
        }
        self.finish_save(errors)
    }

    /// Asynchronous full save pass.
    ///
    /// Widget state is captured through `ui`; storage writes run on blocking
    /// worker threads of the current tokio runtime. Completes after every
    /// storage write finished or was diverted as read-only.
    pub async fn save_async(
        &self,
        token: &SaveToken,
        force: bool,
        ui: &dyn UiExecutor,
        readonly_files: &mut Vec<ReadOnlyTarget>,
    ) -> Result<()> {
        let _active = self.enter_save(token)?;
        let mut errors = Vec::new();

        let components = self.sorted_components();
        let session = if components.is_empty() {
            None
        } else {
            self.manager.start_externalization()
        };
        let Some(mut session) = session else {
            self.save_settings_components(token);
            return self.finish_save(errors);
        };

        // Dispatch every UI capture before awaiting any of them
        let mut pending = Vec::new();
        for record in components {
            if !self.needs_save(&record, force) {
                continue;
            }
            let count = record.component.modification_count();
            if record.capabilities.ui_bridged {
                let (tx, rx) = oneshot::channel();
                let component = record.component.clone();
                ui.execute(Box::new(move || {
                    let _ = tx.send(component.capture_ui_state());
                }));
                pending.push((record, count, Some(rx)));
            } else {
                pending.push((record, count, None));
            }
        }

        let mut collected = Vec::with_capacity(pending.len());
        for (record, count, rx) in pending {
            let state = match rx {
                Some(rx) => match rx.await {
                    Ok(Some(ui_state)) => record.component.state_tree_from_ui(&record.name, ui_state),
                    Ok(None) => record.component.state_tree(&record.name),
                    Err(_) => {
                        info!(component = %record.name, "Save cancelled while capturing UI state");
                        return Err(StoreError::SaveCancelled);
                    }
                },
                None => record.component.state_tree(&record.name),
            };
            collected.push(Collected {
                record,
                count,
                state,
            });
        }

        self.submit(&mut session, collected, &mut errors);
        self.save_settings_components(token);
        let sessions = session.create_save_sessions(force);
        info!(storages = sessions.len(), "Saving storages");

        let mut writes = JoinSet::new();
        for session in sessions {
            writes.spawn_blocking(move || {
                let result = session.save();
                (session, result)
            });
        }
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((session, result)) => {
                    Self::execute_session(session, result, readonly_files, &mut errors);
                }
                Err(e) if e.is_cancelled() => return Err(StoreError::SaveCancelled),
                Err(e) => std::panic::resume_unwind(e.into_panic()),
            }
        }
        self.finish_save(errors)
    }
}
