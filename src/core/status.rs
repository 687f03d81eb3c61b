//! Asynchronous provisioning status
//!
//! Each (context, definition) pair moves through
//!
//! ```text
//! NotStarted ──► Progress ──► Progress ──► … ──► Done | Error
//! ```
//!
//! `Done` and `Error` are terminal. Reaching `Done` also places the instance in
//! the context's service map, so plain [`Context::inject`] succeeds from then
//! on. Every transition is published as a [`StatusUpdateEvent`] travelling
//! [`Direction::Down`] from the owning context.

use crate::core::context::Context;
use crate::core::definition::{Definition, DefinitionId, Service};
use crate::core::event::{Direction, Event, EventBusListener};
use crate::error::{Result, ScopeError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub type SharedError = Arc<anyhow::Error>;

pub enum StatusInfo<T: ?Sized> {
    NotStarted,
    Progress {
        message: String,
        progress: Option<f64>,
    },
    Done {
        instance: Arc<T>,
    },
    Error {
        error: SharedError,
    },
}

impl<T: ?Sized> StatusInfo<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusInfo::Done { .. } | StatusInfo::Error { .. })
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            StatusInfo::NotStarted => "notStarted",
            StatusInfo::Progress { .. } => "progress",
            StatusInfo::Done { .. } => "done",
            StatusInfo::Error { .. } => "error",
        }
    }

    /// Settles a terminal status into the value `when_finished` yields.
    fn into_outcome(self) -> Option<std::result::Result<Arc<T>, SharedError>> {
        match self {
            StatusInfo::Done { instance } => Some(Ok(instance)),
            StatusInfo::Error { error } => Some(Err(error)),
            _ => None,
        }
    }
}

impl<T: ?Sized> Clone for StatusInfo<T> {
    fn clone(&self) -> Self {
        match self {
            StatusInfo::NotStarted => StatusInfo::NotStarted,
            StatusInfo::Progress { message, progress } => StatusInfo::Progress {
                message: message.clone(),
                progress: *progress,
            },
            StatusInfo::Done { instance } => StatusInfo::Done {
                instance: Arc::clone(instance),
            },
            StatusInfo::Error { error } => StatusInfo::Error {
                error: Arc::clone(error),
            },
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for StatusInfo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusInfo::Progress { message, progress } => f
                .debug_struct("Progress")
                .field("message", message)
                .field("progress", progress)
                .finish(),
            StatusInfo::Error { error } => f.debug_struct("Error").field("error", error).finish(),
            other => f.write_str(other.as_label()),
        }
    }
}

/// Status transition of one definition.
///
/// All definitions share this Rust type; listeners are keyed by
/// [`DefinitionId`] through [`Event::event_key`].
pub struct StatusUpdateEvent<T: ?Sized> {
    pub definition: DefinitionId,
    pub status: StatusInfo<T>,
}

impl<T: ?Sized + Service> Event for StatusUpdateEvent<T> {
    fn event_key(&self) -> Option<u64> {
        Some(self.definition.as_u64())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Snapshot of a definition's status as seen from one context.
pub struct ServiceStatus<T: ?Sized> {
    context: Context,
    definition: DefinitionId,
    info: StatusInfo<T>,
}

impl<T: ?Sized + Service> ServiceStatus<T> {
    pub fn info(&self) -> &StatusInfo<T> {
        &self.info
    }

    pub fn as_label(&self) -> &'static str {
        self.info.as_label()
    }

    /// Observes future transitions of this definition.
    pub fn listen(&self) -> EventBusListener<StatusUpdateEvent<T>> {
        self.context
            .event_bus()
            .keyed_listener(self.context.info().clone(), self.definition.as_u64())
    }

    /// Resolves with the instance once the definition is done, or fails with
    /// the provisioning error.
    ///
    /// Subscribes before re-reading the current status, so a transition that
    /// lands in between is still observed. Fails with
    /// [`ScopeError::ContextDisposed`] if this context, the context holding
    /// the status, or the tree's bus is disposed first.
    pub async fn when_finished(&self) -> std::result::Result<Arc<T>, SharedError> {
        let owner = self
            .context
            .status_owner(self.definition)
            .unwrap_or_else(|| self.context.clone());
        let mut signals = vec![self.context.event_bus().closed(), self.context.closed()];
        if owner != self.context {
            signals.push(owner.closed());
        }
        let torn_down = futures::future::select_all(signals.into_iter().map(|signal| wait_closed(signal).boxed()));

        let listener = self.listen();
        let (tx, rx) = oneshot::channel::<StatusInfo<T>>();
        let tx = Mutex::new(Some(tx));
        listener.on_event.add(None, move |event| {
            if event.status.is_terminal() {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(event.status.clone());
                }
            }
        });

        if let Some(outcome) = self.context.status_of::<T>(self.definition).into_outcome() {
            return outcome;
        }

        let disposed = || -> std::result::Result<Arc<T>, SharedError> {
            Err(Arc::new(anyhow::Error::from(ScopeError::ContextDisposed(owner.id()))))
        };
        tokio::select! {
            received = rx => match received {
                Ok(status) => status
                    .into_outcome()
                    .unwrap_or_else(|| Err(Arc::new(ScopeError::Other("status not terminal".to_string()).into()))),
                Err(_) => disposed(),
            },
            _ = torn_down => disposed(),
        }
    }
}

async fn wait_closed(mut signal: watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}

impl Context {
    pub fn get_status<T>(&self, definition: &Definition<T>) -> ServiceStatus<T>
    where
        T: ?Sized + Service,
    {
        ServiceStatus {
            context: self.clone(),
            definition: definition.id(),
            info: self.status_of(definition.id()),
        }
    }

    /// Local status record, else the nearest ancestor's, else `NotStarted`.
    pub(crate) fn status_of<T>(&self, id: DefinitionId) -> StatusInfo<T>
    where
        T: ?Sized + Service,
    {
        let mut current = Some(self);
        while let Some(context) = current {
            let record = context
                .statuses()
                .read()
                .get(&id)
                .and_then(|record| record.downcast_ref::<StatusInfo<T>>())
                .cloned();
            if let Some(record) = record {
                return record;
            }
            current = context.parent();
        }
        StatusInfo::NotStarted
    }

    /// Nearest context, starting at `self`, holding a status record for `id`.
    fn status_owner(&self, id: DefinitionId) -> Option<Context> {
        let mut current = Some(self);
        while let Some(context) = current {
            if context.statuses().read().contains_key(&id) {
                return Some(context.clone());
            }
            current = context.parent();
        }
        None
    }

    pub fn set_status<T>(&self, definition: &Definition<T>, status: StatusInfo<T>) -> Result<()>
    where
        T: ?Sized + Service,
    {
        self.update_status(definition.id(), definition.name(), status)
    }

    fn update_status<T>(&self, id: DefinitionId, name: &'static str, status: StatusInfo<T>) -> Result<()>
    where
        T: ?Sized + Service,
    {
        if self.is_disposed() {
            return Err(ScopeError::ContextDisposed(self.id()));
        }

        let status = {
            let mut statuses = self.statuses().write();
            let finished = statuses
                .get(&id)
                .and_then(|record| record.downcast_ref::<StatusInfo<T>>())
                .is_some_and(StatusInfo::is_terminal);
            if finished {
                warn!(
                    context = self.id(),
                    service = name,
                    status = status.as_label(),
                    "Ignoring status update after terminal status"
                );
                return Ok(());
            }
            if let StatusInfo::NotStarted = status {
                warn!(context = self.id(), service = name, "Ignoring reset to notStarted");
                return Ok(());
            }

            let status = match status {
                StatusInfo::Done { instance } => {
                    match self.insert_instance(id, name, Arc::clone(&instance)) {
                        Ok(()) => StatusInfo::Done { instance },
                        Err(e) => {
                            warn!(context = self.id(), service = name, error = %e, "Async provide collided");
                            StatusInfo::Error {
                                error: Arc::new(e.into()),
                            }
                        }
                    }
                }
                other => other,
            };
            statuses.insert(id, Box::new(status.clone()));
            status
        };

        debug!(
            context = self.id(),
            service = name,
            status = status.as_label(),
            "Status updated"
        );
        self.emit(StatusUpdateEvent { definition: id, status }, Direction::Down);
        Ok(())
    }

    /// Starts `factory` on the tokio runtime and tracks its progress under
    /// `definition`.
    pub fn provide_async<T>(
        &self,
        definition: &Definition<T>,
        factory: AsyncServiceFactory<T>,
    ) -> Result<JoinHandle<()>>
    where
        T: ?Sized + Service,
    {
        crate::runtime_check()?;
        if self.is_disposed() {
            return Err(ScopeError::ContextDisposed(self.id()));
        }
        if self.has_local(definition) || self.statuses().read().contains_key(&definition.id()) {
            return Err(ScopeError::DuplicateService(definition.name().to_string()));
        }

        let reporter = StatusReporter {
            context: self.clone(),
            definition: definition.id(),
            name: definition.name(),
            _service: PhantomData,
        };
        let future = factory.run(self.clone(), reporter.clone());

        Ok(tokio::spawn(async move {
            match future.await {
                Ok(instance) => reporter.done(instance),
                Err(e) => {
                    error!(service = reporter.name, error = %e, "Async service factory failed");
                    reporter.error(e);
                }
            }
        }))
    }
}

type FactoryFn<T> =
    Box<dyn FnOnce(Context, StatusReporter<T>) -> BoxFuture<'static, anyhow::Result<Arc<T>>> + Send>;

/// Asynchronous constructor for a service.
///
/// The callback receives its owning context explicitly; code that needs
/// [`Context::current`] after an `.await` must re-enter it with
/// [`Context::instantiate`].
pub struct AsyncServiceFactory<T: ?Sized> {
    callback: FactoryFn<T>,
}

impl<T: ?Sized + Service> AsyncServiceFactory<T> {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: FnOnce(Context, StatusReporter<T>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |context, reporter| callback(context, reporter).boxed()),
        }
    }

    fn run(self, context: Context, reporter: StatusReporter<T>) -> BoxFuture<'static, anyhow::Result<Arc<T>>> {
        (self.callback)(context, reporter)
    }
}

/// Handle an async factory uses to publish its progress.
pub struct StatusReporter<T: ?Sized> {
    context: Context,
    definition: DefinitionId,
    name: &'static str,
    _service: PhantomData<fn() -> Arc<T>>,
}

impl<T: ?Sized> Clone for StatusReporter<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            definition: self.definition,
            name: self.name,
            _service: PhantomData,
        }
    }
}

impl<T: ?Sized + Service> StatusReporter<T> {
    pub fn progress(&self, message: impl Into<String>, progress: Option<f64>) {
        self.report(StatusInfo::Progress {
            message: message.into(),
            progress,
        });
    }

    pub fn done(&self, instance: Arc<T>) {
        self.report(StatusInfo::Done { instance });
    }

    pub fn error(&self, error: anyhow::Error) {
        self.report(StatusInfo::Error {
            error: Arc::new(error),
        });
    }

    fn report(&self, status: StatusInfo<T>) {
        if let Err(e) = self.context.update_status(self.definition, self.name, status) {
            debug!(service = self.name, error = %e, "Dropped status report");
        }
    }
}
