//! Scoped recording of a session's operations.

use super::{OperationLog, OperationLogType};
use crate::events::{Channel, EventFilter, EventKind, SessionEvent, SubscriptionId};
use crate::session::Session;
use crate::storage::StorageDriver;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Entry point for operation capture.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationCapturer;

impl OperationCapturer {
    /// Records operations of `session` into `log` until the scope ends,
    /// keeping only outermost operations.
    pub fn attach<D: StorageDriver>(session: &mut Session<D>, log: Arc<Mutex<OperationLog>>) -> CaptureScope<'_, D> {
        Self::attach_with(session, log, OperationLogType::default())
    }

    /// Like [`attach`](Self::attach) with an explicit recording policy.
    pub fn attach_with<D: StorageDriver>(
        session: &mut Session<D>,
        log: Arc<Mutex<OperationLog>>,
        log_type: OperationLogType,
    ) -> CaptureScope<'_, D> {
        let sink = Arc::clone(&log);
        let registering = session.subscribe(
            Channel::System,
            EventFilter::kind(EventKind::OperationRegistering),
            move |event| {
                if let SessionEvent::OperationRegistering {
                    operation,
                    depth,
                    composite,
                } = event
                {
                    if log_type.records(*depth, *composite) {
                        sink.lock().push(operation.clone());
                    }
                }
            },
        );
        let sink = Arc::clone(&log);
        let remapped = session.subscribe(
            Channel::System,
            EventFilter::kind(EventKind::KeysRemapped),
            move |event| {
                if let SessionEvent::KeysRemapped { mapping } = event {
                    sink.lock().remap_keys(mapping);
                }
            },
        );
        CaptureScope {
            session,
            log,
            subscriptions: [registering, remapped],
        }
    }
}

/// An active capture. Derefs to the session; recording stops on drop.
pub struct CaptureScope<'s, D: StorageDriver> {
    session: &'s mut Session<D>,
    log: Arc<Mutex<OperationLog>>,
    subscriptions: [SubscriptionId; 2],
}

impl<D: StorageDriver> CaptureScope<'_, D> {
    /// The log being written.
    #[must_use]
    pub fn log(&self) -> &Arc<Mutex<OperationLog>> {
        &self.log
    }

    /// Stops recording and returns a copy of what was captured.
    pub fn finish(self) -> OperationLog {
        self.log.lock().clone()
    }
}

impl<D: StorageDriver> Deref for CaptureScope<'_, D> {
    type Target = Session<D>;

    fn deref(&self) -> &Session<D> {
        self.session
    }
}

impl<D: StorageDriver> DerefMut for CaptureScope<'_, D> {
    fn deref_mut(&mut self) -> &mut Session<D> {
        self.session
    }
}

impl<D: StorageDriver> Drop for CaptureScope<'_, D> {
    fn drop(&mut self) {
        for id in self.subscriptions {
            self.session.unsubscribe(id);
        }
    }
}
