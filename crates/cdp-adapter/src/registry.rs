//! Execution contexts known for the attached page.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::context::CdpExecutionContext;

/// Tracks the main frame and its default execution contexts.
///
/// Only one context is current at a time; older ones stay addressable by id until the
/// browser reports them destroyed, so late binding calls can still be answered.
#[derive(Default)]
pub struct ContextRegistry {
    main_frame: RwLock<Option<String>>,
    current: RwLock<Option<Arc<CdpExecutionContext>>>,
    contexts: DashMap<i64, Arc<CdpExecutionContext>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_main_frame(&self, frame_id: impl Into<String>) {
        *self.main_frame.write() = Some(frame_id.into());
    }

    pub fn main_frame(&self) -> Option<String> {
        self.main_frame.read().clone()
    }

    pub fn is_main_frame(&self, frame_id: &str) -> bool {
        self.main_frame.read().as_deref() == Some(frame_id)
    }

    /// Makes `context` the current one.
    pub fn install(&self, context: Arc<CdpExecutionContext>) {
        self.contexts
            .insert(context.context_id(), Arc::clone(&context));
        *self.current.write() = Some(context);
    }

    /// Forgets context `id`. Returns `true` when it was the current one.
    pub fn remove(&self, id: i64) -> bool {
        self.contexts.remove(&id);
        let mut current = self.current.write();
        if current.as_ref().map(|context| context.context_id()) == Some(id) {
            *current = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        self.contexts.clear();
        *self.current.write() = None;
    }

    pub fn current(&self) -> Option<Arc<CdpExecutionContext>> {
        self.current.read().clone()
    }

    pub fn get(&self, id: i64) -> Option<Arc<CdpExecutionContext>> {
        self.contexts.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
