//! In-memory persistence store.
//!
//! Behaves like the canonical store: assigns ids and timestamps, answers
//! `NotFound` for missing elements, and keeps elements in creation order.
//! Faults can be queued to exercise the pipeline's recovery paths, and every
//! call is recorded so callers can assert what was persisted.

#[cfg(test)]
#[path = "memory_test.rs"]
mod memory_test;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::element::{BoardId, Element, ElementId, ElementPatch, NewElement};
use crate::persistence::{PersistenceStore, StoreError};

/// A failure to return from the next persistence call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    Forbidden,
    Transient,
}

/// A recorded persistence call.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Create(NewElement),
    Update(ElementId, ElementPatch),
    Delete(ElementId),
    List(BoardId),
}

#[derive(Default)]
struct Inner {
    elements: HashMap<ElementId, Element>,
    faults: VecDeque<Fault>,
    calls: Vec<StoreCall>,
}

/// `PersistenceStore` backed by a mutex-guarded map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing canonical elements.
    #[must_use]
    pub fn with_elements(elements: Vec<Element>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for element in elements {
                inner.elements.insert(element.id, element);
            }
        }
        store
    }

    /// Delay every call by `latency` before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next call fail with `fault`. Faults queue up in order.
    pub fn fail_next(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Write an element directly, as another client would.
    pub fn put(&self, element: Element) {
        self.lock().elements.insert(element.id, element);
    }

    /// Remove an element directly, as another client would.
    pub fn take(&self, id: &ElementId) -> Option<Element> {
        self.lock().elements.remove(id)
    }

    /// Canonical elements of a board in creation order.
    #[must_use]
    pub fn elements(&self, board_id: BoardId) -> Vec<Element> {
        let inner = self.lock();
        let mut elements: Vec<Element> = inner
            .elements
            .values()
            .filter(|e| e.board_id == board_id)
            .cloned()
            .collect();
        elements.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        elements
    }

    /// Every call made so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    /// Number of updates issued for `id`.
    #[must_use]
    pub fn update_count(&self, id: &ElementId) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, StoreCall::Update(target, _) if target == id))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn fault_error(fault: Fault, id: ElementId) -> StoreError {
    match fault {
        Fault::NotFound => StoreError::NotFound(id),
        Fault::Forbidden => StoreError::Forbidden(id),
        Fault::Transient => StoreError::Transient("injected failure".to_owned()),
    }
}

#[async_trait::async_trait]
impl PersistenceStore for MemoryStore {
    async fn create(&self, element: &NewElement) -> Result<Element, StoreError> {
        self.pause().await;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::Create(element.clone()));
        if let Some(fault) = inner.faults.pop_front() {
            return Err(fault_error(fault, Uuid::nil()));
        }
        let created = element.clone().into_element(Uuid::new_v4(), OffsetDateTime::now_utc());
        inner.elements.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update(&self, id: ElementId, patch: &ElementPatch) -> Result<Element, StoreError> {
        self.pause().await;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::Update(id, patch.clone()));
        if let Some(fault) = inner.faults.pop_front() {
            return Err(fault_error(fault, id));
        }
        let element = inner.elements.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        patch.apply_to(element);
        element.updated_at = OffsetDateTime::now_utc();
        Ok(element.clone())
    }

    async fn delete(&self, id: ElementId) -> Result<(), StoreError> {
        self.pause().await;
        let mut inner = self.lock();
        inner.calls.push(StoreCall::Delete(id));
        if let Some(fault) = inner.faults.pop_front() {
            return Err(fault_error(fault, id));
        }
        inner.elements.remove(&id).map(|_| ()).ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, board_id: BoardId) -> Result<Vec<Element>, StoreError> {
        self.pause().await;
        {
            let mut inner = self.lock();
            inner.calls.push(StoreCall::List(board_id));
            if let Some(fault) = inner.faults.pop_front() {
                return Err(fault_error(fault, Uuid::nil()));
            }
        }
        Ok(self.elements(board_id))
    }
}
