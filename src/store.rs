//! Element store: the in-memory collection of elements for the open board.
//!
//! The store is a pure reducer over accepted changes. It never talks to the
//! network and never decides whether a change should be applied; callers
//! (the mutation pipeline and the remote router) make that decision first.
//! The render layer reads from it through `snapshot`.

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;

use std::collections::HashMap;

use crate::element::{Element, ElementId, ElementPatch, UserId};

/// In-memory store of board elements.
#[derive(Debug, Default)]
pub struct ElementStore {
    elements: HashMap<ElementId, Element>,
}

impl ElementStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { elements: HashMap::new() }
    }

    /// Insert or fully replace an element by id. Returns the previous record.
    pub fn upsert(&mut self, element: Element) -> Option<Element> {
        self.elements.insert(element.id, element)
    }

    /// Insert an element only if its id is not already present.
    /// Returns `false` when an element with that id exists.
    pub fn insert_if_absent(&mut self, element: Element) -> bool {
        if self.elements.contains_key(&element.id) {
            return false;
        }
        self.elements.insert(element.id, element);
        true
    }

    /// Remove an element by id, returning it if it was present.
    pub fn remove(&mut self, id: &ElementId) -> Option<Element> {
        self.elements.remove(id)
    }

    /// Apply a sparse update to an existing element. Returns `false` if the
    /// element doesn't exist; a missing id never creates an element.
    pub fn patch(&mut self, id: &ElementId, patch: &ElementPatch) -> bool {
        let Some(element) = self.elements.get_mut(id) else {
            return false;
        };
        patch.apply_to(element);
        true
    }

    #[must_use]
    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ElementId) -> bool {
        self.elements.contains_key(id)
    }

    /// Replace the whole collection with a canonical element list.
    pub fn replace_all(&mut self, elements: Vec<Element>) {
        self.elements.clear();
        for element in elements {
            self.elements.insert(element.id, element);
        }
    }

    /// Attach a resolved display name to every element by `author`.
    /// Returns how many elements were touched.
    pub fn attach_author_name(&mut self, author: UserId, name: &str) -> usize {
        let mut touched = 0;
        for element in self.elements.values_mut().filter(|e| e.author_id == author) {
            element.author_name = Some(name.to_owned());
            touched += 1;
        }
        touched
    }

    /// All elements in creation order, ties broken by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Element> {
        let mut elements: Vec<Element> = self.elements.values().cloned().collect();
        elements.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        elements
    }

    /// Ids of all elements, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &ElementId> {
        self.elements.keys()
    }

    /// Number of elements currently in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` if the store contains no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
