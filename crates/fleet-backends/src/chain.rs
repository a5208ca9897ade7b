//! Ordered fallback chain of (backend, model) candidates.

use fleet_core::BackendId;
use serde::Serialize;

/// One place the router may send a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub backend: BackendId,
    /// Model pinned by the registry; resolved per backend when `None`.
    pub model: Option<String>,
}

/// Candidates in the order the router tries them.
///
/// Built as: preferred backend, then the registry's best match for the
/// category, then the remaining backends in the fixed fallback order. A
/// backend whose circuit currently refuses calls is left out everywhere, and
/// no backend appears twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandidateChain {
    candidates: Vec<Candidate>,
}

impl CandidateChain {
    /// Preferred backend, then the registry pick, then the fallback order.
    /// Open backends and repeated backends are skipped.
    pub fn build(
        preferred: Option<BackendId>,
        registry_best: Option<(BackendId, String)>,
        fallback_order: &[BackendId],
        is_open: impl Fn(BackendId) -> bool,
    ) -> Self {
        let mut chain = Self::default();
        if let Some(backend) = preferred {
            if !is_open(backend) {
                chain.push(backend, None);
            }
        }
        if let Some((backend, model)) = registry_best {
            if !is_open(backend) {
                chain.push(backend, Some(model));
            }
        }
        for backend in fallback_order {
            if !is_open(*backend) {
                chain.push(*backend, None);
            }
        }
        chain
    }

    /// Adds a candidate unless its backend is already listed. A pinned model
    /// fills in an existing entry that had none.
    fn push(&mut self, backend: BackendId, model: Option<String>) {
        if let Some(existing) = self.candidates.iter_mut().find(|c| c.backend == backend) {
            if existing.model.is_none() {
                existing.model = model;
            }
            return;
        }
        self.candidates.push(Candidate { backend, model });
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn first(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candidate> {
        self.candidates.iter()
    }

    pub fn backends(&self) -> Vec<BackendId> {
        self.candidates.iter().map(|c| c.backend).collect()
    }
}

impl<'a> IntoIterator for &'a CandidateChain {
    type Item = &'a Candidate;
    type IntoIter = std::slice::Iter<'a, Candidate>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
