use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

/// Orders with a transition currently executing in this process.
///
/// A second transition of the same order is refused before it can reach
/// the ledger; the stored status CAS covers other processes.
#[derive(Default)]
pub struct InFlight {
    ids: Mutex<HashSet<Uuid>>,
}

impl InFlight {
    /// `None` if `id` is already claimed.
    pub fn try_claim(&self, id: Uuid) -> Option<InFlightGuard<'_>> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id).then(|| InFlightGuard { set: self, id })
    }

    pub fn is_claimed(&self, id: Uuid) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

pub struct InFlightGuard<'a> {
    set: &'a InFlight,
    id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let f = InFlight::default();
        let id = Uuid::new_v4();
        let g = f.try_claim(id).unwrap();
        assert!(f.try_claim(id).is_none());
        drop(g);
        assert!(!f.is_claimed(id));
        assert!(f.try_claim(id).is_some());
    }
}
