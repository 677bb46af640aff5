use std::collections::BTreeMap;

/// Handle to an offset-scheduled action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionHandle {
    id: u64,
    offset: u64,
}

type ActionFn = Box<dyn FnOnce(bool) + Send>;

/// Ordered set of callbacks keyed by stream byte offset. Callbacks fire
/// with `valid = true` when playback crosses their offset, or `valid =
/// false` when a local stop invalidates them.
#[derive(Default)]
pub(crate) struct ActionSet {
    next_id: u64,
    actions: BTreeMap<(u64, u64), ActionFn>,
}

impl ActionSet {
    pub fn insert(&mut self, offset: u64, action: impl FnOnce(bool) + Send + 'static) -> ActionHandle {
        self.next_id += 1;
        let handle = ActionHandle {
            id: self.next_id,
            offset,
        };
        self.actions.insert((offset, handle.id), Box::new(action));
        handle
    }

    pub fn cancel(&mut self, handle: ActionHandle) -> bool {
        self.actions.remove(&(handle.offset, handle.id)).is_some()
    }

    /// Removes every action at or below `offset`, in offset order.
    pub fn take_due(&mut self, offset: u64) -> Vec<ActionFn> {
        let mut due = Vec::new();
        while let Some((&key, _)) = self.actions.iter().next() {
            if key.0 > offset {
                break;
            }
            if let Some(action) = self.actions.remove(&key) {
                due.push(action);
            }
        }
        due
    }

    /// Removes every pending action, in offset order.
    pub fn take_all(&mut self) -> Vec<ActionFn> {
        std::mem::take(&mut self.actions).into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_due_actions_fire_in_order() {
        let mut set = ActionSet::default();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for offset in [30u64, 10, 20] {
            let order = order.clone();
            set.insert(offset, move |_| order.lock().unwrap().push(offset));
        }
        for action in set.take_due(20) {
            action(true);
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20]);
        assert!(!set.is_empty());
    }

    #[test]
    fn test_cancel_removes_action() {
        let mut set = ActionSet::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = set.insert(5, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(set.cancel(handle));
        assert!(!set.cancel(handle));
        assert!(set.take_due(100).is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_same_offset_actions_both_fire() {
        let mut set = ActionSet::default();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let f = fired.clone();
            set.insert(7, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        for action in set.take_due(7) {
            action(true);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
