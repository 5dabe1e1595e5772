//! Single-item port container with reader counting.
//!
//! The chain's slot array is read every cycle by the native and host
//! worker threads; insertions and removals are rare administrative
//! events. A [`SlotAccessor`] is a scoped read handle: while any
//! accessor is alive the contained port will not be replaced or removed.
//! Mutation waits for the reader count to drop to zero, bounded by a
//! timeout so a stuck reader surfaces as an error instead of a freeze.

use crate::port::Port;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

struct SlotInner {
    item: Option<Arc<Port>>,
    readers: usize,
}

/// A guarded slot of the port chain.
pub struct GuardedSlot {
    inner: Mutex<SlotInner>,
    released: Condvar,
    timeout: Duration,
}

impl GuardedSlot {
    /// Creates an empty slot. `timeout` bounds insert/remove waits.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                item: None,
                readers: 0,
            }),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Creates a scoped read handle; the contained port (if any) stays
    /// in place for the handle's lifetime.
    pub fn accessor(&self) -> SlotAccessor<'_> {
        let mut inner = self.inner.lock();
        inner.readers += 1;
        SlotAccessor {
            slot: self,
            item: inner.item.clone(),
        }
    }

    /// Installs a port. Fails on an occupied slot; waits (bounded) for
    /// all accessors to be dropped.
    pub fn set_item_wait(&self, port: Arc<Port>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.item.is_some() {
            return Err(Error::wrong_state("insert a port", "into an occupied slot"));
        }
        while inner.readers != 0 {
            if self.released.wait_for(&mut inner, self.timeout).timed_out() {
                return Err(Error::Timeout("set_item_wait"));
            }
        }
        // a concurrent writer may have slipped in while we waited
        if inner.item.is_some() {
            return Err(Error::wrong_state("insert a port", "into an occupied slot"));
        }
        inner.item = Some(port);
        Ok(())
    }

    /// Takes the contained port out. Fails on an empty slot; waits
    /// (bounded) for all accessors to be dropped.
    pub fn remove_item_wait(&self) -> Result<Arc<Port>> {
        let mut inner = self.inner.lock();
        if inner.item.is_none() {
            return Err(Error::wrong_state("remove a port", "from an empty slot"));
        }
        while inner.readers != 0 {
            if self.released.wait_for(&mut inner, self.timeout).timed_out() {
                return Err(Error::Timeout("remove_item_wait"));
            }
        }
        inner
            .item
            .take()
            .ok_or(Error::wrong_state("remove a port", "from an empty slot"))
    }

    pub fn has_item(&self) -> bool {
        self.inner.lock().item.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_item()
    }

    /// Number of currently live accessors.
    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers
    }
}

/// Scoped read handle onto a [`GuardedSlot`].
pub struct SlotAccessor<'a> {
    slot: &'a GuardedSlot,
    item: Option<Arc<Port>>,
}

impl SlotAccessor<'_> {
    pub fn has_item(&self) -> bool {
        self.item.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.item.is_none()
    }

    /// The contained port, if any.
    pub fn port(&self) -> Option<&Port> {
        self.item.as_deref()
    }
}

impl Drop for SlotAccessor<'_> {
    fn drop(&mut self) {
        let mut inner = self.slot.inner.lock();
        inner.readers -= 1;
        if inner.readers == 0 {
            self.slot.released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::event::TimeCode;
    use crate::port::{PortDriver, PortId};
    use crate::server::{Direction, ServerClient};
    use std::thread;
    use std::time::Instant;

    struct NoopDriver;

    impl PortDriver for NoopDriver {
        fn open(&self) -> Result<()> {
            Ok(())
        }
        fn register(&self, _client: &dyn ServerClient) -> Result<()> {
            Ok(())
        }
        fn start(&self) -> Result<()> {
            Ok(())
        }
        fn process_host(&self, _time_code: TimeCode, _last_cycle: bool) -> Result<()> {
            Ok(())
        }
        fn process_native(&self, _time_code: TimeCode, _client: &dyn ServerClient) -> Result<()> {
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn unregister(&self, _client: &dyn ServerClient) -> Result<()> {
            Ok(())
        }
        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_port(id: PortId) -> Arc<Port> {
        Arc::new(Port::new(
            id,
            Direction::Input,
            Box::new(NoopDriver),
            &LinkConfig::default(),
        ))
    }

    #[test]
    fn test_reader_count() {
        let slot = GuardedSlot::new(Duration::from_millis(500));
        assert_eq!(slot.reader_count(), 0);
        {
            let _a = slot.accessor();
            assert_eq!(slot.reader_count(), 1);
            {
                let _b = slot.accessor();
                assert_eq!(slot.reader_count(), 2);
            }
            assert_eq!(slot.reader_count(), 1);
        }
        assert_eq!(slot.reader_count(), 0);
    }

    #[test]
    fn test_set_and_remove() {
        let slot = GuardedSlot::new(Duration::from_millis(500));
        assert!(slot.is_empty());

        slot.set_item_wait(test_port(1)).unwrap();
        assert!(slot.has_item());

        // inserting into an occupied slot is a programming error
        assert!(slot.set_item_wait(test_port(2)).is_err());

        let removed = slot.remove_item_wait().unwrap();
        assert_eq!(removed.id(), 1);
        assert!(slot.is_empty());

        // removing from an empty slot is a programming error
        assert!(slot.remove_item_wait().is_err());
    }

    #[test]
    fn test_accessor_sees_item() {
        let slot = GuardedSlot::new(Duration::from_millis(500));
        {
            let accessor = slot.accessor();
            assert!(accessor.is_empty());
            assert!(accessor.port().is_none());
        }
        slot.set_item_wait(test_port(3)).unwrap();
        let accessor = slot.accessor();
        assert!(accessor.has_item());
        assert_eq!(accessor.port().unwrap().id(), 3);
    }

    #[test]
    fn test_shared_read_access() {
        let slot = GuardedSlot::new(Duration::from_millis(500));
        slot.set_item_wait(test_port(4)).unwrap();

        let a = slot.accessor();
        let b = slot.accessor();
        assert_eq!(a.port().unwrap().id(), 4);
        assert_eq!(b.port().unwrap().id(), 4);
        assert_eq!(slot.reader_count(), 2);
    }

    #[test]
    fn test_remove_waits_for_accessor() {
        let slot = Arc::new(GuardedSlot::new(Duration::from_millis(500)));
        slot.set_item_wait(test_port(5)).unwrap();

        let held = {
            let slot = slot.clone();
            thread::spawn(move || {
                let _accessor = slot.accessor();
                thread::sleep(Duration::from_millis(50));
            })
        };
        thread::sleep(Duration::from_millis(10));

        let before = Instant::now();
        let removed = slot.remove_item_wait().unwrap();
        assert_eq!(removed.id(), 5);
        assert!(before.elapsed() >= Duration::from_millis(20));
        held.join().unwrap();
    }

    #[test]
    fn test_timeout_in_remove() {
        let slot = Arc::new(GuardedSlot::new(Duration::from_millis(5)));
        slot.set_item_wait(test_port(6)).unwrap();

        let held = {
            let slot = slot.clone();
            thread::spawn(move || {
                let _accessor = slot.accessor();
                thread::sleep(Duration::from_millis(60));
            })
        };
        thread::sleep(Duration::from_millis(10));

        let err = slot.remove_item_wait().unwrap_err();
        assert!(err.is_timeout());
        // the slot still contains the original port
        assert!(slot.has_item());
        assert_eq!(slot.accessor().port().unwrap().id(), 6);
        held.join().unwrap();
    }

    #[test]
    fn test_timeout_in_set() {
        let slot = Arc::new(GuardedSlot::new(Duration::from_millis(5)));

        let held = {
            let slot = slot.clone();
            thread::spawn(move || {
                let _accessor = slot.accessor();
                thread::sleep(Duration::from_millis(60));
            })
        };
        thread::sleep(Duration::from_millis(10));

        let err = slot.set_item_wait(test_port(7)).unwrap_err();
        assert!(err.is_timeout());
        assert!(slot.is_empty());
        held.join().unwrap();
    }
}
