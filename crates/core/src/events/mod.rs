//! Main-thread observer lists.
//!
//! Every publisher in the crate owns one [`Event`] per notification it
//! emits. Subscribing hands back a [`Subscription`] guard; dropping the guard
//! (or calling [`Subscription::cancel`]) removes the handler deterministically,
//! so a torn-down consumer can never be notified. Handlers run synchronously,
//! in subscription order, on the thread that calls [`Event::emit`].

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

type Handler<T> = Rc<RefCell<dyn FnMut(&T)>>;

struct Slot<T: ?Sized> {
    id: u64,
    handler: Handler<T>,
}

struct Registry<T: ?Sized> {
    next_id: u64,
    slots: Vec<Slot<T>>,
}

impl<T: ?Sized> Registry<T> {
    fn contains(&self, id: u64) -> bool {
        self.slots.iter().any(|slot| slot.id == id)
    }
}

trait Detach {
    fn detach(&self, id: u64);
}

impl<T: ?Sized> Detach for RefCell<Registry<T>> {
    fn detach(&self, id: u64) {
        self.borrow_mut().slots.retain(|slot| slot.id != id);
    }
}

/// Ordered list of handlers for a single notification carrying a `&T`.
pub struct Event<T: ?Sized> {
    registry: Rc<RefCell<Registry<T>>>,
}

impl<T: ?Sized + 'static> Event<T> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Registers `handler` at the end of the list.
    #[must_use = "dropping the subscription unsubscribes the handler"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(&T) + 'static,
    {
        let handler: Handler<T> = Rc::new(RefCell::new(handler));
        let mut registry = self.registry.borrow_mut();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.slots.push(Slot { id, handler });

        let weak = Rc::downgrade(&self.registry);
        let weak: Weak<dyn Detach> = weak;
        Subscription {
            registry: Some(weak),
            id,
        }
    }

    /// Invokes every handler with `value`.
    ///
    /// Handlers may subscribe or unsubscribe while the event is being
    /// emitted. A handler removed mid-emit is not called; one added mid-emit
    /// is first called on the next emit. A handler that re-enters an emit of
    /// the same event is skipped for the nested call.
    pub fn emit(&self, value: &T) {
        let pending: Vec<(u64, Handler<T>)> = self
            .registry
            .borrow()
            .slots
            .iter()
            .map(|slot| (slot.id, Rc::clone(&slot.handler)))
            .collect();

        for (id, handler) in pending {
            if !self.registry.borrow().contains(id) {
                continue;
            }
            match handler.try_borrow_mut() {
                Ok(mut handler) => (&mut *handler)(value),
                Err(_) => tracing::warn!(id, "skipping re-entrant event handler"),
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.borrow().slots.len()
    }
}

impl Event<()> {
    /// Emits a notification that carries no payload.
    pub fn fire(&self) {
        self.emit(&());
    }
}

impl<T: ?Sized + 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("subscribers", &self.registry.borrow().slots.len())
            .finish()
    }
}

/// Guard returned by [`Event::subscribe`]. The handler stays registered for
/// as long as the guard lives.
pub struct Subscription {
    registry: Option<Weak<dyn Detach>>,
    id: u64,
}

impl Subscription {
    /// Unsubscribes immediately. Safe to call after the publisher is gone.
    pub fn cancel(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.detach(self.id);
        }
    }

    /// Returns `true` while the handler is still registered with a live
    /// publisher.
    pub fn is_active(&self) -> bool {
        self.registry
            .as_ref()
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
