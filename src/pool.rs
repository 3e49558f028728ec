//! Reuse pool for short-lived shared objects.
//!
//! Pooled items hand themselves back through a [`PoolHandle`] once they
//! are done, and must reset their own state before doing so: an item popped
//! from the pool is handed out as-is.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::tree::Shared;

/// Pool of shared items of type `T`.
pub struct Pool<T> {
    free: Rc<RefCell<Vec<Shared<T>>>>,
    created: Rc<Cell<usize>>,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self {
            free: Rc::new(RefCell::new(Vec::new())),
            created: Rc::new(Cell::new(0)),
        }
    }

    /// Take a free item, or build a new one.
    ///
    /// `make` receives the item's own weak reference and a handle back to
    /// this pool, so the item can return itself later.
    pub fn get(&self, make: impl FnOnce(Weak<RefCell<T>>, PoolHandle<T>) -> T) -> Shared<T> {
        if let Some(item) = self.free.borrow_mut().pop() {
            return item;
        }
        self.created.set(self.created.get() + 1);
        let handle = self.handle();
        Rc::new_cyclic(|this| RefCell::new(make(this.clone(), handle)))
    }

    /// Return an item that was reset by the caller.
    pub fn release(&self, item: Shared<T>) {
        self.handle().release(item);
    }

    pub fn handle(&self) -> PoolHandle<T> {
        PoolHandle {
            free: Rc::downgrade(&self.free),
        }
    }

    /// Items created over the pool's lifetime.
    pub fn count_all(&self) -> usize {
        self.created.get()
    }

    pub fn count_free(&self) -> usize {
        self.free.borrow().len()
    }

    pub fn count_active(&self) -> usize {
        self.count_all() - self.count_free()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-owning way back into a [`Pool`].
pub struct PoolHandle<T> {
    free: Weak<RefCell<Vec<Shared<T>>>>,
}

impl<T> PoolHandle<T> {
    /// Give an item back. A no-op once the pool itself is gone.
    ///
    /// Never borrows the item, so it may be called from inside the item's
    /// own methods.
    pub fn release(&self, item: Shared<T>) {
        if let Some(free) = self.free.upgrade() {
            let mut free = free.borrow_mut();
            if free.iter().any(|f| Rc::ptr_eq(f, &item)) {
                log::error!("Pooled item released twice");
                return;
            }
            free.push(item);
        }
    }
}

impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        Self {
            free: self.free.clone(),
        }
    }
}
