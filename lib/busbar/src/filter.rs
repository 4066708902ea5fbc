use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::dispatch::DispatchCtx;
use crate::message::Message;
use crate::support::{BusResult, Handled};

pub type FilterCallback = Box<dyn FnMut(&mut DispatchCtx, &Message) -> BusResult<Handled>>;
pub type MatchPredicate = Box<dyn Fn(&Message) -> bool>;
pub type MatchCallback = Box<dyn FnMut(&mut DispatchCtx, &Message) -> BusResult<Handled>>;

/// One registered filter. The slot is reference counted so the dispatcher
/// can keep driving it while the owning list is mutated underneath.
pub struct FilterSlot {
    id: u64,
    last_iteration: Cell<u64>,
    callback: RefCell<FilterCallback>,
}

impl FilterSlot {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn last_iteration(&self) -> u64 {
        self.last_iteration.get()
    }

    #[inline]
    pub(crate) fn mark(&self, iteration: u64) {
        self.last_iteration.set(iteration);
    }

    #[inline]
    pub(crate) fn invoke(&self, ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
        (self.callback.borrow_mut())(ctx, message)
    }
}

/// Ordered filter list with safe mutation during dispatch: changes set the
/// modified flag, the dispatcher rescans from the head and the
/// per-slot iteration stamp keeps callbacks from running twice for the
/// same inbound message.
pub struct FilterSet {
    slots: Vec<Rc<FilterSlot>>,
    next_id: u64,
    modified: bool,
    active_iteration: u64,
}

impl FilterSet {
    pub fn new() -> FilterSet {
        FilterSet {
            slots: Vec::new(),
            next_id: 0,
            modified: false,
            active_iteration: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Appends a filter and returns its removal cookie. A filter added
    /// while a dispatch is running first fires on the next message.
    pub fn add(&mut self, callback: FilterCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;

        self.slots.push(Rc::new(FilterSlot {
            id,
            last_iteration: Cell::new(self.active_iteration),
            callback: RefCell::new(callback),
        }));
        self.modified = true;
        id
    }

    /// Removes the filter registered under `id`, reporting whether it
    /// existed.
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.id != id);

        if self.slots.len() != before {
            self.modified = true;
            true
        } else {
            false
        }
    }

    #[inline]
    pub(crate) fn begin(&mut self, iteration: u64) {
        self.active_iteration = iteration;
        self.modified = false;
    }

    #[inline]
    pub(crate) fn take_modified(&mut self) -> bool {
        std::mem::replace(&mut self.modified, false)
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> Option<Rc<FilterSlot>> {
        self.slots.get(index).cloned()
    }
}

/// One registered match: an opaque rule predicate plus its callback. Rule
/// parsing happens in the match-rule collaborator; the engine only asks
/// the predicate whether a message applies.
pub struct MatchSlot {
    id: u64,
    predicate: MatchPredicate,
    last_iteration: Cell<u64>,
    callback: RefCell<MatchCallback>,
}

impl MatchSlot {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn applies(&self, message: &Message) -> bool {
        (self.predicate)(message)
    }

    #[inline]
    pub(crate) fn last_iteration(&self) -> u64 {
        self.last_iteration.get()
    }

    #[inline]
    pub(crate) fn mark(&self, iteration: u64) {
        self.last_iteration.set(iteration);
    }

    #[inline]
    pub(crate) fn invoke(&self, ctx: &mut DispatchCtx, message: &Message) -> BusResult<Handled> {
        (self.callback.borrow_mut())(ctx, message)
    }
}

/// Match registrations, driven with the same reentrancy discipline as
/// filters.
pub struct MatchSet {
    slots: Vec<Rc<MatchSlot>>,
    next_id: u64,
    modified: bool,
    active_iteration: u64,
}

impl MatchSet {
    pub fn new() -> MatchSet {
        MatchSet {
            slots: Vec::new(),
            next_id: 0,
            modified: false,
            active_iteration: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn add(&mut self, predicate: MatchPredicate, callback: MatchCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;

        self.slots.push(Rc::new(MatchSlot {
            id,
            predicate,
            last_iteration: Cell::new(self.active_iteration),
            callback: RefCell::new(callback),
        }));
        self.modified = true;
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.id != id);

        if self.slots.len() != before {
            self.modified = true;
            true
        } else {
            false
        }
    }

    #[inline]
    pub(crate) fn begin(&mut self, iteration: u64) {
        self.active_iteration = iteration;
        self.modified = false;
    }

    #[inline]
    pub(crate) fn take_modified(&mut self) -> bool {
        std::mem::replace(&mut self.modified, false)
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> Option<Rc<MatchSlot>> {
        self.slots.get(index).cloned()
    }
}
