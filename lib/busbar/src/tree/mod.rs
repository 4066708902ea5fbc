pub mod vtable;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use hashbrown::HashMap;
use indexmap::IndexSet;

use flux::logging;

use crate::dispatch::DispatchCtx;
use crate::message::Message;
use crate::support::{self, BusResult, Fault, Handled};
use crate::tree::vtable::Vtable;

pub type NodeCallback = Box<dyn FnMut(&mut DispatchCtx, &Message) -> BusResult<Handled>>;
pub type Enumerator = Box<dyn FnMut(&str) -> BusResult<Vec<String>>>;

/// A plain callback attached to a path. Receives every message addressed
/// to the path (or, for fallbacks, to any descendant).
pub struct CallbackSlot {
    id: u64,
    fallback: bool,
    last_iteration: Cell<u64>,
    callback: RefCell<NodeCallback>,
}

impl CallbackSlot {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.fallback
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

/// An interface vtable attached to a path.
pub struct VtableSlot {
    id: u64,
    fallback: bool,
    last_iteration: Cell<u64>,
    vtable: Vtable,
}

impl VtableSlot {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    #[inline]
    pub fn vtable(&self) -> &Vtable {
        &self.vtable
    }

    #[inline]
    pub(crate) fn last_iteration(&self) -> u64 {
        self.last_iteration.get()
    }

    #[inline]
    pub(crate) fn mark(&self, iteration: u64) {
        self.last_iteration.set(iteration);
    }
}

pub struct EnumeratorSlot {
    id: u64,
    enumerate: RefCell<Enumerator>,
}

impl EnumeratorSlot {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    fn invoke(&self, prefix: &str) -> BusResult<Vec<String>> {
        (self.enumerate.borrow_mut())(prefix)
    }
}

/// Resolves a vtable member through one of the dispatch indices.
#[derive(Clone)]
pub(crate) struct MemberRef {
    pub(crate) slot: Rc<VtableSlot>,
    pub(crate) index: usize,
}

struct Node {
    parent: Option<String>,
    children: IndexSet<String>,
    callbacks: Vec<Rc<CallbackSlot>>,
    vtables: Vec<Rc<VtableSlot>>,
    enumerators: Vec<Rc<EnumeratorSlot>>,
    object_manager: bool,
}

impl Node {
    fn new(parent: Option<String>) -> Node {
        Node {
            parent,
            children: IndexSet::new(),
            callbacks: Vec::new(),
            vtables: Vec::new(),
            enumerators: Vec::new(),
            object_manager: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.callbacks.is_empty()
            && self.vtables.is_empty()
            && self.enumerators.is_empty()
            && !self.object_manager
    }
}

type MemberKey = (String, String, String);

/// Hierarchical path tree with per-node callbacks, vtables, enumerators
/// and object-manager flags. Two global indices keyed on
/// (registration path, interface, member) accelerate method and property
/// dispatch. Nodes persist only while they carry an attachment or a
/// child; removal garbage-collects emptied ancestors.
pub struct ObjectTree {
    nodes: HashMap<String, Node>,
    methods: HashMap<MemberKey, MemberRef>,
    properties: HashMap<MemberKey, MemberRef>,
    next_id: u64,
    generation: u64,
    log: logging::Logger,
}

impl ObjectTree {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> ObjectTree {
        let tree_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        ObjectTree {
            nodes: HashMap::new(),
            methods: HashMap::new(),
            properties: HashMap::new(),
            next_id: 0,
            generation: 0,
            log: tree_log,
        }
    }

    /// Bumped on every mutation; the dispatcher restarts its traversal
    /// when it observes a change mid-flight.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn has_node(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Attaches a plain callback at `path` and returns its removal cookie.
    pub fn add_callback(
        &mut self,
        path: &str,
        fallback: bool,
        callback: NodeCallback,
    ) -> BusResult<u64> {
        self.check_path(path)?;
        self.ensure_node(path);

        self.next_id += 1;
        let id = self.next_id;
        self.nodes
            .get_mut(path)
            .expect("Node must exist after ensure")
            .callbacks
            .push(Rc::new(CallbackSlot {
                id,
                fallback,
                last_iteration: Cell::new(0),
                callback: RefCell::new(callback),
            }));
        self.generation += 1;

        logging::debug!(self.log, "callback registered"; "path" => path, "id" => id, "fallback" => fallback);
        Ok(id)
    }

    /// Detaches a plain callback, reporting whether it existed.
    pub fn remove_callback(&mut self, path: &str, id: u64) -> BusResult<bool> {
        self.check_path(path)?;

        let removed = match self.nodes.get_mut(path) {
            Some(node) => {
                let before = node.callbacks.len();
                node.callbacks.retain(|slot| slot.id != id);
                node.callbacks.len() != before
            }
            None => false,
        };

        if removed {
            self.generation += 1;
            self.gc(path);
        }
        Ok(removed)
    }

    /// Attaches an interface vtable at `path`. The same interface may be
    /// attached to a node only once; re-registering it with the opposite
    /// fallback marking is a protocol mismatch.
    pub fn add_vtable(&mut self, path: &str, fallback: bool, vtable: Vtable) -> BusResult<u64> {
        self.check_path(path)?;

        if let Some(node) = self.nodes.get(path) {
            for slot in &node.vtables {
                if slot.vtable.interface() == vtable.interface() {
                    return Err(if slot.fallback != fallback {
                        Fault::WrongProtocol.into()
                    } else {
                        Fault::AlreadyExists.into()
                    });
                }
            }
        }

        self.ensure_node(path);
        self.next_id += 1;
        let id = self.next_id;

        let slot = Rc::new(VtableSlot {
            id,
            fallback,
            last_iteration: Cell::new(0),
            vtable,
        });

        let interface = slot.vtable.interface().to_string();
        for (index, method) in slot.vtable.methods().iter().enumerate() {
            self.methods.insert(
                (path.to_string(), interface.clone(), method.member().to_string()),
                MemberRef {
                    slot: slot.clone(),
                    index,
                },
            );
        }
        for (index, property) in slot.vtable.properties().iter().enumerate() {
            self.properties.insert(
                (path.to_string(), interface.clone(), property.member().to_string()),
                MemberRef {
                    slot: slot.clone(),
                    index,
                },
            );
        }

        self.nodes
            .get_mut(path)
            .expect("Node must exist after ensure")
            .vtables
            .push(slot);
        self.generation += 1;

        logging::debug!(self.log, "vtable registered";
                        "path" => path,
                        "interface" => &interface,
                        "fallback" => fallback);
        Ok(id)
    }

    /// Detaches the vtable registered for `interface` at `path`,
    /// reporting whether one existed.
    pub fn remove_vtable(&mut self, path: &str, interface: &str) -> BusResult<bool> {
        self.check_path(path)?;
        if !support::interface_name_is_valid(interface) {
            return Err(Fault::InvalidArgument.into());
        }

        let slot = match self.nodes.get_mut(path) {
            Some(node) => {
                match node
                    .vtables
                    .iter()
                    .position(|slot| slot.vtable.interface() == interface)
                {
                    Some(position) => Some(node.vtables.remove(position)),
                    None => None,
                }
            }
            None => None,
        };

        let slot = match slot {
            Some(slot) => slot,
            None => return Ok(false),
        };

        for method in slot.vtable.methods() {
            self.methods.remove(&(
                path.to_string(),
                interface.to_string(),
                method.member().to_string(),
            ));
        }
        for property in slot.vtable.properties() {
            self.properties.remove(&(
                path.to_string(),
                interface.to_string(),
                property.member().to_string(),
            ));
        }

        self.generation += 1;
        self.gc(path);

        logging::debug!(self.log, "vtable removed"; "path" => path, "interface" => interface);
        Ok(true)
    }

    /// Attaches a dynamic child enumerator at `path`.
    pub fn add_enumerator(&mut self, path: &str, enumerate: Enumerator) -> BusResult<u64> {
        self.check_path(path)?;
        self.ensure_node(path);

        self.next_id += 1;
        let id = self.next_id;
        self.nodes
            .get_mut(path)
            .expect("Node must exist after ensure")
            .enumerators
            .push(Rc::new(EnumeratorSlot {
                id,
                enumerate: RefCell::new(enumerate),
            }));
        self.generation += 1;
        Ok(id)
    }

    pub fn remove_enumerator(&mut self, path: &str, id: u64) -> BusResult<bool> {
        self.check_path(path)?;

        let removed = match self.nodes.get_mut(path) {
            Some(node) => {
                let before = node.enumerators.len();
                node.enumerators.retain(|slot| slot.id != id);
                node.enumerators.len() != before
            }
            None => false,
        };

        if removed {
            self.generation += 1;
            self.gc(path);
        }
        Ok(removed)
    }

    /// Marks or clears `path` as an object-manager root. Returns whether
    /// the flag changed.
    pub fn set_object_manager(&mut self, path: &str, on: bool) -> BusResult<bool> {
        self.check_path(path)?;

        if on {
            self.ensure_node(path);
        }

        let changed = match self.nodes.get_mut(path) {
            Some(node) => {
                let changed = node.object_manager != on;
                node.object_manager = on;
                changed
            }
            None => false,
        };

        if changed {
            self.generation += 1;
            if !on {
                self.gc(path);
            }
        }
        Ok(changed)
    }

    /// True when the path itself or some ancestor is flagged as an
    /// object-manager root.
    pub(crate) fn object_manager_covers(&self, path: &str) -> bool {
        for prefix in prefix_chain(path) {
            if let Some(node) = self.nodes.get(&prefix) {
                if node.object_manager {
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn callbacks_at(&self, path: &str, fallback: bool) -> Vec<Rc<CallbackSlot>> {
        match self.nodes.get(path) {
            Some(node) => node
                .callbacks
                .iter()
                .filter(|slot| slot.fallback == fallback)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn vtables_at(&self, path: &str, fallback: bool) -> Vec<Rc<VtableSlot>> {
        match self.nodes.get(path) {
            Some(node) => node
                .vtables
                .iter()
                .filter(|slot| slot.fallback == fallback)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every vtable serving the object at `path`: non-fallback slots at
    /// the exact node, then fallback slots at each ancestor, nearest
    /// first.
    pub(crate) fn vtables_for_object(&self, path: &str) -> Vec<Rc<VtableSlot>> {
        let mut slots = self.vtables_at(path, false);
        for prefix in prefix_chain(path).into_iter().skip(1) {
            slots.extend(self.vtables_at(&prefix, true));
        }
        slots
    }

    pub(crate) fn method_ref(&self, path: &str, interface: &str, member: &str) -> Option<MemberRef> {
        self.methods
            .get(&(path.to_string(), interface.to_string(), member.to_string()))
            .cloned()
    }

    pub(crate) fn property_ref(
        &self,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Option<MemberRef> {
        self.properties
            .get(&(path.to_string(), interface.to_string(), member.to_string()))
            .cloned()
    }

    /// Whether a call addressed to `path` has anything that could serve
    /// it: a registered node, an ancestor fallback registration, or an
    /// ancestor enumerator producing the path.
    pub(crate) fn object_exists(&self, path: &str) -> BusResult<bool> {
        if self.nodes.contains_key(path) {
            return Ok(true);
        }

        for prefix in prefix_chain(path).into_iter().skip(1) {
            if let Some(node) = self.nodes.get(&prefix) {
                if node.callbacks.iter().any(|slot| slot.fallback)
                    || node.vtables.iter().any(|slot| slot.fallback)
                {
                    return Ok(true);
                }
            }
        }

        for prefix in prefix_chain(path).into_iter().skip(1) {
            let produced = self.enumerate(&prefix)?;
            if produced.contains(path) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Names of the direct children of `prefix`: registered nodes plus
    /// enumerator-produced paths, first segment only.
    pub(crate) fn children_names(&self, prefix: &str) -> BusResult<IndexSet<String>> {
        let mut names = IndexSet::new();

        if let Some(node) = self.nodes.get(prefix) {
            for child in &node.children {
                if let Some(name) = first_segment(prefix, child) {
                    names.insert(name.to_string());
                }
            }
        }

        for path in self.enumerate(prefix)? {
            if let Some(name) = first_segment(prefix, &path) {
                names.insert(name.to_string());
            }
        }

        Ok(names)
    }

    /// All concrete descendant object paths under `prefix`: registered
    /// nodes carrying at least one vtable plus enumerator-produced paths.
    pub(crate) fn managed_paths(&self, prefix: &str) -> BusResult<IndexSet<String>> {
        let mut paths = IndexSet::new();

        for (path, node) in &self.nodes {
            if is_under(prefix, path) && !node.vtables.is_empty() {
                paths.insert(path.clone());
            }
        }

        for path in self.enumerate(prefix)? {
            paths.insert(path);
        }

        Ok(paths)
    }

    /// Runs every enumerator whose subtree intersects `prefix` and
    /// collects the valid produced paths. Entries that are not valid
    /// object paths under the prefix are dropped.
    fn enumerate(&self, prefix: &str) -> BusResult<IndexSet<String>> {
        let mut slots: Vec<Rc<EnumeratorSlot>> = Vec::new();

        for (path, node) in &self.nodes {
            let intersects =
                path == prefix || is_under(path, prefix) || is_under(prefix, path);
            if intersects {
                slots.extend(node.enumerators.iter().cloned());
            }
        }

        let mut produced = IndexSet::new();
        for slot in slots {
            for path in slot.invoke(prefix)? {
                if support::object_path_is_valid(&path) && is_under(prefix, &path) {
                    produced.insert(path);
                } else {
                    logging::warn!(self.log, "enumerator produced invalid path";
                                   "prefix" => prefix,
                                   "path" => &path);
                }
            }
        }

        Ok(produced)
    }

    fn check_path(&self, path: &str) -> BusResult<()> {
        if !support::object_path_is_valid(path) {
            return Err(Fault::InvalidArgument.into());
        }
        Ok(())
    }

    /// Creates `path` and any missing ancestors as structural nodes.
    fn ensure_node(&mut self, path: &str) {
        if self.nodes.contains_key(path) {
            return;
        }

        let parent = parent_path(path).map(str::to_string);
        self.nodes
            .insert(path.to_string(), Node::new(parent.clone()));

        if let Some(parent) = parent {
            self.ensure_node(&parent);
            self.nodes
                .get_mut(&parent)
                .expect("Parent must exist after ensure")
                .children
                .insert(path.to_string());
        }
    }

    /// Releases `path` and its ancestors while they carry no attachment
    /// and no children.
    fn gc(&mut self, path: &str) {
        let mut current = path.to_string();

        loop {
            let empty = match self.nodes.get(&current) {
                Some(node) => node.is_empty(),
                None => return,
            };
            if !empty {
                return;
            }

            let parent = self
                .nodes
                .remove(&current)
                .expect("Node checked above")
                .parent;

            match parent {
                Some(parent) => {
                    if let Some(node) = self.nodes.get_mut(&parent) {
                        node.children.shift_remove(&current);
                    }
                    current = parent;
                }
                None => return,
            }
        }
    }
}

/// The parent of an object path: the substring up to the final `/`. The
/// root has no parent.
pub(crate) fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(position) => Some(&path[..position]),
        None => None,
    }
}

/// The path itself followed by every ancestor up to and including `/`.
pub(crate) fn prefix_chain(path: &str) -> Vec<String> {
    let mut chain = vec![path.to_string()];
    let mut current = path.to_string();

    while let Some(parent) = parent_path(&current) {
        let parent = parent.to_string();
        chain.push(parent.clone());
        current = parent;
    }

    chain
}

/// True when `path` lies strictly below `prefix`.
pub(crate) fn is_under(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return path != "/" && path.starts_with('/');
    }
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'/'
}

/// The name of the direct child of `prefix` that `path` passes through.
fn first_segment<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if !is_under(prefix, path) {
        return None;
    }
    let rest = if prefix == "/" {
        &path[1..]
    } else {
        &path[prefix.len() + 1..]
    };
    Some(rest.split('/').next().unwrap_or(rest))
}
