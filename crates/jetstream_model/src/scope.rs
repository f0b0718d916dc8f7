use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ScopeError;
use crate::fragment::{FragmentKind, SyncFragment};
use crate::lock;
use crate::model::{CollectionChange, ModelObject, PropertyChange};
use crate::schema::registry;
use crate::value::{self, PropertyValue, RefUuids};

type ChangeObserver = Arc<dyn Fn(Vec<SyncFragment>) + Send + Sync>;

#[derive(Default)]
struct Pending {
    dirty: HashMap<Uuid, HashSet<&'static str>>,
    root_changed: bool,
}

enum Deferred {
    Change(Arc<ModelObject>, PropertyChange),
    Collection(Arc<ModelObject>, CollectionChange),
}

/// A named, remotely-attached container for a connected sub-graph of model
/// objects. Owns the `uuid -> object` index, captures local edits into
/// outbound fragments, and applies inbound fragments under the
/// remote-apply guard.
pub struct Scope {
    name: String,
    weak_self: Weak<Scope>,
    root: Mutex<Option<Arc<ModelObject>>>,
    objects: DashMap<Uuid, Arc<ModelObject>>,
    remote_applying: AtomicU32,
    pending: Mutex<Pending>,
    flush_armed: AtomicBool,
    observer: Mutex<Option<ChangeObserver>>,
    deferred: Mutex<Vec<Deferred>>,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<Scope>| Scope {
            name,
            weak_self: weak.clone(),
            root: Mutex::new(None),
            objects: DashMap::new(),
            remote_applying: AtomicU32::new(0),
            pending: Mutex::new(Pending::default()),
            flush_armed: AtomicBool::new(false),
            observer: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_model(&self) -> Option<Arc<ModelObject>> {
        lock(&self.root).clone()
    }

    pub fn get_object_by_uuid(&self, uuid: &Uuid) -> Option<Arc<ModelObject>> {
        self.objects.get(uuid).map(|entry| entry.value().clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Installs `root` as the scope root. The object graph reachable from
    /// it is folded into the scope on the next flush.
    pub fn attach_root(&self, root: Arc<ModelObject>) {
        debug!("Attaching root {:?} to scope `{}`", root, self.name);
        *lock(&self.root) = Some(root);
        if !self.is_applying_remote() {
            lock(&self.pending).root_changed = true;
            self.arm_flush();
        }
    }

    /// Drops the root; every indexed object detaches on the next flush.
    pub fn detach_root(&self) {
        debug!("Detaching root of scope `{}`", self.name);
        *lock(&self.root) = None;
        if !self.is_applying_remote() {
            self.arm_flush();
        }
    }

    /// Registers the single change observer (the client). Each flush hands
    /// it the ordered fragment list for one coalesced batch of local edits.
    pub fn observe_changes(&self, observer: impl Fn(Vec<SyncFragment>) + Send + Sync + 'static) {
        *lock(&self.observer) = Some(Arc::new(observer));
    }

    pub fn clear_change_observer(&self) {
        *lock(&self.observer) = None;
    }

    // ---- remote-apply guard ----

    pub fn is_applying_remote(&self) -> bool {
        self.remote_applying.load(Ordering::SeqCst) > 0
    }

    pub fn start_applying_remote(&self) {
        self.remote_applying.fetch_add(1, Ordering::SeqCst);
    }

    /// Ends a remote-apply interval. The outermost end fires the
    /// observations deferred during the step.
    ///
    /// Panics when unpaired: that leaves the scope inconsistent and is a
    /// programmer error.
    pub fn end_applying_remote(&self) {
        let prev = self.remote_applying.load(Ordering::SeqCst);
        if prev == 0 {
            panic!("end_applying_remote called without a matching start");
        }
        self.remote_applying.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            let deferred = std::mem::take(&mut *lock(&self.deferred));
            for event in deferred {
                match event {
                    Deferred::Change(obj, change) => obj.emit_change(&change),
                    Deferred::Collection(obj, change) => obj.emit_collection(&change),
                }
            }
        }
    }

    pub(crate) fn defer_change(&self, object: &Arc<ModelObject>, change: PropertyChange) {
        lock(&self.deferred).push(Deferred::Change(object.clone(), change));
    }

    pub(crate) fn defer_collection(&self, object: &Arc<ModelObject>, change: CollectionChange) {
        lock(&self.deferred).push(Deferred::Collection(object.clone(), change));
    }

    // ---- local change capture ----

    /// Called by an owned object after a local property write.
    pub(crate) fn record_change(&self, object: Uuid, property: &'static str) {
        if self.is_applying_remote() {
            return;
        }
        lock(&self.pending)
            .dirty
            .entry(object)
            .or_default()
            .insert(property);
        self.arm_flush();
    }

    /// Arms the zero-delay deferred flush. All writes in the current tick
    /// land in one batch.
    fn arm_flush(&self) {
        if !self.flush_armed.swap(true, Ordering::SeqCst) {
            if let Some(scope) = self.weak_self.upgrade() {
                tokio::spawn(async move {
                    scope.flush_now();
                });
            }
        }
    }

    /// Reconciles pending local edits into an ordered fragment list and
    /// hands it to the change observer. Normally runs on the deferred
    /// task; callable directly to drain before shutdown.
    pub fn flush_now(&self) {
        self.flush_armed.store(false, Ordering::SeqCst);
        let pending = std::mem::take(&mut *lock(&self.pending));
        let root = self.root_model();

        // Reachability from the root, parents before children.
        let mut reachable: Vec<Arc<ModelObject>> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        if let Some(root) = &root {
            let mut queue = VecDeque::from([root.clone()]);
            seen.insert(root.uuid());
            while let Some(obj) = queue.pop_front() {
                for child in obj.referenced_children() {
                    if seen.insert(child.uuid()) {
                        queue.push_back(child);
                    }
                }
                reachable.push(obj);
            }
        }

        // Indexed objects that fell out of reach detach now.
        let stale: Vec<Arc<ModelObject>> = self
            .objects
            .iter()
            .filter(|entry| !seen.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        for obj in &stale {
            debug!("Object {:?} left scope `{}`", obj, self.name);
            self.objects.remove(&obj.uuid());
            obj.detach();
        }

        // Newly reachable objects join the index and become adds.
        let mut added: Vec<Arc<ModelObject>> = Vec::new();
        for obj in &reachable {
            if !self.objects.contains_key(&obj.uuid()) {
                self.objects.insert(obj.uuid(), obj.clone());
                obj.set_scope(Some(self.weak_self.clone()));
                added.push(obj.clone());
            }
        }

        // Fragment order: root, adds, then changes.
        let mut fragments: Vec<SyncFragment> = Vec::new();
        let mut covered: HashSet<Uuid> = HashSet::new();
        if pending.root_changed {
            if let Some(root) = &root {
                fragments.push(SyncFragment::root(root));
                covered.insert(root.uuid());
            }
        }
        for obj in &added {
            if covered.insert(obj.uuid()) {
                fragments.push(SyncFragment::add(obj));
            }
        }
        for (uuid, names) in pending.dirty {
            if covered.contains(&uuid) {
                // A full snapshot for this object is already in the batch.
                continue;
            }
            let Some(obj) = self.get_object_by_uuid(&uuid) else {
                continue;
            };
            fragments.push(SyncFragment::change(&obj, &names));
        }

        if fragments.is_empty() {
            return;
        }
        let observer = lock(&self.observer).clone();
        match observer {
            Some(observer) => observer(fragments),
            None => debug!(
                "Scope `{}` flushed {} fragment(s) with no observer",
                self.name,
                fragments.len()
            ),
        }
    }

    // ---- inbound application ----

    /// Installs or reconciles the root plus the accompanying object graph
    /// from a full state dump, inside one remote-apply interval.
    pub fn apply_root_fragment(
        &self,
        root_fragment: &SyncFragment,
        extras: &[SyncFragment],
    ) -> Result<(), ScopeError> {
        self.start_applying_remote();
        let result = self.apply_batch(Some(root_fragment), extras);
        self.end_applying_remote();
        result
    }

    /// Applies an incremental fragment batch in received order, inside one
    /// remote-apply interval.
    pub fn apply_sync_fragments(&self, fragments: &[SyncFragment]) -> Result<(), ScopeError> {
        self.start_applying_remote();
        let result = self.apply_batch(None, fragments);
        self.end_applying_remote();
        result
    }

    /// Two-pass application: first instantiate every add and root so
    /// references resolve regardless of in-batch order, then wire
    /// properties in received order.
    fn apply_batch(
        &self,
        root_fragment: Option<&SyncFragment>,
        fragments: &[SyncFragment],
    ) -> Result<(), ScopeError> {
        if let Some(frag) = root_fragment {
            let root = self.materialize(frag)?;
            *lock(&self.root) = Some(root);
        }
        for frag in fragments {
            match frag.kind {
                FragmentKind::Add => match self.materialize(frag) {
                    Ok(_) => {}
                    // A fragment we cannot instantiate drops alone; the
                    // rest of the batch still applies.
                    Err(e) => warn!("Dropping add fragment {}: {}", frag.uuid, e),
                },
                FragmentKind::Root => match self.materialize(frag) {
                    Ok(root) => *lock(&self.root) = Some(root),
                    Err(e) => warn!("Dropping root fragment {}: {}", frag.uuid, e),
                },
                FragmentKind::Change => {}
            }
        }

        if let Some(frag) = root_fragment {
            self.apply_properties(frag);
        }
        for frag in fragments {
            match frag.kind {
                FragmentKind::Add | FragmentKind::Root => self.apply_properties(frag),
                FragmentKind::Change => {
                    if self.objects.contains_key(&frag.uuid) {
                        self.apply_properties(frag);
                    } else {
                        warn!(
                            "Dropping change for unknown object {} in scope `{}`",
                            frag.uuid, self.name
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves the fragment's object, instantiating it from the class
    /// registry when absent. Duplicate adds resolve to the existing
    /// object, making them idempotent.
    fn materialize(&self, frag: &SyncFragment) -> Result<Arc<ModelObject>, ScopeError> {
        if let Some(existing) = self.get_object_by_uuid(&frag.uuid) {
            return Ok(existing);
        }
        let cls = frag
            .cls
            .as_deref()
            .ok_or(ScopeError::MissingClass(frag.uuid))?;
        let schema = registry()
            .get(cls)
            .ok_or_else(|| ScopeError::UnknownClass(cls.to_owned()))?;
        let obj = ModelObject::with_uuid(schema, frag.uuid);
        obj.set_scope(Some(self.weak_self.clone()));
        self.objects.insert(frag.uuid, obj.clone());
        Ok(obj)
    }

    /// Sets each property a fragment carries. Unknown names and malformed
    /// values skip the single field; references resolve against the scope
    /// index, falling back to null.
    fn apply_properties(&self, frag: &SyncFragment) {
        let Some(obj) = self.get_object_by_uuid(&frag.uuid) else {
            return;
        };
        let Some(props) = &frag.properties else {
            return;
        };
        for (name, json) in props {
            let Some(prop) = obj.schema().property(name) else {
                warn!(
                    "Skipping unknown property `{}` on class `{}`",
                    name,
                    obj.class_name()
                );
                continue;
            };
            let value = if prop.tag.is_reference() {
                match value::decode_ref_uuids(prop.tag, json) {
                    Ok(RefUuids::One(None)) => PropertyValue::Ref(None),
                    Ok(RefUuids::One(Some(uuid))) => match self.get_object_by_uuid(&uuid) {
                        Some(child) => PropertyValue::Ref(Some(child)),
                        None => {
                            warn!(
                                "Reference `{}` -> {} did not resolve; treating as null",
                                name, uuid
                            );
                            PropertyValue::Ref(None)
                        }
                    },
                    Ok(RefUuids::Many(uuids)) => {
                        let mut children = Vec::with_capacity(uuids.len());
                        for uuid in uuids {
                            match self.get_object_by_uuid(&uuid) {
                                Some(child) => children.push(child),
                                None => warn!(
                                    "Collection `{}` entry {} did not resolve; dropping it",
                                    name, uuid
                                ),
                            }
                        }
                        PropertyValue::Array(children)
                    }
                    Err(e) => {
                        warn!("Skipping property `{}`: {}", name, e);
                        continue;
                    }
                }
            } else {
                match value::decode_scalar(prop.tag, json) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Skipping property `{}`: {}", name, e);
                        continue;
                    }
                }
            };
            if let Err(e) = obj.set_value(prop.name, value) {
                warn!("Failed to apply `{}` on {:?}: {}", name, obj, e);
            }
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("objects", &self.objects.len())
            .field(
                "remote_applying",
                &self.remote_applying.load(Ordering::SeqCst),
            )
            .finish()
    }
}
