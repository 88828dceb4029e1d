//! Handles and the object directory.
//!
//! Every cross-object reference in the runtime (a task waiting on an event, a
//! finish latch pointing at its parent, a dependency slot naming a data block)
//! goes through a `Guid` rather than a pointer. The directory maps a guid back
//! to its object.
//!
//! A guid packs a slot index and a generation. Releasing an object bumps the
//! generation of its slot, so any guid issued before the release stops resolving
//! instead of aliasing whatever object reuses the slot.
//!
//! Objects are handed out as `Arc`s: releasing a guid only removes the
//! directory's reference, a thread that resolved the object earlier can finish
//! what it is doing with it.

use crate::core::event::Event;
use crate::core::task::Task;
use crate::data::DataBlock;
use crate::error::{Error, Result};
use crate::sync::{Arc, RwLock};

use std::fmt;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Guid(u64);

impl Guid {
    /// The absence of an object. Never issued by the directory.
    pub const NULL: Guid = Guid(0);

    // Reserved bit pattern used by events to mark missing data. Generations never
    // reach u32::MAX so no issued guid can collide with it.
    pub(crate) const UNSET_BITS: u64 = u64::MAX;

    fn new(index: u32, generation: u32) -> Self {
        debug_assert!(generation != 0 && generation != u32::MAX);
        Guid(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub fn is_null(self) -> bool { self.0 == 0 }

    #[inline]
    pub fn index(self) -> u32 { self.0 as u32 }

    #[inline]
    pub fn generation(self) -> u32 { (self.0 >> 32) as u32 }

    /// The raw handle, for passing guids through task parameters.
    #[inline]
    pub fn to_bits(self) -> u64 { self.0 }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        debug_assert!(bits != Self::UNSET_BITS);
        Guid(bits)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Guid(null)");
        }
        write!(f, "Guid({}#{})", self.index(), self.generation())
    }
}

impl Default for Guid {
    fn default() -> Self { Guid::NULL }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Event,
    Task,
    Data,
}

#[derive(Clone)]
pub enum Object {
    Event(Arc<Event>),
    Task(Arc<Task>),
    Data(Arc<DataBlock>),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Event(_) => ObjectKind::Event,
            Object::Task(_) => ObjectKind::Task,
            Object::Data(_) => ObjectKind::Data,
        }
    }
}

impl From<Arc<Event>> for Object {
    fn from(event: Arc<Event>) -> Self { Object::Event(event) }
}

impl From<Arc<Task>> for Object {
    fn from(task: Arc<Task>) -> Self { Object::Task(task) }
}

impl From<Arc<DataBlock>> for Object {
    fn from(data: Arc<DataBlock>) -> Self { Object::Data(data) }
}

struct Slot {
    generation: u32,
    object: Option<Object>,
}

struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Maps guids to objects.
///
/// This is the one place in the runtime that takes a lock. The event, task and
/// scheduler code only ever holds it for the duration of a lookup.
pub struct Directory {
    inner: RwLock<Slots>,
}

impl Directory {
    pub fn new() -> Self {
        Directory {
            inner: RwLock::new(Slots { slots: Vec::new(), free: Vec::new() }),
        }
    }

    /// Issue a new guid for `object`.
    pub fn register(&self, object: Object) -> Guid {
        let mut inner = self.inner.write().unwrap();
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            debug_assert!(slot.object.is_none());
            slot.object = Some(object);
            return Guid::new(index, slot.generation);
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot { generation: 1, object: Some(object) });

        Guid::new(index, 1)
    }

    /// Register an object that needs to know its own guid.
    pub(crate) fn register_with<T, F>(&self, build: F) -> Arc<T>
    where
        F: FnOnce(Guid) -> T,
        Arc<T>: Into<Object>,
    {
        let mut inner = self.inner.write().unwrap();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot { generation: 1, object: None });
                (inner.slots.len() - 1) as u32
            }
        };

        let slot = &mut inner.slots[index as usize];
        let object = Arc::new(build(Guid::new(index, slot.generation)));
        slot.object = Some(Arc::clone(&object).into());

        object
    }

    pub fn resolve(&self, guid: Guid) -> Result<Object> {
        if guid.is_null() {
            return Err(Error::StaleHandle(guid));
        }

        let inner = self.inner.read().unwrap();
        match inner.slots.get(guid.index() as usize) {
            Some(Slot { generation, object: Some(object) }) if *generation == guid.generation() => {
                Ok(object.clone())
            }
            _ => Err(Error::StaleHandle(guid)),
        }
    }

    pub fn kind(&self, guid: Guid) -> Option<ObjectKind> {
        self.resolve(guid).ok().map(|obj| obj.kind())
    }

    pub fn resolve_event(&self, guid: Guid) -> Result<Arc<Event>> {
        match self.resolve(guid)? {
            Object::Event(event) => Ok(event),
            _ => Err(Error::KindMismatch { guid, expected: ObjectKind::Event }),
        }
    }

    pub fn resolve_task(&self, guid: Guid) -> Result<Arc<Task>> {
        match self.resolve(guid)? {
            Object::Task(task) => Ok(task),
            _ => Err(Error::KindMismatch { guid, expected: ObjectKind::Task }),
        }
    }

    pub fn resolve_data(&self, guid: Guid) -> Result<Arc<DataBlock>> {
        match self.resolve(guid)? {
            Object::Data(data) => Ok(data),
            _ => Err(Error::KindMismatch { guid, expected: ObjectKind::Data }),
        }
    }

    /// Invalidate `guid` and hand back the directory's reference to the object.
    ///
    /// Returns `None` if the guid was already stale.
    pub fn release(&self, guid: Guid) -> Option<Object> {
        if guid.is_null() {
            return None;
        }

        let mut inner = self.inner.write().unwrap();
        let slot = inner.slots.get_mut(guid.index() as usize)?;
        if slot.generation != guid.generation() || slot.object.is_none() {
            return None;
        }

        let object = slot.object.take();
        slot.generation = match slot.generation.wrapping_add(1) {
            0 | u32::MAX => 1,
            generation => generation,
        };
        inner.free.push(guid.index());

        object
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.slots.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Directory {
    fn default() -> Self { Directory::new() }
}
