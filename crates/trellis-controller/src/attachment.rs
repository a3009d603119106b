use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Typed key into an operation's attachment map. Keys with the same name but
/// different value types do not collide.
pub struct AttachmentKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttachmentKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttachmentKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttachmentKey<T> {}

impl<T> fmt::Debug for AttachmentKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentKey({})", self.name)
    }
}

type Slot = (TypeId, &'static str);

/// Values attached for the lifetime of one operation.
#[derive(Default)]
pub struct Attachments {
    values: HashMap<Slot, Box<dyn Any + Send>>,
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.values.keys().map(|(_, name)| name))
            .finish()
    }
}

fn slot<T: Any>(key: AttachmentKey<T>) -> Slot {
    (TypeId::of::<T>(), key.name)
}

impl Attachments {
    /// Attach `value`, returning the value it replaced.
    pub fn attach<T: Any + Send>(&mut self, key: AttachmentKey<T>, value: T) -> Option<T> {
        self.values
            .insert(slot(key), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Attach `value` only if nothing is attached under `key`. Returns the
    /// existing value otherwise.
    pub fn attach_if_absent<T: Any + Send + Clone>(
        &mut self,
        key: AttachmentKey<T>,
        value: T,
    ) -> Option<T> {
        if let Some(existing) = self.get(key) {
            return Some(existing);
        }
        self.values.insert(slot(key), Box::new(value));
        None
    }

    pub fn detach<T: Any + Send>(&mut self, key: AttachmentKey<T>) -> Option<T> {
        self.values
            .remove(&slot(key))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send + Clone>(&self, key: AttachmentKey<T>) -> Option<T> {
        self.values
            .get(&slot(key))
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Mutate the attached value in place, attaching `T::default()` first if
    /// nothing is attached.
    pub fn update<T, R>(&mut self, key: AttachmentKey<T>, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Send + Default,
    {
        let entry = self
            .values
            .entry(slot(key))
            .or_insert_with(|| Box::new(T::default()));
        if !entry.is::<T>() {
            *entry = Box::new(T::default());
        }
        match entry.downcast_mut::<T>() {
            Some(value) => f(value),
            None => f(&mut T::default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
