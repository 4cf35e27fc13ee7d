use crate::core::{MetaError, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

/// Objects that can be registered in a [`NamedCache`].
pub trait CacheEntry: Send + Sync {
    const KIND: &'static str;

    fn entry_id(&self) -> u64;

    fn entry_name(&self) -> String;
}

struct Slot<T> {
    /// Name this entry is registered under in `name_to_id`.
    name: String,
    object: Arc<T>,
}

struct Entries<T> {
    name_to_id: HashMap<String, u64>,
    by_id: HashMap<u64, Slot<T>>,
}

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Self {
            name_to_id: HashMap::new(),
            by_id: HashMap::new(),
        }
    }
}

impl<T: CacheEntry> Entries<T> {
    fn insert(&mut self, object: Arc<T>) -> Result<()> {
        let id = object.entry_id();
        let name = object.entry_name();
        if self.name_to_id.contains_key(&name) {
            return Err(MetaError::AlreadyExists(format!("{} '{}'", T::KIND, name)));
        }
        if self.by_id.contains_key(&id) {
            return Err(MetaError::AlreadyExists(format!("{} id {}", T::KIND, id)));
        }
        self.name_to_id.insert(name.clone(), id);
        self.by_id.insert(id, Slot { name, object });
        Ok(())
    }

    fn check_rename(&self, id: u64, new_name: &str) -> Result<()> {
        if let Some(owner) = self.name_to_id.get(new_name) {
            if *owner != id {
                return Err(MetaError::AlreadyExists(format!("{} '{}'", T::KIND, new_name)));
            }
        }
        if !self.by_id.contains_key(&id) {
            return Err(MetaError::NotFound(format!("{} id {}", T::KIND, id)));
        }
        Ok(())
    }
}

/// Two-way `name -> id -> object` index under one lock.
///
/// The name an entry was registered with is kept beside the object, so
/// removal and renames never consult the object's live name.
pub struct NamedCache<T> {
    entries: RwLock<Entries<T>>,
}

impl<T> Default for NamedCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
        }
    }
}

impl<T: CacheEntry> NamedCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, object: Arc<T>) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(object)
    }

    /// Removes the entry stored for `object`'s id together with the name it
    /// was registered under.
    pub fn delete(&self, object: &T) -> Option<Arc<T>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let id = object.entry_id();
        let slot = entries.by_id.remove(&id)?;
        if entries.name_to_id.get(&slot.name) == Some(&id) {
            entries.name_to_id.remove(&slot.name);
        }
        Some(slot.object)
    }

    /// Moves entry `id` to `new_name`.
    pub fn rename(&self, id: u64, new_name: &str) -> Result<()> {
        self.rename_with(id, new_name, || {})
    }

    /// Fails the way [`NamedCache::rename`] would, without changing anything.
    pub fn check_rename(&self, id: u64, new_name: &str) -> Result<()> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check_rename(id, new_name)
    }

    /// Moves entry `id` to `new_name`, running `apply` under the cache write
    /// lock first. Lookups by name never observe the object renamed while
    /// the maps still carry the old name.
    pub fn rename_with(&self, id: u64, new_name: &str, apply: impl FnOnce()) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.check_rename(id, new_name)?;
        apply();
        let Some(slot) = entries.by_id.get_mut(&id) else {
            return Ok(());
        };
        let old_name = std::mem::replace(&mut slot.name, new_name.to_string());
        if old_name != new_name {
            entries.name_to_id.remove(&old_name);
            entries.name_to_id.insert(new_name.to_string(), id);
        }
        Ok(())
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name_to_id
            .contains_key(name)
    }

    /// Looks an entry up by name. A name whose id has no matching entry, or
    /// whose entry is registered or currently named otherwise, is reported
    /// as `InternalInconsistency` and left as is.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Arc<T>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let Some(id) = entries.name_to_id.get(name) else {
            return Ok(None);
        };
        match entries.by_id.get(id) {
            Some(slot) => {
                let live = slot.object.entry_name();
                if slot.name == name && live == name {
                    return Ok(Some(Arc::clone(&slot.object)));
                }
                error!(
                    kind = T::KIND,
                    name,
                    id,
                    registered = %slot.name,
                    live = %live,
                    "cache name map points at a differently named entry"
                );
                Err(MetaError::InternalInconsistency(format!(
                    "{} '{}' maps to id {} named '{}'",
                    T::KIND,
                    name,
                    id,
                    live
                )))
            }
            None => {
                error!(kind = T::KIND, name, id, "cache name map points at a missing entry");
                Err(MetaError::InternalInconsistency(format!(
                    "{} '{}' maps to unknown id {}",
                    T::KIND,
                    name,
                    id
                )))
            }
        }
    }

    pub fn find_by_id(&self, id: u64) -> Option<Arc<T>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .map(|slot| Arc::clone(&slot.object))
    }

    /// Every entry, ordered by id.
    pub fn all(&self) -> Vec<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = entries
            .by_id
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(&slot.object)))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all.into_iter().map(|(_, object)| object).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the whole content with `objects`. On a duplicate nothing
    /// changes.
    pub fn restore(&self, objects: Vec<Arc<T>>) -> Result<()> {
        let mut fresh = Entries::default();
        for object in objects {
            fresh.insert(object)?;
        }
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    /// Checks that both maps agree entry for entry.
    pub fn verify(&self) -> Result<()> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        for (name, id) in &entries.name_to_id {
            match entries.by_id.get(id) {
                Some(slot) if &slot.name == name && slot.object.entry_name() == *name => {}
                _ => {
                    error!(kind = T::KIND, name = %name, id, "cache maps disagree");
                    return Err(MetaError::InternalInconsistency(format!(
                        "{} '{}' -> {} has no matching entry",
                        T::KIND,
                        name,
                        id
                    )));
                }
            }
        }
        if entries.name_to_id.len() != entries.by_id.len() {
            return Err(MetaError::InternalInconsistency(format!(
                "{} cache holds {} names for {} entries",
                T::KIND,
                entries.name_to_id.len(),
                entries.by_id.len()
            )));
        }
        Ok(())
    }
}
