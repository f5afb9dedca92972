//! A single named, ordered map with per-key compare-and-set.

use crate::error::{CoreError, CoreResult};
use crate::types::MapId;
use mvtx_codec::{from_cbor, to_cbor, Value};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A type that can be stored as the payload of an [`MvMap`].
pub trait MapValue: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> MapValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// State shared between a store and every map it hands out.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    /// Set by every mutation, cleared when a snapshot is taken.
    pub(crate) unsaved: AtomicBool,
    /// Set once the store is closed.
    pub(crate) closed: AtomicBool,
}

/// An ordered map from [`Value`] keys to immutable `V` cells.
///
/// Cells are handed out as `Arc<V>`; [`MvMap::compare_and_set`] compares by
/// pointer identity, so a caller can replace exactly the cell it read.
pub struct MvMap<V> {
    id: MapId,
    name: String,
    entries: RwLock<BTreeMap<Value, Arc<V>>>,
    closed: AtomicBool,
    shared: Arc<SharedState>,
}

/// A key together with its cell.
pub type MapEntry<V> = (Value, Arc<V>);

fn cloned<V>((key, value): (&Value, &Arc<V>)) -> MapEntry<V> {
    (key.clone(), Arc::clone(value))
}

impl<V> MvMap<V> {
    pub(crate) fn new(id: MapId, name: String, shared: Arc<SharedState>) -> Self {
        Self::with_entries(id, name, BTreeMap::new(), shared)
    }

    fn with_entries(
        id: MapId,
        name: String,
        entries: BTreeMap<Value, Arc<V>>,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            id,
            name,
            entries: RwLock::new(entries),
            closed: AtomicBool::new(false),
            shared,
        }
    }

    /// Returns the map id.
    #[must_use]
    pub fn id(&self) -> MapId {
        self.id
    }

    /// Returns the map name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the map was removed from its store.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CoreError::StoreClosed);
        }
        if self.is_closed() {
            return Err(CoreError::map_closed(self.name.clone()));
        }
        Ok(())
    }

    fn mark_unsaved(&self) {
        self.shared.unsaved.store(true, Ordering::Release);
    }

    /// Returns the cell stored for `key`.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<Arc<V>> {
        self.entries.read().get(key).cloned()
    }

    /// Stores `value` for `key`, returning the previous cell.
    ///
    /// # Errors
    ///
    /// Fails if the map or its store is closed.
    pub fn put(&self, key: Value, value: V) -> CoreResult<Option<Arc<V>>> {
        self.check_writable()?;
        let previous = self.entries.write().insert(key, Arc::new(value));
        self.mark_unsaved();
        Ok(previous)
    }

    /// Removes `key`, returning the previous cell.
    ///
    /// # Errors
    ///
    /// Fails if the map or its store is closed.
    pub fn remove(&self, key: &Value) -> CoreResult<Option<Arc<V>>> {
        self.check_writable()?;
        let previous = self.entries.write().remove(key);
        if previous.is_some() {
            self.mark_unsaved();
        }
        Ok(previous)
    }

    /// Atomically replaces the cell of `key` if it is still `expected`.
    ///
    /// `expected == None` means the key must be absent; `new == None`
    /// removes the key. Cells are compared by identity. Returns whether the
    /// replacement happened.
    ///
    /// # Errors
    ///
    /// Fails if the map or its store is closed.
    pub fn compare_and_set(
        &self,
        key: &Value,
        expected: Option<&Arc<V>>,
        new: Option<Arc<V>>,
    ) -> CoreResult<bool> {
        self.check_writable()?;
        let mut entries = self.entries.write();
        let matches = match (entries.get(key), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            _ => false,
        };
        if !matches {
            return Ok(false);
        }
        match new {
            Some(cell) => {
                entries.insert(key.clone(), cell);
            }
            None => {
                entries.remove(key);
            }
        }
        drop(entries);
        self.mark_unsaved();
        Ok(true)
    }

    /// Returns the entry with the smallest key.
    #[must_use]
    pub fn first_entry(&self) -> Option<MapEntry<V>> {
        self.entries.read().iter().next().map(cloned)
    }

    /// Returns the entry with the largest key.
    #[must_use]
    pub fn last_entry(&self) -> Option<MapEntry<V>> {
        self.entries.read().iter().next_back().map(cloned)
    }

    /// Returns the entry with the smallest key strictly greater than `key`.
    #[must_use]
    pub fn higher_entry(&self, key: &Value) -> Option<MapEntry<V>> {
        self.entries
            .read()
            .range::<Value, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(cloned)
    }

    /// Returns the entry with the smallest key greater than or equal to `key`.
    #[must_use]
    pub fn ceiling_entry(&self, key: &Value) -> Option<MapEntry<V>> {
        self.entries
            .read()
            .range::<Value, _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(cloned)
    }

    /// Returns the entry with the largest key strictly less than `key`.
    #[must_use]
    pub fn lower_entry(&self, key: &Value) -> Option<MapEntry<V>> {
        self.entries
            .read()
            .range::<Value, _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(cloned)
    }

    /// Returns the entry with the largest key less than or equal to `key`.
    #[must_use]
    pub fn floor_entry(&self, key: &Value) -> Option<MapEntry<V>> {
        self.entries
            .read()
            .range::<Value, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(cloned)
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the map has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes every key.
    ///
    /// # Errors
    ///
    /// Fails if the map or its store is closed.
    pub fn clear(&self) -> CoreResult<()> {
        self.check_writable()?;
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            entries.clear();
            drop(entries);
            self.mark_unsaved();
        }
        Ok(())
    }

    /// Returns a point-in-time copy of the keys, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<Value> {
        self.entries.read().keys().cloned().collect()
    }

    /// Returns a point-in-time copy of the cells, in key order.
    #[must_use]
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries.read().values().cloned().collect()
    }
}

impl<V: MapValue> MvMap<V> {
    pub(crate) fn encode(&self) -> CoreResult<Vec<u8>> {
        let entries = self.entries.read();
        let image: Vec<(&Value, &V)> = entries.iter().map(|(k, v)| (k, v.as_ref())).collect();
        Ok(to_cbor(&image)?)
    }

    pub(crate) fn decode(
        id: MapId,
        name: String,
        bytes: &[u8],
        shared: Arc<SharedState>,
    ) -> CoreResult<Self> {
        let image: Vec<(Value, V)> = from_cbor(bytes)?;
        let entries = image.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        Ok(Self::with_entries(id, name, entries, shared))
    }
}

impl<V> fmt::Debug for MvMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MvMap")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Type-erased view of a loaded map, held by the store registry.
pub(crate) trait StoredMap: Send + Sync {
    fn encode_entries(&self) -> CoreResult<Vec<u8>>;
    fn close_map(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<V: MapValue> StoredMap for MvMap<V> {
    fn encode_entries(&self) -> CoreResult<Vec<u8>> {
        self.encode()
    }

    fn close_map(&self) {
        self.close();
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> MvMap<String> {
        MvMap::new(MapId::new(1), "test".into(), Arc::new(SharedState::default()))
    }

    fn filled() -> MvMap<String> {
        let m = map();
        for k in [10, 20, 30] {
            m.put(Value::Integer(k), format!("v{k}")).unwrap();
        }
        m
    }

    fn key_of(entry: Option<MapEntry<String>>) -> Option<i64> {
        entry.and_then(|(k, _)| k.as_integer())
    }

    #[test]
    fn put_get_remove() {
        let m = map();
        assert!(m.put(Value::from("a"), "1".into()).unwrap().is_none());
        let previous = m.put(Value::from("a"), "2".into()).unwrap().unwrap();
        assert_eq!(*previous, "1");
        assert_eq!(*m.get(&Value::from("a")).unwrap(), "2");
        assert_eq!(*m.remove(&Value::from("a")).unwrap().unwrap(), "2");
        assert!(m.get(&Value::from("a")).is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn compare_and_set_uses_identity() {
        let m = map();
        let key = Value::Integer(1);
        assert!(m
            .compare_and_set(&key, None, Some(Arc::new("a".into())))
            .unwrap());
        assert!(!m
            .compare_and_set(&key, None, Some(Arc::new("b".into())))
            .unwrap());

        let current = m.get(&key).unwrap();
        let equal_but_distinct = Arc::new("a".to_string());
        assert!(!m
            .compare_and_set(&key, Some(&equal_but_distinct), None)
            .unwrap());
        assert!(m.compare_and_set(&key, Some(&current), None).unwrap());
        assert!(m.get(&key).is_none());
    }

    #[test]
    fn navigation() {
        let m = filled();
        assert_eq!(key_of(m.first_entry()), Some(10));
        assert_eq!(key_of(m.last_entry()), Some(30));
        assert_eq!(key_of(m.higher_entry(&Value::Integer(10))), Some(20));
        assert_eq!(key_of(m.ceiling_entry(&Value::Integer(10))), Some(10));
        assert_eq!(key_of(m.ceiling_entry(&Value::Integer(11))), Some(20));
        assert_eq!(key_of(m.lower_entry(&Value::Integer(10))), None);
        assert_eq!(key_of(m.floor_entry(&Value::Integer(29))), Some(20));
        assert_eq!(key_of(m.higher_entry(&Value::Integer(30))), None);
        assert_eq!(m.keys().len(), 3);
    }

    #[test]
    fn closed_map_rejects_writes() {
        let m = filled();
        m.close();
        assert!(matches!(
            m.put(Value::Integer(1), "x".into()),
            Err(CoreError::MapClosed { .. })
        ));
        assert!(m.get(&Value::Integer(10)).is_some());
    }

    #[test]
    fn mutations_mark_unsaved() {
        let m = map();
        assert!(!m.shared.unsaved.load(Ordering::Acquire));
        m.put(Value::Integer(1), "x".into()).unwrap();
        assert!(m.shared.unsaved.load(Ordering::Acquire));
    }

    #[test]
    fn encode_decode_keeps_order() {
        let m = filled();
        let bytes = m.encode().unwrap();
        let decoded: MvMap<String> =
            MvMap::decode(m.id(), m.name().into(), &bytes, Arc::new(SharedState::default()))
                .unwrap();
        assert_eq!(decoded.keys(), m.keys());
        assert_eq!(*decoded.get(&Value::Integer(20)).unwrap(), "v20");
    }
}
