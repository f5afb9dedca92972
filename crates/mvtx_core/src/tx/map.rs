//! Transaction-scoped view of a map.

use crate::error::{CoreError, CoreResult};
use crate::mvstore::{MapEntry, MvMap};
use crate::tx::store::{Decision, LockMode, WriteOutcome};
use crate::tx::transaction::Transaction;
use crate::tx::versioned::VersionedValue;
use crate::types::MapId;
use mvtx_codec::{CodecError, Value, ValueType};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Where a navigation starts.
enum Seek<'k> {
    First,
    Last,
    Higher(&'k Value),
    Ceiling(&'k Value),
    Lower(&'k Value),
    Floor(&'k Value),
}

/// A map as seen by one transaction.
///
/// Reads are read-committed: a key shows its committed value, unless this
/// transaction has a pending write on it, in which case the pending value
/// (or absence, for a pending delete) is shown. Reads never block.
///
/// Writes lock the key until the transaction ends. A blocking write on a
/// key locked by another transaction waits for it; the `try_*` variants
/// return `false` instead.
///
/// `K` and `V` are converted with [`ValueType`]; a stored value of another
/// type surfaces as a [`CoreError::Codec`] error.
pub struct TransactionMap<K, V> {
    tx: Transaction,
    map: Arc<MvMap<VersionedValue>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

fn decode_entry<K: ValueType, V: ValueType>((key, value): (Value, Value)) -> CoreResult<(K, V)> {
    Ok((K::from_value(key)?, V::from_value(value)?))
}

fn decode<T: ValueType>(value: Option<Value>) -> CoreResult<Option<T>> {
    Ok(value.map(T::from_value).transpose()?)
}

impl<K: ValueType, V: ValueType> TransactionMap<K, V> {
    pub(crate) fn new(tx: Transaction, map: Arc<MvMap<VersionedValue>>) -> Self {
        Self {
            tx,
            map,
            _marker: PhantomData,
        }
    }

    /// Returns the transaction this view belongs to.
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Returns the map name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.map.name()
    }

    /// Returns the id of the underlying map.
    #[must_use]
    pub fn map_id(&self) -> MapId {
        self.map.id()
    }

    fn check_readable(&self) -> CoreResult<()> {
        self.tx.store().store().ensure_open()?;
        self.tx.check_current()?;
        if self.map.is_closed() {
            return Err(CoreError::map_closed(self.map.name()));
        }
        Ok(())
    }

    fn visible<'a>(&self, cell: &'a VersionedValue) -> Option<&'a Value> {
        self.tx.store().visible(self.tx.id(), cell)
    }

    fn get_value(&self, key: &Value) -> Option<Value> {
        let cell = self.map.get(key)?;
        self.visible(&cell).cloned()
    }

    /// Walks from `entry` until a key with a visible value is found.
    fn scan(&self, mut entry: Option<MapEntry<VersionedValue>>, forward: bool) -> Option<(Value, Value)> {
        while let Some((key, cell)) = entry {
            if let Some(value) = self.visible(&cell) {
                return Some((key, value.clone()));
            }
            entry = if forward {
                self.map.higher_entry(&key)
            } else {
                self.map.lower_entry(&key)
            };
        }
        None
    }

    fn seek(&self, seek: Seek<'_>) -> CoreResult<Option<(Value, Value)>> {
        self.check_readable()?;
        Ok(match seek {
            Seek::First => self.scan(self.map.first_entry(), true),
            Seek::Last => self.scan(self.map.last_entry(), false),
            Seek::Higher(key) => self.scan(self.map.higher_entry(key), true),
            Seek::Ceiling(key) => self.scan(self.map.ceiling_entry(key), true),
            Seek::Lower(key) => self.scan(self.map.lower_entry(key), false),
            Seek::Floor(key) => self.scan(self.map.floor_entry(key), false),
        })
    }

    fn seek_key(&self, seek: Seek<'_>) -> CoreResult<Option<K>> {
        decode(self.seek(seek)?.map(|(key, _)| key))
    }

    fn seek_entry(&self, seek: Seek<'_>) -> CoreResult<Option<(K, V)>> {
        self.seek(seek)?.map(decode_entry).transpose()
    }

    /// Returns the value of `key` visible to this transaction.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed, or the stored
    /// value is not a `V`.
    pub fn get(&self, key: &K) -> CoreResult<Option<V>> {
        self.check_readable()?;
        decode(self.get_value(&key.to_value()))
    }

    /// Returns true if `key` has a visible value.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn contains_key(&self, key: &K) -> CoreResult<bool> {
        self.check_readable()?;
        Ok(self.get_value(&key.to_value()).is_some())
    }

    /// Returns true if no key is visible.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.seek(Seek::First)?.is_none())
    }

    /// Number of visible keys. Counted by a full scan.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn size(&self) -> CoreResult<usize> {
        self.check_readable()?;
        Ok(self
            .map
            .values()
            .iter()
            .filter(|cell| self.visible(cell).is_some())
            .count())
    }

    /// Number of visible keys, as a `u64`.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn size_as_long(&self) -> CoreResult<u64> {
        Ok(self.size()? as u64)
    }

    /// Returns the smallest visible key.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn first_key(&self) -> CoreResult<Option<K>> {
        self.seek_key(Seek::First)
    }

    /// Returns the largest visible key.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn last_key(&self) -> CoreResult<Option<K>> {
        self.seek_key(Seek::Last)
    }

    /// Returns the smallest visible key strictly greater than `key`.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn higher_key(&self, key: &K) -> CoreResult<Option<K>> {
        self.seek_key(Seek::Higher(&key.to_value()))
    }

    /// Returns the smallest visible key greater than or equal to `key`.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn ceiling_key(&self, key: &K) -> CoreResult<Option<K>> {
        self.seek_key(Seek::Ceiling(&key.to_value()))
    }

    /// Returns the largest visible key strictly less than `key`.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn lower_key(&self, key: &K) -> CoreResult<Option<K>> {
        self.seek_key(Seek::Lower(&key.to_value()))
    }

    /// Returns the largest visible key less than or equal to `key`.
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn floor_key(&self, key: &K) -> CoreResult<Option<K>> {
        self.seek_key(Seek::Floor(&key.to_value()))
    }

    /// Entry variant of [`TransactionMap::first_key`].
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn first_entry(&self) -> CoreResult<Option<(K, V)>> {
        self.seek_entry(Seek::First)
    }

    /// Entry variant of [`TransactionMap::last_key`].
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn last_entry(&self) -> CoreResult<Option<(K, V)>> {
        self.seek_entry(Seek::Last)
    }

    /// Entry variant of [`TransactionMap::higher_key`].
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn higher_entry(&self, key: &K) -> CoreResult<Option<(K, V)>> {
        self.seek_entry(Seek::Higher(&key.to_value()))
    }

    /// Entry variant of [`TransactionMap::ceiling_key`].
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn ceiling_entry(&self, key: &K) -> CoreResult<Option<(K, V)>> {
        self.seek_entry(Seek::Ceiling(&key.to_value()))
    }

    /// Entry variant of [`TransactionMap::lower_key`].
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn lower_entry(&self, key: &K) -> CoreResult<Option<(K, V)>> {
        self.seek_entry(Seek::Lower(&key.to_value()))
    }

    /// Entry variant of [`TransactionMap::floor_key`].
    ///
    /// # Errors
    ///
    /// Fails if the map, transaction or store is closed.
    pub fn floor_entry(&self, key: &K) -> CoreResult<Option<(K, V)>> {
        self.seek_entry(Seek::Floor(&key.to_value()))
    }

    fn write(
        &self,
        key: &Value,
        mode: LockMode,
        decide: impl FnMut(Option<&Value>) -> Decision,
    ) -> CoreResult<WriteOutcome> {
        if self.map.is_closed() {
            return Err(CoreError::map_closed(self.map.name()));
        }
        self.tx
            .store()
            .write(&self.tx, &self.map, key, mode, decide)
    }

    /// Stores `value` for `key`, waiting for another transaction's lock.
    ///
    /// Returns the value visible before the call.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Deadlock`] or [`CoreError::Locked`] if the lock
    /// cannot be taken, or fails if the transaction is not open.
    pub fn put(&self, key: K, value: V) -> CoreResult<Option<V>> {
        let value = value.to_value();
        let outcome = self.write(&key.to_value(), LockMode::Wait, |_| {
            Decision::Set(Some(value.clone()))
        })?;
        decode(outcome.previous())
    }

    /// Stores `value` for `key` unless another transaction holds the key.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not open.
    pub fn try_put(&self, key: K, value: V) -> CoreResult<bool> {
        let value = value.to_value();
        let outcome = self.write(&key.to_value(), LockMode::NoWait, |_| {
            Decision::Set(Some(value.clone()))
        })?;
        Ok(!matches!(outcome, WriteOutcome::Locked))
    }

    /// Removes `key`, waiting for another transaction's lock.
    ///
    /// Returns the value visible before the call. Removing a key that does
    /// not exist at all is a no-op and takes no lock.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionMap::put`].
    pub fn remove(&self, key: &K) -> CoreResult<Option<V>> {
        let outcome = self.write(&key.to_value(), LockMode::Wait, |_| Decision::Set(None))?;
        decode(outcome.previous())
    }

    /// Removes `key` unless another transaction holds it.
    ///
    /// A holder that is still rolling back counts as holding the key.
    ///
    /// # Errors
    ///
    /// Fails if the transaction is not open.
    pub fn try_remove(&self, key: &K) -> CoreResult<bool> {
        let outcome = self.write(&key.to_value(), LockMode::NoWait, |_| Decision::Set(None))?;
        Ok(!matches!(outcome, WriteOutcome::Locked))
    }

    /// Locks `key` for this transaction without changing its value.
    ///
    /// Returns the visible value. Later writes by other transactions wait
    /// until this transaction ends.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionMap::put`].
    pub fn lock(&self, key: &K) -> CoreResult<Option<V>> {
        let outcome = self.write(&key.to_value(), LockMode::Wait, |_| Decision::Lock)?;
        decode(outcome.previous())
    }

    /// Replaces the value of `key` with `f(key, value)` if it has one.
    ///
    /// `f` returning `None` removes the key. Returns the new value. `f`
    /// may run more than once if the key changes concurrently.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionMap::put`], or a codec error if the stored
    /// value is not a `V`.
    pub fn compute_if_present<F>(&self, key: &K, mut f: F) -> CoreResult<Option<V>>
    where
        F: FnMut(&K, V) -> Option<V>,
    {
        let mut failure: Option<CodecError> = None;
        let mut result = None;
        self.write(&key.to_value(), LockMode::Wait, |visible| {
            let Some(current) = visible else {
                result = None;
                return Decision::Keep;
            };
            match V::from_value(current.clone()) {
                Ok(current) => {
                    let next = f(key, current);
                    let raw = next.as_ref().map(ValueType::to_value);
                    result = next;
                    Decision::Set(raw)
                }
                Err(e) => {
                    failure = Some(e);
                    Decision::Keep
                }
            }
        })?;
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(result),
        }
    }

    /// Iterates the visible keys in order, starting at `from` if given.
    #[must_use]
    pub fn keys(&self, from: Option<&K>) -> Keys<'_, K, V> {
        Keys {
            cursor: Cursor::new(self, from.map(ValueType::to_value)),
        }
    }

    /// Iterates the visible entries in order, starting at `from` if given.
    #[must_use]
    pub fn entries(&self, from: Option<&K>) -> Entries<'_, K, V> {
        Entries {
            cursor: Cursor::new(self, from.map(ValueType::to_value)),
        }
    }

    /// Iterates all visible entries in order.
    #[must_use]
    pub fn iter(&self) -> Entries<'_, K, V> {
        self.entries(None)
    }
}

impl<K, V> fmt::Debug for TransactionMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionMap")
            .field("name", &self.map.name())
            .field("transaction", &self.tx.id())
            .finish()
    }
}

enum Position {
    From(Option<Value>),
    After(Value),
    Done,
}

/// Re-seeks the underlying map on every step, so concurrent writes never
/// invalidate it; each step shows the state at the time it is taken.
struct Cursor<'a, K, V> {
    map: &'a TransactionMap<K, V>,
    position: Position,
}

impl<'a, K: ValueType, V: ValueType> Cursor<'a, K, V> {
    fn new(map: &'a TransactionMap<K, V>, from: Option<Value>) -> Self {
        Self {
            map,
            position: Position::From(from),
        }
    }

    fn advance(&mut self) -> Option<CoreResult<(Value, Value)>> {
        let start = match &self.position {
            Position::Done => return None,
            Position::From(None) => self.map.map.first_entry(),
            Position::From(Some(from)) => self.map.map.ceiling_entry(from),
            Position::After(last) => self.map.map.higher_entry(last),
        };
        if let Err(e) = self.map.check_readable() {
            self.position = Position::Done;
            return Some(Err(e));
        }
        match self.map.scan(start, true) {
            Some((key, value)) => {
                self.position = Position::After(key.clone());
                Some(Ok((key, value)))
            }
            None => {
                self.position = Position::Done;
                None
            }
        }
    }
}

/// Iterator over the visible keys of a [`TransactionMap`].
pub struct Keys<'a, K, V> {
    cursor: Cursor<'a, K, V>,
}

impl<K: ValueType, V: ValueType> Iterator for Keys<'_, K, V> {
    type Item = CoreResult<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor
            .advance()
            .map(|entry| entry.and_then(|(key, _)| Ok(K::from_value(key)?)))
    }
}

/// Iterator over the visible entries of a [`TransactionMap`].
pub struct Entries<'a, K, V> {
    cursor: Cursor<'a, K, V>,
}

impl<K: ValueType, V: ValueType> Iterator for Entries<'_, K, V> {
    type Item = CoreResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.advance().map(|entry| entry.and_then(decode_entry))
    }
}

#[cfg(test)]
mod tests {
    use crate::{MvStore, TransactionStore};
    use std::sync::Arc;

    fn store() -> Arc<TransactionStore> {
        let ts = TransactionStore::new(Arc::new(MvStore::in_memory())).unwrap();
        ts.init().unwrap();
        ts
    }

    #[test]
    fn read_your_writes() {
        let ts = store();
        let tx = ts.begin().unwrap();
        let map = tx.open_map::<String, String>("data").unwrap();
        assert!(map.put("a".into(), "1".into()).unwrap().is_none());
        assert_eq!(map.get(&"a".into()).unwrap(), Some("1".to_string()));
        assert_eq!(
            map.put("a".into(), "2".into()).unwrap(),
            Some("1".to_string())
        );
        assert_eq!(map.remove(&"a".into()).unwrap(), Some("2".to_string()));
        assert!(!map.contains_key(&"a".into()).unwrap());
    }

    #[test]
    fn pending_writes_are_invisible_to_others() {
        let ts = store();
        let writer = ts.begin().unwrap();
        let reader = ts.begin().unwrap();
        let w = writer.open_map::<i64, i64>("data").unwrap();
        let r = reader.open_map::<i64, i64>("data").unwrap();
        w.put(1, 10).unwrap();
        assert_eq!(r.get(&1).unwrap(), None);
        assert!(r.is_empty().unwrap());
        writer.commit().unwrap();
        assert_eq!(r.get(&1).unwrap(), Some(10));
        assert_eq!(r.size().unwrap(), 1);
    }

    #[test]
    fn remove_of_missing_key_takes_no_lock() {
        let ts = store();
        let tx = ts.begin().unwrap();
        let map = tx.open_map::<i64, i64>("data").unwrap();
        assert_eq!(map.remove(&7).unwrap(), None);
        assert!(!tx.has_changes());
    }

    #[test]
    fn try_put_fails_on_foreign_lock() {
        let ts = store();
        let a = ts.begin().unwrap();
        let b = ts.begin().unwrap();
        let ma = a.open_map::<i64, i64>("data").unwrap();
        let mb = b.open_map::<i64, i64>("data").unwrap();
        assert!(ma.try_put(1, 1).unwrap());
        assert!(!mb.try_put(1, 2).unwrap());
        assert!(!mb.try_remove(&1).unwrap());
        a.commit().unwrap();
        assert!(mb.try_put(1, 2).unwrap());
        b.commit().unwrap();
    }

    #[test]
    fn compute_if_present() {
        let ts = store();
        let tx = ts.begin().unwrap();
        let map = tx.open_map::<i64, i64>("data").unwrap();
        assert_eq!(map.compute_if_present(&1, |_, v| Some(v + 1)).unwrap(), None);
        assert!(!tx.has_changes());
        map.put(1, 41).unwrap();
        assert_eq!(
            map.compute_if_present(&1, |_, v| Some(v + 1)).unwrap(),
            Some(42)
        );
        assert_eq!(map.compute_if_present(&1, |_, _| None).unwrap(), None);
        assert_eq!(map.get(&1).unwrap(), None);
    }

    #[test]
    fn lock_keeps_value() {
        let ts = store();
        let setup = ts.begin().unwrap();
        setup
            .open_map::<i64, String>("data")
            .unwrap()
            .put(1, "x".into())
            .unwrap();
        setup.commit().unwrap();

        let a = ts.begin().unwrap();
        let ma = a.open_map::<i64, String>("data").unwrap();
        assert_eq!(ma.lock(&1).unwrap(), Some("x".to_string()));
        assert!(a.has_changes());

        let b = ts.begin().unwrap();
        let mb = b.open_map::<i64, String>("data").unwrap();
        assert_eq!(mb.get(&1).unwrap(), Some("x".to_string()));
        assert!(!mb.try_put(1, "y".into()).unwrap());
        a.commit().unwrap();
        assert_eq!(mb.get(&1).unwrap(), Some("x".to_string()));
    }

    #[test]
    fn iteration_sees_pending_inserts_and_hides_pending_deletes() {
        let ts = store();
        let setup = ts.begin().unwrap();
        let map = setup.open_map::<i64, i64>("data").unwrap();
        for k in 1..=4 {
            map.put(k, k * 10).unwrap();
        }
        setup.commit().unwrap();

        let tx = ts.begin().unwrap();
        let map = tx.open_map::<i64, i64>("data").unwrap();
        map.remove(&2).unwrap();
        map.put(5, 50).unwrap();
        let keys: Vec<i64> = map.keys(None).map(Result::unwrap).collect();
        assert_eq!(keys, vec![1, 3, 4, 5]);
        let from: Vec<(i64, i64)> = map.entries(Some(&2)).map(Result::unwrap).collect();
        assert_eq!(from, vec![(3, 30), (4, 40), (5, 50)]);
        assert_eq!(map.size_as_long().unwrap(), 4);
        assert_eq!(map.lower_key(&3).unwrap(), Some(1));
        assert_eq!(map.last_entry().unwrap(), Some((5, 50)));
    }

    #[test]
    fn wrong_value_type_is_a_codec_error() {
        let ts = store();
        let tx = ts.begin().unwrap();
        tx.open_map::<i64, String>("data")
            .unwrap()
            .put(1, "text".into())
            .unwrap();
        let as_int = tx.open_map::<i64, i64>("data").unwrap();
        assert!(matches!(
            as_int.get(&1),
            Err(crate::CoreError::Codec(_))
        ));
    }
}
