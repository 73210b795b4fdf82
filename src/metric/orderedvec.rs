use std::borrow::Borrow;
use std::cmp::Ord;
use std::fmt;
use std::iter::FromIterator;

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Small map which keeps its entries sorted by key.
///
/// Iteration follows the key's `Ord`, which for instance names is plain
/// byte order (`cpu10` before `cpu2`), not the order of the instance
/// domain.
pub struct OrderedVec<K, V>(Vec<(K, V)>);

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for OrderedVec<K, V> {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		let mut dbg = f.debug_map();
		for (ref k, ref v) in self.0.iter() {
			dbg.entry(k, v);
		}
		dbg.finish()
	}
}

impl<K: Clone, V: Clone> Clone for OrderedVec<K, V> {
	fn clone(&self) -> Self {
		OrderedVec(self.0.clone())
	}
}

impl<K: PartialEq, V: PartialEq> PartialEq for OrderedVec<K, V> {
	fn eq(&self, other: &Self) -> bool {
		self.0 == other.0
	}
}

impl<K, V> Default for OrderedVec<K, V> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K, V> OrderedVec<K, V> {
	pub fn new() -> Self {
		Self(Vec::new())
	}

	pub fn with_capacity(capacity: usize) -> Self {
		Self(Vec::with_capacity(capacity))
	}

	#[inline]
	fn find<Q: ?Sized>(&self, k: &Q) -> Result<usize, usize>
		where
			K: Borrow<Q>,
			Q: Ord
	{
		self.0.binary_search_by(|kv: &(K, V)| { Ord::cmp(kv.0.borrow(), k) })
	}

	pub fn insert(&mut self, k: K, mut v: V) -> Option<V>
		where K: Ord
	{
		match self.find(&k) {
			Ok(existing) => {
				std::mem::swap(&mut v, &mut self.0[existing].1);
				Some(v)
			}
			Err(target) => {
				self.0.insert(target, (k, v));
				None
			}
		}
	}

	pub fn get<Q: ?Sized>(&self, k: &Q) -> Option<&V>
		where
			K: Borrow<Q>,
			Q: Ord
	{
		match self.find(k) {
			Ok(index) => Some(&self.0[index].1),
			Err(_) => None,
		}
	}

	pub fn contains_key<Q: ?Sized>(&self, k: &Q) -> bool
		where
			K: Borrow<Q>,
			Q: Ord
	{
		self.find(k).is_ok()
	}

	pub fn remove<Q: ?Sized>(&mut self, k: &Q) -> Option<V>
		where
			K: Borrow<Q>,
			Q: Ord
	{
		match self.find(k) {
			Ok(index) => Some(self.0.remove(index).1),
			Err(_) => None,
		}
	}

	pub fn keys(&self) -> impl Iterator<Item = &K> {
		self.0.iter().map(|kv| &kv.0)
	}

	/// Build a new map with the same keys, transforming each value.
	pub fn map_values<U, F: FnMut(&K, &V) -> U>(&self, mut f: F) -> OrderedVec<K, U>
		where K: Clone
	{
		OrderedVec(self.0.iter().map(|(k, v)| (k.clone(), f(k, v))).collect())
	}
}

impl<K: Ord, V> FromIterator<(K, V)> for OrderedVec<K, V> {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		let mut result = Self::new();
		for (k, v) in iter {
			result.insert(k, v);
		}
		result
	}
}

impl<K, V> std::ops::Deref for OrderedVec<K, V> {
	type Target = [(K, V)];

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<K: Serialize, V: Serialize> Serialize for OrderedVec<K, V> {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(self.0.len()))?;
		for (k, v) in self.0.iter() {
			map.serialize_entry(k, v)?;
		}
		map.end()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_insert_and_get() {
		let mut v = OrderedVec::new();
		v.insert("cpu0", 23.42f64);
		assert_eq!(*v.get("cpu0").unwrap(), 23.42f64);
	}

	#[test]
	fn test_insert_returns_old_value() {
		let mut v = OrderedVec::new();
		v.insert("k1", "foo");
		assert_eq!(v.insert("k1", "bar").unwrap(), "foo");
	}

	#[test]
	fn test_iteration_is_sorted_by_key() {
		let v: OrderedVec<&'static str, i32> = vec![("cpu2", 2), ("cpu0", 0), ("cpu1", 1)].into_iter().collect();
		let keys: Vec<_> = v.keys().cloned().collect();
		assert_eq!(keys, vec!["cpu0", "cpu1", "cpu2"]);
	}

	#[test]
	fn test_contains_key_and_remove() {
		let mut v = OrderedVec::new();
		v.insert("k1", "foo");
		v.insert("k2", "bar");
		assert!(v.contains_key("k1"));
		assert_eq!(v.remove("k1"), Some("foo"));
		assert!(!v.contains_key("k1"));
		assert!(v.remove("k1").is_none());
		assert_eq!(v.len(), 1);
	}

	#[test]
	fn test_get_returns_none_on_nonexistant_key() {
		let v = OrderedVec::<&'static str, i32>::new();
		assert!(v.get("foobar").is_none());
	}

	#[test]
	fn test_map_values_keeps_keys() {
		let v: OrderedVec<&'static str, i32> = vec![("a", 1), ("b", 2)].into_iter().collect();
		let doubled = v.map_values(|_, x| x * 2);
		assert_eq!(doubled.get("a"), Some(&2));
		assert_eq!(doubled.get("b"), Some(&4));
	}

	#[test]
	fn test_serializes_as_object() {
		let v: OrderedVec<&'static str, Option<f64>> = vec![("b", None), ("a", Some(1.5))].into_iter().collect();
		assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"a":1.5,"b":null}"#);
	}
}
