use crate::err::Error;
use crate::ipfs::Cid;
use crate::tree::{Key, Value};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::mem;

/// The identifier of an entry inside a node: either a real key, or the
/// `+∞` sentinel which sorts after every real key and anchors the node's
/// rightmost subtree.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum NodeKey {
	Key(Key),
	Inf,
}

impl NodeKey {
	pub(crate) fn as_key(&self) -> Option<&str> {
		match self {
			Self::Key(k) => Some(k),
			Self::Inf => None,
		}
	}
}

impl Display for NodeKey {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			Self::Key(k) => f.write_str(k),
			Self::Inf => f.write_str("INF"),
		}
	}
}

/// One slot of a node.
///
/// `value` is `None` only on the sentinel. `child` is the stored hash of
/// the subtree below this slot and `child_node` its in-memory copy; a slot
/// with a hash but no node is inflated lazily, and a slot whose subtree
/// has been mutated has its hash cleared until the next store pass
/// recomputes it.
#[derive(Clone, Debug, Default)]
pub(crate) struct Entry {
	pub(crate) value: Option<Value>,
	pub(crate) child: Option<Cid>,
	pub(crate) child_node: Option<Box<Node>>,
}

impl Entry {
	pub(crate) fn leaf(value: Value) -> Self {
		Self {
			value: Some(value),
			child: None,
			child_node: None,
		}
	}
}

/// A single tree node: an ordered mapping from entry identifiers to
/// entries, with the sentinel (when present) in the last position.
#[derive(Clone, Debug, Default)]
pub(crate) struct Node {
	pub(crate) entries: BTreeMap<NodeKey, Entry>,
}

impl Node {
	/// The number of keyed entries, the sentinel excluded
	pub(crate) fn size(&self) -> usize {
		if self.entries.contains_key(&NodeKey::Inf) {
			self.entries.len() - 1
		} else {
			self.entries.len()
		}
	}

	pub(crate) fn is_leaf(&self) -> bool {
		self.entries.values().all(|e| e.child.is_none() && e.child_node.is_none())
	}

	/// The sentinel entry, created on first use
	pub(crate) fn inf_entry(&mut self) -> &mut Entry {
		self.entries.entry(NodeKey::Inf).or_default()
	}

	/// The identifier of the first entry greater than or equal to `key`
	pub(crate) fn lower_bound(&self, key: &str) -> Option<NodeKey> {
		self.entries.range(NodeKey::Key(key.to_owned())..).next().map(|(k, _)| k.clone())
	}

	pub(crate) fn last_real_key(&self) -> Option<&str> {
		self.entries.keys().rev().find_map(|k| k.as_key())
	}

	/// Splice the two-entry node produced by a child's split into this
	/// node. The lower entry takes its place under the median key; the
	/// upper entry's subtree replaces the child we descended into.
	pub(crate) fn splice(&mut self, at: NodeKey, two: Node) -> Result<(), Error> {
		let mut halves = two.entries.into_iter();
		let (median, lower) = halves.next().ok_or(Error::Unreachable("Node::splice"))?;
		let (_, upper) = halves.next().ok_or(Error::Unreachable("Node::splice"))?;
		let slot = self.entries.get_mut(&at).ok_or(Error::Unreachable("Node::splice"))?;
		slot.child = upper.child;
		slot.child_node = upper.child_node;
		self.entries.insert(median, lower);
		Ok(())
	}

	/// Partition an oversized node around its median key.
	///
	/// Returns a synthetic two-entry node: the median entry owning the
	/// left half, and a sentinel entry owning the right half. The caller
	/// splices it into the parent, or promotes it to the new root.
	pub(crate) fn split(&mut self, max_node_size: usize) -> Option<Node> {
		if self.size() <= max_node_size {
			return None;
		}
		let median = self.size() / 2;
		let mut left = Node::default();
		let mut right = Node::default();
		let mut median_entry = None;
		for (i, (k, e)) in mem::take(&mut self.entries).into_iter().enumerate() {
			match i.cmp(&median) {
				std::cmp::Ordering::Less => {
					left.entries.insert(k, e);
				}
				std::cmp::Ordering::Equal => median_entry = Some((k, e)),
				std::cmp::Ordering::Greater => {
					right.entries.insert(k, e);
				}
			}
		}
		debug_assert!(median_entry.is_some());
		let (k, mut e) = median_entry?;
		// The median's own subtree holds keys below it, so it becomes the
		// rightmost subtree of the left half.
		if e.child.is_some() || e.child_node.is_some() {
			let inf = left.inf_entry();
			inf.child = e.child.take();
			inf.child_node = e.child_node.take();
		}
		e.child = None;
		e.child_node = Some(Box::new(left));
		let mut parent = Node::default();
		parent.entries.insert(k, e);
		parent.inf_entry().child_node = Some(Box::new(right));
		Some(parent)
	}

	/// The number of nodes of this subtree held in memory
	pub(crate) fn local_count(&self) -> usize {
		1 + self
			.entries
			.values()
			.filter_map(|e| e.child_node.as_ref())
			.map(|n| n.local_count())
			.sum::<usize>()
	}

	#[cfg(debug_assertions)]
	fn min_max_depth(&self) -> (usize, usize) {
		let mut depth = None;
		for e in self.entries.values() {
			if let Some(child) = &e.child_node {
				let (cmin, cmax) = child.min_max_depth();
				let (min, max) = depth.unwrap_or((usize::MAX, 0));
				depth = Some((min.min(cmin + 1), max.max(cmax + 1)));
			}
		}
		depth.unwrap_or((1, 1))
	}

	#[cfg(debug_assertions)]
	pub(crate) fn check_invariants(&self, max_node_size: usize) -> bool {
		if self.size() > max_node_size {
			return false;
		}
		let (min, max) = self.min_max_depth();
		if min != max {
			return false;
		}
		for (k, e) in &self.entries {
			let Some(child) = &e.child_node else {
				continue;
			};
			for ck in child.entries.keys() {
				let Some(ck) = ck.as_key() else {
					continue;
				};
				match k.as_key() {
					// Keys below a real key must stay below it.
					Some(k) => {
						if ck >= k {
							return false;
						}
					}
					// Keys below the sentinel sit at or above every
					// real key of this node.
					None => {
						if let Some(last) = self.last_real_key() {
							if ck < last {
								return false;
							}
						}
					}
				}
			}
			if !child.check_invariants(max_node_size) {
				return false;
			}
		}
		true
	}

	/// Serialize this node for the object store. Every materialized
	/// subtree must already have its hash recorded.
	pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, Error> {
		for (k, e) in &self.entries {
			if e.child_node.is_some() && e.child.is_none() {
				return Err(Error::Unreachable("Node::to_bytes"));
			}
			if k.as_key().is_some() && e.value.is_none() {
				return Err(Error::Unreachable("Node::to_bytes"));
			}
		}
		Ok(serde_json::to_vec(self)?)
	}

	pub(crate) fn try_from_bytes(bytes: &[u8]) -> Result<Self, Error> {
		serde_json::from_slice(bytes).map_err(|e| Error::InvalidDbFormat(e.to_string()))
	}

	fn fmt_at(&self, f: &mut Formatter<'_>, depth: usize) -> fmt::Result {
		for (k, e) in &self.entries {
			writeln!(f, "{:indent$}{k}", "", indent = 2 * depth)?;
			if let Some(child) = &e.child_node {
				child.fmt_at(f, depth + 1)?;
			}
		}
		Ok(())
	}
}

impl Display for Node {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		self.fmt_at(f, 0)
	}
}

#[derive(Serialize)]
struct WireEntry<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	value: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	child: Option<&'a Cid>,
}

#[derive(Deserialize)]
struct OwnedWireEntry {
	#[serde(default)]
	value: Option<String>,
	#[serde(default)]
	child: Option<Cid>,
}

impl Serialize for Node {
	/// Nodes serialize as a JSON object in entry order, which puts the
	/// sentinel's `""` key last. The order is part of the wire format:
	/// identical trees must serialize to identical bytes so that they
	/// hash to identical content identifiers.
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		let mut map = serializer.serialize_map(Some(self.entries.len()))?;
		for (k, e) in &self.entries {
			let wire = WireEntry {
				value: e.value.as_deref(),
				child: e.child.as_ref(),
			};
			map.serialize_entry(k.as_key().unwrap_or(""), &wire)?;
		}
		map.end()
	}
}

impl<'de> Deserialize<'de> for Node {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		struct NodeVisitor;

		impl<'de> Visitor<'de> for NodeVisitor {
			type Value = Node;

			fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
				f.write_str("a map of entry keys to `{value, child}` objects")
			}

			fn visit_map<A>(self, mut access: A) -> Result<Node, A::Error>
			where
				A: MapAccess<'de>,
			{
				use serde::de::Error as _;
				let mut node = Node::default();
				while let Some((key, wire)) = access.next_entry::<String, OwnedWireEntry>()? {
					let id = if key.is_empty() {
						if wire.value.is_some() {
							return Err(A::Error::custom("sentinel entry carries a value"));
						}
						NodeKey::Inf
					} else {
						if wire.value.is_none() {
							return Err(A::Error::custom(format!("entry `{key}` has no value")));
						}
						NodeKey::Key(key)
					};
					let entry = Entry {
						value: wire.value,
						child: wire.child,
						child_node: None,
					};
					node.entries.insert(id, entry);
				}
				Ok(node)
			}
		}

		deserializer.deserialize_map(NodeVisitor)
	}
}
