//! Process-wide mountgroup registry.
//!
//! One explicit object owned by the daemon's dispatch loop and passed by
//! reference wherever mountgroup state is needed; there are no
//! package-level singletons.

use {crate::group::Mountgroup, std::collections::BTreeMap};

#[derive(Default)]
pub struct Registry {
	groups: BTreeMap<String, Mountgroup>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.groups.contains_key(name)
	}

	/// Inserts a new mountgroup, returning it back if the name is taken.
	pub fn insert(&mut self, group: Mountgroup) -> Result<(), Mountgroup> {
		if self.groups.contains_key(group.name()) {
			return Err(group);
		}
		self.groups.insert(group.name().to_string(), group);
		Ok(())
	}

	pub fn get(&self, name: &str) -> Option<&Mountgroup> {
		self.groups.get(name)
	}

	pub fn get_mut(&mut self, name: &str) -> Option<&mut Mountgroup> {
		self.groups.get_mut(name)
	}

	pub fn remove(&mut self, name: &str) -> Option<Mountgroup> {
		self.groups.remove(name)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Mountgroup> {
		self.groups.values()
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.groups.keys().map(String::as_str)
	}

	pub fn is_empty(&self) -> bool {
		self.groups.is_empty()
	}
}
