//! Resource-type name resolution cache.
//!
//! The data model treats resources as generic JSON, so there is no class to look up; what
//! still needs caching is the cheap validation that a type name is well-formed, so repeated
//! calls with the same type name (the common case) skip re-validating it.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{FHIRConnectionError, Result};

#[derive(Default, Debug)]
pub struct ResourceTypeRegistry {
	seen: Mutex<HashSet<String>>,
}

impl Clone for ResourceTypeRegistry {
	fn clone(&self) -> Self {
		let seen = self.seen.lock().expect("registry mutex poisoned");
		Self { seen: Mutex::new(seen.clone()) }
	}
}

impl ResourceTypeRegistry {
	/// Validate (once per distinct name) that `type_name` looks like a FHIR resource type
	/// name, and return it back unchanged.
	pub fn resolve<'a>(&self, type_name: &'a str) -> Result<&'a str> {
		{
			let seen = self.seen.lock().expect("registry mutex poisoned");
			if seen.contains(type_name) {
				return Ok(type_name);
			}
		}
		if type_name.is_empty() || !type_name.chars().next().is_some_and(char::is_uppercase) {
			return Err(FHIRConnectionError::config_invalid(format!(
				"`{type_name}` is not a valid FHIR resource type name"
			)));
		}
		self.seen.lock().expect("registry mutex poisoned").insert(type_name.to_string());
		Ok(type_name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_and_caches_valid_type_name() {
		let registry = ResourceTypeRegistry::default();
		assert_eq!(registry.resolve("Patient").unwrap(), "Patient");
		assert_eq!(registry.resolve("Patient").unwrap(), "Patient");
	}

	#[test]
	fn rejects_lowercase_type_name() {
		let registry = ResourceTypeRegistry::default();
		assert!(registry.resolve("patient").is_err());
	}
}
