//! Bidirectional peer-id / holon-name registry.
//!
//! At most one name per peer; a name may be claimed by several peers, kept
//! in insertion order. Resolution always returns the first registrant other
//! than the caller. There is no load balancing; a round-robin policy would
//! belong in a dispatcher variant, not here.

use std::collections::HashMap;

/// The broker's name book.
#[derive(Debug, Default)]
pub struct HolonRegistry {
    name_by_peer: HashMap<String, String>,
    peers_by_name: HashMap<String, Vec<String>>,
}

impl HolonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `peer_id` with the trimmed `name`.
    ///
    /// Returns the stored name, or `None` when the trimmed name is empty.
    /// A peer re-registering under a different name is removed from the old
    /// name's set first; re-registering the same name keeps its position.
    pub fn register(&mut self, peer_id: &str, name: &str) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(previous) = self.name_by_peer.get(peer_id) {
            if previous == name {
                return Some(name.to_string());
            }
            let previous = previous.clone();
            self.remove_from_name(&previous, peer_id);
        }
        self.name_by_peer
            .insert(peer_id.to_string(), name.to_string());
        self.peers_by_name
            .entry(name.to_string())
            .or_default()
            .push(peer_id.to_string());
        Some(name.to_string())
    }

    /// Remove both directions for `peer_id`. No-op when unknown.
    pub fn deregister(&mut self, peer_id: &str) {
        if let Some(name) = self.name_by_peer.remove(peer_id) {
            self.remove_from_name(&name, peer_id);
        }
    }

    /// First peer registered under `name` whose id differs from `exclude`.
    pub fn resolve(&self, name: &str, exclude: &str) -> Option<String> {
        self.peers_by_name
            .get(name)?
            .iter()
            .find(|peer| peer.as_str() != exclude)
            .cloned()
    }

    /// Whether any peer is registered under `name`.
    pub fn contains_name(&self, name: &str) -> bool {
        self.peers_by_name.contains_key(name)
    }

    /// The name `peer_id` is registered under, if any.
    pub fn name_of(&self, peer_id: &str) -> Option<&str> {
        self.name_by_peer.get(peer_id).map(String::as_str)
    }

    fn remove_from_name(&mut self, name: &str, peer_id: &str) {
        if let Some(peers) = self.peers_by_name.get_mut(name) {
            peers.retain(|p| p != peer_id);
            if peers.is_empty() {
                self.peers_by_name.remove(name);
            }
        }
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward = self.name_by_peer.iter().all(|(peer, name)| {
            self.peers_by_name
                .get(name)
                .map(|peers| peers.iter().any(|p| p == peer))
                .unwrap_or(false)
        });
        let backward = self.peers_by_name.iter().all(|(name, peers)| {
            !peers.is_empty()
                && peers
                    .iter()
                    .all(|peer| self.name_by_peer.get(peer).map(String::as_str) == Some(name.as_str()))
        });
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HolonRegistry::new();
        assert_eq!(registry.register("c1", "compute"), Some("compute".into()));
        assert_eq!(registry.resolve("compute", "c9"), Some("c1".into()));
        assert_eq!(registry.name_of("c1"), Some("compute"));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_name_is_trimmed_and_non_empty() {
        let mut registry = HolonRegistry::new();
        assert_eq!(registry.register("c1", "  storage  "), Some("storage".into()));
        assert_eq!(registry.resolve("storage", ""), Some("c1".into()));
        assert_eq!(registry.register("c2", "   "), None);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_resolution_is_case_sensitive() {
        let mut registry = HolonRegistry::new();
        registry.register("c1", "Compute");
        assert_eq!(registry.resolve("compute", ""), None);
        assert_eq!(registry.resolve("Compute", ""), Some("c1".into()));
    }

    #[test]
    fn test_shared_name_keeps_insertion_order() {
        let mut registry = HolonRegistry::new();
        registry.register("c1", "worker");
        registry.register("c2", "worker");
        registry.register("c3", "worker");
        assert_eq!(registry.resolve("worker", ""), Some("c1".into()));
        // Resolution skips the excluded caller, not the head of the set.
        assert_eq!(registry.resolve("worker", "c1"), Some("c2".into()));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_caller_exclusion_can_empty_the_set() {
        let mut registry = HolonRegistry::new();
        registry.register("c1", "solo");
        assert_eq!(registry.resolve("solo", "c1"), None);
    }

    #[test]
    fn test_rename_moves_peer_between_names() {
        let mut registry = HolonRegistry::new();
        registry.register("c1", "alpha");
        registry.register("c2", "alpha");
        registry.register("c1", "beta");

        assert_eq!(registry.name_of("c1"), Some("beta"));
        assert_eq!(registry.resolve("alpha", ""), Some("c2".into()));
        assert_eq!(registry.resolve("beta", ""), Some("c1".into()));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let mut registry = HolonRegistry::new();
        registry.register("c1", "gone");
        registry.deregister("c1");
        registry.deregister("c1");
        registry.deregister("never-registered");
        assert!(!registry.contains_name("gone"));
        assert_eq!(registry.name_of("c1"), None);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_consistency_under_churn() {
        let mut registry = HolonRegistry::new();
        for round in 0..5 {
            for peer in 0..8 {
                let id = format!("c{}", peer);
                let name = format!("name{}", (peer + round) % 3);
                registry.register(&id, &name);
                assert!(registry.is_consistent(), "round {} peer {}", round, peer);
            }
            registry.deregister(&format!("c{}", round));
            assert!(registry.is_consistent(), "after deregister round {}", round);
        }
    }
}
