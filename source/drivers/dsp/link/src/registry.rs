// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Owned table of live links keyed by `(processor, link)`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{FirstError, LinkError, Result};
use crate::link::Link;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    pub processor: u16,
    pub link: u16,
}

impl LinkKey {
    pub const fn new(processor: u16, link: u16) -> Self {
        Self { processor, link }
    }

    pub fn of(link: &Link) -> Self {
        Self::new(link.config().processor_id, link.config().link_id)
    }
}

#[derive(Default)]
pub struct LinkRegistry {
    links: Mutex<BTreeMap<LinkKey, Arc<Link>>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_link(&self, link: Arc<Link>) -> Result<LinkKey> {
        let key = LinkKey::of(&link);
        let mut links = self.links.lock();
        if links.contains_key(&key) {
            return Err(LinkError::InvalidState("link already registered"));
        }
        links.insert(key, link);
        log::debug!("registry: link {}.{} registered", key.processor, key.link);
        Ok(key)
    }

    /// Removes the link from the table; the caller decides when to finalize it.
    pub fn unregister_link(&self, key: LinkKey) -> Result<Arc<Link>> {
        self.links.lock().remove(&key).ok_or(LinkError::NotFound)
    }

    pub fn get(&self, key: LinkKey) -> Result<Arc<Link>> {
        self.links.lock().get(&key).cloned().ok_or(LinkError::NotFound)
    }

    pub fn keys(&self) -> Vec<LinkKey> {
        self.links.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }

    /// Unregisters and finalizes every link.
    pub fn finalize_all(&self) -> Result<()> {
        let links = std::mem::take(&mut *self.links.lock());
        let mut errs = FirstError::new();
        for link in links.into_values() {
            errs.record("link finalize", link.finalize());
        }
        errs.finish()
    }
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::host::SimBoard;
    use crate::link::LinkState;

    fn link(processor: u16) -> (SimBoard, Arc<Link>) {
        let cfg = LinkConfig::shm(processor, 4);
        let board = SimBoard::new(&cfg);
        let link = Link::initialize(cfg, board.resources()).unwrap();
        (board, link)
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = LinkRegistry::new();
        let (_b0, l0) = link(0);
        let (_b1, l1) = link(1);
        let k0 = registry.register_link(l0.clone()).unwrap();
        registry.register_link(l1).unwrap();
        assert!(matches!(registry.register_link(l0.clone()), Err(LinkError::InvalidState(_))));
        assert_eq!(registry.keys(), [LinkKey::new(0, 0), LinkKey::new(1, 0)]);
        assert!(Arc::ptr_eq(&registry.get(k0).unwrap(), &l0));

        let removed = registry.unregister_link(k0).unwrap();
        assert_eq!(removed.state(), LinkState::Initialized);
        assert!(matches!(registry.get(k0), Err(LinkError::NotFound)));
        assert!(matches!(registry.unregister_link(k0), Err(LinkError::NotFound)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn finalize_all_empties_the_table() {
        let registry = LinkRegistry::new();
        let (_board, l0) = link(2);
        registry.register_link(l0.clone()).unwrap();
        registry.finalize_all().unwrap();
        assert!(registry.is_empty());
        assert_eq!(l0.state(), LinkState::Finalized);
    }
}
