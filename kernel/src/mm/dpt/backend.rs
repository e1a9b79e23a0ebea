//! Backend page tracker
//!
//! Records the physical pages a decorated page table allocated for its own
//! intermediate tables, with the level each page serves. Pages referenced
//! from the table but owned by the source page table are never recorded
//! here, which is how the walkers tell "ours to modify and free" from
//! "shared, read-only".

extern crate alloc;

use alloc::{collections::BTreeMap, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    mm::{page_table::PageTableLevel, PhysicalAddress},
};

/// Physical pages owned by one decorated page table
#[derive(Debug, Default)]
pub struct BackendPages {
    pages: BTreeMap<u64, PageTableLevel>,
}

impl BackendPages {
    pub const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Register `page` as a table of `level`
    pub fn add(&mut self, page: PhysicalAddress, level: PageTableLevel) -> KernelResult<()> {
        if page.is_null() || !page.is_page_aligned() {
            return Err(KernelError::InvalidArgument {
                name: "backend page",
                value: page.as_u64(),
            });
        }
        if self.pages.contains_key(&page.as_u64()) {
            return Err(KernelError::AlreadyOwned {
                addr: page.as_u64(),
            });
        }
        self.pages.insert(page.as_u64(), level);
        Ok(())
    }

    /// Forget `page`, returning the level it was registered with
    pub fn remove(&mut self, page: PhysicalAddress) -> Option<PageTableLevel> {
        self.pages.remove(&page.page_align_down().as_u64())
    }

    /// Whether the page containing `offset` is owned
    pub fn is_owned(&self, offset: PhysicalAddress) -> bool {
        self.pages.contains_key(&offset.page_align_down().as_u64())
    }

    pub fn level(&self, page: PhysicalAddress) -> Option<PageTableLevel> {
        self.pages.get(&page.page_align_down().as_u64()).copied()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Remove every page, handing them back for freeing
    pub fn drain(&mut self) -> Vec<(PhysicalAddress, PageTableLevel)> {
        let pages = core::mem::take(&mut self.pages);
        pages
            .into_iter()
            .map(|(addr, level)| (PhysicalAddress::new(addr), level))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() {
        let mut pages = BackendPages::new();
        pages
            .add(PhysicalAddress::new(0x20_0000), PageTableLevel::Pmd)
            .unwrap();
        assert!(pages.is_owned(PhysicalAddress::new(0x20_0000)));
        assert!(pages.is_owned(PhysicalAddress::new(0x20_0ff8)));
        assert!(!pages.is_owned(PhysicalAddress::new(0x20_1000)));
        assert_eq!(
            pages.level(PhysicalAddress::new(0x20_0010)),
            Some(PageTableLevel::Pmd)
        );
        assert_eq!(pages.len(), 1);
    }

    #[test]
    fn test_rejects_null_and_misaligned() {
        let mut pages = BackendPages::new();
        assert!(matches!(
            pages.add(PhysicalAddress::new(0), PageTableLevel::Pte),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            pages.add(PhysicalAddress::new(0x1008), PageTableLevel::Pte),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(pages.is_empty());
    }

    #[test]
    fn test_rejects_duplicate() {
        let mut pages = BackendPages::new();
        pages
            .add(PhysicalAddress::new(0x3000), PageTableLevel::Pte)
            .unwrap();
        assert_eq!(
            pages.add(PhysicalAddress::new(0x3000), PageTableLevel::Pmd),
            Err(KernelError::AlreadyOwned { addr: 0x3000 })
        );
    }

    #[test]
    fn test_drain() {
        let mut pages = BackendPages::new();
        pages
            .add(PhysicalAddress::new(0x3000), PageTableLevel::Pte)
            .unwrap();
        pages
            .add(PhysicalAddress::new(0x4000), PageTableLevel::Pud)
            .unwrap();
        let drained = pages.drain();
        assert_eq!(drained.len(), 2);
        assert!(pages.is_empty());
        assert_eq!(pages.remove(PhysicalAddress::new(0x3000)), None);
    }
}
