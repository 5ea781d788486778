//! Catalogue of registered status notifier items.
//!
//! A fixed-capacity slot table keyed by bus service name. Removed slots
//! become tombstones that later registrations reuse; the high-water mark
//! only ever grows, and every lookup is a linear scan over the prefix up
//! to it. Slot order is also the order `RegisteredStatusNotifierItems`
//! reports.

use x11rb::protocol::xproto::{Gcontext, Pixmap, Window};

use crate::error::CatalogueError;

pub const CAPACITY: usize = 64;

/// The native window an icon is docked through, with its bound graphics
/// context. Created and destroyed as a pair.
#[derive(Debug, Clone, Copy)]
pub struct Surface {
    pub window: Window,
    pub gc: Gcontext,
}

/// A server-side pixmap holding the scaled icon image. Width and height
/// are the scaled dimensions, both non-zero.
#[derive(Debug, Clone, Copy)]
pub struct ScaledPixmap {
    pub pixmap: Pixmap,
    pub width: u16,
    pub height: u16,
}

/// One registered icon publisher.
#[derive(Debug)]
pub struct Icon {
    pub service: String,
    pub path: String,
    pub surface: Option<Surface>,
    pub pixmap: Option<ScaledPixmap>,
}

impl Icon {
    /// The service+path string advertised in registration signals and in
    /// the `RegisteredStatusNotifierItems` property.
    pub fn full_name(&self) -> String {
        format!("{}{}", self.service, self.path)
    }
}

#[derive(Debug)]
pub struct Catalogue {
    slots: Vec<Option<Icon>>,
    high_water: usize,
}

impl Catalogue {
    pub fn new() -> Self {
        Catalogue {
            slots: (0..CAPACITY).map(|_| None).collect(),
            high_water: 0,
        }
    }

    /// Register a service at the lowest empty slot. The new icon owns no
    /// display resources yet.
    pub fn insert(&mut self, service: &str, path: &str) -> Result<&mut Icon, CatalogueError> {
        if self.find_by_service(service).is_some() {
            return Err(CatalogueError::AlreadyPresent);
        }
        let index = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(CatalogueError::CapacityExceeded)?;
        if index >= self.high_water {
            self.high_water = index + 1;
        }
        Ok(self.slots[index].insert(Icon {
            service: service.to_owned(),
            path: path.to_owned(),
            surface: None,
            pixmap: None,
        }))
    }

    pub fn find_by_service(&mut self, service: &str) -> Option<&mut Icon> {
        self.slots[..self.high_water]
            .iter_mut()
            .flatten()
            .find(|icon| icon.service == service)
    }

    pub fn find_by_window(&mut self, window: Window) -> Option<&mut Icon> {
        self.slots[..self.high_water]
            .iter_mut()
            .flatten()
            .find(|icon| icon.surface.is_some_and(|s| s.window == window))
    }

    /// Tombstone the service's slot and hand the icon back so the caller
    /// can release its display resources. The high-water mark stays.
    pub fn remove(&mut self, service: &str) -> Option<Icon> {
        self.slots[..self.high_water]
            .iter_mut()
            .find(|slot| {
                slot.as_ref()
                    .is_some_and(|icon| icon.service == service)
            })
            .and_then(Option::take)
    }

    /// Present icons in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Icon> {
        self.slots[..self.high_water].iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Icon> {
        self.slots[..self.high_water].iter_mut().flatten()
    }

    /// Drain every present icon, emptying the catalogue.
    pub fn drain(&mut self) -> Vec<Icon> {
        self.slots[..self.high_water]
            .iter_mut()
            .filter_map(Option::take)
            .collect()
    }

    /// service+path for every present icon, in slot order.
    pub fn registered_names(&self) -> Vec<String> {
        self.iter().map(Icon::full_name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_round_trips() {
        let mut cat = Catalogue::new();
        cat.insert(":1.42", "/StatusNotifierItem").unwrap();
        assert_eq!(
            cat.registered_names(),
            vec![":1.42/StatusNotifierItem".to_owned()]
        );
        assert!(cat.find_by_service(":1.42").is_some());
        assert!(cat.find_by_service(":1.43").is_none());
    }

    #[test]
    fn duplicate_insert_leaves_catalogue_unchanged() {
        let mut cat = Catalogue::new();
        cat.insert(":1.42", "/StatusNotifierItem").unwrap();
        let err = cat.insert(":1.42", "/Other").unwrap_err();
        assert_eq!(err, CatalogueError::AlreadyPresent);
        assert_eq!(cat.registered_names().len(), 1);
        assert_eq!(cat.find_by_service(":1.42").unwrap().path, "/StatusNotifierItem");
    }

    #[test]
    fn insert_fails_when_full() {
        let mut cat = Catalogue::new();
        for i in 0..CAPACITY {
            cat.insert(&format!(":1.{i}"), "/StatusNotifierItem").unwrap();
        }
        let err = cat.insert(":2.0", "/StatusNotifierItem").unwrap_err();
        assert_eq!(err, CatalogueError::CapacityExceeded);
    }

    #[test]
    fn removed_slot_is_reused_at_lowest_index() {
        let mut cat = Catalogue::new();
        cat.insert(":1.1", "/StatusNotifierItem").unwrap();
        cat.insert(":1.2", "/StatusNotifierItem").unwrap();
        cat.insert(":1.3", "/StatusNotifierItem").unwrap();
        assert!(cat.remove(":1.2").is_some());
        cat.insert(":1.4", "/StatusNotifierItem").unwrap();
        // :1.4 fills the tombstone, so it reports between :1.1 and :1.3.
        assert_eq!(
            cat.registered_names(),
            vec![
                ":1.1/StatusNotifierItem".to_owned(),
                ":1.4/StatusNotifierItem".to_owned(),
                ":1.3/StatusNotifierItem".to_owned(),
            ]
        );
    }

    #[test]
    fn remove_returns_owned_resources() {
        let mut cat = Catalogue::new();
        let icon = cat.insert(":1.1", "/StatusNotifierItem").unwrap();
        icon.surface = Some(Surface { window: 7, gc: 8 });
        icon.pixmap = Some(ScaledPixmap {
            pixmap: 9,
            width: 16,
            height: 16,
        });
        let removed = cat.remove(":1.1").unwrap();
        assert_eq!(removed.surface.unwrap().window, 7);
        assert_eq!(removed.pixmap.unwrap().pixmap, 9);
        assert!(cat.is_empty());
        assert!(cat.remove(":1.1").is_none());
    }

    #[test]
    fn find_by_window_scans_present_slots() {
        let mut cat = Catalogue::new();
        cat.insert(":1.1", "/StatusNotifierItem").unwrap();
        let icon = cat.insert(":1.2", "/StatusNotifierItem").unwrap();
        icon.surface = Some(Surface { window: 31, gc: 32 });
        assert_eq!(cat.find_by_window(31).unwrap().service, ":1.2");
        assert!(cat.find_by_window(99).is_none());
    }

    #[test]
    fn registrations_minus_vanished_owners() {
        let mut cat = Catalogue::new();
        for svc in [":1.1", ":1.2", ":1.3"] {
            cat.insert(svc, "/StatusNotifierItem").unwrap();
        }
        cat.remove(":1.1");
        cat.remove(":1.3");
        assert_eq!(
            cat.registered_names(),
            vec![":1.2/StatusNotifierItem".to_owned()]
        );
        cat.remove(":1.2");
        assert!(cat.is_empty());
    }
}
