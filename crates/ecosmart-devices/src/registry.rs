//! Device registry.
//!
//! Devices live in an arena addressed by their stable id. The registry is
//! split in two capabilities:
//! - [`RegistryWriter`]: the single write handle, owned by the controller
//! - [`RegistryView`]: cloneable read access that only hands out copies
//!
//! Nobody outside the registry ever holds a reference into the arena, so
//! readers cannot observe a torn write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ecosmart_core::{Device, Error, Result};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Arena {
    devices: Vec<Device>,
    index: HashMap<String, usize>,
}

impl Arena {
    fn slot(&self, device_id: &str) -> Option<usize> {
        self.index.get(device_id).copied()
    }
}

/// Build a registry from configuration. Ids must be unique.
pub fn registry(devices: Vec<Device>) -> Result<(RegistryWriter, RegistryView)> {
    let mut arena = Arena::default();
    for device in devices {
        device.validate()?;
        if arena.index.contains_key(&device.id) {
            return Err(Error::config(format!("duplicate device id {}", device.id)));
        }
        arena.index.insert(device.id.clone(), arena.devices.len());
        arena.devices.push(device);
    }
    let inner = Arc::new(RwLock::new(arena));
    Ok((
        RegistryWriter {
            inner: inner.clone(),
        },
        RegistryView { inner },
    ))
}

/// Read-only access to device records.
#[derive(Debug, Clone)]
pub struct RegistryView {
    inner: Arc<RwLock<Arena>>,
}

impl RegistryView {
    /// Point-in-time copy of every device, in registration order.
    pub fn snapshot(&self) -> Vec<Device> {
        self.inner.read().devices.clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        let arena = self.inner.read();
        arena.slot(device_id).map(|slot| arena.devices[slot].clone())
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.inner.read().index.contains_key(device_id)
    }

    pub fn is_on(&self, device_id: &str) -> Option<bool> {
        let arena = self.inner.read();
        arena.slot(device_id).map(|slot| arena.devices[slot].is_on)
    }

    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().devices.is_empty()
    }

    /// Devices matching `filter`, copied.
    pub fn select(&self, filter: impl Fn(&Device) -> bool) -> Vec<Device> {
        self.inner
            .read()
            .devices
            .iter()
            .filter(|d| filter(d))
            .cloned()
            .collect()
    }
}

/// Exclusive write handle. Deliberately not `Clone`.
#[derive(Debug)]
pub struct RegistryWriter {
    inner: Arc<RwLock<Arena>>,
}

impl RegistryWriter {
    pub fn view(&self) -> RegistryView {
        RegistryView {
            inner: self.inner.clone(),
        }
    }

    /// Record a new power state. Returns whether the state changed.
    pub fn set_power_state(
        &mut self,
        device_id: &str,
        is_on: bool,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut arena = self.inner.write();
        let slot = arena
            .slot(device_id)
            .ok_or_else(|| Error::not_found(format!("device {device_id}")))?;
        let device = &mut arena.devices[slot];
        if device.is_on == is_on {
            return Ok(false);
        }
        device.is_on = is_on;
        device.last_changed = Some(at);
        tracing::debug!(device_id = %device_id, is_on, "device state updated");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecosmart_core::{Priority, UsagePattern};

    fn devices() -> Vec<Device> {
        vec![
            Device::new("washer", 800.0, Priority::Low, true, UsagePattern::Manual),
            Device::new("fridge", 150.0, Priority::Critical, false, UsagePattern::Constant)
                .with_state(true),
        ]
    }

    #[test]
    fn test_views_see_writer_updates_as_copies() {
        let (mut writer, view) = registry(devices()).unwrap();
        let before = view.get("washer").unwrap();
        assert!(!before.is_on);

        assert!(writer.set_power_state("washer", true, Utc::now()).unwrap());
        assert!(!writer.set_power_state("washer", true, Utc::now()).unwrap());

        // The earlier copy is unaffected.
        assert!(!before.is_on);
        assert_eq!(view.is_on("washer"), Some(true));
        assert!(view.get("washer").unwrap().last_changed.is_some());
    }

    #[test]
    fn test_unknown_device() {
        let (mut writer, view) = registry(devices()).unwrap();
        assert!(view.get("oven").is_none());
        assert!(matches!(
            writer.set_power_state("oven", true, Utc::now()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut list = devices();
        list.push(list[0].clone());
        assert!(registry(list).is_err());
    }

    #[test]
    fn test_snapshot_order_and_select() {
        let (writer, view) = registry(devices()).unwrap();
        let ids: Vec<_> = view.snapshot().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["washer", "fridge"]);
        assert_eq!(view.select(|d| d.is_critical()).len(), 1);
        assert_eq!(writer.view().len(), 2);
    }
}
