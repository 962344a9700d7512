//! Stable `device_id` <-> `slot` mapping across transports and reconnects
//! (spec.md sections 3 and 4.12).
//!
//! Grounded on the same mutex-guarded-map-with-short-critical-sections
//! discipline spec.md section 5 calls for; there's no teacher precedent for
//! device/slot allocation specifically (the teacher is a single-session RTSP
//! client), so the lock shape follows `EventBus`'s `Mutex<Topics>` above.

use std::collections::HashMap;
use std::sync::Mutex;

pub type DeviceId = u64;
pub type Slot = u16;

#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: DeviceId,
    pub slot: Slot,
    pub fingerprint: String,
    pub label: String,
}

struct Inner {
    by_fingerprint: HashMap<String, DeviceId>,
    by_id: HashMap<DeviceId, Device>,
    used_slots: Vec<bool>,
    next_device_id: DeviceId,
}

impl Inner {
    fn lowest_free_slot(&mut self) -> Slot {
        if let Some(idx) = self.used_slots.iter().position(|used| !used) {
            self.used_slots[idx] = true;
            return idx as Slot;
        }
        self.used_slots.push(true);
        (self.used_slots.len() - 1) as Slot
    }
}

/// Created on first successful handshake on any transport; a `Device`
/// destroyed only by explicit `unregister`, never by transient disconnect
/// (spec.md section 3).
pub struct DeviceRegistry {
    inner: Mutex<Inner>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            inner: Mutex::new(Inner {
                by_fingerprint: HashMap::new(),
                by_id: HashMap::new(),
                used_slots: Vec::new(),
                next_device_id: 1,
            }),
        }
    }

    /// Returns the existing `(device_id, slot)` for `fingerprint` if one was
    /// already registered this process lifetime; otherwise allocates the
    /// lowest free slot and a fresh `device_id`.
    pub fn register_by_fingerprint(&self, fingerprint: &str, label: &str) -> (DeviceId, Slot) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(&device_id) = inner.by_fingerprint.get(fingerprint) {
            let slot = inner.by_id[&device_id].slot;
            return (device_id, slot);
        }
        let device_id = inner.next_device_id;
        inner.next_device_id += 1;
        let slot = inner.lowest_free_slot();
        inner.by_fingerprint.insert(fingerprint.to_string(), device_id);
        inner.by_id.insert(
            device_id,
            Device {
                device_id,
                slot,
                fingerprint: fingerprint.to_string(),
                label: label.to_string(),
            },
        );
        (device_id, slot)
    }

    pub fn unregister(&self, device_id: DeviceId) -> Option<Device> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let device = inner.by_id.remove(&device_id)?;
        inner.by_fingerprint.remove(&device.fingerprint);
        if let Some(used) = inner.used_slots.get_mut(device.slot as usize) {
            *used = false;
        }
        Some(device)
    }

    pub fn all_devices(&self) -> Vec<Device> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        let mut devices: Vec<Device> = inner.by_id.values().cloned().collect();
        devices.sort_by_key(|d| d.slot);
        devices
    }

    pub fn get(&self, device_id: DeviceId) -> Option<Device> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_id.get(&device_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_fingerprint_returns_same_mapping() {
        let reg = DeviceRegistry::new();
        let (id1, slot1) = reg.register_by_fingerprint("aa:bb", "phone-a");
        let (id2, slot2) = reg.register_by_fingerprint("aa:bb", "phone-a");
        assert_eq!(id1, id2);
        assert_eq!(slot1, slot2);
    }

    #[test]
    fn distinct_fingerprints_get_distinct_slots() {
        let reg = DeviceRegistry::new();
        let (_, slot1) = reg.register_by_fingerprint("aa:bb", "a");
        let (_, slot2) = reg.register_by_fingerprint("cc:dd", "b");
        assert_ne!(slot1, slot2);
    }

    #[test]
    fn unregister_frees_the_slot_for_reuse() {
        let reg = DeviceRegistry::new();
        let (id1, slot1) = reg.register_by_fingerprint("aa:bb", "a");
        reg.unregister(id1);
        let (id2, slot2) = reg.register_by_fingerprint("cc:dd", "b");
        assert_ne!(id1, id2);
        assert_eq!(slot1, slot2);
    }

    #[test]
    fn all_devices_sorted_by_slot() {
        let reg = DeviceRegistry::new();
        reg.register_by_fingerprint("z", "z");
        reg.register_by_fingerprint("a", "a");
        let devices = reg.all_devices();
        assert_eq!(devices[0].slot, 0);
        assert_eq!(devices[1].slot, 1);
    }
}
