//! Table of connected devices.
//!
//! Map operations take the registry lock for their whole duration; removed
//! devices are asked to close after it is released. Callbacks passed to
//! [`Registry::visit`] run under the read lock and must not call back into
//! the registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::measures::Measures;
use super::{Device, DeviceError, DeviceId};

pub struct Registry {
    limit: usize,
    devices: RwLock<HashMap<DeviceId, Arc<Device>>>,
    measures: Measures,
}

impl Registry {
    /// Create a registry. A `limit` of 0 means unbounded.
    pub fn new(limit: usize, measures: Measures) -> Self {
        Self {
            limit,
            devices: RwLock::new(HashMap::new()),
            measures,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn add(&self, device: Arc<Device>) -> Result<(), DeviceError> {
        let mut devices = self.devices.write();
        if devices.contains_key(device.id()) {
            self.measures.duplicates.inc();
            return Err(DeviceError::DuplicateId(device.id().to_string()));
        }
        if self.limit > 0 && devices.len() >= self.limit {
            self.measures.limit_reached.inc();
            return Err(DeviceError::CapacityExceeded { limit: self.limit });
        }
        devices.insert(device.id().clone(), device);
        self.measures.device.set(devices.len() as i64);
        Ok(())
    }

    /// Remove the device registered under `id` and ask it to close.
    pub fn remove(&self, id: &DeviceId) -> Option<Arc<Device>> {
        let removed = {
            let mut devices = self.devices.write();
            let removed = devices.remove(id);
            self.measures.device.set(devices.len() as i64);
            removed
        };
        if let Some(device) = &removed {
            device.request_close();
        }
        removed
    }

    /// Remove `device` only if it is the connection currently registered
    /// under its id. A newer connection with the same id is left in place.
    pub fn remove_device(&self, device: &Arc<Device>) -> bool {
        let mut devices = self.devices.write();
        match devices.get(device.id()) {
            Some(current) if Arc::ptr_eq(current, device) => {
                devices.remove(device.id());
                self.measures.device.set(devices.len() as i64);
                true
            }
            _ => false,
        }
    }

    /// Remove every device whose id matches `predicate` and ask each to
    /// close, returning how many were removed. The closes happen after the
    /// lock is released.
    pub fn remove_if(&self, predicate: impl Fn(&DeviceId) -> bool) -> usize {
        let removed: Vec<_> = {
            let mut devices = self.devices.write();
            let ids: Vec<DeviceId> = devices.keys().filter(|id| predicate(id)).cloned().collect();
            let removed: Vec<Arc<Device>> =
                ids.iter().filter_map(|id| devices.remove(id)).collect();
            self.measures.device.set(devices.len() as i64);
            removed
        };
        for device in &removed {
            device.request_close();
        }
        removed.len()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.devices.read().get(id).cloned()
    }

    /// Apply `visitor` to every device, returning how many were visited.
    pub fn visit(&self, mut visitor: impl FnMut(&Arc<Device>)) -> usize {
        let devices = self.devices.read();
        for device in devices.values() {
            visitor(device);
        }
        devices.len()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    fn registry(limit: usize) -> (Registry, Measures) {
        let measures = Measures::new(&MetricsRegistry::new());
        (Registry::new(limit, measures.clone()), measures)
    }

    fn device(id: &str) -> Arc<Device> {
        Device::new(DeviceId::parse(id).unwrap(), None, 1).0
    }

    #[test]
    fn test_add_get_remove() {
        let (registry, measures) = registry(0);
        let d = device("mac:112233445566");
        registry.add(d.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(measures.device.get(), 1);
        assert!(Arc::ptr_eq(&registry.get(d.id()).unwrap(), &d));

        let removed = registry.remove(d.id()).unwrap();
        assert!(Arc::ptr_eq(&removed, &d));
        assert!(d.closed());
        assert!(registry.remove(d.id()).is_none());
        assert_eq!(measures.device.get(), 0);
    }

    #[test]
    fn test_capacity() {
        let (registry, measures) = registry(2);
        registry.add(device("dns:a")).unwrap();
        registry.add(device("dns:b")).unwrap();
        assert_eq!(
            registry.add(device("dns:c")),
            Err(DeviceError::CapacityExceeded { limit: 2 })
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(measures.limit_reached.get(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let (registry, measures) = registry(0);
        let first = device("dns:a");
        registry.add(first.clone()).unwrap();
        assert!(matches!(
            registry.add(device("dns:a")),
            Err(DeviceError::DuplicateId(_))
        ));
        assert!(Arc::ptr_eq(&registry.get(first.id()).unwrap(), &first));
        assert_eq!(measures.duplicates.get(), 1);
    }

    #[test]
    fn test_duplicate_reported_before_capacity() {
        let (registry, _) = registry(1);
        registry.add(device("dns:a")).unwrap();
        assert!(matches!(
            registry.add(device("dns:a")),
            Err(DeviceError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_remove_device_ignores_newer_connection() {
        let (registry, _) = registry(0);
        let stale = device("dns:a");
        let current = device("dns:a");
        registry.add(current.clone()).unwrap();
        assert!(!registry.remove_device(&stale));
        assert!(registry.remove_device(&current));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_and_visit() {
        let (registry, _) = registry(0);
        for id in ["dns:keep-1", "dns:drop-1", "dns:drop-2", "dns:keep-2"] {
            registry.add(device(id)).unwrap();
        }
        let removed = registry.remove_if(|id| id.as_str().contains("drop"));
        assert_eq!(removed, 2);

        let mut seen = Vec::new();
        let count = registry.visit(|d| seen.push(d.id().to_string()));
        seen.sort();
        assert_eq!(count, 2);
        assert_eq!(seen, vec!["dns:keep-1", "dns:keep-2"]);
    }

    #[test]
    fn test_limit_never_exceeded_under_churn() {
        let (registry, _) = registry(3);
        for round in 0..50 {
            for i in 0..5 {
                let _ = registry.add(device(&format!("dns:{}", (round + i) % 7)));
            }
            assert!(registry.len() <= 3);
            if round % 3 == 0 {
                registry.remove_if(|id| id.as_str().ends_with(&(round % 7).to_string()));
            } else {
                registry.remove(&DeviceId::parse(&format!("dns:{}", round % 7)).unwrap());
            }
            assert!(registry.len() <= 3);
        }
    }
}
