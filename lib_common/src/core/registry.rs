//! # Sensor Registry
//!
//! Catalogue of every sensor ever reported by a producer, plus the listener
//! relation (sensor identity → ordered listeners). Only the registry creates
//! sensors. Everything else gets a `SensorKey` back and reads snapshots.
//!
//! The registry lives on the reactor thread and is shared by `Rc`. Every
//! notification iterates a snapshot of the listener list taken before the
//! first callback runs, so a listener may add or remove listeners (itself
//! included) from inside `on_update` / `on_disconnected`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::sensor::{Sensor, SensorKey};

/// # Sensor Listener
///
/// Party interested in one sensor's stream.
pub trait SensorListener {
    /// A new measurement for `sensor` was recorded.
    fn on_update(&self, sensor: &Sensor);

    /// The producer feeding `sensor` went away.
    fn on_disconnected(&self, _sensor: &Sensor) {}
}

/// Handle returned by `add_listener`, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type AttachHook = Rc<dyn Fn(&Sensor)>;

struct ListenerEntry {
    id: ListenerId,
    listener: Rc<dyn SensorListener>,
}

/// # Sensor Registry
#[derive(Default)]
pub struct SensorRegistry {
    sensors: RefCell<Vec<Sensor>>,
    listeners: RefCell<HashMap<SensorKey, Vec<ListenerEntry>>>,
    attach_hooks: RefCell<Vec<AttachHook>>,
    next_listener_id: Cell<u64>,
}

impl SensorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a sensor by identity.
    pub fn find_sensor(&self, resource: &str, metric: &str) -> Option<Sensor> {
        self.sensors
            .borrow()
            .iter()
            .find(|s| s.key().matches(resource, metric))
            .cloned()
    }

    /// All resources with at least one sensor, in first-seen order.
    pub fn list_resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = Vec::new();
        for sensor in self.sensors.borrow().iter() {
            if !resources.iter().any(|r| r == sensor.resource()) {
                resources.push(sensor.resource().to_string());
            }
        }
        resources
    }

    /// All metrics reported for `resource`, in first-seen order.
    pub fn list_metrics(&self, resource: &str) -> Vec<String> {
        let mut metrics: Vec<String> = Vec::new();
        for sensor in self.sensors.borrow().iter() {
            if sensor.resource() == resource && !metrics.iter().any(|m| m == sensor.metric()) {
                metrics.push(sensor.metric().to_string());
            }
        }
        metrics
    }

    /// Snapshot of every known sensor, in creation order.
    pub fn sensors(&self) -> Vec<Sensor> {
        self.sensors.borrow().clone()
    }

    /// Number of known sensors.
    pub fn len(&self) -> usize {
        self.sensors.borrow().len()
    }

    /// True before the first producer message.
    pub fn is_empty(&self) -> bool {
        self.sensors.borrow().is_empty()
    }

    /// # Make Sensor
    ///
    /// Returns the key of the sensor named `resource` / `metric`, creating it
    /// on first use. Creating a sensor for an identity that already exists
    /// is impossible: the existing one is returned.
    pub fn make_sensor(&self, resource: &str, metric: &str) -> SensorKey {
        if let Some(existing) = self.find_sensor(resource, metric) {
            return existing.key().clone();
        }

        let key = SensorKey::new(resource, metric);
        self.sensors.borrow_mut().push(Sensor::new(key.clone()));
        log::info!("New sensor {}", key);
        key
    }

    /// # Update Measurement
    ///
    /// Overwrites the last measurement of `key` and invokes every listener
    /// of that sensor, in registration order, before returning. Returns
    /// `false` for an unknown key.
    pub fn update_measurement(&self, key: &SensorKey, value: f64) -> bool {
        let snapshot = {
            let mut sensors = self.sensors.borrow_mut();
            match sensors.iter_mut().find(|s| s.key() == key) {
                Some(sensor) => {
                    sensor.update_measurement(value);
                    sensor.clone()
                }
                None => return false,
            }
        };

        for listener in self.listeners_of(key) {
            listener.on_update(&snapshot);
        }
        true
    }

    /// Tells every listener of `key` that its producer disconnected.
    pub fn notify_disconnected(&self, key: &SensorKey) {
        let Some(snapshot) = self.find_sensor(key.resource(), key.metric()) else {
            return;
        };

        for listener in self.listeners_of(key) {
            listener.on_disconnected(&snapshot);
        }
    }

    /// Fires the producer-attached hooks for `key`. Called by the ingestion
    /// side when a connection establishes its sensor identity.
    pub fn notify_attached(&self, key: &SensorKey) {
        let Some(snapshot) = self.find_sensor(key.resource(), key.metric()) else {
            return;
        };

        let hooks: Vec<AttachHook> = self.attach_hooks.borrow().iter().map(Rc::clone).collect();
        for hook in hooks {
            hook(&snapshot);
        }
    }

    /// Registers a hook run every time a producer connection establishes its
    /// sensor (before that connection's first measurement is recorded).
    pub fn on_producer_attached<F>(&self, hook: F)
    where
        F: Fn(&Sensor) + 'static,
    {
        self.attach_hooks.borrow_mut().push(Rc::new(hook));
    }

    /// # Add Listener
    ///
    /// Appends `listener` to the listeners of `key`. The same listener may be
    /// registered on several sensors, one call per sensor.
    pub fn add_listener(&self, key: &SensorKey, listener: Rc<dyn SensorListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.get());
        self.next_listener_id.set(id.0 + 1);

        self.listeners
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .push(ListenerEntry { id, listener });
        id
    }

    /// Removes the listener registered as `id` on `key`. Returns whether it
    /// was present.
    pub fn remove_listener(&self, key: &SensorKey, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.borrow_mut();
            let Some(entries) = listeners.get_mut(key) else {
                return false;
            };
            let removed = entries
                .iter()
                .position(|e| e.id == id)
                .map(|index| entries.remove(index));
            if entries.is_empty() {
                listeners.remove(key);
            }
            removed
        };
        // The removed handle is dropped outside the borrow.
        removed.is_some()
    }

    /// Number of listeners currently registered on `key`.
    pub fn listener_count(&self, key: &SensorKey) -> usize {
        self.listeners.borrow().get(key).map_or(0, Vec::len)
    }

    fn listeners_of(&self, key: &SensorKey) -> Vec<Rc<dyn SensorListener>> {
        self.listeners
            .borrow()
            .get(key)
            .map(|entries| entries.iter().map(|e| Rc::clone(&e.listener)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        updates: RefCell<Vec<f64>>,
        disconnects: Cell<usize>,
    }

    impl SensorListener for Recorder {
        fn on_update(&self, sensor: &Sensor) {
            self.updates.borrow_mut().push(sensor.last_measurement());
        }

        fn on_disconnected(&self, _sensor: &Sensor) {
            self.disconnects.set(self.disconnects.get() + 1);
        }
    }

    #[test]
    fn test_make_sensor_creates_once_per_identity() {
        let registry = SensorRegistry::new();
        let a = registry.make_sensor("cpu", "usage");
        let b = registry.make_sensor(&String::from("cpu"), &String::from("usage"));

        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert!(registry.update_measurement(&b, 0.5));
        assert_eq!(registry.find_sensor("cpu", "usage").unwrap().last_measurement(), 0.5);
    }

    #[test]
    fn test_listing_is_unique_and_ordered() {
        let registry = SensorRegistry::new();
        registry.make_sensor("host-b", "mem");
        registry.make_sensor("host-a", "cpu");
        registry.make_sensor("host-b", "cpu");
        registry.make_sensor("host-b", "mem");

        assert_eq!(registry.list_resources(), vec!["host-b", "host-a"]);
        assert_eq!(registry.list_metrics("host-b"), vec!["mem", "cpu"]);
        assert!(registry.list_metrics("nope").is_empty());
        assert_eq!(registry.sensors().len(), 3);
        assert!(registry.find_sensor("host-a", "mem").is_none());
    }

    #[test]
    fn test_update_reaches_every_listener_once_in_order() {
        let registry = SensorRegistry::new();
        let key = registry.make_sensor("disk", "iops");
        let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

        struct Tagged(usize, Rc<RefCell<Vec<usize>>>);
        impl SensorListener for Tagged {
            fn on_update(&self, _sensor: &Sensor) {
                self.1.borrow_mut().push(self.0);
            }
        }

        for tag in 0..4 {
            registry.add_listener(&key, Rc::new(Tagged(tag, Rc::clone(&order))));
        }
        registry.update_measurement(&key, 1.0);

        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_update_does_not_reach_other_sensors() {
        let registry = SensorRegistry::new();
        let cpu = registry.make_sensor("h", "cpu");
        let mem = registry.make_sensor("h", "mem");
        let recorder = Rc::new(Recorder::default());
        registry.add_listener(&cpu, recorder.clone());

        registry.update_measurement(&mem, 3.0);
        assert!(recorder.updates.borrow().is_empty());
        registry.update_measurement(&cpu, 4.0);
        assert_eq!(*recorder.updates.borrow(), vec![4.0]);
    }

    #[test]
    fn test_remove_listener_and_disconnect() {
        let registry = SensorRegistry::new();
        let key = registry.make_sensor("h", "cpu");
        let kept = Rc::new(Recorder::default());
        let dropped = Rc::new(Recorder::default());
        registry.add_listener(&key, kept.clone());
        let id = registry.add_listener(&key, dropped.clone());

        assert!(registry.remove_listener(&key, id));
        assert!(!registry.remove_listener(&key, id));
        registry.notify_disconnected(&key);

        assert_eq!(kept.disconnects.get(), 1);
        assert_eq!(dropped.disconnects.get(), 0);
        assert_eq!(registry.listener_count(&key), 1);
    }

    #[test]
    fn test_listener_may_deregister_itself_while_notified() {
        struct SelfRemoving {
            registry: Rc<SensorRegistry>,
            id: Cell<Option<ListenerId>>,
            key: SensorKey,
        }
        impl SensorListener for SelfRemoving {
            fn on_update(&self, _sensor: &Sensor) {}
            fn on_disconnected(&self, _sensor: &Sensor) {
                if let Some(id) = self.id.take() {
                    self.registry.remove_listener(&self.key, id);
                }
            }
        }

        let registry = Rc::new(SensorRegistry::new());
        let key = registry.make_sensor("h", "cpu");
        let listener = Rc::new(SelfRemoving {
            registry: Rc::clone(&registry),
            id: Cell::new(None),
            key: key.clone(),
        });
        let id = registry.add_listener(&key, listener.clone());
        listener.id.set(Some(id));

        registry.notify_disconnected(&key);
        assert_eq!(registry.listener_count(&key), 0);
    }

    #[test]
    fn test_attach_hooks_see_the_sensor() {
        let registry = SensorRegistry::new();
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        registry.on_producer_attached(move |sensor| sink.borrow_mut().push(sensor.key().to_string()));

        let key = registry.make_sensor("h", "cpu");
        registry.notify_attached(&key);
        registry.notify_attached(&SensorKey::new("h", "unknown"));

        assert_eq!(*seen.borrow(), vec!["h:cpu"]);
    }

    #[test]
    fn test_update_for_unknown_key_is_rejected() {
        let registry = SensorRegistry::new();
        assert!(!registry.update_measurement(&SensorKey::new("x", "y"), 1.0));
    }
}
