//! Process-wide resource factory registry.
//!
//! A factory turns a raw decompressed payload into a typed resource wrapper.
//! The core ships exactly one concrete wrapper (the LRLE image codec); all
//! other resource types fall through to [`RawResource`], which carries the
//! payload bytes untouched.
//!
//! # Concurrency
//! The registry is the one piece of process-wide mutable state in the crate.
//! Registration takes a short exclusive lock and swaps in a new immutable
//! snapshot; lookups take a read lock only long enough to clone the snapshot
//! `Arc`, so they never wait behind factory construction or another caller's
//! long-running decode.  When two registrations race, whichever completes
//! first wins and the other observes the updated table.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use crate::key::ResourceKey;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload does not parse as resource type {resource_type:#010X}: {reason}")]
    Malformed { resource_type: u32, reason: String },
}

/// A decoded, typed resource.
pub trait Resource: Any + Send {
    /// The resource-type id this wrapper decodes.
    fn resource_type(&self) -> u32;

    /// Re-emit the wire payload (uncompressed).
    fn serialize(&self) -> Vec<u8>;

    /// Downcast support for callers that know the concrete wrapper.
    fn as_any(&self) -> &dyn Any;
}

/// Decoder plug-in contract.  Implementations are registered per resource
/// type and must be callable from any thread.
pub trait ResourceFactory: Send + Sync {
    fn decode(&self, payload: &[u8], key: ResourceKey) -> Result<Box<dyn Resource>, DecodeError>;

    /// The resource-type ids this factory understands.
    fn recognized_types(&self) -> &[u32];
}

// ── Default pass-through ─────────────────────────────────────────────────────

/// The fallback wrapper: opaque bytes plus the key they came from.
#[derive(Debug, Clone)]
pub struct RawResource {
    pub key:   ResourceKey,
    pub bytes: Vec<u8>,
}

impl Resource for RawResource {
    fn resource_type(&self) -> u32 {
        self.key.type_id
    }

    fn serialize(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RawFactory;

impl ResourceFactory for RawFactory {
    fn decode(&self, payload: &[u8], key: ResourceKey) -> Result<Box<dyn Resource>, DecodeError> {
        Ok(Box::new(RawResource { key, bytes: payload.to_vec() }))
    }

    fn recognized_types(&self) -> &[u32] {
        &[]
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

type FactoryMap = HashMap<u32, Arc<dyn ResourceFactory>>;

lazy_static! {
    static ref FACTORIES: RwLock<Arc<FactoryMap>> = RwLock::new(Arc::new(HashMap::new()));
    static ref DEFAULT_FACTORY: Arc<dyn ResourceFactory> = Arc::new(RawFactory);
}

fn snapshot() -> Arc<FactoryMap> {
    FACTORIES.read().expect("factory registry poisoned").clone()
}

fn swap<F: FnOnce(&mut FactoryMap)>(mutate: F) {
    let mut guard = FACTORIES.write().expect("factory registry poisoned");
    let mut next: FactoryMap = (**guard).clone();
    mutate(&mut next);
    *guard = Arc::new(next);
}

/// Register a factory for `resource_type`.  Returns false (and leaves the
/// existing factory in place) when the type is already registered.
pub fn register(resource_type: u32, factory: Arc<dyn ResourceFactory>) -> bool {
    let mut inserted = false;
    swap(|map| {
        if let std::collections::hash_map::Entry::Vacant(slot) = map.entry(resource_type) {
            slot.insert(factory);
            inserted = true;
        }
    });
    inserted
}

/// Register a factory, displacing any existing registration for the type.
pub fn register_or_replace(resource_type: u32, factory: Arc<dyn ResourceFactory>) {
    swap(|map| {
        map.insert(resource_type, factory);
    });
}

/// Remove a registration.  Returns true when something was removed.
pub fn unregister(resource_type: u32) -> bool {
    let mut removed = false;
    swap(|map| {
        removed = map.remove(&resource_type).is_some();
    });
    removed
}

/// Look up the factory for a type, if one is registered.
pub fn get(resource_type: u32) -> Option<Arc<dyn ResourceFactory>> {
    snapshot().get(&resource_type).cloned()
}

/// Look up the factory for a type, falling back to the raw pass-through.
pub fn get_or_default(resource_type: u32) -> Arc<dyn ResourceFactory> {
    get(resource_type).unwrap_or_else(|| DEFAULT_FACTORY.clone())
}

/// The resource types with an explicit registration, in no defined order.
pub fn registered_types() -> Vec<u32> {
    snapshot().keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperFactory;

    impl ResourceFactory for UpperFactory {
        fn decode(&self, payload: &[u8], key: ResourceKey) -> Result<Box<dyn Resource>, DecodeError> {
            Ok(Box::new(RawResource {
                key,
                bytes: payload.to_ascii_uppercase(),
            }))
        }

        fn recognized_types(&self) -> &[u32] {
            &[0xDEAD_0001]
        }
    }

    // Each test uses its own type ids: the registry is process-wide and the
    // harness runs tests concurrently.

    #[test]
    fn default_factory_passes_bytes_through() {
        let key = ResourceKey::new(0x5151_0001, 0, 1);
        let res = get_or_default(0x5151_0001).decode(b"payload", key).unwrap();
        assert_eq!(res.serialize(), b"payload");
        assert_eq!(res.resource_type(), 0x5151_0001);
        let raw = res.as_any().downcast_ref::<RawResource>().unwrap();
        assert_eq!(raw.key, key);
    }

    #[test]
    fn register_is_first_wins() {
        let ty = 0x5151_0002;
        assert!(register(ty, Arc::new(UpperFactory)));
        assert!(!register(ty, Arc::new(RawFactory)));
        let res = get_or_default(ty)
            .decode(b"abc", ResourceKey::new(ty, 0, 0))
            .unwrap();
        assert_eq!(res.serialize(), b"ABC");
        assert!(unregister(ty));
        assert!(!unregister(ty));
    }

    #[test]
    fn replace_displaces() {
        let ty = 0x5151_0003;
        assert!(register(ty, Arc::new(UpperFactory)));
        register_or_replace(ty, Arc::new(RawFactory));
        let res = get_or_default(ty)
            .decode(b"abc", ResourceKey::new(ty, 0, 0))
            .unwrap();
        assert_eq!(res.serialize(), b"abc");
        unregister(ty);
    }

    #[test]
    fn enumeration_sees_registrations() {
        let ty = 0x5151_0004;
        register(ty, Arc::new(UpperFactory));
        assert!(registered_types().contains(&ty));
        unregister(ty);
        assert!(!registered_types().contains(&ty));
    }

    #[test]
    fn lookups_hold_no_lock_across_decode() {
        // A decode running on one thread must not block registration on
        // another: the lookup clones the snapshot and releases the lock.
        let ty = 0x5151_0005;
        let factory = get_or_default(ty);
        register(ty, Arc::new(UpperFactory));
        // The pre-registration snapshot still decodes as pass-through.
        let res = factory.decode(b"abc", ResourceKey::new(ty, 0, 0)).unwrap();
        assert_eq!(res.serialize(), b"abc");
        unregister(ty);
    }
}
