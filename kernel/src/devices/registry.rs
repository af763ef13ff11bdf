//! RCU-protected device registry.
//!
//! A fixed-size hash table of intrusive chains. Readers traverse under an
//! RCU reader section with consume loads and never take a lock; writers
//! serialize on a `spin::RwLock` and publish unlinks with release stores.
//! Removal defers the object's destruction through the epoch reclaimer, so
//! a pointer obtained inside a reader section stays dereferenceable until
//! the section ends; taking a reference extends validity past it.

use core::{ptr::NonNull, sync::atomic::Ordering};
use core::sync::atomic::AtomicUsize;

use spin::RwLock;

use crate::{
    config::DEV_REGISTRY_BUCKETS,
    devices::{pack_key, Device},
    error::{DeviceError, KernelError, KernelResult},
    sync::rcu::{self, RcuCell},
};

// ---------------------------------------------------------------------------
// Golden-ratio multiplicative hashes
// ---------------------------------------------------------------------------

const GOLDEN_RATIO_64: u64 = 0x9E37_79B9_7F4A_7C15;
const GOLDEN_RATIO_32: u32 = 0x9E37_79B9;

/// Hash a 64-bit value: multiply by the golden-ratio constant and keep the
/// mixed high bits.
#[inline]
pub fn hash_u64(value: u64, bits: u32) -> u64 {
    value.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits)
}

/// 32-bit variant.
#[inline]
pub fn hash_u32(value: u32, bits: u32) -> u32 {
    value.wrapping_mul(GOLDEN_RATIO_32) >> (32 - bits)
}

/// Byte-string variant: fold each byte through the 64-bit multiplier.
pub fn hash_bytes(bytes: &[u8], bits: u32) -> u64 {
    let mut acc: u64 = 0;
    for &b in bytes {
        acc = (acc ^ b as u64).wrapping_mul(GOLDEN_RATIO_64);
    }
    acc >> (64 - bits)
}

const BUCKET_BITS: u32 = DEV_REGISTRY_BUCKETS.trailing_zeros();

fn bucket_of(key: u64) -> usize {
    hash_u64(key, BUCKET_BITS) as usize
}

// ---------------------------------------------------------------------------
// Registry state
// ---------------------------------------------------------------------------

static BUCKETS: [RcuCell<Device>; DEV_REGISTRY_BUCKETS] =
    [const { RcuCell::new() }; DEV_REGISTRY_BUCKETS];

/// Serializes all writers; readers go through RCU only.
static WRITER_LOCK: RwLock<()> = RwLock::new(());

static COUNT: AtomicUsize = AtomicUsize::new(0);

/// Register a device. The registry takes one reference (dropped again by
/// [`unregister`]); at most one entry may exist per (major, minor).
pub fn register(dev: NonNull<Device>) -> KernelResult<()> {
    // SAFETY: the caller owns the device and keeps it alive until the
    // deferred destroy; shared access is through &Device.
    let d = unsafe { dev.as_ref() };
    let key = d.key();
    let _w = WRITER_LOCK.write();

    let bucket = &BUCKETS[bucket_of(key)];
    let mut cur = bucket.consume();
    while let Some(existing) = NonNull::new(cur) {
        // SAFETY: chained devices are alive until a grace period after
        // unlink, and we hold the writer lock.
        let e = unsafe { existing.as_ref() };
        if e.key() == key {
            return Err(KernelError::AlreadyExists {
                resource: "device",
                id: key,
            });
        }
        cur = e.next.consume();
    }

    d.ref_inc();
    // Publish: link the new head's next first, then swing the bucket head
    // with a release store so readers see a fully initialized node.
    d.next.publish(bucket.consume());
    bucket.publish(dev.as_ptr());
    COUNT.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

/// Unregister by identity. Unlinks the entry (publishing the new chain) and
/// drops the registry's reference; destruction is scheduled through the
/// reclaimer once the count reaches zero.
pub fn unregister(major: u32, minor: u32) -> KernelResult<()> {
    let key = pack_key(major, minor);
    let _w = WRITER_LOCK.write();

    let mut cell: &RcuCell<Device> = &BUCKETS[bucket_of(key)];
    loop {
        let cur = match NonNull::new(cell.consume()) {
            Some(p) => p,
            None => {
                return Err(DeviceError::NoSuchDevice { major, minor }.into());
            }
        };
        // SAFETY: writer lock held; the chain is stable and nodes outlive
        // the registry's grace-period contract.
        let d: &'static Device = unsafe { &*cur.as_ptr() };
        if d.key() == key {
            cell.publish(d.next.consume());
            COUNT.fetch_sub(1, Ordering::AcqRel);
            drop_reference(cur);
            return Ok(());
        }
        cell = &d.next;
    }
}

/// Look up a device inside an RCU reader section. The returned reference
/// is valid until the caller leaves the section; take a reference with
/// [`reference`] to keep it longer. Calling this outside a reader section
/// is a caller bug.
pub fn lookup(major: u32, minor: u32) -> Option<&'static Device> {
    assert!(
        rcu::reader_active(),
        "registry lookup outside an RCU reader section"
    );
    let key = pack_key(major, minor);
    let mut cur = BUCKETS[bucket_of(key)].consume();
    while let Some(p) = NonNull::new(cur) {
        // SAFETY: the reader section plus deferred reclamation guarantee
        // the chain nodes outlive this traversal.
        let d = unsafe { &*p.as_ptr() };
        let k = d.key();
        debug_assert_ne!(k, super::KEY_POISON, "poisoned device reachable from registry");
        if k == key {
            return Some(d);
        }
        cur = d.next.consume();
    }
    None
}

/// Take a counted reference on a device (typically under a reader section,
/// which extends the pointer's validity beyond the section).
pub fn reference(dev: &Device) -> usize {
    dev.ref_inc()
}

/// Drop a counted reference; at zero the object is poisoned and destroyed
/// after a grace period.
pub fn release(dev: &Device) {
    drop_reference(NonNull::from(dev));
}

fn drop_reference(dev: NonNull<Device>) {
    // SAFETY: refcounted devices stay alive until the deferred destroy.
    let d = unsafe { dev.as_ref() };
    if d.ref_dec() == 0 {
        // Captured as an address so the closure is Send; the pointee is.
        let addr = dev.as_ptr() as usize;
        rcu::defer(move || {
            let raw = NonNull::new(addr as *mut Device).expect("null deferred device");
            // SAFETY: the grace period guarantees no reader still holds a
            // pointer from before the unlink; poison first so a broken
            // traversal shows up as a poisoned key, then let the owner
            // reclaim storage.
            let d = unsafe { &*raw.as_ptr() };
            d.poison_key();
            if let Some(destroy) = d.ops.destroy {
                destroy(raw);
            }
        });
    }
}

/// Convenience: look up and take a reference in one reader section.
pub fn get(major: u32, minor: u32) -> Option<NonNull<Device>> {
    rcu::read_lock();
    let found = lookup(major, minor).map(|d| {
        d.ref_inc();
        NonNull::from(d)
    });
    rcu::read_unlock();
    found
}

/// Registered device count (debug surface).
pub fn device_count() -> usize {
    COUNT.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceClass, DeviceOps, KEY_POISON};
    use alloc::boxed::Box;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;

    static DESTROYED: StdAtomicUsize = StdAtomicUsize::new(0);

    fn test_destroy(dev: NonNull<Device>) {
        DESTROYED.fetch_add(1, StdOrdering::SeqCst);
        // SAFETY: created by Box::into_raw in mk_dev.
        unsafe { drop(Box::from_raw(dev.as_ptr())) };
    }

    static TEST_OPS: DeviceOps = DeviceOps {
        name: "testdev",
        open: None,
        read: None,
        write: None,
        ioctl: None,
        destroy: Some(test_destroy),
    };

    fn mk_dev(major: u32, minor: u32) -> NonNull<Device> {
        let b = Box::new(Device::new(major, minor, DeviceClass::Char, &TEST_OPS));
        NonNull::new(Box::into_raw(b)).unwrap()
    }

    #[test]
    fn test_golden_ratio_hashes_spread_and_repeat() {
        // Deterministic.
        assert_eq!(hash_u64(12345, BUCKET_BITS), hash_u64(12345, BUCKET_BITS));
        assert_eq!(hash_u32(777, 6), hash_u32(777, 6));
        assert_eq!(hash_bytes(b"tty0", 6), hash_bytes(b"tty0", 6));
        assert_ne!(hash_bytes(b"tty0", 16), hash_bytes(b"tty1", 16));

        // Sequential keys should not pile into one bucket.
        let mut seen = std::collections::BTreeSet::new();
        for minor in 0..16u32 {
            seen.insert(bucket_of(pack_key(1, minor)));
        }
        assert!(seen.len() > 4, "sequential identities hash to {} buckets", seen.len());
    }

    #[test]
    fn test_register_lookup_unregister_round_trip() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let dev = mk_dev(100, 1);
        register(dev).unwrap();

        rcu::read_lock();
        let found = lookup(100, 1).expect("registered device not found");
        assert_eq!(found.major(), 100);
        assert_eq!(found.minor(), 1);
        rcu::read_unlock();

        // Double registration of the same identity is refused.
        let dup = mk_dev(100, 1);
        assert!(matches!(
            register(dup),
            Err(KernelError::AlreadyExists { .. })
        ));
        // SAFETY: dup was never registered; we still own it.
        unsafe { drop(Box::from_raw(dup.as_ptr())) };

        unregister(100, 1).unwrap();
        rcu::synchronize();
        rcu::read_lock();
        assert!(lookup(100, 1).is_none());
        rcu::read_unlock();
        rcu::barrier();
    }

    #[test]
    fn test_unregister_missing_is_not_found() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        assert!(matches!(
            unregister(999, 999),
            Err(KernelError::Device(DeviceError::NoSuchDevice { .. }))
        ));
    }

    #[test]
    fn test_reference_extends_past_reader_section() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        let before = DESTROYED.load(StdOrdering::SeqCst);
        let dev = mk_dev(120, 1);
        register(dev).unwrap();

        // Take a reference under the reader section, then unregister while
        // still inside it: the pointer stays valid through the section and
        // beyond, because of our reference.
        rcu::read_lock();
        let d = lookup(120, 1).unwrap();
        reference(d);
        unregister(120, 1).unwrap();
        assert_eq!(d.major(), 120, "dereference after unregister, inside section");
        rcu::read_unlock();

        rcu::synchronize();
        rcu::read_lock();
        assert!(lookup(120, 1).is_none());
        rcu::read_unlock();

        // Still referenced: not destroyed yet.
        rcu::barrier();
        assert_eq!(DESTROYED.load(StdOrdering::SeqCst), before);

        // Final put schedules poisoning and destruction.
        release(d);
        rcu::barrier();
        assert_eq!(DESTROYED.load(StdOrdering::SeqCst), before + 1);
    }

    #[test]
    fn test_concurrent_readers_vs_writer_churn() {
        let _g = crate::test_support::lock();
        crate::sched::bootstrap_for_tests();
        // Each reader thread plays a distinct simulated CPU whose
        // quiescence timestamp only advances *between* its reader
        // sections; the reclaimer on CPU 0 must honor all of them.
        for cpu in 1..=4 {
            crate::sched::smp::set_online(cpu);
            rcu::note_quiescent_on(cpu);
        }

        let dev = mk_dev(101, 1);
        register(dev).unwrap();

        let stop = Arc::new(StdAtomicUsize::new(0));
        let mut handles = std::vec::Vec::new();
        for cpu in 1..=4usize {
            let stop = stop.clone();
            handles.push(std::thread::spawn(move || {
                let mut reads = 0u32;
                while reads < 1000 {
                    rcu::read_lock();
                    if let Some(d) = lookup(101, 1) {
                        // Poison must never be observable while the pointer
                        // is reachable from the registry.
                        assert_ne!(d.key(), KEY_POISON, "use after free observed");
                        assert_eq!(d.major(), 101);
                        assert_eq!(d.minor(), 1);
                        reads += 1;
                    }
                    rcu::read_unlock();
                    // Quiescent only between sections.
                    rcu::note_quiescent_on(cpu);
                }
                stop.fetch_add(1, StdOrdering::SeqCst);
            }));
        }

        // Writer: re-register the same identity in a tight loop, letting
        // the reclaimer run only at quiescent boundaries.
        let mut churns = 0u32;
        while stop.load(StdOrdering::SeqCst) < 4 {
            unregister(101, 1).unwrap();
            let fresh = mk_dev(101, 1);
            register(fresh).unwrap();
            rcu::reclaim_scan(0);
            churns += 1;
            if churns % 64 == 0 {
                std::thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        unregister(101, 1).unwrap();
        for cpu in 1..=4 {
            crate::sched::smp::set_offline(cpu);
        }
        rcu::barrier();
    }
}
