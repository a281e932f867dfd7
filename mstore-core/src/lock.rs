/// Striped write locks
///
/// Writers of one record serialize on a record stripe; writers touching one
/// bucket serialize on a bucket stripe. Record and bucket stripes live in
/// separate tables. A writer takes its record stripe first and then its
/// bucket stripes in ascending order, so no cycle can form.

use parking_lot::{Mutex, MutexGuard};

pub struct LockTable {
    records: Vec<Mutex<()>>,
    buckets: Vec<Mutex<()>>,
}

impl LockTable {
    /// `stripes` must be non-zero (checked by `StoreConfig::validate`)
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            records: (0..stripes).map(|_| Mutex::new(())).collect(),
            buckets: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripes(&self) -> usize {
        self.records.len()
    }

    pub fn stripe_of(&self, key: &str) -> usize {
        crc32fast::hash(key.as_bytes()) as usize % self.records.len()
    }

    /// Lock the stripe of a record key
    pub fn lock_record(&self, key: &str) -> MutexGuard<'_, ()> {
        self.records[self.stripe_of(key)].lock()
    }

    /// Lock the stripes of a set of bucket keys, lowest stripe first
    pub fn lock_buckets<'a, I, S>(&'a self, keys: I) -> Vec<MutexGuard<'a, ()>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut stripes: Vec<usize> = keys
            .into_iter()
            .map(|k| self.stripe_of(k.as_ref()))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes.into_iter().map(|s| self.buckets[s].lock()).collect()
    }

    /// Every stripe of both tables, records first; used by index rebuilds
    pub fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        let mut guards: Vec<MutexGuard<'_, ()>> = self.records.iter().map(|m| m.lock()).collect();
        guards.extend(self.buckets.iter().map(|m| m.lock()));
        guards
    }
}
