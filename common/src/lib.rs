//! Types shared between the orchestrator, its workers and its clients.
//! Jobs are expressed as map and reduce functions over key-value pairs;
//! every piece of data in flight between workers lives on an
//! S3-compatible store and is passed around by reference.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;
use std::marker::PhantomData;

use bytes::Bytes;

pub mod codec;
pub mod minio;

/////////////////////////////////////////////////////////////////////////////
// Identifiers
/////////////////////////////////////////////////////////////////////////////

macro_rules! define_id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id_type!(
    /// Identifies a registered worker.
    WorkerId
);
define_id_type!(
    /// Identifies a submitted job. Doubles as the handle a client uses
    /// to open its result channel.
    ClientId
);
define_id_type!(
    /// Identifies one task, whether a root task of a job or a sub-task
    /// synthesized for a map or reduce stage.
    TaskId
);

/// Hands out identifiers of one type, starting at 1 and never reusing
/// a value. Ids allocated later always compare greater.
#[derive(Debug)]
pub struct IdGenerator<T> {
    next: u64,
    marker: PhantomData<T>,
}

impl<T: From<u64>> IdGenerator<T> {
    pub fn new() -> Self {
        Self {
            next: 1,
            marker: PhantomData,
        }
    }

    pub fn next(&mut self) -> T {
        let value = self.next;
        self.next += 1;
        T::from(value)
    }
}

impl<T: From<u64>> Default for IdGenerator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////////////////////////////////////////
// Workload types
/////////////////////////////////////////////////////////////////////////////

/// The output of a workload map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) map operations.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>>;

/// A map function takes a key-value pair and auxiliary arguments.
///
/// It returns an iterator that yields new key-value pairs.
pub type MapFn = fn(kv: KeyValue, aux: Bytes) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// and an auxiliary argument. It returns an [`anyhow::Result`]
/// containing a single output value.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> anyhow::Result<Bytes>;

/// A named unit of work a worker can execute.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,

    /// The value.
    pub value: Bytes,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

/// Interpret the bytes as UTF-8, copying them into an owned string.
pub fn string_from_bytes(bytes: Bytes) -> anyhow::Result<String> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Hashes an intermediate key. Compute a reduce partition for a given key
/// by calculating `ihash(key) % num_reducers`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    let value = hasher.finish() & 0x7fffffff;
    value as u32
}
