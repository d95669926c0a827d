//! Kernel maps: fixed-schema key/value storage shared with programs.

use std::fmt;
use std::mem;
use std::os::fd::RawFd;

use aya::Pod;
use log::debug;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::sys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MapType {
    Hash = 1,
    Array = 2,
    PerfEventArray = 4,
    RingBuf = 27,
}

impl fmt::Display for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MapType::Hash => "hash",
            MapType::Array => "array",
            MapType::PerfEventArray => "perf_event_array",
            MapType::RingBuf => "ringbuf",
        };
        f.write_str(name)
    }
}

/// Update semantics for [`Map::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u64)]
pub enum UpdateFlags {
    /// Create or overwrite.
    #[default]
    Any = 0,
    /// Only create.
    NoExist = 1,
    /// Only overwrite.
    Exist = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSpec {
    pub name: String,
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
}

impl MapSpec {
    pub fn new(
        name: impl Into<String>,
        map_type: MapType,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            map_type,
            key_size,
            value_size,
            max_entries,
            flags: 0,
        }
    }

    pub fn array(name: impl Into<String>, value_size: u32, max_entries: u32) -> Self {
        Self::new(name, MapType::Array, 4, value_size, max_entries)
    }

    pub fn hash(name: impl Into<String>, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        Self::new(name, MapType::Hash, key_size, value_size, max_entries)
    }

    /// `size` is the ring's data size in bytes.
    pub fn ring_buf(name: impl Into<String>, size: u32) -> Self {
        Self::new(name, MapType::RingBuf, 0, 0, size)
    }

    /// One slot per possible CPU.
    pub fn perf_event_array(name: impl Into<String>) -> Self {
        Self::new(name, MapType::PerfEventArray, 4, 4, 0)
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    fn expect_size(what: &'static str, expected: u32, actual: u32) -> Result<()> {
        if expected != actual {
            return Err(Error::SizeMismatch {
                what,
                expected: expected as usize,
                actual: actual as usize,
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match self.map_type {
            MapType::Array => {
                Self::expect_size("array key", 4, self.key_size)?;
            }
            MapType::PerfEventArray => {
                Self::expect_size("perf event array key", 4, self.key_size)?;
                Self::expect_size("perf event array value", 4, self.value_size)?;
                return Ok(());
            }
            MapType::RingBuf => {
                Self::expect_size("ring buffer key", 0, self.key_size)?;
                Self::expect_size("ring buffer value", 0, self.value_size)?;
                let page = sys::page_size() as u32;
                if !self.max_entries.is_power_of_two() || self.max_entries % page != 0 {
                    return Err(Error::InvalidSpec(format!(
                        "ring buffer {} size {} is not a power-of-two multiple of the page size {}",
                        self.name, self.max_entries, page
                    )));
                }
                return Ok(());
            }
            MapType::Hash => {
                if self.key_size == 0 {
                    return Err(Error::InvalidSpec(format!("map {} has a zero key size", self.name)));
                }
            }
        }
        if self.value_size == 0 {
            return Err(Error::InvalidSpec(format!("map {} has a zero value size", self.name)));
        }
        if self.max_entries == 0 {
            return Err(Error::InvalidSpec(format!("map {} has no entries", self.name)));
        }
        Ok(())
    }

    /// Fills in values the kernel needs but the spec may leave implicit.
    pub fn resolved(&self) -> Result<Self> {
        let mut spec = self.clone();
        if spec.map_type == MapType::PerfEventArray && spec.max_entries == 0 {
            spec.max_entries = aya::util::nr_cpus().map_err(|(path, source)| Error::Syscall {
                call: path,
                source,
            })? as u32;
        }
        Ok(spec)
    }

    /// Checks that `replacement` can stand in for a map created from `self`.
    pub fn check_compatible(&self, replacement: &MapSpec) -> Result<()> {
        let mismatch = |field: &str, want: String, have: String| Error::Incompatible {
            name: self.name.clone(),
            reason: format!("{field} {have} != {want}"),
        };
        if self.map_type != replacement.map_type {
            return Err(mismatch(
                "type",
                self.map_type.to_string(),
                replacement.map_type.to_string(),
            ));
        }
        if self.key_size != replacement.key_size {
            return Err(mismatch(
                "key size",
                self.key_size.to_string(),
                replacement.key_size.to_string(),
            ));
        }
        if self.value_size != replacement.value_size {
            return Err(mismatch(
                "value size",
                self.value_size.to_string(),
                replacement.value_size.to_string(),
            ));
        }
        if self.max_entries != replacement.max_entries {
            return Err(mismatch(
                "max entries",
                self.max_entries.to_string(),
                replacement.max_entries.to_string(),
            ));
        }
        Ok(())
    }
}

/// A live map. Safe to share between threads; the kernel serialises access.
#[derive(Debug)]
pub struct Map {
    spec: MapSpec,
    handle: Handle,
}

impl Map {
    pub fn new(spec: &MapSpec) -> Result<Self> {
        spec.validate()?;
        let spec = spec.resolved()?;

        let mut attr = sys::MapCreateAttr {
            map_type: spec.map_type as u32,
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
            map_flags: spec.flags,
            map_name: sys::object_name(&spec.name),
            ..Default::default()
        };
        let fd = sys::bpf_map_create(&mut attr).map_err(|source| {
            let what = format!("{} map {}", spec.map_type, spec.name);
            match source.raw_os_error() {
                // Unknown map types are rejected as invalid arguments.
                Some(libc::EINVAL) if spec.map_type == MapType::RingBuf => {
                    Error::not_supported(what, "ring buffers need Linux 5.8")
                }
                _ => Error::from_errno("bpf(BPF_MAP_CREATE)", what, source),
            }
        })?;
        debug!(
            "created {} map {} (key={} value={} entries={})",
            spec.map_type, spec.name, spec.key_size, spec.value_size, spec.max_entries
        );

        Ok(Self {
            spec,
            handle: Handle::new("map", fd),
        })
    }

    pub fn spec(&self) -> &MapSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn map_type(&self) -> MapType {
        self.spec.map_type
    }

    pub fn fd(&self) -> Result<RawFd> {
        self.handle.raw_fd()
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        MapSpec::expect_size("key", self.spec.key_size, key.len() as u32)
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        MapSpec::expect_size("value", self.spec.value_size, value.len() as u32)
    }

    fn elem_error(&self, call: &'static str, source: std::io::Error) -> Error {
        if source.raw_os_error() == Some(libc::ENOENT) {
            return Error::KeyNotFound;
        }
        Error::from_errno(call, format!("{} map {}", self.spec.map_type, self.spec.name), source)
    }

    /// Creates or overwrites `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.update(key, value, UpdateFlags::Any)
    }

    pub fn update(&self, key: &[u8], value: &[u8], flags: UpdateFlags) -> Result<()> {
        self.check_key(key)?;
        self.check_value(value)?;
        self.handle.with_fd(|fd| {
            sys::bpf_map_update_elem(fd, key, value, flags as u64)
                .map_err(|e| self.elem_error("bpf(BPF_MAP_UPDATE_ELEM)", e))
        })
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut value = vec![0u8; self.spec.value_size as usize];
        self.lookup_into(key, &mut value)?;
        Ok(value)
    }

    pub fn lookup_into(&self, key: &[u8], value: &mut [u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_value(value)?;
        self.handle.with_fd(|fd| {
            sys::bpf_map_lookup_elem(fd, key, value)
                .map_err(|e| self.elem_error("bpf(BPF_MAP_LOOKUP_ELEM)", e))
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.handle.with_fd(|fd| {
            sys::bpf_map_delete_elem(fd, key)
                .map_err(|e| self.elem_error("bpf(BPF_MAP_DELETE_ELEM)", e))
        })
    }

    /// The key following `key`, or the first key when `key` is `None`.
    pub fn next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        if let Some(key) = key {
            self.check_key(key)?;
        }
        let mut next = vec![0u8; self.spec.key_size as usize];
        let found = self.handle.with_fd(|fd| {
            match sys::bpf_map_get_next_key(fd, key, &mut next) {
                Ok(()) => Ok(true),
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
                Err(e) => Err(self.elem_error("bpf(BPF_MAP_GET_NEXT_KEY)", e)),
            }
        })?;
        Ok(found.then_some(next))
    }

    pub fn keys(&self) -> Keys<'_> {
        Keys {
            map: self,
            last: None,
            done: false,
        }
    }

    pub fn put_pod<K: Pod, V: Pod>(&self, key: &K, value: &V) -> Result<()> {
        self.put(pod_bytes(key), pod_bytes(value))
    }

    pub fn get_pod<K: Pod, V: Pod>(&self, key: &K) -> Result<V> {
        MapSpec::expect_size("value", self.spec.value_size, mem::size_of::<V>() as u32)?;
        let value = self.lookup(pod_bytes(key))?;
        // SAFETY: `value` holds exactly size_of::<V>() bytes and V is Pod.
        Ok(unsafe { value.as_ptr().cast::<V>().read_unaligned() })
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

fn pod_bytes<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: Pod types are plain bytes without padding-dependent invariants.
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// Iterator over the keys of a map. Concurrent deletes may restart the walk,
/// as the kernel returns the first key for a key that no longer exists.
pub struct Keys<'a> {
    map: &'a Map,
    last: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for Keys<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.map.next_key(self.last.as_deref()) {
            Ok(Some(key)) => {
                self.last = Some(key.clone());
                Some(Ok(key))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
