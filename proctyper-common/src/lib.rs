#![no_std]

/// Maximum number of runtime offsets a single classification can carry.
pub const MAX_OFFSETS: usize = 16;

/// Identity of an executable file: the `(device, inode)` pair of its backing file.
///
/// Processes started from the same binary share an identity, so it is the key
/// under which classification results are cached.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutableIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl ExecutableIdentity {
    pub const fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

/// Runtime detected for an executable.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    /// Inspection failed; the executable is never instrumented.
    NotInstrumentable = 0,
    /// Native code with no runtime-specific instrumentation.
    Generic = 1,
    Go = 2,
    Java = 3,
    Python = 4,
    Ruby = 5,
    NodeJs = 6,
    DotNet = 7,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::NotInstrumentable => "not_instrumentable",
            RuntimeKind::Generic => "generic",
            RuntimeKind::Go => "go",
            RuntimeKind::Java => "java",
            RuntimeKind::Python => "python",
            RuntimeKind::Ruby => "ruby",
            RuntimeKind::NodeJs => "nodejs",
            RuntimeKind::DotNet => "dotnet",
        }
    }
}

impl From<u8> for RuntimeKind {
    fn from(v: u8) -> Self {
        match v {
            1 => RuntimeKind::Generic,
            2 => RuntimeKind::Go,
            3 => RuntimeKind::Java,
            4 => RuntimeKind::Python,
            5 => RuntimeKind::Ruby,
            6 => RuntimeKind::NodeJs,
            7 => RuntimeKind::DotNet,
            _ => RuntimeKind::NotInstrumentable,
        }
    }
}

/// Addresses of instrumentation points inside an executable, in the order the
/// inspector was asked to locate them. Unresolved points are stored as 0.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeOffsets {
    pub entries: [u64; MAX_OFFSETS],
    pub len: u32,
    pub _pad: u32,
}

impl Default for RuntimeOffsets {
    fn default() -> Self {
        Self {
            entries: [0; MAX_OFFSETS],
            len: 0,
            _pad: 0,
        }
    }
}

impl RuntimeOffsets {
    /// Appends an offset. Returns false once `MAX_OFFSETS` entries are stored.
    pub fn push(&mut self, offset: u64) -> bool {
        let idx = self.len as usize;
        if idx >= MAX_OFFSETS {
            return false;
        }
        self.entries[idx] = offset;
        self.len += 1;
        true
    }

    pub fn get(&self, idx: usize) -> Option<u64> {
        self.as_slice().get(idx).copied()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.entries[..self.len()]
    }

    /// Stored entries. `len` may come from a foreign writer, so it is clamped.
    pub fn len(&self) -> usize {
        (self.len as usize).min(MAX_OFFSETS)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_push_until_full() {
        let mut offsets = RuntimeOffsets::default();
        for i in 0..MAX_OFFSETS as u64 {
            assert!(offsets.push(0x1000 + i));
        }
        assert!(!offsets.push(0xdead));
        assert_eq!(offsets.len(), MAX_OFFSETS);
        assert_eq!(offsets.get(0), Some(0x1000));
        assert_eq!(offsets.get(MAX_OFFSETS), None);
    }

    #[test]
    fn test_offsets_with_corrupt_len_are_clamped() {
        let offsets = RuntimeOffsets {
            len: 99,
            ..Default::default()
        };
        assert_eq!(offsets.len(), MAX_OFFSETS);
        assert_eq!(offsets.as_slice().len(), MAX_OFFSETS);
        assert_eq!(offsets.get(MAX_OFFSETS - 1), Some(0));
        assert_eq!(offsets.get(99), None);

        let mut offsets = offsets;
        assert!(!offsets.push(0x1000));
    }

    #[test]
    fn test_runtime_kind_from_u8() {
        assert_eq!(RuntimeKind::from(2), RuntimeKind::Go);
        assert_eq!(RuntimeKind::from(200), RuntimeKind::NotInstrumentable);
        assert_eq!(RuntimeKind::Go as u8, 2);
    }
}
