//! Owner-scoped cache key system for per-user isolation.
//!
//! An `OwnerScopedKey` cannot be built without the owning app user id, so a
//! durable lookup is always confined to one owner's entries.

use std::fmt;

/// Separator byte between the owner and the rest of the key.
///
/// `0xFF` never occurs in UTF-8, so it cannot appear inside an owner id.
const SEPARATOR: u8 = 0xFF;

/// Which snapshot family an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    CustomerState,
    Offerings,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CustomerState => "customer_state",
            Self::Offerings => "offerings",
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Self::CustomerState => 0,
            Self::Offerings => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::CustomerState),
            1 => Some(Self::Offerings),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The snapshot bytes and its refresh timestamp live in separate slots so the
/// timestamp can be dropped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntrySlot {
    Value,
    Timestamp,
}

impl EntrySlot {
    fn to_byte(self) -> u8 {
        match self {
            Self::Value => 0,
            Self::Timestamp => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Value),
            1 => Some(Self::Timestamp),
            _ => None,
        }
    }
}

/// A durable cache key scoped to a specific owner.
///
/// # Binary Format
///
/// - owner app user id, UTF-8
/// - separator (0xFF)
/// - kind (single byte)
/// - slot (single byte)
///
/// Keys sort by owner first, so all of an owner's entries share
/// [`OwnerScopedKey::owner_prefix`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerScopedKey {
    inner: OwnerKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OwnerKeyInner {
    owner: String,
    kind: CacheKind,
    slot: EntrySlot,
}

impl OwnerScopedKey {
    pub fn new(owner: impl Into<String>, kind: CacheKind, slot: EntrySlot) -> Self {
        Self {
            inner: OwnerKeyInner {
                owner: owner.into(),
                kind,
                slot,
            },
        }
    }

    pub fn value(owner: &str, kind: CacheKind) -> Self {
        Self::new(owner, kind, EntrySlot::Value)
    }

    pub fn timestamp(owner: &str, kind: CacheKind) -> Self {
        Self::new(owner, kind, EntrySlot::Timestamp)
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn kind(&self) -> CacheKind {
        self.inner.kind
    }

    pub fn slot(&self) -> EntrySlot {
        self.inner.slot
    }

    pub fn encode(&self) -> Vec<u8> {
        let owner = self.inner.owner.as_bytes();
        let mut bytes = Vec::with_capacity(owner.len() + 3);
        bytes.extend_from_slice(owner);
        bytes.push(SEPARATOR);
        bytes.push(self.inner.kind.to_byte());
        bytes.push(self.inner.slot.to_byte());
        bytes
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` unless the bytes are a valid UTF-8 owner followed by the
    /// separator, a known kind and a known slot.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            return None;
        }
        let split = bytes.len() - 3;
        if bytes[split] != SEPARATOR {
            return None;
        }
        let owner = std::str::from_utf8(&bytes[..split]).ok()?;
        let kind = CacheKind::from_byte(bytes[split + 1])?;
        let slot = EntrySlot::from_byte(bytes[split + 2])?;
        Some(Self::new(owner, kind, slot))
    }

    /// Prefix shared by every key of `owner`.
    pub fn owner_prefix(owner: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(owner.len() + 1);
        prefix.extend_from_slice(owner.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }

    /// Prefix shared by the value and timestamp keys of one owner and kind.
    pub fn kind_prefix(owner: &str, kind: CacheKind) -> Vec<u8> {
        let mut prefix = Self::owner_prefix(owner);
        prefix.push(kind.to_byte());
        prefix
    }
}

/// Fixed durable slots for the current and legacy app user ids.
///
/// These keys contain no separator byte, so they never collide with an
/// [`OwnerScopedKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySlot {
    Current,
    /// Pre-migration location, read once at configure time.
    Legacy,
}

impl IdentitySlot {
    pub fn key(self) -> &'static [u8] {
        match self {
            Self::Current => b"entitle.appUserID.new",
            Self::Legacy => b"entitle.appUserID",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
