//! # Capability Keys
//!
//! A [`Key`] is the proof of authority that trusted native-calling code
//! presents for privileged operations such as adopting a resource back.
//!
//! Keys are compared by identity. Minting a new key is harmless: it matches
//! only the handles stamped with it, so ordinary code that never saw the
//! boundary's key has no way to produce one that passes a check.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{HandleError, HandleResult};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Identity behind a key. Only its address matters.
#[derive(Debug)]
struct Token {
    serial: u64,
}

/// An unforgeable capability held by the trusted boundary layer.
///
/// Deliberately neither `Clone` nor `Copy`: pass it by reference.
pub struct Key {
    token: Arc<Token>,
}

impl Key {
    /// Mints a fresh key, distinct from every other key in the process.
    #[must_use]
    pub fn mint() -> Self {
        Self {
            token: Arc::new(Token {
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    /// Stamps a handle with this key.
    pub(crate) fn stamp(&self) -> Stamp {
        Stamp {
            token: Arc::clone(&self.token),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

/// The handle-side record of the key a handle was constructed with.
pub(crate) struct Stamp {
    token: Arc<Token>,
}

impl Stamp {
    /// Fails with [`HandleError::CapabilityMismatch`] unless `key` is the stamping key.
    pub(crate) fn check(&self, key: &Key) -> HandleResult<()> {
        if Arc::ptr_eq(&self.token, &key.token) {
            Ok(())
        } else {
            Err(HandleError::CapabilityMismatch)
        }
    }

    /// Serial number, for diagnostics only.
    pub(crate) fn serial(&self) -> u64 {
        self.token.serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_accepts_own_key() {
        let key = Key::mint();
        let stamp = key.stamp();
        assert!(stamp.check(&key).is_ok());
    }

    #[test]
    fn test_stamp_rejects_other_key() {
        let key = Key::mint();
        let other = Key::mint();
        let stamp = key.stamp();
        assert_eq!(stamp.check(&other), Err(HandleError::CapabilityMismatch));
    }

    #[test]
    fn test_debug_reveals_nothing() {
        assert_eq!(format!("{:?}", Key::mint()), "Key(..)");
    }
}
