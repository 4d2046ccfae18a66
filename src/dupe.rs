//! A marker for "cheap, explicit clone" of shared handles.
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//
// Plain `.clone()` on an `Arc` or a `tokio::sync::mpsc::Sender` is O(1), but
// reads like a deep copy to anyone skimming the call site. `Dupe::dupe`
// makes the cheapness explicit and keeps `derive(Clone)` reserved for types
// where cloning is actually not free.

use std::sync::Arc;
use tokio::sync::mpsc;

/// Types that can be cheaply duplicated (reference-counted handles, sender
/// ends of channels, etc.), as opposed to [`Clone`] which makes no promise
/// about cost.
pub trait Dupe {
    /// Duplicate `self`. Must be O(1).
    fn dupe(&self) -> Self;
}

impl<T> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Arc::clone(self)
    }
}

impl<T> Dupe for mpsc::Sender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for mpsc::UnboundedSender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
