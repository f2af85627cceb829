//! Cheap clones of shared handles, inspired by facebook/gazebo's `Dupe`.
//!
//! `dupe()` marks a clone as a refcount bump rather than a deep copy, which
//! matters when reading the close cascade: a duped [`CloseHandle`] closes the
//! very same connection.
//!
//! [`CloseHandle`]: crate::connection::CloseHandle
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

/// A clone that only bumps a reference count.
pub trait Dupe: Clone {
    /// A cheap clone of the object.
    #[inline]
    #[must_use]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for &T {}
impl<T> Dupe for std::sync::Arc<T> {}
impl<T> Dupe for tokio::sync::watch::Receiver<T> {}
impl Dupe for tokio_util::sync::CancellationToken {}
impl Dupe for bytes::Bytes {}
impl<T: Dupe> Dupe for Option<T> {}
