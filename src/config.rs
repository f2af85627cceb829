//! Default configuration parameters.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

/// Initial capacity of the read buffer behind each leg's decoder.
#[cfg(not(test))]
pub const READ_BUFFER_SIZE: usize = 1 << 13;
/// Largest chunk a decoder hands to a pump in one go.
/// Together with the one-chunk-in-flight rule this bounds the memory a
/// session can hold per direction.
#[cfg(not(test))]
pub const MAX_CHUNK_SIZE: usize = 1 << 16;
/// Largest HTTP message head the framing layer will try to delimit before
/// giving up and passing the rest of the stream through untouched.
#[cfg(not(test))]
pub const MAX_HEAD_SIZE: usize = 1 << 16;

/// Initial capacity of the read buffer behind each leg's decoder.
#[cfg(test)]
pub const READ_BUFFER_SIZE: usize = 1 << 6;
/// Small chunks in tests so that multi-chunk paths get exercised.
#[cfg(test)]
pub const MAX_CHUNK_SIZE: usize = 1 << 8;
/// Largest HTTP message head before falling back to passthrough.
#[cfg(test)]
pub const MAX_HEAD_SIZE: usize = 1 << 10;

/// Default timeout for dialing the remote endpoint, in seconds as accepted
/// by `--dial-timeout`.
pub const DEFAULT_DIAL_TIMEOUT: &str = "10";
