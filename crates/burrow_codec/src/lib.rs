//! # Burrow Codec
//!
//! Canonical binary encoding for BurrowDB.
//!
//! Document bodies, the remote-registry dictionary, and socket option
//! dictionaries are all carried as [`Value`] trees encoded with this codec.
//! The encoding is a canonical CBOR subset: integers use the shortest form,
//! map keys are sorted bytewise by their encodings, and floats are not
//! supported. Equal values therefore always produce identical bytes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::{CodecError, CodecResult};
pub use value::Value;
