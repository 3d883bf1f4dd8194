//! EnOcean Equipment Profiles: definition files, lookup and telegram
//! decoding.

pub mod decode;
pub mod library;
pub mod profile;

pub use decode::{DecodeError, StateMap, StateValue, decode};
pub use library::EepLibrary;
pub use profile::{Datafield, EepProfile, EntityMeta, ProfileCase, ProfileSummary};
