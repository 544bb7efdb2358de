// src/packages/mod.rs

//! Package records and RPM header reading
//!
//! `PackageRecord` is the one package type the rest of the compose works
//! with; `rpm` fills it from package files on disk.

pub mod record;
pub mod rpm;

pub use record::{Nevra, PackageRecord, SYSTEM_RELEASE, is_debug_name, is_ignored_requirement};
pub use rpm::RpmPackage;
