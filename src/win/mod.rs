//! NTFS-specific plumbing: raw volume access, USN journal ioctls, FRN
//! path resolution and the MFT enumerator.
//!
//! Change monitoring on Windows goes through the shared notify-based
//! monitor, whose platform backend is ReadDirectoryChangesW.

pub mod mft;
pub mod path_resolver;
pub mod volume;
