//! Authentication and authorisation subsystem.
//!
//! [`ssh_resolver`] turns an offered SSH public key into a platform
//! [`Identity`](crate::identity::Identity); [`permission`] answers what that
//! identity may do to a repository.

pub mod permission;
pub mod ssh_resolver;

pub use permission::{build_permission_source, Permission, PermissionSource};
pub use ssh_resolver::{AuthRejected, KeyResolver};
