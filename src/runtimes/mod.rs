//! Runtime client bindings.
//!
//! Each binding implements [`RuntimeClient`](crate::runtime::RuntimeClient)
//! against a concrete container runtime. The session orchestrator only sees
//! the trait, so alternative bindings (a containerd socket client, a test
//! double) slot in without touching session logic.

pub mod native;

pub use self::native::NativeRuntime;
