//! Ports to the WebAssembly runtime.
//!
//! The embedder only needs load, instantiate, linear-memory access and
//! export calls; everything else about the runtime stays behind these two
//! traits. The shipped binding is [`crate::guest::wasmi`]; tests drive the
//! host with a scripted stand-in.

use super::HostEnv;

/// Why an export call did not complete.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallError {
    /// The module does not provide the export (or its signature differs).
    MissingExport,
    /// The guest trapped. Non-fatal: the instance stays live.
    Trap,
}

/// A WebAssembly runtime able to produce guest instances.
pub trait Runtime {
    type Module;
    type Instance: Instance;
    type Error: core::fmt::Debug;

    /// Validates and loads a binary module.
    fn load(&mut self, wasm: &[u8]) -> Result<Self::Module, Self::Error>;

    /// Instantiates `module` with the host imports reachable through `env`
    /// and the requested stack and heap sizes.
    fn instantiate(
        &mut self,
        module: &Self::Module,
        env: HostEnv,
        stack_size: usize,
        heap_size: usize,
    ) -> Result<Self::Instance, Self::Error>;
}

/// One live guest instance.
pub trait Instance {
    type Error: core::fmt::Debug;

    /// Reserves `size` bytes inside the guest's linear memory and returns
    /// the guest-side pointer.
    fn alloc(&mut self, size: u32) -> Result<u32, Self::Error>;

    /// Copies `bytes` into linear memory at `ptr`.
    fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Calls a `(ptr, size) -> ()` export such as `link_msg_buffer`.
    fn call_link_export(&mut self, name: &str, ptr: u32, size: u32) -> Result<(), CallError>;

    /// Runs one activation of the guest's `main` export.
    fn call_main(&mut self) -> Result<(), CallError>;
}
