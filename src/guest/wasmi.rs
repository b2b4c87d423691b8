//! `wasmi`-backed implementation of the runtime port.
//!
//! The three imports live in module `env`. They read guest memory through
//! the caller's exported `memory` and bounce straight into [`HostEnv`];
//! out-of-range pointers make the import a no-op (`SendMsg` returns 0)
//! instead of trapping, so a buggy guest cannot wedge its own activation
//! loop.
//!
//! Host-side allocations (the linked `msg_buf`/`mode_buf`) come from an
//! instance-level bump allocator appended to the module's linear memory and
//! capped by the heap size given at instantiation. The guest never hands
//! out that memory itself; it only learns the addresses through its link
//! exports.

use ::wasmi::core::Pages;
use ::wasmi::{Caller, Config, Engine, Linker, Memory, Module, StackLimits, Store};

use heapless::Vec;

use crate::config::{GUEST_STACK_SIZE, MAX_DATA_LEN};

use super::runtime::{CallError, Instance, Runtime};
use super::HostEnv;

/// Longest `PrintStr` span copied out of guest memory per call.
const PRINT_STR_MAX: usize = 256;

/// Bytes per WebAssembly linear-memory page.
const PAGE_SIZE: usize = 0x10000;

#[derive(Debug)]
pub enum WasmiError {
    Wasmi(::wasmi::Error),
    Linker(::wasmi::errors::LinkerError),
    Memory(::wasmi::errors::MemoryError),
    /// The module does not export its linear memory as `memory`.
    NoMemory,
    /// The instantiation-time heap is spent; the allocation was refused.
    HeapExhausted,
}

impl From<::wasmi::Error> for WasmiError {
    fn from(err: ::wasmi::Error) -> Self {
        WasmiError::Wasmi(err)
    }
}

pub struct WasmiRuntime {
    engine: Engine,
}

impl WasmiRuntime {
    pub fn new() -> Self {
        let mut config = Config::default();
        // Eight bytes per value slot maps the configured byte count onto
        // the interpreter's value-stack height.
        let limits =
            StackLimits::new(1024, GUEST_STACK_SIZE / 8, 1024).unwrap_or_default();
        config.set_stack_limits(limits);
        WasmiRuntime {
            engine: Engine::new(&config),
        }
    }
}

impl Default for WasmiRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime for WasmiRuntime {
    type Module = Module;
    type Instance = WasmiInstance;
    type Error = WasmiError;

    fn load(&mut self, wasm: &[u8]) -> Result<Module, WasmiError> {
        Ok(Module::new(&self.engine, wasm)?)
    }

    fn instantiate(
        &mut self,
        module: &Module,
        env: HostEnv,
        stack_size: usize,
        heap_size: usize,
    ) -> Result<WasmiInstance, WasmiError> {
        // The value stack was sized at engine construction; `heap_size`
        // bounds the host-side allocator below.
        log::debug!("guest: instantiate, stack={} heap={}", stack_size, heap_size);

        let mut store = Store::new(&self.engine, env);
        let mut linker = <Linker<HostEnv>>::new(&self.engine);

        linker
            .func_wrap(
                "env",
                "PrintStr",
                |mut caller: Caller<'_, HostEnv>, ptr: i32, len: i32| {
                    let Some(bytes) = copy_guest_bytes::<PRINT_STR_MAX>(&mut caller, ptr, len)
                    else {
                        return;
                    };
                    let env = *caller.data();
                    env.print_str(&bytes);
                },
            )
            .map_err(WasmiError::Linker)?;

        linker
            .func_wrap(
                "env",
                "PrintInt32",
                |caller: Caller<'_, HostEnv>, number: i32, hex: i32| {
                    caller.data().print_int32(number, hex == 1);
                },
            )
            .map_err(WasmiError::Linker)?;

        linker
            .func_wrap(
                "env",
                "SendMsg",
                |mut caller: Caller<'_, HostEnv>,
                 controller_id: i32,
                 priority: i32,
                 pgn: i32,
                 source: i32,
                 data_ptr: i32,
                 data_len: i32|
                 -> i32 {
                    let Some(bytes) =
                        copy_guest_bytes::<MAX_DATA_LEN>(&mut caller, data_ptr, data_len)
                    else {
                        return 0;
                    };
                    let env = *caller.data();
                    env.send_msg(controller_id, priority, pgn, source, &bytes)
                },
            )
            .map_err(WasmiError::Linker)?;

        let instance = linker.instantiate(&mut store, module)?.start(&mut store)?;
        let memory = instance
            .get_memory(&store, "memory")
            .ok_or(WasmiError::NoMemory)?;

        // The host heap starts where the module's initial memory ends.
        let heap_base = memory.data(&store).len() as u32;

        Ok(WasmiInstance {
            store,
            instance,
            memory,
            heap_base,
            heap_used: 0,
            heap_size,
        })
    }
}

pub struct WasmiInstance {
    store: Store<HostEnv>,
    instance: ::wasmi::Instance,
    memory: Memory,
    heap_base: u32,
    heap_used: u32,
    heap_size: usize,
}

impl Instance for WasmiInstance {
    type Error = WasmiError;

    fn alloc(&mut self, size: u32) -> Result<u32, WasmiError> {
        // Bump allocation out of the reserved heap region, growing linear
        // memory underneath it as needed. The region sits past everything
        // the module placed itself, so nothing in the guest aliases it.
        let aligned = (size.max(1).checked_add(7).ok_or(WasmiError::HeapExhausted)?) & !7;
        let new_used = self
            .heap_used
            .checked_add(aligned)
            .ok_or(WasmiError::HeapExhausted)?;
        if new_used as usize > self.heap_size {
            return Err(WasmiError::HeapExhausted);
        }

        let ptr = self.heap_base + self.heap_used;
        let required = self.heap_base as usize + new_used as usize;
        let current = self.memory.data(&self.store).len();
        if required > current {
            let deficit = required - current;
            let pages = Pages::new(((deficit + PAGE_SIZE - 1) / PAGE_SIZE) as u32)
                .ok_or(WasmiError::HeapExhausted)?;
            self.memory
                .grow(&mut self.store, pages)
                .map_err(WasmiError::Memory)?;
        }

        self.heap_used = new_used;
        Ok(ptr)
    }

    fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), WasmiError> {
        self.memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(WasmiError::Memory)
    }

    fn call_link_export(&mut self, name: &str, ptr: u32, size: u32) -> Result<(), CallError> {
        let func = self
            .instance
            .get_typed_func::<(i32, i32), ()>(&self.store, name)
            .map_err(|_| CallError::MissingExport)?;
        func.call(&mut self.store, (ptr as i32, size as i32))
            .map_err(|err| {
                log::warn!("guest: {} trapped: {}", name, err);
                CallError::Trap
            })
    }

    fn call_main(&mut self) -> Result<(), CallError> {
        let func = self
            .instance
            .get_typed_func::<(), ()>(&self.store, "main")
            .map_err(|_| CallError::MissingExport)?;
        func.call(&mut self.store, ()).map_err(|err| {
            log::warn!("guest: trap: {}", err);
            CallError::Trap
        })
    }
}

/// Copies `len` bytes at `ptr` out of the caller's linear memory, bounded by
/// `N`. `None` on a missing memory export or an out-of-range span.
fn copy_guest_bytes<const N: usize>(
    caller: &mut Caller<'_, HostEnv>,
    ptr: i32,
    len: i32,
) -> Option<Vec<u8, N>> {
    if ptr < 0 || len < 0 || len as usize > N {
        return None;
    }
    let memory = caller.get_export("memory")?.into_memory()?;
    let mut bytes: Vec<u8, N> = Vec::new();
    bytes.resize_default(len as usize).ok()?;
    memory.read(&*caller, ptr as usize, &mut bytes).ok()?;
    Some(bytes)
}
