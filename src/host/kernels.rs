//! Host kernel library
//!
//! Host "device code" is a Rust function looked up by name. A loader entry
//! with format [`CodeFormat::HostSymbol`](crate::CodeFormat::HostSymbol)
//! carries that name as its code blob.

use super::heap::DeviceHeap;
use crate::kernel::KernelArg;
use crate::launch::LaunchConfig;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Body of a host kernel. An `Err` becomes a `LaunchFailed` on the stream.
pub type HostKernelFn =
    Arc<dyn Fn(&mut KernelContext<'_>) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct HostKernel {
    pub(crate) arity: usize,
    pub(crate) body: HostKernelFn,
}

/// Named host kernels
#[derive(Clone, Default)]
pub struct KernelLibrary {
    kernels: IndexMap<String, HostKernel>,
}

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// The kernels every host platform ships with.
    pub fn builtin() -> Self {
        let mut library = Self::new();
        library
            .register("fill_u32", 2, fill_u32)
            .register("saxpy", 4, saxpy)
            .register("vector_add_f32", 3, vector_add_f32);
        library
    }

    pub fn register<F>(&mut self, name: &str, arity: usize, body: F) -> &mut Self
    where
        F: Fn(&mut KernelContext<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.kernels.insert(
            name.to_string(),
            HostKernel {
                arity,
                body: Arc::new(body),
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&HostKernel> {
        self.kernels.get(name)
    }
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.kernels.keys()).finish()
    }
}

/// What a host kernel sees while it runs
pub struct KernelContext<'a> {
    config: LaunchConfig,
    args: &'a [KernelArg],
    heap: &'a mut DeviceHeap,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(config: LaunchConfig, args: &'a [KernelArg], heap: &'a mut DeviceHeap) -> Self {
        Self { config, args, heap }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn arg(&self, index: usize) -> Result<&KernelArg, String> {
        self.args
            .get(index)
            .ok_or_else(|| format!("no argument {}", index))
    }

    pub fn u32(&self, index: usize) -> Result<u32, String> {
        match self.arg(index)? {
            KernelArg::UInt32(v) => Ok(*v),
            other => Err(format!("argument {} is {:?}, expected u32", index, other)),
        }
    }

    pub fn f32(&self, index: usize) -> Result<f32, String> {
        match self.arg(index)? {
            KernelArg::Float32(v) => Ok(*v),
            other => Err(format!("argument {} is {:?}, expected f32", index, other)),
        }
    }

    pub fn buffer(&self, index: usize) -> Result<&[u8], String> {
        let memory = self.buffer_arg(index)?;
        self.heap.resolve(memory).map_err(|e| e.to_string())
    }

    pub fn buffer_mut(&mut self, index: usize) -> Result<&mut [u8], String> {
        let memory = self.buffer_arg(index)?;
        self.heap.resolve_mut(memory).map_err(|e| e.to_string())
    }

    pub fn read_f32(&self, index: usize) -> Result<Vec<f32>, String> {
        Ok(self
            .buffer(index)?
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect())
    }

    /// Overwrite the start of buffer `index` with `values`.
    pub fn write_f32(&mut self, index: usize, values: &[f32]) -> Result<(), String> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let dst = self.buffer_mut(index)?;
        if bytes.len() > dst.len() {
            return Err(format!(
                "writing {} bytes into a {} byte buffer",
                bytes.len(),
                dst.len()
            ));
        }
        dst[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn buffer_arg(&self, index: usize) -> Result<crate::DeviceMemory, String> {
        self.arg(index)?
            .as_buffer()
            .ok_or_else(|| format!("argument {} is not a device buffer", index))
    }
}

// === Builtins ===

/// `fill_u32(dst, value)`: every 32-bit word of `dst` becomes `value`.
fn fill_u32(ctx: &mut KernelContext<'_>) -> Result<(), String> {
    let value = ctx.u32(1)?;
    for word in ctx.buffer_mut(0)?.chunks_exact_mut(4) {
        word.copy_from_slice(bytemuck::bytes_of(&value));
    }
    Ok(())
}

/// `saxpy(n, a, x, y)`: `y[i] = a * x[i] + y[i]` for `i < n`.
fn saxpy(ctx: &mut KernelContext<'_>) -> Result<(), String> {
    let n = ctx.u32(0)? as usize;
    let a = ctx.f32(1)?;
    let x = ctx.read_f32(2)?;
    let mut y = ctx.read_f32(3)?;
    if x.len() < n || y.len() < n {
        return Err(format!(
            "n = {} but x has {} and y has {} elements",
            n,
            x.len(),
            y.len()
        ));
    }
    for (yi, xi) in y.iter_mut().zip(&x).take(n) {
        *yi += a * xi;
    }
    ctx.write_f32(3, &y)
}

/// `vector_add_f32(a, b, out)`: elementwise sum over the length of `out`.
fn vector_add_f32(ctx: &mut KernelContext<'_>) -> Result<(), String> {
    let a = ctx.read_f32(0)?;
    let b = ctx.read_f32(1)?;
    let len = ctx.buffer(2)?.len() / 4;
    if a.len() < len || b.len() < len {
        return Err("inputs shorter than output".to_string());
    }
    let sum: Vec<f32> = a.iter().zip(&b).take(len).map(|(x, y)| x + y).collect();
    ctx.write_f32(2, &sum)
}
