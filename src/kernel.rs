//! Kernel handles and launch arguments

use crate::backend::KernelToken;
use crate::executor::ExecutorId;
use crate::loader::CodeFormat;
use crate::memory::DeviceMemory;

/// Reference to kernel code loaded on one executor
///
/// A fresh handle is unbound. [`Executor::get_kernel`](crate::Executor::get_kernel)
/// binds it; only bound handles can be launched, and only on the executor that
/// bound them.
#[derive(Debug, Default)]
pub struct KernelHandle {
    binding: Option<Binding>,
}

#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub(crate) executor: ExecutorId,
    pub(crate) token: KernelToken,
    pub(crate) name: String,
    pub(crate) format: CodeFormat,
    pub(crate) arity: usize,
}

impl KernelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Get the kernel name
    pub fn name(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.name.as_str())
    }

    /// Declared argument count of the bound entry
    pub fn arity(&self) -> Option<usize> {
        self.binding.as_ref().map(|b| b.arity)
    }

    pub fn format(&self) -> Option<CodeFormat> {
        self.binding.as_ref().map(|b| b.format)
    }

    pub fn executor(&self) -> Option<ExecutorId> {
        self.binding.as_ref().map(|b| b.executor)
    }

    pub(crate) fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub(crate) fn bind(&mut self, binding: Binding) {
        self.binding = Some(binding);
    }

    pub(crate) fn unbind(&mut self) -> Option<Binding> {
        self.binding.take()
    }
}

/// Kernel argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(DeviceMemory),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl KernelArg {
    /// Size of the argument as passed to the device.
    pub fn size(&self) -> usize {
        match self {
            KernelArg::Buffer(_) => std::mem::size_of::<u64>(),
            KernelArg::Int32(_) | KernelArg::UInt32(_) | KernelArg::Float32(_) => 4,
            KernelArg::Int64(_) | KernelArg::UInt64(_) | KernelArg::Float64(_) => 8,
        }
    }

    /// Native-endian bytes of the value; buffers pass their address token.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            KernelArg::Buffer(mem) => mem.address().0.to_ne_bytes().to_vec(),
            KernelArg::Int32(v) => v.to_ne_bytes().to_vec(),
            KernelArg::Int64(v) => v.to_ne_bytes().to_vec(),
            KernelArg::UInt32(v) => v.to_ne_bytes().to_vec(),
            KernelArg::UInt64(v) => v.to_ne_bytes().to_vec(),
            KernelArg::Float32(v) => v.to_ne_bytes().to_vec(),
            KernelArg::Float64(v) => v.to_ne_bytes().to_vec(),
        }
    }

    pub fn as_buffer(&self) -> Option<DeviceMemory> {
        match self {
            KernelArg::Buffer(mem) => Some(*mem),
            _ => None,
        }
    }
}

impl From<&DeviceMemory> for KernelArg {
    fn from(mem: &DeviceMemory) -> Self {
        KernelArg::Buffer(*mem)
    }
}

macro_rules! scalar_arg {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for KernelArg {
                fn from(v: $ty) -> Self {
                    KernelArg::$variant(v)
                }
            }
        )*
    };
}

scalar_arg! {
    i32 => Int32,
    i64 => Int64,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

/// Ordered argument list for a launch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelArgs {
    args: Vec<KernelArg>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl Into<KernelArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn push(&mut self, arg: impl Into<KernelArg>) {
        self.args.push(arg.into());
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&KernelArg> {
        self.args.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KernelArg> {
        self.args.iter()
    }

    pub fn as_slice(&self) -> &[KernelArg] {
        &self.args
    }
}

impl FromIterator<KernelArg> for KernelArgs {
    fn from_iter<I: IntoIterator<Item = KernelArg>>(iter: I) -> Self {
        Self {
            args: iter.into_iter().collect(),
        }
    }
}
