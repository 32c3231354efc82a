//! Core value types shared by the graph, backends and memory manager.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Stable node handle, never reused while the graph lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Stable tensor handle, never reused while the graph lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

/// Stable edge handle, never reused while the graph lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

/// Process-unique graph identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub usize);

macro_rules! impl_id_display {
    ($($ty:ident),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

impl_id_display!(NodeId, TensorId, EdgeId, GraphId);

/// Execution device selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Not yet resolved; must be assigned before allocation
    #[default]
    Unspecified,
    /// Vector CPU
    Cpu,
    /// GPU compute queue
    GpuCompute,
    /// GPU shader pipeline
    GpuShader,
}

impl Target {
    /// All concrete targets, in default-preference order
    pub const CONCRETE: [Target; 3] = [Target::Cpu, Target::GpuCompute, Target::GpuShader];

    /// Whether the target lives on a GPU and needs mapping for host access
    pub fn is_gpu(&self) -> bool {
        matches!(self, Target::GpuCompute | Target::GpuShader)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Unspecified => write!(f, "Unspecified"),
            Target::Cpu => write!(f, "CPU"),
            Target::GpuCompute => write!(f, "GPU-compute"),
            Target::GpuShader => write!(f, "GPU-shader"),
        }
    }
}

impl FromStr for Target {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" | "neon" => Ok(Target::Cpu),
            "gpu" | "gpu_compute" | "cl" => Ok(Target::GpuCompute),
            "gpu_shader" | "gc" | "gles" => Ok(Target::GpuShader),
            other => Err(GraphError::InvalidConfiguration(format!(
                "unknown target '{}'",
                other
            ))),
        }
    }
}

/// Element data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    Unknown,
    U8,
    QAsymm8,
    S32,
    F16,
    F32,
}

impl DataType {
    /// Element size in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::Unknown => 0,
            DataType::U8 | DataType::QAsymm8 => 1,
            DataType::F16 => 2,
            DataType::S32 | DataType::F32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F16 | DataType::F32)
    }
}

/// Asymmetric quantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuantizationInfo {
    pub scale: f32,
    pub offset: i32,
}

impl QuantizationInfo {
    pub fn new(scale: f32, offset: i32) -> Self {
        Self { scale, offset }
    }

    pub fn is_empty(&self) -> bool {
        self.scale == 0.0 && self.offset == 0
    }

    pub fn quantize(&self, value: f32) -> u8 {
        let q = (value / self.scale).round() as i32 + self.offset;
        q.clamp(0, 255) as u8
    }

    pub fn dequantize(&self, value: u8) -> f32 {
        (value as i32 - self.offset) as f32 * self.scale
    }
}

/// Tensor shape in innermost-first order (`[W, H, C, N]`).
///
/// Trailing unit dimensions are dropped so `[4, 1]` and `[4]` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorShape(Vec<usize>);

impl TensorShape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        let mut shape = Self(dims.into());
        shape.trim();
        shape
    }

    fn trim(&mut self) {
        while self.0.len() > 1 && self.0.last() == Some(&1) {
            self.0.pop();
        }
    }

    pub fn num_dimensions(&self) -> usize {
        self.0.len()
    }

    /// Size of dimension `idx`, 1 beyond the last dimension
    pub fn dim(&self, idx: usize) -> usize {
        self.0.get(idx).copied().unwrap_or(1)
    }

    pub fn set(&mut self, idx: usize, value: usize) {
        if idx >= self.0.len() {
            self.0.resize(idx + 1, 1);
        }
        self.0[idx] = value;
        self.trim();
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of elements, 0 for an unconfigured shape
    pub fn total_size(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.iter().product()
        }
    }

    /// Product of dimensions from `from` upwards
    pub fn total_size_upper(&self, from: usize) -> usize {
        self.0.iter().skip(from).product()
    }

    /// Element strides, innermost stride is 1
    pub fn strides(&self, rank: usize) -> Vec<usize> {
        let mut strides = Vec::with_capacity(rank);
        let mut stride: usize = 1;
        for idx in 0..rank {
            strides.push(stride);
            stride = stride.saturating_mul(self.dim(idx));
        }
        strides
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join("x"))
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        TensorShape::new(dims)
    }
}

/// Starting coordinates of a sub-tensor inside its parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Coordinates(pub Vec<usize>);

impl Coordinates {
    pub fn new(coords: impl Into<Vec<usize>>) -> Self {
        Self(coords.into())
    }

    pub fn get(&self, idx: usize) -> usize {
        self.0.get(idx).copied().unwrap_or(0)
    }
}

/// Lifetime strategy of a memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryManagerAffinity {
    /// Whole buffers reused wholesale, one per group
    #[default]
    Buffer,
    /// Groups packed at byte offsets inside one buffer
    Offset,
}

impl FromStr for MemoryManagerAffinity {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buffer" | "blob" => Ok(MemoryManagerAffinity::Buffer),
            "offset" => Ok(MemoryManagerAffinity::Offset),
            other => Err(GraphError::InvalidConfiguration(format!(
                "unknown memory affinity '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConvolutionMethod {
    /// Let the backend choose (resolves to GEMM)
    #[default]
    Default,
    Gemm,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthwiseConvolutionMethod {
    #[default]
    Default,
    Optimized3x3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseOperation {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationFunction {
    Identity,
    Relu,
    /// min(a, max(0, x))
    BoundedRelu,
    /// x if x > 0 else a * x
    LeakyRelu,
    Logistic,
    /// a * tanh(b * x)
    Tanh,
    /// a * x + b
    Linear,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationLayerInfo {
    pub function: ActivationFunction,
    pub a: f32,
    pub b: f32,
}

impl ActivationLayerInfo {
    pub fn new(function: ActivationFunction) -> Self {
        Self {
            function,
            a: 0.0,
            b: 0.0,
        }
    }

    pub fn with_params(function: ActivationFunction, a: f32, b: f32) -> Self {
        Self { function, a, b }
    }

    pub fn relu() -> Self {
        Self::new(ActivationFunction::Relu)
    }
}

/// Convolution stride and padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PadStrideInfo {
    pub stride_x: usize,
    pub stride_y: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
}

impl PadStrideInfo {
    pub fn new(stride_x: usize, stride_y: usize, pad_x: usize, pad_y: usize) -> Self {
        Self {
            stride_x,
            stride_y,
            pad_left: pad_x,
            pad_right: pad_x,
            pad_top: pad_y,
            pad_bottom: pad_y,
        }
    }
}

impl Default for PadStrideInfo {
    fn default() -> Self {
        Self::new(1, 1, 0, 0)
    }
}
