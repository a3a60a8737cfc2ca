use crate::error::{FlotillaError, Result};
use serde::{Deserialize, Serialize};

/// Tolerance for floating point resource comparisons
const EPSILON: f64 = 1e-9;

/// Resources a job asks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU in cores (fractions allowed)
    pub cpu_cores: f64,
    /// Memory in GB
    pub memory_gb: f64,
    /// Whether the job needs a GPU
    #[serde(default)]
    pub gpu_required: bool,
    /// GPU memory in GB, only meaningful with `gpu_required`
    #[serde(default)]
    pub gpu_memory_gb: Option<f64>,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_gb: 2.0,
            gpu_required: false,
            gpu_memory_gb: None,
        }
    }
}

impl ResourceRequirements {
    pub fn new(cpu_cores: f64, memory_gb: f64) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            gpu_required: false,
            gpu_memory_gb: None,
        }
    }

    pub fn with_gpu(mut self, gpu_memory_gb: Option<f64>) -> Self {
        self.gpu_required = true;
        self.gpu_memory_gb = gpu_memory_gb;
        self
    }

    /// Reject requirements that no node could ever satisfy meaningfully
    pub fn validate(&self) -> Result<()> {
        if !self.cpu_cores.is_finite() || self.cpu_cores <= 0.0 {
            return Err(FlotillaError::validation_failed(
                "resources.cpu_cores",
                format!("must be a positive number, got {}", self.cpu_cores),
                "Request at least a fraction of a core, e.g. 0.5",
            ));
        }

        if !self.memory_gb.is_finite() || self.memory_gb < 0.0 {
            return Err(FlotillaError::validation_failed(
                "resources.memory_gb",
                format!("must be zero or positive, got {}", self.memory_gb),
                "Express memory in GB, e.g. 2.0",
            ));
        }

        if let Some(gpu_mem) = self.gpu_memory_gb {
            if !self.gpu_required {
                return Err(FlotillaError::validation_failed(
                    "resources.gpu_memory_gb",
                    "GPU memory requested without gpu_required",
                    "Set gpu_required = true or drop gpu_memory_gb",
                ));
            }
            if !gpu_mem.is_finite() || gpu_mem < 0.0 {
                return Err(FlotillaError::validation_failed(
                    "resources.gpu_memory_gb",
                    format!("must be zero or positive, got {}", gpu_mem),
                    "Express GPU memory in GB, e.g. 16.0",
                ));
            }
        }

        Ok(())
    }
}

/// Total resources a node offers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    #[serde(default)]
    pub gpu_count: u32,
    /// Aggregate GPU memory across all devices, in GB
    #[serde(default)]
    pub gpu_memory_gb: f64,
}

impl NodeCapacity {
    pub fn new(cpu_cores: f64, memory_gb: f64) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            gpu_count: 0,
            gpu_memory_gb: 0.0,
        }
    }

    pub fn with_gpus(mut self, gpu_count: u32, gpu_memory_gb: f64) -> Self {
        self.gpu_count = gpu_count;
        self.gpu_memory_gb = gpu_memory_gb;
        self
    }
}

/// Resources currently reserved on a node by its assigned jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub gpus: u32,
    pub gpu_memory_gb: f64,
}

impl Allocation {
    pub fn add(&mut self, req: &ResourceRequirements) {
        self.cpu_cores += req.cpu_cores;
        self.memory_gb += req.memory_gb;
        if req.gpu_required {
            self.gpus += 1;
            self.gpu_memory_gb += req.gpu_memory_gb.unwrap_or(0.0);
        }
    }

    pub fn subtract(&mut self, req: &ResourceRequirements) {
        self.cpu_cores = (self.cpu_cores - req.cpu_cores).max(0.0);
        self.memory_gb = (self.memory_gb - req.memory_gb).max(0.0);
        if req.gpu_required {
            self.gpus = self.gpus.saturating_sub(1);
            self.gpu_memory_gb = (self.gpu_memory_gb - req.gpu_memory_gb.unwrap_or(0.0)).max(0.0);
        }
    }

    /// Spare capacity left on `capacity` after this allocation
    pub fn spare(&self, capacity: &NodeCapacity) -> Allocation {
        Allocation {
            cpu_cores: (capacity.cpu_cores - self.cpu_cores).max(0.0),
            memory_gb: (capacity.memory_gb - self.memory_gb).max(0.0),
            gpus: capacity.gpu_count.saturating_sub(self.gpus),
            gpu_memory_gb: (capacity.gpu_memory_gb - self.gpu_memory_gb).max(0.0),
        }
    }

    /// Fraction of the node in use, taking the busiest of cpu and memory
    pub fn utilization(&self, capacity: &NodeCapacity) -> f64 {
        let cpu = if capacity.cpu_cores > 0.0 {
            self.cpu_cores / capacity.cpu_cores
        } else {
            1.0
        };
        let memory = if capacity.memory_gb > 0.0 {
            self.memory_gb / capacity.memory_gb
        } else {
            1.0
        };
        cpu.max(memory).clamp(0.0, 1.0)
    }
}

/// Result of checking requirements against spare capacity
#[derive(Debug, Clone, PartialEq)]
pub enum Fit {
    Fits,
    Insufficient(String),
}

impl Fit {
    pub fn fits(&self) -> bool {
        matches!(self, Fit::Fits)
    }
}

/// Check every requested dimension against spare resources
pub fn check_fit(req: &ResourceRequirements, spare: &Allocation) -> Fit {
    if req.cpu_cores > spare.cpu_cores + EPSILON {
        return Fit::Insufficient(format!(
            "Insufficient CPU: requested {:.2} cores, available {:.2} cores",
            req.cpu_cores, spare.cpu_cores
        ));
    }

    if req.memory_gb > spare.memory_gb + EPSILON {
        return Fit::Insufficient(format!(
            "Insufficient memory: requested {:.2} GB, available {:.2} GB",
            req.memory_gb, spare.memory_gb
        ));
    }

    if req.gpu_required {
        if spare.gpus == 0 {
            return Fit::Insufficient("Insufficient GPU: no free GPU".to_string());
        }
        let gpu_mem = req.gpu_memory_gb.unwrap_or(0.0);
        if gpu_mem > spare.gpu_memory_gb + EPSILON {
            return Fit::Insufficient(format!(
                "Insufficient GPU memory: requested {:.2} GB, available {:.2} GB",
                gpu_mem, spare.gpu_memory_gb
            ));
        }
    }

    Fit::Fits
}

/// Parsers for human-readable resource quantities used in cluster manifests
pub struct ResourceQuantities;

impl ResourceQuantities {
    /// Parse CPU string into cores (e.g., "2", "1000m", "0.5")
    pub fn parse_cpu(s: &str) -> Result<f64> {
        let s = s.trim();
        if let Some(m) = s.strip_suffix('m') {
            // Millicores
            m.parse::<u64>()
                .map(|milli| milli as f64 / 1000.0)
                .map_err(|e| FlotillaError::invalid_quantity(s, e.to_string()))
        } else {
            s.parse::<f64>()
                .ok()
                .filter(|cores| cores.is_finite() && *cores >= 0.0)
                .ok_or_else(|| FlotillaError::invalid_quantity(s, "not a CPU core count"))
        }
    }

    /// Parse memory string into GB (e.g., "128Mi", "8Gi", "1024")
    pub fn parse_memory(s: &str) -> Result<f64> {
        const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
        let s = s.trim();

        let (num, multiplier) = if let Some(num) = s.strip_suffix("Ki") {
            (num, 1024.0)
        } else if let Some(num) = s.strip_suffix("Mi") {
            (num, 1024.0 * 1024.0)
        } else if let Some(num) = s.strip_suffix("Gi") {
            (num, GIB)
        } else if let Some(num) = s.strip_suffix("Ti") {
            (num, GIB * 1024.0)
        } else {
            // Plain bytes
            (s, 1.0)
        };

        let value = num
            .parse::<f64>()
            .map_err(|e| FlotillaError::invalid_quantity(s, e.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(FlotillaError::invalid_quantity(s, "must be zero or positive"));
        }

        Ok(value * multiplier / GIB)
    }
}
