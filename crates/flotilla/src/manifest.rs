use flotilla_core::{JobSpec, NodeCapacity, ResourceQuantities, ResourceRequirements};
use flotilla_scheduler::SchedulerConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Cluster description driven by `flotilla simulate`
///
/// ```yaml
/// nodes:
///   - name: node-a
///     cpu: "4"
///     memory: 8Gi
///     fail_after_secs: 10
/// jobs:
///   - name: etl
///     priority: 8
///     cpu: 500m
///     memory: 512Mi
///     replicas: 3
///     hint: { duration_ms: 200, fail_attempts: 1 }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub nodes: Vec<NodeManifest>,
    #[serde(default)]
    pub jobs: Vec<JobManifest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeManifest {
    pub name: String,
    pub cpu: String,
    pub memory: String,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub gpu_memory: Option<String>,
    /// Load reported with every heartbeat
    #[serde(default)]
    pub load: f64,
    /// Stop heartbeating after this long, simulating a crashed node
    #[serde(default)]
    pub fail_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobManifest {
    pub name: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub gpu_memory: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Submit this many copies, named `<name>-<n>`
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Mock executor behaviour, passed through as the job payload
    #[serde(default)]
    pub hint: Option<serde_json::Value>,
}

fn default_cpu() -> String {
    "1".to_string()
}

fn default_memory() -> String {
    "1Gi".to_string()
}

fn default_replicas() -> u32 {
    1
}

impl Manifest {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| miette::miette!("Failed to read manifest '{}': {}", path.display(), e))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| miette::miette!("Invalid manifest '{}': {}", path.display(), e))
    }
}

impl NodeManifest {
    pub fn capacity(&self) -> flotilla_core::Result<NodeCapacity> {
        let capacity = NodeCapacity::new(
            ResourceQuantities::parse_cpu(&self.cpu)?,
            ResourceQuantities::parse_memory(&self.memory)?,
        );
        if self.gpus == 0 {
            return Ok(capacity);
        }
        let gpu_memory = match &self.gpu_memory {
            Some(q) => ResourceQuantities::parse_memory(q)?,
            None => 0.0,
        };
        Ok(capacity.with_gpus(self.gpus, gpu_memory))
    }

    pub fn fail_after(&self) -> Option<Duration> {
        self.fail_after_secs.map(Duration::from_secs)
    }
}

impl JobManifest {
    /// Expand into one spec per replica
    pub fn to_specs(&self) -> flotilla_core::Result<Vec<JobSpec>> {
        let mut resources = ResourceRequirements::new(
            ResourceQuantities::parse_cpu(&self.cpu)?,
            ResourceQuantities::parse_memory(&self.memory)?,
        );
        if self.gpu {
            let gpu_memory = self
                .gpu_memory
                .as_deref()
                .map(ResourceQuantities::parse_memory)
                .transpose()?;
            resources = resources.with_gpu(gpu_memory);
        }

        let payload = match &self.hint {
            Some(hint) => serde_json::to_vec(hint)
                .map_err(|e| flotilla_core::FlotillaError::internal_error(e.to_string()))?,
            None => Vec::new(),
        };

        let specs = (0..self.replicas.max(1))
            .map(|n| {
                let name = if self.replicas > 1 {
                    format!("{}-{}", self.name, n)
                } else {
                    self.name.clone()
                };
                JobSpec {
                    name,
                    priority: self.priority,
                    resources: resources.clone(),
                    max_retries: self.max_retries,
                    timeout_secs: self.timeout_secs,
                    payload: bytes::Bytes::from(payload.clone()),
                }
            })
            .collect();
        Ok(specs)
    }
}

/// Read a scheduler config file, or the defaults when none is given
pub fn load_config(path: Option<&Path>) -> miette::Result<SchedulerConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                miette::miette!("Failed to read config '{}': {}", path.display(), e)
            })?;
            serde_yaml::from_str::<SchedulerConfig>(&raw)
                .map_err(|e| miette::miette!("Invalid config '{}': {}", path.display(), e))?
        }
        None => SchedulerConfig::default(),
    };
    config.validate()?;
    Ok(config)
}
