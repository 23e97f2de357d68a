// Device sampling. A `GpuSource` reads the driver; the `Sampler` runs it off the async runtime
// and attaches process owners resolved through sysinfo.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};
use tracing::instrument;

use crate::models::{CpuUsage, GpuInfo, ProcessInfo};

pub const UNKNOWN_USER: &str = "N/A";
pub const UNKNOWN_PROCESS: &str = "Unknown";

/// A device poll before owner resolution: processes carry only pid and memory.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub gpu_index: u32,
    pub name: String,
    pub gpu_utilization: u32,
    pub memory_utilization: u32,
    pub total_memory: u64,
    pub used_memory: u64,
    pub free_memory: u64,
    pub processes: Vec<(u32, Option<u64>)>,
}

pub trait GpuSource: Send {
    fn poll(&mut self) -> anyhow::Result<Vec<DeviceReading>>;
}

/// Fixed readings, for hosts without a driver and for tests.
pub struct StaticSource {
    readings: Vec<DeviceReading>,
}

impl StaticSource {
    pub fn new(readings: Vec<DeviceReading>) -> Self {
        Self { readings }
    }

    /// One idle 80 GiB device with no processes.
    pub fn mock() -> Self {
        const TOTAL: u64 = 80 << 30;
        Self::new(vec![DeviceReading {
            gpu_index: 0,
            name: "Mock GPU".into(),
            gpu_utilization: 0,
            memory_utilization: 0,
            total_memory: TOTAL,
            used_memory: 0,
            free_memory: TOTAL,
            processes: vec![],
        }])
    }
}

impl GpuSource for StaticSource {
    fn poll(&mut self) -> anyhow::Result<Vec<DeviceReading>> {
        Ok(self.readings.clone())
    }
}

#[cfg(feature = "nvml")]
pub struct NvmlSource {
    nvml: nvml_wrapper::Nvml,
}

#[cfg(feature = "nvml")]
impl NvmlSource {
    pub fn init() -> anyhow::Result<Self> {
        let nvml = nvml_wrapper::Nvml::init()?;
        Ok(Self { nvml })
    }
}

#[cfg(feature = "nvml")]
impl GpuSource for NvmlSource {
    fn poll(&mut self) -> anyhow::Result<Vec<DeviceReading>> {
        use nvml_wrapper::enums::device::UsedGpuMemory;
        use nvml_wrapper::error::NvmlError;

        let count = self.nvml.device_count()?;
        let mut out = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self.nvml.device_by_index(index)?;
            let util = device.utilization_rates()?;
            let mem = device.memory_info()?;

            let mut procs = Vec::new();
            for list in [
                device.running_graphics_processes(),
                device.running_compute_processes(),
            ] {
                match list {
                    Ok(list) => procs.extend(list),
                    Err(NvmlError::NotSupported) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            let mut seen = std::collections::HashSet::new();
            let processes = procs
                .into_iter()
                .filter(|p| seen.insert(p.pid))
                .map(|p| {
                    let used = match p.used_gpu_memory {
                        UsedGpuMemory::Used(bytes) => Some(bytes),
                        UsedGpuMemory::Unavailable => None,
                    };
                    (p.pid, used)
                })
                .collect();

            out.push(DeviceReading {
                gpu_index: index,
                name: device.name()?,
                gpu_utilization: util.gpu,
                memory_utilization: util.memory,
                total_memory: mem.total,
                used_memory: mem.used,
                free_memory: mem.free,
                processes,
            });
        }
        Ok(out)
    }
}

/// The driver source for this build: NVML when compiled in and loadable, else an error.
pub fn default_source() -> anyhow::Result<Box<dyn GpuSource>> {
    #[cfg(feature = "nvml")]
    {
        Ok(Box::new(NvmlSource::init()?))
    }
    #[cfg(not(feature = "nvml"))]
    {
        anyhow::bail!("built without the nvml feature; no GPU source available")
    }
}

/// Owner, CPU usage and name of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOwner {
    pub user: String,
    pub cpu_usage: CpuUsage,
    pub name: String,
}

impl ProcessOwner {
    pub fn unknown() -> Self {
        Self {
            user: UNKNOWN_USER.to_string(),
            cpu_usage: CpuUsage::unavailable(),
            name: UNKNOWN_PROCESS.to_string(),
        }
    }
}

pub struct OwnerResolver {
    sys: System,
    users: Users,
}

impl Default for OwnerResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerResolver {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            users: Users::new_with_refreshed_list(),
        }
    }

    /// Look up `pids`. Processes that exited or cannot be read come back as `ProcessOwner::unknown()`.
    pub fn resolve(&mut self, pids: &[u32]) -> HashMap<u32, ProcessOwner> {
        let wanted: Vec<Pid> = pids.iter().map(|&p| Pid::from_u32(p)).collect();
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&wanted),
            true,
            ProcessRefreshKind::nothing()
                .with_cpu()
                .with_user(UpdateKind::OnlyIfNotSet),
        );

        let mut refreshed_users = false;
        let mut out = HashMap::with_capacity(pids.len());
        for &pid in pids {
            let Some(process) = self.sys.process(Pid::from_u32(pid)) else {
                out.insert(pid, ProcessOwner::unknown());
                continue;
            };
            let user = match process.user_id() {
                Some(uid) => {
                    if self.users.get_user_by_id(uid).is_none() && !refreshed_users {
                        self.users.refresh();
                        refreshed_users = true;
                    }
                    self.users
                        .get_user_by_id(uid)
                        .map(|u| u.name().to_string())
                        .unwrap_or_else(|| UNKNOWN_USER.to_string())
                }
                None => UNKNOWN_USER.to_string(),
            };
            out.insert(
                pid,
                ProcessOwner {
                    user,
                    cpu_usage: CpuUsage::Percent(process.cpu_usage() as f64),
                    name: process.name().to_string_lossy().into_owned(),
                },
            );
        }
        out
    }
}

/// Join readings with resolved owners.
pub fn attach_owners(
    readings: Vec<DeviceReading>,
    owners: &HashMap<u32, ProcessOwner>,
) -> Vec<GpuInfo> {
    readings
        .into_iter()
        .map(|r| {
            let processes = r
                .processes
                .iter()
                .map(|&(pid, used_memory)| {
                    let owner = owners.get(&pid).cloned().unwrap_or_else(ProcessOwner::unknown);
                    ProcessInfo {
                        pid,
                        user: owner.user,
                        used_memory,
                        cpu_usage: owner.cpu_usage,
                        name: owner.name,
                    }
                })
                .collect();
            GpuInfo {
                gpu_index: r.gpu_index,
                name: r.name,
                gpu_utilization: r.gpu_utilization,
                memory_utilization: r.memory_utilization,
                total_memory: r.total_memory,
                used_memory: r.used_memory,
                free_memory: r.free_memory,
                processes,
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct Sampler {
    source: Arc<Mutex<Box<dyn GpuSource>>>,
    owners: Arc<Mutex<OwnerResolver>>,
}

impl Sampler {
    pub fn new(source: Box<dyn GpuSource>) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            owners: Arc::new(Mutex::new(OwnerResolver::new())),
        }
    }

    /// One poll of every device with process owners filled in.
    #[instrument(skip(self), fields(repo = "sampler", operation = "poll"))]
    pub async fn poll(&self) -> anyhow::Result<Vec<GpuInfo>> {
        let source = self.source.clone();
        let owners = self.owners.clone();
        tokio::task::spawn_blocking(move || {
            let readings = source
                .lock()
                .map_err(|e| anyhow::anyhow!("gpu source lock poisoned: {}", e))?
                .poll()?;
            let pids: Vec<u32> = readings
                .iter()
                .flat_map(|r| r.processes.iter().map(|&(pid, _)| pid))
                .collect();
            let resolved = owners
                .lock()
                .map_err(|e| anyhow::anyhow!("owner resolver lock poisoned: {}", e))?
                .resolve(&pids);
            Ok(attach_owners(readings, &resolved))
        })
        .await?
    }
}
