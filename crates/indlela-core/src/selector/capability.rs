//! Host capability probe.
//!
//! Collects the static host facts the selector decides on: platform, OS
//! build, CPU count, memory, installed backends, and hardware acceleration
//! availability. Probing is the only I/O the selector touches; selection
//! itself is a pure function of the probe result.

use std::collections::BTreeMap;

use semver::Version;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::adapter::{AccelSupport, AdapterRegistry};
use crate::manifest::{BackendKind, Platform, Provider};

/// Static facts about the host, as seen at probe time.
#[derive(Debug, Clone)]
pub struct HostCapabilities {
    pub platform: Platform,
    /// Host OS build number, compared against `minSdkVersion`.
    pub os_version: u32,
    pub cpu_cores: usize,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub installed_backends: BTreeMap<BackendKind, Version>,
    pub accel: BTreeMap<(BackendKind, Provider), AccelSupport>,
}

impl HostCapabilities {
    /// Probe the current host and the given adapter registry.
    pub fn probe(registry: &AdapterRegistry) -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        Self {
            platform: host_platform(),
            os_version: host_os_version(),
            cpu_cores: num_cpus(),
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            installed_backends: registry.installed_backends(),
            accel: registry.probe_accel(),
        }
    }

    /// The preferred accelerated provider for this platform.
    pub fn accel_provider(&self) -> Provider {
        match self.platform {
            Platform::Ios | Platform::Macos => Provider::CoreMl,
            Platform::Android => Provider::Nnapi,
            Platform::Linux | Platform::Windows => Provider::Gpu,
        }
    }

    pub fn accel_for(&self, backend: BackendKind, provider: Provider) -> AccelSupport {
        self.accel
            .get(&(backend, provider))
            .copied()
            .unwrap_or_default()
    }
}

fn host_platform() -> Platform {
    if cfg!(target_os = "ios") {
        Platform::Ios
    } else if cfg!(target_os = "android") {
        Platform::Android
    } else if cfg!(target_os = "macos") {
        Platform::Macos
    } else if cfg!(target_os = "windows") {
        Platform::Windows
    } else {
        Platform::Linux
    }
}

fn host_os_version() -> u32 {
    System::os_version()
        .and_then(|v| {
            v.split(|c: char| !c.is_ascii_digit())
                .find(|s| !s.is_empty())
                .and_then(|s| s.parse().ok())
        })
        .unwrap_or(0)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
