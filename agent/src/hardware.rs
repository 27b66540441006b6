//! Host hardware detection. Best effort from `/proc` and `nvidia-smi`;
//! unified-memory hosts report their VRAM as the RAM shared with the system.

use stream_event::{CpuArch, HardwareInfo};

pub fn host_arch() -> CpuArch {
    match std::env::consts::ARCH {
        "aarch64" => CpuArch::Arm64,
        _ => CpuArch::Amd64,
    }
}

fn read_cpu_model() -> String {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                matches!(key.trim(), "model name" | "Model" | "Hardware")
                    .then(|| value.trim().to_string())
            })
        })
        .unwrap_or_else(|| std::env::consts::ARCH.to_string())
}

fn read_ram_gb() -> f64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                let rest = line.strip_prefix("MemTotal:")?;
                let kb: f64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                Some(kb / 1024.0 / 1024.0)
            })
        })
        .unwrap_or(0.0)
}

struct GpuProbe {
    name: String,
    vram_gb: Option<f64>,
    compute_capability: Option<String>,
}

fn probe_nvidia() -> Option<GpuProbe> {
    let out = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,compute_cap",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let line = String::from_utf8_lossy(&out.stdout).lines().next()?.to_string();
    let mut parts = line.split(',').map(|s| s.trim().to_string());
    let name = parts.next()?;
    let vram_gb = parts.next().and_then(|mb| mb.parse::<f64>().ok()).map(|mb| mb / 1024.0);
    let compute_capability = parts.next();
    Some(GpuProbe {
        name,
        vram_gb,
        compute_capability,
    })
}

/// Detects the host. `environment_type` tags how the GPU reaches memory:
/// `cuda` for discrete NVIDIA parts, `unified` for shared-memory machines,
/// `cpu` when no GPU was found.
pub fn detect() -> (CpuArch, HardwareInfo) {
    let arch = host_arch();
    let cpu = read_cpu_model();
    let ram_gb = read_ram_gb();

    if let Some(gpu) = probe_nvidia() {
        return (
            arch,
            HardwareInfo {
                gpu: gpu.name,
                cpu,
                ram_gb,
                compute_capability: gpu.compute_capability,
                environment_type: "cuda".to_string(),
                vram_gb: gpu.vram_gb,
            },
        );
    }

    if arch == CpuArch::Arm64 {
        // Unified memory: the GPU shares system RAM.
        return (
            arch,
            HardwareInfo {
                gpu: format!("{cpu} (integrated)"),
                cpu,
                ram_gb,
                compute_capability: None,
                environment_type: "unified".to_string(),
                vram_gb: Some(ram_gb),
            },
        );
    }

    (
        arch,
        HardwareInfo {
            gpu: "none".to_string(),
            cpu,
            ram_gb,
            compute_capability: None,
            environment_type: "cpu".to_string(),
            vram_gb: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_returns_consistent_snapshot() {
        let (arch, hw) = detect();
        assert!(!hw.cpu.is_empty());
        match hw.environment_type.as_str() {
            "unified" => {
                assert_eq!(arch, CpuArch::Arm64);
                assert_eq!(hw.vram_gb, Some(hw.ram_gb));
            }
            "cpu" => assert!(hw.vram_gb.is_none()),
            "cuda" => assert!(!hw.gpu.is_empty()),
            other => panic!("unexpected environment_type {other}"),
        }
    }
}
