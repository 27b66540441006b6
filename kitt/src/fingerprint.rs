//! Compact hardware identity string for a host: a readable slug plus a short
//! digest, stable for an unchanged machine.

use sha2::{Digest, Sha256};

use stream_event::{CpuArch, HardwareInfo};

fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// `arm64-apple-m3-ram32-1a2b3c4d` style identity string.
pub fn fingerprint(arch: CpuArch, hw: &HardwareInfo) -> String {
    let canonical = format!(
        "{}|{}|{}|{:.0}|{}|{}",
        arch.as_str(),
        hw.gpu,
        hw.cpu,
        hw.ram_gb,
        hw.compute_capability.as_deref().unwrap_or(""),
        hw.environment_type,
    );
    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    format!(
        "{}-{}-ram{:.0}-{}",
        arch.as_str(),
        slug(&hw.gpu),
        hw.ram_gb,
        &digest[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw() -> HardwareInfo {
        HardwareInfo {
            gpu: "NVIDIA RTX 4090".into(),
            cpu: "AMD EPYC 7543".into(),
            ram_gb: 128.0,
            compute_capability: Some("8.9".into()),
            environment_type: "baremetal".into(),
            vram_gb: Some(24.0),
        }
    }

    #[test]
    fn stable_for_same_hardware() {
        let a = fingerprint(CpuArch::Amd64, &hw());
        let b = fingerprint(CpuArch::Amd64, &hw());
        assert_eq!(a, b);
        assert!(a.starts_with("amd64-nvidia-rtx-4090-ram128-"));
    }

    #[test]
    fn changes_with_hardware() {
        let mut other = hw();
        other.gpu = "NVIDIA H100".into();
        assert_ne!(
            fingerprint(CpuArch::Amd64, &hw()),
            fingerprint(CpuArch::Amd64, &other)
        );
        assert_ne!(
            fingerprint(CpuArch::Amd64, &hw()),
            fingerprint(CpuArch::Arm64, &hw())
        );
    }
}
