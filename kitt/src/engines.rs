//! Compile-time engine registry.
//!
//! Each inference engine is described by a capability set: the model formats
//! it loads, the CPU architectures its images ship for, and how the agent
//! reaches it once running. Lookup is by name; there is no dynamic plugin
//! loading.

use serde::Serialize;

use stream_event::CpuArch;

use crate::types::ModelFormat;

#[derive(Clone, Debug, Serialize)]
pub struct EngineSpec {
    pub name: &'static str,
    pub supported_formats: &'static [ModelFormat],
    pub supported_arches: &'static [CpuArch],
    pub default_port: u16,
    pub health_path: &'static str,
    /// Container image; the agent pulls the variant matching its host arch.
    pub image: &'static str,
}

impl EngineSpec {
    pub fn supports_format(&self, format: ModelFormat) -> bool {
        self.supported_formats.contains(&format)
    }

    pub fn supports_arch(&self, arch: CpuArch) -> bool {
        self.supported_arches.contains(&arch)
    }

    /// Docker platform string for an image pull on the given host.
    pub fn platform(&self, arch: CpuArch) -> String {
        format!("linux/{}", arch.as_str())
    }
}

static ENGINES: &[EngineSpec] = &[
    EngineSpec {
        name: "vllm",
        supported_formats: &[ModelFormat::Safetensors, ModelFormat::Pytorch],
        supported_arches: &[CpuArch::Amd64],
        default_port: 8000,
        health_path: "/health",
        image: "vllm/vllm-openai:latest",
    },
    EngineSpec {
        name: "tgi",
        supported_formats: &[ModelFormat::Safetensors, ModelFormat::Pytorch],
        supported_arches: &[CpuArch::Amd64],
        default_port: 8080,
        health_path: "/health",
        image: "ghcr.io/huggingface/text-generation-inference:latest",
    },
    EngineSpec {
        name: "llama_cpp",
        supported_formats: &[ModelFormat::Gguf],
        supported_arches: &[CpuArch::Amd64, CpuArch::Arm64],
        default_port: 8080,
        health_path: "/health",
        image: "ghcr.io/ggml-org/llama.cpp:server",
    },
    EngineSpec {
        name: "ollama",
        supported_formats: &[ModelFormat::Gguf],
        supported_arches: &[CpuArch::Amd64, CpuArch::Arm64],
        default_port: 11434,
        health_path: "/api/version",
        image: "ollama/ollama:latest",
    },
];

/// All registered engines.
pub fn engines() -> &'static [EngineSpec] {
    ENGINES
}

/// Looks an engine up by name.
pub fn lookup(name: &str) -> Option<&'static EngineSpec> {
    ENGINES.iter().find(|e| e.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_engines() {
        assert!(lookup("vllm").is_some());
        assert!(lookup("llama_cpp").is_some());
        assert!(lookup("triton").is_none());
    }

    #[test]
    fn tgi_has_no_arm64() {
        let tgi = lookup("tgi").unwrap();
        assert!(tgi.supports_arch(CpuArch::Amd64));
        assert!(!tgi.supports_arch(CpuArch::Arm64));
    }

    #[test]
    fn gguf_engines_reject_safetensors() {
        let ollama = lookup("ollama").unwrap();
        assert!(ollama.supports_format(ModelFormat::Gguf));
        assert!(!ollama.supports_format(ModelFormat::Safetensors));
    }
}
