//! Domain enums shared across the control plane: statuses, model formats,
//! and the model-size heuristics used by matrix expansion.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Agent liveness as tracked by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// Quick-test lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Queued,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Queued => "queued",
            TestStatus::Dispatched => "dispatched",
            TestStatus::Running => "running",
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
            TestStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Failed | TestStatus::Cancelled
        )
    }

    /// Whether an agent currently holds this test (counts toward the
    /// one-in-flight-per-agent rule).
    pub fn is_active(&self) -> bool {
        matches!(self, TestStatus::Dispatched | TestStatus::Running)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TestStatus::Queued),
            "dispatched" => Ok(TestStatus::Dispatched),
            "running" => Ok(TestStatus::Running),
            "completed" => Ok(TestStatus::Completed),
            "failed" => Ok(TestStatus::Failed),
            "cancelled" => Ok(TestStatus::Cancelled),
            other => Err(format!("unknown test status: {other}")),
        }
    }
}

/// Campaign lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Queued => "queued",
            CampaignStatus::Running => "running",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled
        )
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "queued" => Ok(CampaignStatus::Queued),
            "running" => Ok(CampaignStatus::Running),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// On-disk model artifact format, matched against engine capability sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Safetensors,
    Pytorch,
    Gguf,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Safetensors => "safetensors",
            ModelFormat::Pytorch => "pytorch",
            ModelFormat::Gguf => "gguf",
        }
    }

    /// Infers the format from a model path or repo name. `None` when nothing
    /// in the name gives it away.
    pub fn infer(path: &str) -> Option<ModelFormat> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".gguf") || lower.contains("gguf") {
            return Some(ModelFormat::Gguf);
        }
        if lower.ends_with(".safetensors") || lower.contains("safetensors") {
            return Some(ModelFormat::Safetensors);
        }
        if lower.ends_with(".pt") || lower.ends_with(".pth") || lower.ends_with(".bin") {
            return Some(ModelFormat::Pytorch);
        }
        None
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rough on-disk size in GiB from the parameter count and quantization
/// markers in a model name, e.g. `llama-3.1-8b-instruct-q4_k_m.gguf`.
/// Falls back to 8 GiB when the name carries no parameter count.
pub fn estimate_size_gb(name: &str) -> f64 {
    let lower = name.to_ascii_lowercase();
    let Some(params_b) = parse_param_count(&lower) else {
        return 8.0;
    };
    let bytes_per_param = if lower.contains("q2") {
        0.35
    } else if lower.contains("q3") {
        0.45
    } else if lower.contains("q4") {
        0.56
    } else if lower.contains("q5") {
        0.68
    } else if lower.contains("q6") {
        0.80
    } else if lower.contains("q8") {
        1.06
    } else if lower.contains("fp8") || lower.contains("int8") {
        1.0
    } else {
        // Unquantized weights ship as fp16/bf16.
        2.0
    };
    params_b * bytes_per_param
}

/// Parses `7b`, `13b`, `0.5b`, `70b` style parameter counts (billions).
fn parse_param_count(lower: &str) -> Option<f64> {
    let bytes = lower.as_bytes();
    for (i, window) in bytes.windows(2).enumerate() {
        if window[1] == b'b' && window[0].is_ascii_digit() {
            // Walk back over digits and at most one dot.
            let mut start = i;
            while start > 0
                && (bytes[start - 1].is_ascii_digit() || bytes[start - 1] == b'.')
            {
                start -= 1;
            }
            // Boundary check: `70b` in `x70b` is fine, `b` in `8bit` is not.
            let next = bytes.get(i + 2);
            if matches!(next, Some(c) if c.is_ascii_alphanumeric()) {
                continue;
            }
            if let Ok(v) = lower[start..=i].parse::<f64>() {
                if v > 0.0 && v < 2000.0 {
                    return Some(v);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in ["queued", "dispatched", "running", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<TestStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<TestStatus>().is_err());
    }

    #[test]
    fn format_inference() {
        assert_eq!(
            ModelFormat::infer("/m/llama-7b-q4_k_m.gguf"),
            Some(ModelFormat::Gguf)
        );
        assert_eq!(
            ModelFormat::infer("/m/llama-7b.safetensors"),
            Some(ModelFormat::Safetensors)
        );
        assert_eq!(
            ModelFormat::infer("/m/pytorch_model.bin"),
            Some(ModelFormat::Pytorch)
        );
        assert_eq!(ModelFormat::infer("/m/mystery-model"), None);
    }

    #[test]
    fn size_estimates_scale_with_params_and_quant() {
        let q4_7b = estimate_size_gb("llama-7b-q4_k_m.gguf");
        let q4_70b = estimate_size_gb("llama-70b-q4_k_m.gguf");
        let fp16_7b = estimate_size_gb("llama-7b");
        assert!(q4_70b > q4_7b * 8.0);
        assert!(fp16_7b > q4_7b);
        // No parameter count at all: fixed fallback.
        assert_eq!(estimate_size_gb("mystery-model"), 8.0);
    }
}
