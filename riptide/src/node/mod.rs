/// Connection-level error codes
pub mod error;

/// Producer endpoint and active streams
pub mod producer;

/// Consumer endpoint and passive streams
pub mod consumer;

pub use consumer::DcpConsumer;
pub use producer::DcpProducer;

use serde::{Deserialize, Serialize};

/// Scheduling weight a connection asks its peer for
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnPriority {
    Low,
    Medium,
    High,
}

impl ConnPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnPriority::Low => "low",
            ConnPriority::Medium => "medium",
            ConnPriority::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<ConnPriority> {
        match value {
            "low" => Some(ConnPriority::Low),
            "medium" => Some(ConnPriority::Medium),
            "high" => Some(ConnPriority::High),
            _ => None,
        }
    }
}
