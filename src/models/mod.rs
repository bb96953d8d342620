use serde::{Deserialize, Serialize};

/// Protocol a reading was taken with, `Debug` output is used in topic names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceProtocol {
    Unknown,
    Marstek,
}
