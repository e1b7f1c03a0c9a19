use serde::{Deserialize, Serialize};

/// One result from the upstream test runner.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResultEvent {
    pub result: ResultSet,
    pub test: TestDescriptor,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResultSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced: Option<AdvancedResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AdvancedResult {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub audits: Vec<Audit>,
}

/// `score` and `raw_value` arrive loosely typed (numbers, numeric strings,
/// null) and are coerced during shaping.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Audit {
    pub id: String,
    #[serde(default)]
    pub score: serde_json::Value,
    #[serde(default, rename = "rawValue")]
    pub raw_value: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TestDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
}
