//! Issue records returned by the tracker CLI.

use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Issue ids look like `iv-12`: letters, a hyphen, digits.
static ISSUE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]+-[0-9]+$").unwrap());

/// Validate an issue identifier parsed from tool output.
pub fn is_valid_issue_id(id: &str) -> bool {
    ISSUE_ID_RE.is_match(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Epic,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Closed,
}

/// Kind of a dependency edge between issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    #[serde(rename = "parent-child")]
    ParentChild,
    #[serde(rename = "blocks")]
    Blocks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueDependency {
    pub issue_id: String,
    pub depends_on_id: String,
    #[serde(rename = "type")]
    pub kind: DependencyKind,
}

/// A full issue record, with dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub issue_type: IssueType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub dependencies: Vec<IssueDependency>,
}

impl Issue {
    /// Ids of the issues this one is blocked by (`blocks` edges only;
    /// parent-child edges are structure, not ordering).
    pub fn dependency_ids(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Blocks)
            .map(|d| d.depends_on_id.as_str())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.status == IssueStatus::Closed
    }
}

/// Deserialize tool JSON that is either a bare object or a one-element
/// array, depending on the subcommand.
pub fn parse_single<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let object = match value {
        serde_json::Value::Array(mut items) => {
            if items.len() != 1 {
                bail!("expected exactly one record, got {}", items.len());
            }
            items.remove(0)
        }
        other => other,
    };
    Ok(serde_json::from_value(object)?)
}

/// Deserialize tool JSON that is either an array or a bare object
/// (treated as a one-element list).
pub fn parse_list<T: serde::de::DeserializeOwned>(json: &str) -> Result<Vec<T>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|v| Ok(serde_json::from_value(v)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUE_JSON: &str = r###"{
        "id": "iv-3",
        "issue_type": "task",
        "title": "Add handler",
        "description": "## Spec\nbody",
        "status": "open",
        "dependencies": [
            {"issue_id": "iv-3", "depends_on_id": "iv-1", "type": "blocks"},
            {"issue_id": "iv-3", "depends_on_id": "iv-0", "type": "parent-child"}
        ]
    }"###;

    #[test]
    fn issue_id_validation() {
        assert!(is_valid_issue_id("iv-12"));
        assert!(is_valid_issue_id("IV-1"));
        assert!(!is_valid_issue_id("iv12"));
        assert!(!is_valid_issue_id("iv-"));
        assert!(!is_valid_issue_id("-12"));
        assert!(!is_valid_issue_id("iv-12-extra"));
        assert!(!is_valid_issue_id(""));
    }

    #[test]
    fn dependency_ids_filters_to_blocks() {
        let issue: Issue = serde_json::from_str(ISSUE_JSON).unwrap();
        assert_eq!(issue.dependency_ids(), vec!["iv-1"]);
    }

    #[test]
    fn parse_single_accepts_object() {
        let issue: Issue = parse_single(ISSUE_JSON).unwrap();
        assert_eq!(issue.id, "iv-3");
        assert_eq!(issue.issue_type, IssueType::Task);
    }

    #[test]
    fn parse_single_accepts_one_element_array() {
        let wrapped = format!("[{ISSUE_JSON}]");
        let issue: Issue = parse_single(&wrapped).unwrap();
        assert_eq!(issue.id, "iv-3");
    }

    #[test]
    fn parse_single_rejects_multi_element_array() {
        let wrapped = format!("[{ISSUE_JSON},{ISSUE_JSON}]");
        assert!(parse_single::<Issue>(&wrapped).is_err());
    }

    #[test]
    fn parse_list_accepts_bare_object() {
        let issues: Vec<Issue> = parse_list(ISSUE_JSON).unwrap();
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn missing_description_defaults_empty() {
        let json = r#"{"id":"iv-9","issue_type":"epic","title":"t","status":"closed"}"#;
        let issue: Issue = parse_single(json).unwrap();
        assert_eq!(issue.description, "");
        assert!(issue.is_closed());
        assert!(issue.dependency_ids().is_empty());
    }
}
