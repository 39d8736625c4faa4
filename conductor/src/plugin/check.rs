//! Structured check results accumulated by `check` calls.
//!
//! The check log of a job is a json array of items. Plain checks sit at the
//! top level; checks with a `group_title` are collected into one group item
//! whose result is the conjunction of its members.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::target::plugin_error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEntry {
    pub title: String,
    pub message: String,
    pub result: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckItem {
    Check(CheckEntry),
    Group {
        title: String,
        message: String,
        result: bool,
        content: Vec<CheckEntry>,
    },
}

/// Arguments of a `check` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub title: String,
    pub result: bool,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub success_msg: Option<String>,
    #[serde(default)]
    pub fail_msg: Option<String>,
    #[serde(default)]
    pub group_title: Option<String>,
    #[serde(default)]
    pub group_success_msg: Option<String>,
    #[serde(default)]
    pub group_fail_msg: Option<String>,
}

impl CheckRequest {
    pub fn entry(&self) -> Result<CheckEntry> {
        let outcome_msg = if self.result {
            &self.success_msg
        } else {
            &self.fail_msg
        };
        let message = self
            .msg
            .as_ref()
            .or(outcome_msg.as_ref())
            .cloned()
            .ok_or_else(|| plugin_error(format!("check '{}' needs msg, success_msg or fail_msg", self.title)))?;
        Ok(CheckEntry {
            title: self.title.clone(),
            message,
            result: self.result,
        })
    }
}

/// Add one check to `items`, creating or updating its group
pub fn append(items: &mut Vec<CheckItem>, request: &CheckRequest) -> Result<CheckEntry> {
    let entry = request.entry()?;
    let Some(group_title) = &request.group_title else {
        items.push(CheckItem::Check(entry.clone()));
        return Ok(entry);
    };

    let position = items
        .iter()
        .position(|item| matches!(item, CheckItem::Group { title, .. } if title == group_title));
    let position = match position {
        Some(position) => position,
        None => {
            items.push(CheckItem::Group {
                title: group_title.clone(),
                message: String::new(),
                result: true,
                content: Vec::new(),
            });
            items.len() - 1
        }
    };

    if let CheckItem::Group {
        message,
        result,
        content,
        ..
    } = &mut items[position]
    {
        content.push(entry.clone());
        *result = content.iter().all(|c| c.result);
        let group_msg = if *result {
            &request.group_success_msg
        } else {
            &request.group_fail_msg
        };
        if let Some(group_msg) = group_msg {
            *message = group_msg.clone();
        }
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(title: &str, result: bool, group: Option<&str>) -> CheckRequest {
        CheckRequest {
            title: title.to_string(),
            result,
            success_msg: Some("ok".to_string()),
            fail_msg: Some("broken".to_string()),
            group_title: group.map(str::to_string),
            group_success_msg: Some("all good".to_string()),
            group_fail_msg: Some("something failed".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_message_selection() {
        assert_eq!(request("a", true, None).entry().unwrap().message, "ok");
        assert_eq!(request("a", false, None).entry().unwrap().message, "broken");

        let explicit = CheckRequest {
            msg: Some("explicit".to_string()),
            ..request("a", false, None)
        };
        assert_eq!(explicit.entry().unwrap().message, "explicit");

        let bare = CheckRequest {
            title: "a".to_string(),
            result: true,
            ..Default::default()
        };
        assert!(bare.entry().is_err());
    }

    #[test]
    fn test_grouped_checks_share_one_item() {
        let mut items = Vec::new();
        append(&mut items, &request("plain", true, None)).unwrap();
        append(&mut items, &request("disk", true, Some("host checks"))).unwrap();
        append(&mut items, &request("memory", false, Some("host checks"))).unwrap();

        assert_eq!(items.len(), 2);
        match &items[1] {
            CheckItem::Group {
                title,
                message,
                result,
                content,
            } => {
                assert_eq!(title, "host checks");
                assert_eq!(message, "something failed");
                assert!(!result);
                assert_eq!(content.len(), 2);
            }
            other => panic!("expected a group, got {:?}", other),
        }
    }

    #[test]
    fn test_check_log_json_shape() {
        let mut items = Vec::new();
        append(&mut items, &request("disk", true, Some("host checks"))).unwrap();
        let value = serde_json::to_value(&items).unwrap();
        assert_eq!(value[0]["type"], "group");
        assert_eq!(value[0]["message"], "all good");
        assert_eq!(value[0]["content"][0]["title"], "disk");
    }
}
