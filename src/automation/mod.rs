use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{MailDripError, Result};

/// A single workflow node as stored on `automations.nodes`. Branch children
/// are nested; only the `yes` branch participates in scheduling, other
/// branch keys are preserved as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub config: NodeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<Branches>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    EntryCriteria,
    SendEmail,
    Delay,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Direct template id on a send_email node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Cross-owner template key, resolved per owner at refresh time.
    #[serde(default, rename = "templateKey", skip_serializing_if = "Option::is_none")]
    pub template_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<DelayUnit>,
    /// Wall-clock HH:MM on a trigger node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Hours,
    Days,
    Weeks,
}

impl DelayUnit {
    pub fn to_days(self, duration: f64) -> f64 {
        match self {
            DelayUnit::Hours => duration / 24.0,
            DelayUnit::Days => duration,
            DelayUnit::Weeks => duration * 7.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branches {
    #[serde(default)]
    pub yes: Vec<WorkflowNode>,
    /// Conditional branches other than `yes` are recognized but not walked.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// One send emitted by the node walk: which template, from which node, how
/// many days after the first qualification date.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailStep {
    pub node_id: String,
    pub template_ref: TemplateRef,
    pub days_offset: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateRef {
    Id(String),
    Key(String),
}

pub fn parse_nodes(json: &str) -> Result<Vec<WorkflowNode>> {
    Ok(serde_json::from_str(json)?)
}

/// Depth-first walk over the workflow, skipping `trigger` and
/// `entry_criteria`, accumulating `delay` nodes into a running day offset
/// and emitting a step per `send_email`. Rejects node graphs that revisit
/// an id.
pub fn build_email_schedule(nodes: &[WorkflowNode]) -> Result<Vec<EmailStep>> {
    let mut steps = Vec::new();
    let mut visited = HashSet::new();
    let mut delay_days = 0.0;
    walk_nodes(nodes, &mut delay_days, &mut visited, &mut steps)?;
    Ok(steps)
}

fn walk_nodes(
    nodes: &[WorkflowNode],
    delay_days: &mut f64,
    visited: &mut HashSet<String>,
    steps: &mut Vec<EmailStep>,
) -> Result<()> {
    for node in nodes {
        if !visited.insert(node.id.clone()) {
            return Err(MailDripError::CycleDetected);
        }

        match node.node_type {
            NodeType::Trigger | NodeType::EntryCriteria => {}
            NodeType::Delay => {
                let duration = node.config.duration.unwrap_or(0.0);
                let unit = node.config.unit.unwrap_or(DelayUnit::Days);
                *delay_days += unit.to_days(duration);
            }
            NodeType::SendEmail => {
                let template_ref = match (&node.config.template, &node.config.template_key) {
                    (Some(id), _) if !id.is_empty() => TemplateRef::Id(id.clone()),
                    (_, Some(key)) if !key.is_empty() => TemplateRef::Key(key.clone()),
                    _ => {
                        return Err(MailDripError::invalid(format!(
                            "send_email node {} carries neither template nor templateKey",
                            node.id
                        )))
                    }
                };
                steps.push(EmailStep {
                    node_id: node.id.clone(),
                    template_ref,
                    days_offset: *delay_days,
                });
            }
        }

        if let Some(branches) = &node.branches {
            walk_nodes(&branches.yes, delay_days, visited, steps)?;
        }
    }
    Ok(())
}

/// Wall-clock send time from the trigger node, if one carries a valid HH:MM.
pub fn trigger_time(nodes: &[WorkflowNode]) -> Option<chrono::NaiveTime> {
    nodes
        .iter()
        .find(|n| n.node_type == NodeType::Trigger)
        .and_then(|n| n.config.time.as_deref())
        .and_then(parse_wall_clock)
}

fn parse_wall_clock(time: &str) -> Option<chrono::NaiveTime> {
    chrono::NaiveTime::parse_from_str(time.trim(), "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: NodeType, config: NodeConfig) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            node_type,
            config,
            branches: None,
        }
    }

    fn send(id: &str, template: &str) -> WorkflowNode {
        node(
            id,
            NodeType::SendEmail,
            NodeConfig {
                template: Some(template.to_string()),
                ..Default::default()
            },
        )
    }

    fn delay(id: &str, duration: f64, unit: DelayUnit) -> WorkflowNode {
        node(
            id,
            NodeType::Delay,
            NodeConfig {
                duration: Some(duration),
                unit: Some(unit),
                ..Default::default()
            },
        )
    }

    #[test]
    fn accumulates_delays_across_units() {
        let nodes = vec![
            node("t", NodeType::Trigger, NodeConfig::default()),
            send("s1", "tpl-1"),
            delay("d1", 3.0, DelayUnit::Days),
            send("s2", "tpl-2"),
            delay("d2", 2.0, DelayUnit::Weeks),
            delay("d3", 12.0, DelayUnit::Hours),
            send("s3", "tpl-3"),
        ];

        let steps = build_email_schedule(&nodes).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].days_offset, 0.0);
        assert_eq!(steps[1].days_offset, 3.0);
        assert_eq!(steps[2].days_offset, 3.0 + 14.0 + 0.5);
    }

    #[test]
    fn skips_trigger_and_entry_criteria() {
        let nodes = vec![
            node("t", NodeType::Trigger, NodeConfig::default()),
            node("e", NodeType::EntryCriteria, NodeConfig::default()),
            send("s1", "tpl-1"),
        ];
        let steps = build_email_schedule(&nodes).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].node_id, "s1");
    }

    #[test]
    fn walks_yes_branch_recursively() {
        let mut branching = send("s1", "tpl-1");
        branching.branches = Some(Branches {
            yes: vec![delay("d1", 1.0, DelayUnit::Days), send("s2", "tpl-2")],
            other: serde_json::Map::new(),
        });
        let nodes = vec![branching, send("s3", "tpl-3")];

        let steps = build_email_schedule(&nodes).unwrap();
        assert_eq!(
            steps.iter().map(|s| s.node_id.as_str()).collect::<Vec<_>>(),
            vec!["s1", "s2", "s3"]
        );
        assert_eq!(steps[1].days_offset, 1.0);
        // delay inside the branch stays accumulated for later siblings
        assert_eq!(steps[2].days_offset, 1.0);
    }

    #[test]
    fn rejects_repeated_node_ids() {
        let nodes = vec![send("s1", "tpl-1"), send("s1", "tpl-1")];
        assert!(matches!(
            build_email_schedule(&nodes),
            Err(MailDripError::CycleDetected)
        ));
    }

    #[test]
    fn send_without_template_is_invalid() {
        let nodes = vec![node("s1", NodeType::SendEmail, NodeConfig::default())];
        assert!(matches!(
            build_email_schedule(&nodes),
            Err(MailDripError::InvalidInput(_))
        ));
    }

    #[test]
    fn template_key_resolves_as_key_ref() {
        let nodes = vec![node(
            "s1",
            NodeType::SendEmail,
            NodeConfig {
                template_key: Some("renewal_first_touch".to_string()),
                ..Default::default()
            },
        )];
        let steps = build_email_schedule(&nodes).unwrap();
        assert_eq!(
            steps[0].template_ref,
            TemplateRef::Key("renewal_first_touch".to_string())
        );
    }

    #[test]
    fn trigger_time_parses_and_defaults() {
        let nodes = vec![node(
            "t",
            NodeType::Trigger,
            NodeConfig {
                time: Some("14:30".to_string()),
                ..Default::default()
            },
        )];
        assert_eq!(
            trigger_time(&nodes),
            Some(chrono::NaiveTime::from_hms_opt(14, 30, 0).unwrap())
        );
        assert_eq!(trigger_time(&[send("s", "t")]), None);
    }

    #[test]
    fn non_yes_branches_survive_roundtrip() {
        let json = r#"[{
            "id": "s1",
            "type": "send_email",
            "config": {"template": "tpl-1"},
            "branches": {"yes": [], "no": [{"id": "x", "type": "delay"}]}
        }]"#;
        let nodes = parse_nodes(json).unwrap();
        let branches = nodes[0].branches.as_ref().unwrap();
        assert!(branches.other.contains_key("no"));

        let rendered = serde_json::to_string(&nodes).unwrap();
        assert!(rendered.contains("\"no\""));
    }
}
