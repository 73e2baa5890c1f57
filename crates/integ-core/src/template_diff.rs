//! Structural template diffing
//!
//! Compares two versions of a stack template resource by resource and
//! classifies each difference by its deployment impact. Destructive impacts
//! (replace, destroy, orphan) and optionally security-relevant updates are
//! surfaced as [`DestructiveChange`]s by the snapshot verifier.

use crate::error::CollaboratorError;
use crate::types::{DestructiveChange, ResourceImpact};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// One resource-level difference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDifference {
    /// Stack the resource lives in
    pub stack_name: String,
    /// Logical ID within the template
    pub logical_id: String,
    /// Resource type of the newer version (older if removed)
    pub resource_type: String,
    /// Deployment impact
    pub impact: ResourceImpact,
    /// Touches IAM or network access rules
    pub security_relevant: bool,
}

impl ResourceDifference {
    /// As a destructive change record
    #[must_use]
    pub fn to_destructive_change(&self) -> DestructiveChange {
        DestructiveChange {
            stack_name: self.stack_name.clone(),
            logical_id: self.logical_id.clone(),
            impact: self.impact,
        }
    }
}

/// Differences between two versions of one stack template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateDiff {
    /// Changed resources
    pub resources: Vec<ResourceDifference>,
    /// Other top-level sections that changed (`Outputs`, `Parameters`, ...)
    pub other_sections: Vec<String>,
}

impl TemplateDiff {
    /// Check if the templates are equivalent
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.other_sections.is_empty()
    }

    /// Total number of differences
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len() + self.other_sections.len()
    }

    /// Differences flagged as destructive
    ///
    /// With `include_security` set, security-relevant updates are flagged too.
    #[must_use]
    pub fn destructive_changes(&self, include_security: bool) -> Vec<DestructiveChange> {
        self.resources
            .iter()
            .filter(|d| d.impact.is_destructive() || (include_security && d.security_relevant))
            .map(ResourceDifference::to_destructive_change)
            .collect()
    }

    /// Multi-line rendering for diagnostics
    #[must_use]
    pub fn render(&self) -> String {
        let mut lines = Vec::with_capacity(self.len());
        for section in &self.other_sections {
            lines.push(format!("[~] {section}"));
        }
        for d in &self.resources {
            let marker = match d.impact {
                ResourceImpact::WillCreate => "[+]",
                ResourceImpact::WillDestroy | ResourceImpact::WillOrphan => "[-]",
                ResourceImpact::WillReplace => "[-/+]",
                ResourceImpact::WillUpdate | ResourceImpact::NoChange => "[~]",
            };
            let security = if d.security_relevant { " (security)" } else { "" };
            lines.push(format!(
                "{marker} {} {} {}{security}",
                d.resource_type, d.logical_id, d.impact
            ));
        }
        lines.join("\n")
    }
}

/// Diff collaborator
pub trait TemplateDiffer: Send + Sync {
    /// Diff `old` against `new` for the stack named `stack_name`
    ///
    /// # Errors
    /// Returns [`CollaboratorError::Diff`] when a template is malformed.
    fn diff(&self, stack_name: &str, old: &Value, new: &Value) -> Result<TemplateDiff, CollaboratorError>;
}

/// Properties whose change forces resource replacement, by resource type
const REPLACEMENT_PROPERTIES: &[(&str, &[&str])] = &[
    ("AWS::S3::Bucket", &["BucketName", "ObjectLockEnabled"]),
    ("AWS::DynamoDB::Table", &["TableName", "KeySchema"]),
    ("AWS::Lambda::Function", &["FunctionName", "PackageType"]),
    ("AWS::SQS::Queue", &["QueueName", "FifoQueue"]),
    ("AWS::SNS::Topic", &["TopicName", "FifoTopic"]),
    ("AWS::IAM::Role", &["RoleName", "Path"]),
    ("AWS::EC2::SecurityGroup", &["GroupName", "GroupDescription", "VpcId"]),
    ("AWS::EC2::VPC", &["CidrBlock", "InstanceTenancy"]),
    ("AWS::EC2::Subnet", &["AvailabilityZone", "CidrBlock", "VpcId"]),
    ("AWS::RDS::DBInstance", &["DBInstanceIdentifier", "Engine", "DBName"]),
    ("AWS::Logs::LogGroup", &["LogGroupName"]),
    ("AWS::Kinesis::Stream", &["Name"]),
    ("AWS::ECR::Repository", &["RepositoryName"]),
];

const SECURITY_TYPE_PREFIXES: &[&str] = &[
    "AWS::IAM::",
    "AWS::EC2::SecurityGroup",
    "AWS::KMS::",
    "AWS::Lambda::Permission",
    "AWS::SQS::QueuePolicy",
    "AWS::SNS::TopicPolicy",
    "AWS::S3::BucketPolicy",
];

/// Resource attributes that take part in the comparison; `Metadata` is ignored
const COMPARED_ATTRIBUTES: &[&str] = &[
    "Properties",
    "DeletionPolicy",
    "UpdateReplacePolicy",
    "DependsOn",
    "Condition",
];

/// Resource-level diff over `Resources` maps of JSON templates
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTemplateDiffer {
    flag_security: bool,
}

impl JsonTemplateDiffer {
    /// Create new differ
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also mark IAM / network-rule updates as security relevant
    #[must_use]
    pub fn with_security_flagging(mut self, enabled: bool) -> Self {
        self.flag_security = enabled;
        self
    }

    fn is_security_type(resource_type: &str) -> bool {
        SECURITY_TYPE_PREFIXES
            .iter()
            .any(|prefix| resource_type.starts_with(prefix))
    }

    fn classify_update(resource_type: &str, old: &Map<String, Value>, new: &Map<String, Value>) -> ResourceImpact {
        let old_props = old.get("Properties");
        let new_props = new.get("Properties");
        let replacing = REPLACEMENT_PROPERTIES
            .iter()
            .find(|(ty, _)| *ty == resource_type)
            .is_some_and(|(_, props)| {
                props.iter().any(|p| {
                    old_props.and_then(|v| v.get(p)) != new_props.and_then(|v| v.get(p))
                })
            });
        if replacing {
            ResourceImpact::WillReplace
        } else {
            ResourceImpact::WillUpdate
        }
    }

    fn removal_impact(old: &Map<String, Value>) -> ResourceImpact {
        match old.get("DeletionPolicy").and_then(Value::as_str) {
            Some("Retain" | "RetainExceptOnCreate") => ResourceImpact::WillOrphan,
            _ => ResourceImpact::WillDestroy,
        }
    }
}

fn resources(template: &Value) -> Result<Map<String, Value>, CollaboratorError> {
    match template.get("Resources") {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(CollaboratorError::Diff("`Resources` is not an object".into())),
    }
}

fn as_resource<'a>(logical_id: &str, value: &'a Value) -> Result<&'a Map<String, Value>, CollaboratorError> {
    value
        .as_object()
        .ok_or_else(|| CollaboratorError::Diff(format!("resource {logical_id} is not an object")))
}

fn resource_type(resource: &Map<String, Value>) -> String {
    resource
        .get("Type")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string()
}

impl TemplateDiffer for JsonTemplateDiffer {
    fn diff(&self, stack_name: &str, old: &Value, new: &Value) -> Result<TemplateDiff, CollaboratorError> {
        let old_resources = resources(old)?;
        let new_resources = resources(new)?;
        let mut diff = TemplateDiff::default();

        let empty = Map::new();
        let sections: BTreeSet<&String> = old
            .as_object()
            .unwrap_or(&empty)
            .keys()
            .chain(new.as_object().unwrap_or(&empty).keys())
            .filter(|k| k.as_str() != "Resources")
            .collect();
        for section in sections {
            if old.get(section) != new.get(section) {
                diff.other_sections.push(section.clone());
            }
        }

        let ids: BTreeSet<&String> = old_resources.keys().chain(new_resources.keys()).collect();
        for id in ids {
            let (impact, ty) = match (old_resources.get(id), new_resources.get(id)) {
                (None, Some(n)) => (ResourceImpact::WillCreate, resource_type(as_resource(id, n)?)),
                (Some(o), None) => {
                    let o = as_resource(id, o)?;
                    (Self::removal_impact(o), resource_type(o))
                }
                (Some(o), Some(n)) => {
                    let (o, n) = (as_resource(id, o)?, as_resource(id, n)?);
                    let (old_ty, new_ty) = (resource_type(o), resource_type(n));
                    if old_ty != new_ty {
                        (ResourceImpact::WillReplace, new_ty)
                    } else if COMPARED_ATTRIBUTES.iter().any(|a| o.get(*a) != n.get(*a)) {
                        (Self::classify_update(&new_ty, o, n), new_ty)
                    } else {
                        continue;
                    }
                }
                (None, None) => continue,
            };
            let security_relevant = self.flag_security && Self::is_security_type(&ty);
            diff.resources.push(ResourceDifference {
                stack_name: stack_name.to_string(),
                logical_id: id.clone(),
                resource_type: ty,
                impact,
                security_relevant,
            });
        }

        Ok(diff)
    }
}
