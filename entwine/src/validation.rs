//! Scalar attribute validation.
//!
//! Built-in rules cover the common cases. Anything that needs wider context
//! (for example a rule comparing two attributes of the same record) is a
//! `Custom` rule resolved through a [`ValidatorRegistry`].

use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use regex::Regex;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::{
    errors::{ValidationError, ValidationIssue, ValidationResult},
    types::{AttributeDescriptor, Attributes, FieldType, KindDescriptor, ValidationRule, ValidationScope},
};

/// A named validator referenced from `ValidationRule::Custom`.
///
/// Receives the whole candidate record so rules can depend on sibling attributes.
pub trait ScalarValidator: Send + Sync {
    fn validate(&self, kind: &str, field: &str, value: &Value, record: &Attributes) -> Result<(), String>;
}

impl<F> ScalarValidator for F
where
    F: Fn(&str, &str, &Value, &Attributes) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, kind: &str, field: &str, value: &Value, record: &Attributes) -> Result<(), String> {
        self(kind, field, value, record)
    }
}

#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: BTreeMap<String, Arc<dyn ScalarValidator>>,
}

impl ValidatorRegistry {
    pub fn register(&mut self, name: impl Into<String>, validator: impl ScalarValidator + 'static) {
        self.validators.insert(name.into(), Arc::new(validator));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ScalarValidator>> {
        self.validators.get(name)
    }
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.validators.keys()).finish()
    }
}

/// Inserts declared defaults for attributes absent from a record being created.
pub fn fill_defaults(kind: &KindDescriptor, record: &mut Attributes) {
    for attribute in &kind.attributes {
        if let Some(default) = &attribute.default
            && !record.contains_key(&attribute.name)
        {
            record.insert(attribute.name.clone(), default.clone());
        }
    }
}

/// Stamps `auto_created` attributes on create and `auto_updated` attributes on every write.
pub fn stamp_timestamps(kind: &KindDescriptor, record: &mut Attributes, creating: bool, now: DateTime<Utc>) {
    let stamp = Value::String(now.to_rfc3339());
    for attribute in &kind.attributes {
        let stamps = attribute.auto_updated || (creating && attribute.auto_created);
        if stamps {
            record.insert(attribute.name.clone(), stamp.clone());
        }
    }
}

/// Validates every declared attribute of a complete candidate record.
pub fn validate_record(kind: &KindDescriptor, record: &Attributes, registry: &ValidatorRegistry) -> ValidationResult<()> {
    let mut issues = Vec::new();
    for attribute in &kind.attributes {
        match record.get(&attribute.name) {
            Some(Value::Null) | None => {
                if !attribute.optional && !attribute.auto_created && !attribute.auto_updated {
                    issues.push(ValidationIssue::new(
                        attribute.name.clone(),
                        "validation.required",
                        "field is required",
                    ));
                }
            }
            Some(value) => {
                if !type_matches(attribute.field_type, value) {
                    issues.push(ValidationIssue::new(
                        attribute.name.clone(),
                        "validation.invalid_type",
                        format!("expected {:?}", attribute.field_type).to_lowercase(),
                    ));
                    continue;
                }
                validate_attribute(&kind.name, attribute, value, record, registry, &mut issues);
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(issues))
    }
}

fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Array => value.is_array(),
        FieldType::DateTime => value.as_str().is_some_and(|raw| DateTime::parse_from_rfc3339(raw).is_ok()),
        FieldType::Object => true,
    }
}

/// Where a rule is being applied, for issue reporting and custom validators.
struct RuleSite<'a> {
    kind: &'a str,
    field: &'a str,
    record: &'a Attributes,
    registry: &'a ValidatorRegistry,
}

/// A failed rule: the issue code and its message.
type Failure = (String, String);

fn fail(code: impl Into<String>, message: impl Into<String>) -> Result<(), Failure> {
    Err((code.into(), message.into()))
}

fn validate_attribute(
    kind: &str,
    attribute: &AttributeDescriptor,
    value: &Value,
    record: &Attributes,
    registry: &ValidatorRegistry,
    issues: &mut Vec<ValidationIssue>,
) {
    let site = RuleSite { kind, field: &attribute.name, record, registry };
    for descriptor in &attribute.validations {
        let targets: Vec<(FieldType, &Value)> = match descriptor.scope {
            ValidationScope::Field => vec![(attribute.field_type, value)],
            ValidationScope::EachElement => value
                .as_array()
                .into_iter()
                .flatten()
                .map(|element| (element_kind(element), element))
                .collect(),
        };
        for (field_type, target) in targets {
            if let Err((code, message)) = check_rule(&site, &descriptor.rule, field_type, target) {
                issues.push(ValidationIssue::new(attribute.name.clone(), code, message));
            }
        }
    }
}

fn element_kind(element: &Value) -> FieldType {
    match element {
        Value::String(_) => FieldType::String,
        Value::Array(_) => FieldType::Array,
        _ => FieldType::Object,
    }
}

/// Character count for strings, element count for arrays.
fn measured_length(field_type: FieldType, value: &Value) -> Option<usize> {
    match (field_type, value) {
        (FieldType::String | FieldType::DateTime, Value::String(text)) => Some(text.chars().count()),
        (FieldType::Array, Value::Array(items)) => Some(items.len()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64().or_else(|| value.as_str().and_then(|text| text.parse().ok()))
}

fn well_formed(rule: &ValidationRule, text: &str) -> bool {
    match rule {
        ValidationRule::Email => EmailAddress::is_valid(text),
        ValidationRule::Url => Url::parse(text).is_ok(),
        ValidationRule::Uuid => Uuid::parse_str(text).is_ok(),
        _ => true,
    }
}

fn check_rule(site: &RuleSite<'_>, rule: &ValidationRule, field_type: FieldType, value: &Value) -> Result<(), Failure> {
    match rule {
        ValidationRule::Length { min, max } => match measured_length(field_type, value) {
            Some(len) if min.is_some_and(|min| len < min) => {
                fail("validation.length", format!("length must be at least {}", min.unwrap_or_default()))
            }
            Some(len) if max.is_some_and(|max| len > max) => {
                fail("validation.length", format!("length must be at most {}", max.unwrap_or_default()))
            }
            _ => Ok(()),
        },
        ValidationRule::Range { min, max } => match as_number(value) {
            Some(n) if min.is_some_and(|min| n < min) => {
                fail("validation.range", format!("value must be at least {}", min.unwrap_or_default()))
            }
            Some(n) if max.is_some_and(|max| n > max) => {
                fail("validation.range", format!("value must be at most {}", max.unwrap_or_default()))
            }
            _ => Ok(()),
        },
        ValidationRule::Regex { pattern } => {
            let Some(text) = value.as_str() else { return Ok(()) };
            match Regex::new(pattern) {
                Ok(regex) if regex.is_match(text) => Ok(()),
                Ok(_) => fail("validation.regex", format!("value does not match pattern {pattern}")),
                Err(err) => fail("validation.regex", format!("invalid pattern {pattern}: {err}")),
            }
        }
        ValidationRule::Enum { allowed, case_insensitive } => {
            let Some(text) = value.as_str() else { return Ok(()) };
            let listed = if *case_insensitive {
                allowed.iter().any(|option| option.eq_ignore_ascii_case(text))
            } else {
                allowed.iter().any(|option| option == text)
            };
            if listed { Ok(()) } else { fail("validation.enum", format!("value must be one of {allowed:?}")) }
        }
        ValidationRule::Email | ValidationRule::Url | ValidationRule::Uuid => {
            let (code, noun) = match rule {
                ValidationRule::Email => ("validation.email", "email address"),
                ValidationRule::Url => ("validation.url", "URL"),
                _ => ("validation.uuid", "UUID"),
            };
            match value.as_str() {
                Some(text) if !well_formed(rule, text) => fail(code, format!("value must be a valid {noun}")),
                _ => Ok(()),
            }
        }
        ValidationRule::Custom { name } => {
            let Some(validator) = site.registry.get(name) else {
                return fail("validation.custom", format!("no validator registered as `{name}`"));
            };
            validator
                .validate(site.kind, site.field, value, site.record)
                .map_err(|message| (format!("validation.{name}"), message))
        }
    }
}
