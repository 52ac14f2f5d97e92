use std::collections::BTreeMap;
use std::sync::OnceLock;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{Selector, SelectorExt};
use regex::Regex;

use crate::{Error, Result};

/// A compiled label + annotation predicate over an entity's metadata.
///
/// Annotation selectors are label selectors re-interpreted over the entity's
/// annotations, so label character-set and length restrictions apply to the
/// selector's values: annotations whose values fall outside that set can never
/// match. That is a documented limitation of this selector type, which is why
/// compilation rejects selector values that are not valid label values instead
/// of letting them silently never match.
#[derive(Clone, Debug)]
pub struct EntitySelector {
    labels: Selector,
    annotations: Selector,
}

impl EntitySelector {
    /// Compile the selector pair. An absent selector matches everything.
    pub fn compile(
        label_selector: Option<&LabelSelector>,
        annotation_selector: Option<&LabelSelector>,
    ) -> Result<EntitySelector> {
        Ok(EntitySelector {
            labels: compile_one(label_selector)?,
            annotations: compile_one(annotation_selector)?,
        })
    }

    /// All present selector kinds combine with logical AND.
    pub fn matches(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> bool {
        self.labels.matches(labels) && self.annotations.matches(annotations)
    }
}

/// Compile a single label selector, or a match-everything selector if absent.
pub fn compile_one(selector: Option<&LabelSelector>) -> Result<Selector> {
    let Some(selector) = selector else {
        return Ok(Selector::default());
    };
    validate_values(selector)?;
    Selector::try_from(selector.clone()).map_err(|e| Error::InvalidSelector(e.to_string()))
}

// Selector values that are not syntactically valid label values can never
// match anything; reject them at compile time so the failure lands in
// Status.reason instead of a silently empty selection.
fn validate_values(selector: &LabelSelector) -> Result<()> {
    static LABEL_VALUE: OnceLock<Regex> = OnceLock::new();
    let re = LABEL_VALUE
        .get_or_init(|| Regex::new(r"^([A-Za-z0-9]([A-Za-z0-9._-]{0,61}[A-Za-z0-9])?)?$").unwrap());

    let mut check = |value: &str| -> Result<()> {
        if re.is_match(value) {
            Ok(())
        } else {
            Err(Error::InvalidSelector(format!(
                "{value:?} is not a valid label value"
            )))
        }
    };

    for value in selector.match_labels.iter().flatten().map(|(_, v)| v) {
        check(value)?;
    }
    for expr in selector.match_expressions.iter().flatten() {
        for value in expr.values.iter().flatten() {
            check(value)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn match_labels(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            match_expressions: None,
        }
    }

    #[test]
    fn absent_selectors_match_everything() {
        let sel = EntitySelector::compile(None, None).unwrap();
        assert!(sel.matches(&labels(&[]), &labels(&[])));
        assert!(sel.matches(&labels(&[("team", "payments")]), &labels(&[])));
    }

    #[test]
    fn empty_selector_means_no_constraint() {
        let sel = EntitySelector::compile(Some(&LabelSelector::default()), None).unwrap();
        assert!(sel.matches(&labels(&[]), &labels(&[])));
    }

    #[test]
    fn label_and_annotation_selectors_are_anded() {
        let sel = EntitySelector::compile(
            Some(&match_labels(&[("team", "payments")])),
            Some(&match_labels(&[("tier", "prod")])),
        )
        .unwrap();

        assert!(sel.matches(
            &labels(&[("team", "payments")]),
            &labels(&[("tier", "prod")]),
        ));
        // label matches, annotation does not
        assert!(!sel.matches(&labels(&[("team", "payments")]), &labels(&[])));
        // annotation matches, label does not
        assert!(!sel.matches(&labels(&[("team", "billing")]), &labels(&[("tier", "prod")])));
    }

    #[test]
    fn match_expressions_are_honoured() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "team".into(),
                operator: "In".into(),
                values: Some(vec!["payments".into(), "billing".into()]),
            }]),
        };
        let sel = EntitySelector::compile(Some(&selector), None).unwrap();
        assert!(sel.matches(&labels(&[("team", "billing")]), &labels(&[])));
        assert!(!sel.matches(&labels(&[("team", "web")]), &labels(&[])));
    }

    #[test]
    fn conflicting_operator_requirements_fail_compilation() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "team".into(),
                operator: "In".into(),
                values: None, // In with no values is malformed
            }]),
        };
        let err = EntitySelector::compile(Some(&selector), None).unwrap_err();
        assert!(matches!(err, Error::InvalidSelector(_)));
    }

    #[test]
    fn values_outside_label_syntax_fail_fast() {
        let selector = match_labels(&[("note", "not a label value!")]);
        let err = EntitySelector::compile(None, Some(&selector)).unwrap_err();
        assert!(matches!(err, Error::InvalidSelector(_)));
    }

    #[test]
    fn empty_string_value_is_a_valid_label_value() {
        let selector = match_labels(&[("team", "")]);
        assert!(EntitySelector::compile(Some(&selector), None).is_ok());
    }
}
