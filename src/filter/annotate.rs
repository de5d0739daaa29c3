/// Annotation filters injecting capability metadata into matching entities
use super::{map_entities, EntityPredicate, FilterContext, MetadataFilter};
use crate::{
    error::MetadataResult,
    metadata::{MetadataDocument, RoleType},
};

fn push_missing(target: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

/// Algorithms to advertise for entities matching a predicate
#[derive(Clone)]
pub struct AlgorithmRule {
    pub predicate: EntityPredicate,
    pub digest_methods: Vec<String>,
    pub signing_methods: Vec<String>,
}

/// Adds digest/signing method support to matching entities
#[derive(Clone, Default)]
pub struct AlgorithmAnnotationFilter {
    rules: Vec<AlgorithmRule>,
}

impl AlgorithmAnnotationFilter {
    pub fn new(rules: Vec<AlgorithmRule>) -> Self {
        Self { rules }
    }

    pub fn rule(
        mut self,
        predicate: EntityPredicate,
        digest_methods: Vec<String>,
        signing_methods: Vec<String>,
    ) -> Self {
        self.rules.push(AlgorithmRule {
            predicate,
            digest_methods,
            signing_methods,
        });
        self
    }
}

impl MetadataFilter for AlgorithmAnnotationFilter {
    fn name(&self) -> &str {
        "AlgorithmAnnotation"
    }

    fn filter(
        &self,
        document: MetadataDocument,
        _context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>> {
        map_entities(document, &mut |mut entity| {
            for rule in &self.rules {
                if (rule.predicate)(&entity) {
                    push_missing(&mut entity.extensions.digest_methods, &rule.digest_methods);
                    push_missing(&mut entity.extensions.signing_methods, &rule.signing_methods);
                }
            }
            Ok(Some(entity))
        })
    }
}

/// NameID formats to add to matching entities' SSO roles
#[derive(Clone)]
pub struct NameIdFormatRule {
    pub predicate: EntityPredicate,
    pub formats: Vec<String>,
}

/// Adds NameID formats to IdP and SP roles of matching entities
#[derive(Clone, Default)]
pub struct NameIdFormatFilter {
    rules: Vec<NameIdFormatRule>,
}

impl NameIdFormatFilter {
    pub fn new(rules: Vec<NameIdFormatRule>) -> Self {
        Self { rules }
    }

    pub fn rule(mut self, predicate: EntityPredicate, formats: Vec<String>) -> Self {
        self.rules.push(NameIdFormatRule { predicate, formats });
        self
    }
}

impl MetadataFilter for NameIdFormatFilter {
    fn name(&self) -> &str {
        "NameIDFormat"
    }

    fn filter(
        &self,
        document: MetadataDocument,
        _context: &FilterContext,
    ) -> MetadataResult<Option<MetadataDocument>> {
        map_entities(document, &mut |mut entity| {
            for rule in &self.rules {
                if !(rule.predicate)(&entity) {
                    continue;
                }
                for role in entity
                    .roles
                    .iter_mut()
                    .filter(|r| matches!(r.role, RoleType::IdpSso | RoleType::SpSso))
                {
                    push_missing(&mut role.name_id_formats, &rule.formats);
                }
            }
            Ok(Some(entity))
        })
    }
}
