use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::binder;
use crate::delegation::{accessor, Accessor, DelegationChain, Dynamic, Selector};
use crate::entity::Entity;
use crate::error::MtiError;
use crate::session::Session;
use crate::storage::SchemaSource;
use crate::value::FieldValue;

/// Domain behaviour attached to a model type and reachable through
/// `Selector::Call`.
pub type Method = Arc<
    dyn Fn(&mut Entity, &mut Session, &[FieldValue]) -> Result<FieldValue, MtiError> + Send + Sync,
>;

/// Record-level check run before every save. `Err` carries the message.
pub type Validator = Arc<dyn Fn(&Entity) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// Foreign key on this record pointing at `target`.
    BelongsTo { target: String, foreign_key: String },
    /// `{name}_type` / `{name}_id` pair on this record pointing at any model.
    PolymorphicBelongsTo {
        foreign_type: String,
        foreign_key: String,
    },
    /// Record of `target` whose `{as_name}_type` / `{as_name}_id` point back here.
    PolymorphicHasOne { target: String, as_name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationOptions {
    pub autosave: bool,
    pub dependent_destroy: bool,
    pub validate: bool,
    pub inverse_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub options: RelationOptions,
}

impl Relation {
    #[must_use]
    pub fn belongs_to(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: RelationKind::BelongsTo {
                target: target.to_string(),
                foreign_key: format!("{name}_id"),
            },
            options: RelationOptions::default(),
        }
    }

    #[must_use]
    pub fn is_belongs_to(&self) -> bool {
        matches!(
            self.kind,
            RelationKind::BelongsTo { .. } | RelationKind::PolymorphicBelongsTo { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseBinding {
    /// Name of the polymorphic relation to the implementation; also the
    /// prefix of the `_type` / `_id` columns.
    pub relation: String,
}

impl BaseBinding {
    #[must_use]
    pub fn type_column(&self) -> String {
        format!("{}_type", self.relation)
    }

    #[must_use]
    pub fn id_column(&self) -> String {
        format!("{}_id", self.relation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplementationBinding {
    pub base_model: String,
    /// Name of the relation to the base record.
    pub relation: String,
}

impl ImplementationBinding {
    #[must_use]
    pub fn type_column(&self) -> String {
        format!("{}_type", self.relation)
    }

    #[must_use]
    pub fn id_column(&self) -> String {
        format!("{}_id", self.relation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Plain,
    Base(BaseBinding),
    Implementation(ImplementationBinding),
}

/// Target of a generated forwarding entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// Send the same selector to the base record.
    Base,
    /// Answer with the base record's id.
    BaseId,
}

/// Registered, immutable description of one model type.
pub struct ModelType {
    pub(crate) name: String,
    pub(crate) table: String,
    pub(crate) columns: Vec<String>,
    pub(crate) relations: BTreeMap<String, Relation>,
    pub(crate) methods: BTreeMap<String, Method>,
    pub(crate) validators: Vec<Validator>,
    pub(crate) role: Role,
    pub(crate) forwards: BTreeMap<Selector, Forward>,
    pub(crate) forwarded_relations: BTreeSet<String>,
    pub(crate) delegation: DelegationChain<Entity, Session>,
    pub(crate) nested_attributes: BTreeSet<String>,
}

impl ModelType {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Non-key columns known at declaration time. Empty when the table did
    /// not exist yet.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn relations(&self) -> &BTreeMap<String, Relation> {
        &self.relations
    }

    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    #[must_use]
    pub fn role(&self) -> &Role {
        &self.role
    }

    #[must_use]
    pub fn is_base(&self) -> bool {
        matches!(self.role, Role::Base(_))
    }

    #[must_use]
    pub fn forwards(&self) -> &BTreeMap<Selector, Forward> {
        &self.forwards
    }

    #[must_use]
    pub fn forwarded_relations(&self) -> &BTreeSet<String> {
        &self.forwarded_relations
    }

    #[must_use]
    pub fn delegation(&self) -> &DelegationChain<Entity, Session> {
        &self.delegation
    }

    #[must_use]
    pub fn accepts_nested_attributes_for(&self, relation: &str) -> bool {
        self.nested_attributes.contains(relation)
    }

    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub(crate) fn method(&self, name: &str) -> Option<Method> {
        self.methods.get(name).cloned()
    }
}

impl Debug for ModelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelType")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("role", &self.role)
            .field("forwards", &self.forwards.len())
            .field("delegation", &self.delegation)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RoleDecl {
    Plain,
    Base,
    ImplementationOf(String),
}

/// Declaration of a model type, turned into a [`ModelType`] by
/// [`Registry::register`].
pub struct ModelDef {
    name: String,
    table: String,
    relations: Vec<Relation>,
    methods: BTreeMap<String, Method>,
    validators: Vec<Validator>,
    delegations: Vec<Vec<String>>,
    role: RoleDecl,
}

impl ModelDef {
    #[must_use]
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            relations: Vec::new(),
            methods: BTreeMap::new(),
            validators: Vec::new(),
            delegations: Vec::new(),
            role: RoleDecl::Plain,
        }
    }

    #[must_use]
    pub fn belongs_to(mut self, name: &str, target: &str) -> Self {
        self.relations.push(Relation::belongs_to(name, target));
        self
    }

    #[must_use]
    pub fn method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut Entity, &mut Session, &[FieldValue]) -> Result<FieldValue, MtiError>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(name.to_string(), Arc::new(f));
        self
    }

    #[must_use]
    pub fn validates<F>(mut self, f: F) -> Self
    where
        F: Fn(&Entity) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.push(Arc::new(f));
        self
    }

    /// Forward unknown members to the named relations, in order.
    #[must_use]
    pub fn delegate_missing_to(mut self, relations: &[&str]) -> Self {
        let names = relations.iter().map(ToString::to_string).collect();
        self.delegations.push(names);
        self
    }

    #[must_use]
    pub fn mti_base(mut self) -> Self {
        self.role = RoleDecl::Base;
        self
    }

    #[must_use]
    pub fn mti_implementation_of(mut self, base: &str) -> Self {
        self.role = RoleDecl::ImplementationOf(base.to_string());
        self
    }
}

/// All declared model types, keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    models: BTreeMap<String, Arc<ModelType>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a model type. Base types must be registered before their
    /// implementations.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be read, the name is taken, or
    /// the declared base is unknown or not a base type.
    pub fn register(
        &mut self,
        schema: &dyn SchemaSource,
        def: ModelDef,
    ) -> Result<Arc<ModelType>, MtiError> {
        if self.models.contains_key(&def.name) {
            return Err(MtiError::Declaration(format!(
                "model {} is already registered",
                def.name
            )));
        }

        let columns = if schema.table_exists(&def.table)? {
            schema
                .columns(&def.table)?
                .into_iter()
                .filter(|column| !column.primary_key)
                .map(|column| column.name)
                .collect()
        } else {
            tracing::warn!(model = %def.name, table = %def.table, "table missing at declaration");
            Vec::new()
        };

        let mut model = ModelType {
            name: def.name,
            table: def.table,
            columns,
            relations: def
                .relations
                .into_iter()
                .map(|relation| (relation.name.clone(), relation))
                .collect(),
            methods: def.methods,
            validators: def.validators,
            role: Role::Plain,
            forwards: BTreeMap::new(),
            forwarded_relations: BTreeSet::new(),
            delegation: DelegationChain::new(),
            nested_attributes: BTreeSet::new(),
        };

        match def.role {
            RoleDecl::Plain => {}
            RoleDecl::Base => binder::declare_base(&mut model),
            RoleDecl::ImplementationOf(base_name) => {
                let base = Arc::clone(self.model(&base_name)?);
                binder::declare_implementation_of(&mut model, &base, schema)?;
            }
        }

        for relations in def.delegations {
            for name in &relations {
                if !model.relations.contains_key(name)
                    && !model.forwarded_relations.contains(name)
                {
                    return Err(MtiError::UnknownRelation {
                        relation: name.clone(),
                        model: model.name.clone(),
                    });
                }
            }
            model.delegation.delegate_missing_to(
                relations
                    .into_iter()
                    .map(|name| (name.clone(), related_accessor(name))),
            );
        }

        tracing::debug!(
            model = %model.name,
            role = ?model.role,
            forwards = model.forwards.len(),
            "registered model type"
        );

        let model = Arc::new(model);
        self.models.insert(model.name.clone(), Arc::clone(&model));
        Ok(model)
    }

    /// # Errors
    /// Returns `MtiError::UnknownModel` when no model has this name.
    pub fn model(&self, name: &str) -> Result<&Arc<ModelType>, MtiError> {
        self.models
            .get(name)
            .ok_or_else(|| MtiError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelType>> {
        self.models.values()
    }
}

/// Collaborator accessor that loads the named relation of the host record.
fn related_accessor(relation: String) -> Accessor<Entity, Session> {
    accessor(move |entity: &mut Entity, cx: &mut Session| {
        Ok(entity
            .related(cx, &relation)?
            .map(|target| target as &mut dyn Dynamic<Session>))
    })
}
