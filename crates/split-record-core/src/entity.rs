use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::delegation::{Dynamic, Selector};
use crate::error::MtiError;
use crate::model::{Forward, ImplementationBinding, ModelType, RelationKind, Role};
use crate::session::Session;
use crate::value::{FieldValue, RecordId, Row};

/// A materialised record of one model type.
///
/// Implementation entities answer for their base as well: forwarded fields,
/// forwarded relations and any member the base responds to are reachable
/// through [`Dynamic::send`] on the implementation itself.
#[derive(Clone)]
pub struct Entity {
    model: Arc<ModelType>,
    id: Option<RecordId>,
    values: BTreeMap<String, FieldValue>,
    changed: BTreeSet<String>,
    pub(crate) associations: BTreeMap<String, Option<Box<Entity>>>,
}

impl Entity {
    pub(crate) fn from_row(model: Arc<ModelType>, row: Row) -> Self {
        Self {
            model,
            id: row.id,
            values: row.values,
            changed: BTreeSet::new(),
            associations: BTreeMap::new(),
        }
    }

    pub(crate) fn blank(model: Arc<ModelType>, columns: &[String]) -> Self {
        Self {
            model,
            id: None,
            values: columns
                .iter()
                .map(|column| (column.clone(), FieldValue::Null))
                .collect(),
            changed: BTreeSet::new(),
            associations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<RecordId> {
        self.id
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    #[must_use]
    pub fn model(&self) -> &Arc<ModelType> {
        &self.model
    }

    #[must_use]
    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Local column value, without forwarding.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    #[must_use]
    pub fn changes(&self) -> BTreeMap<String, FieldValue> {
        self.changed
            .iter()
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    /// Whether `relation` has been loaded or assigned, and what it holds.
    #[must_use]
    pub fn loaded(&self, relation: &str) -> Option<Option<&Entity>> {
        self.associations.get(relation).map(|slot| slot.as_deref())
    }

    pub(crate) fn attach(&mut self, relation: &str, target: Entity) {
        self.associations
            .insert(relation.to_string(), Some(Box::new(target)));
    }

    pub(crate) fn set_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    pub(crate) fn clear_changes(&mut self) {
        self.changed.clear();
    }

    pub(crate) fn replace_values(&mut self, values: BTreeMap<String, FieldValue>) {
        self.values = values;
        self.changed.clear();
        self.associations.clear();
    }

    /// Set a local column, marking it changed only when the value differs.
    pub(crate) fn write_attribute(&mut self, name: &str, value: FieldValue) {
        if self.values.get(name) != Some(&value) {
            self.changed.insert(name.to_string());
        }
        self.values.insert(name.to_string(), value);
    }

    /// # Errors
    /// Returns `MtiError::MethodNotFound` when no local, forwarded or
    /// delegated field named `name` exists.
    pub fn get(&mut self, cx: &mut Session, name: &str) -> Result<FieldValue, MtiError> {
        self.send(cx, &Selector::read(name), Vec::new())
    }

    /// # Errors
    /// Returns `MtiError::MethodNotFound` when no local, forwarded or
    /// delegated field named `name` exists.
    pub fn set(
        &mut self,
        cx: &mut Session,
        name: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), MtiError> {
        self.send(cx, &Selector::write(name), vec![value.into()])
            .map(|_| ())
    }

    /// # Errors
    /// Returns `MtiError::MethodNotFound` when no field named `name` exists.
    pub fn present(&mut self, cx: &mut Session, name: &str) -> Result<bool, MtiError> {
        match self.send(cx, &Selector::presence(name), Vec::new())? {
            FieldValue::Bool(present) => Ok(present),
            other => Ok(other.is_present()),
        }
    }

    /// # Errors
    /// Returns `MtiError::MethodNotFound` when neither this model nor any
    /// collaborator defines `method`, or the method's own error.
    pub fn call(
        &mut self,
        cx: &mut Session,
        method: &str,
        args: Vec<FieldValue>,
    ) -> Result<FieldValue, MtiError> {
        self.send(cx, &Selector::call(method), args)
    }

    /// # Errors
    /// Propagates failures of collaborator accessors.
    pub fn responds_to(&mut self, cx: &mut Session, selector: &Selector) -> Result<bool, MtiError> {
        self.respond_to(cx, selector)
    }

    /// The linked base record, read in base instance mode and auto-built
    /// (unsaved) when none is linked yet.
    ///
    /// # Errors
    /// Returns `MtiError::Declaration` for non-implementation entities,
    /// `MtiError::BrokenPair` when no base can be built, or the storage
    /// failure of the lookup.
    pub fn base(&mut self, cx: &mut Session) -> Result<&mut Entity, MtiError> {
        let Role::Implementation(binding) = self.model.role() else {
            return Err(MtiError::Declaration(format!(
                "{} is not an implementation type",
                self.model.name()
            )));
        };
        let binding = binding.clone();

        // Present but empty means looked up without a match: build, don't reload.
        let looked_up = self.associations.contains_key(&binding.relation);
        let base = match self.associations.remove(&binding.relation).flatten() {
            Some(base) => base,
            None => match self.fresh_base(cx, &binding, looked_up) {
                Ok(base) => Box::new(base),
                Err(err) => {
                    if looked_up {
                        self.associations.insert(binding.relation, None);
                    }
                    return Err(err);
                }
            },
        };
        let slot = self.associations.entry(binding.relation).or_default();
        let base: &mut Entity = slot.insert(base);
        Ok(base)
    }

    fn fresh_base(
        &self,
        cx: &mut Session,
        binding: &ImplementationBinding,
        looked_up: bool,
    ) -> Result<Entity, MtiError> {
        let found = match self.id {
            Some(id) if !looked_up => cx.load_base_of(&self.model, binding, id)?,
            _ => None,
        };
        match found {
            Some(base) => Ok(base),
            None => cx.build_base_of(&self.model, binding, self.id),
        }
    }

    /// Id of the linked base record; `None` while the base is unsaved.
    ///
    /// # Errors
    /// Same as [`Entity::base`].
    pub fn base_id(&mut self, cx: &mut Session) -> Result<Option<RecordId>, MtiError> {
        Ok(self.base(cx)?.id())
    }

    /// For a base entity, its linked implementation.
    ///
    /// # Errors
    /// Returns `MtiError::Declaration` for non-base entities, or lookup failures.
    pub fn implementation(&mut self, cx: &mut Session) -> Result<Option<&mut Entity>, MtiError> {
        let Role::Base(binding) = self.model.role() else {
            return Err(MtiError::Declaration(format!(
                "{} is not a base type",
                self.model.name()
            )));
        };
        let relation = binding.relation.clone();
        self.related(cx, &relation)
    }

    /// Load (once) and return the record behind relation `name`. Relations of
    /// the base are reachable from an implementation.
    ///
    /// # Errors
    /// Returns `MtiError::UnknownRelation` or the failure of the lookup.
    pub fn related(
        &mut self,
        cx: &mut Session,
        name: &str,
    ) -> Result<Option<&mut Entity>, MtiError> {
        if self.is_base_relation(name) {
            return self.base(cx).map(Some);
        }
        if self.model.forwarded_relations.contains(name) {
            return self.base(cx)?.related(cx, name);
        }

        let relation = self
            .model
            .relation(name)
            .cloned()
            .ok_or_else(|| self.unknown_relation(name))?;
        if !self.associations.contains_key(name) {
            let loaded = cx.load_relation(self, &relation)?;
            self.associations.insert(name.to_string(), loaded.map(Box::new));
        }
        Ok(self
            .associations
            .get_mut(name)
            .and_then(|slot| slot.as_deref_mut()))
    }

    /// Point relation `name` at `target` and remember it for the next save.
    ///
    /// # Errors
    /// Returns `MtiError::UnknownRelation`, or `MtiError::InvalidAttribute`
    /// when a polymorphic target has not been saved yet.
    pub fn assign_related(
        &mut self,
        cx: &mut Session,
        name: &str,
        target: Option<Entity>,
    ) -> Result<(), MtiError> {
        if self.model.forwarded_relations.contains(name) {
            return self.base(cx)?.assign_related(cx, name, target);
        }

        let relation = self
            .model
            .relation(name)
            .cloned()
            .ok_or_else(|| self.unknown_relation(name))?;

        let mut target = target;
        match &relation.kind {
            RelationKind::BelongsTo { foreign_key, .. } => {
                let id = target.as_ref().and_then(Entity::id);
                self.write_attribute(foreign_key, id.into());
            }
            RelationKind::PolymorphicBelongsTo { foreign_type, foreign_key } => {
                if target.as_ref().is_some_and(Entity::is_new) {
                    return Err(MtiError::InvalidAttribute {
                        attribute: name.to_string(),
                        reason: "polymorphic target must be saved first".to_string(),
                    });
                }
                let id = target.as_ref().and_then(Entity::id);
                let type_name = target.as_ref().map(|t| t.model_name().to_string());
                self.write_attribute(foreign_key, id.into());
                self.write_attribute(foreign_type, type_name.into());
            }
            RelationKind::PolymorphicHasOne { as_name, .. } => {
                if let Some(target) = target.as_mut() {
                    target.write_attribute(&format!("{as_name}_type"), self.model_name().into());
                    target.write_attribute(&format!("{as_name}_id"), self.id.into());
                }
            }
        }

        self.associations.insert(name.to_string(), target.map(Box::new));
        Ok(())
    }

    /// Assign a JSON object of attributes. `<relation>_attributes` keys are
    /// applied to that relation when nested attributes are accepted for it.
    ///
    /// # Errors
    /// Returns `MtiError::InvalidAttribute` for unknown keys or non-scalar
    /// values.
    pub fn assign_attributes(
        &mut self,
        cx: &mut Session,
        attributes: &serde_json::Value,
    ) -> Result<(), MtiError> {
        let serde_json::Value::Object(map) = attributes else {
            return Err(MtiError::InvalidAttribute {
                attribute: self.model.name().to_string(),
                reason: "attributes must be a JSON object".to_string(),
            });
        };

        for (key, value) in map {
            if let Some(relation) = key
                .strip_suffix("_attributes")
                .filter(|relation| self.model.accepts_nested_attributes_for(relation))
            {
                let relation = relation.to_string();
                let target = self
                    .related(cx, &relation)?
                    .ok_or_else(|| MtiError::InvalidAttribute {
                        attribute: key.clone(),
                        reason: format!("no {relation} to assign to"),
                    })?;
                target.assign_attributes(cx, value)?;
                continue;
            }

            let field = FieldValue::from_json(key, value)?;
            match self.send(cx, &Selector::write(key.as_str()), vec![field]) {
                Err(MtiError::MethodNotFound { receiver, .. }) => {
                    return Err(MtiError::InvalidAttribute {
                        attribute: key.clone(),
                        reason: format!("unknown attribute for {receiver}"),
                    });
                }
                other => {
                    other?;
                }
            }
        }

        Ok(())
    }

    fn unknown_relation(&self, name: &str) -> MtiError {
        MtiError::UnknownRelation {
            relation: name.to_string(),
            model: self.model.name().to_string(),
        }
    }

    fn is_base_relation(&self, name: &str) -> bool {
        matches!(self.model.role(), Role::Implementation(binding) if binding.relation == name)
    }

    fn responds_locally(&self, selector: &Selector) -> bool {
        match selector {
            Selector::Read(name) => name == "id" || self.values.contains_key(name),
            Selector::Write(name) | Selector::Presence(name) => self.values.contains_key(name),
            Selector::Call(name) => self.model.has_method(name),
        }
    }

    fn send_locally(
        &mut self,
        cx: &mut Session,
        selector: &Selector,
        args: Vec<FieldValue>,
    ) -> Result<FieldValue, MtiError> {
        selector.check_arity(args.len())?;
        match selector {
            Selector::Read(name) if name == "id" && !self.values.contains_key(name) => {
                Ok(self.id.into())
            }
            Selector::Read(name) => Ok(self.values.get(name).cloned().unwrap_or_default()),
            Selector::Presence(name) => {
                let present = self.values.get(name).is_some_and(FieldValue::is_present);
                Ok(FieldValue::Bool(present))
            }
            Selector::Write(name) => {
                let value = args.into_iter().next().unwrap_or_default();
                self.write_attribute(name, value.clone());
                Ok(value)
            }
            Selector::Call(name) => match self.model.method(name) {
                Some(method) => method(self, cx, &args),
                None => Err(MtiError::MethodNotFound {
                    selector: selector.clone(),
                    receiver: self.model.name().to_string(),
                }),
            },
        }
    }
}

impl Dynamic<Session> for Entity {
    fn type_name(&self) -> &str {
        self.model.name()
    }

    fn respond_to(&mut self, cx: &mut Session, selector: &Selector) -> Result<bool, MtiError> {
        if self.model.forwards.contains_key(selector) || self.responds_locally(selector) {
            return Ok(true);
        }
        let model = Arc::clone(&self.model);
        model.delegation.responds_to(self, cx, selector)
    }

    fn send(
        &mut self,
        cx: &mut Session,
        selector: &Selector,
        args: Vec<FieldValue>,
    ) -> Result<FieldValue, MtiError> {
        if let Some(forward) = self.model.forwards.get(selector).copied() {
            selector.check_arity(args.len())?;
            return match forward {
                Forward::Base => self.base(cx)?.send(cx, selector, args),
                Forward::BaseId => Ok(self.base_id(cx)?.into()),
            };
        }

        if self.responds_locally(selector) {
            return self.send_locally(cx, selector, args);
        }

        let model = Arc::clone(&self.model);
        model.delegation.dispatch(self, cx, selector, args)
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("model", &self.model.name())
            .field("id", &self.id)
            .field("values", &self.values)
            .field("changed", &self.changed)
            .field("associations", &self.associations)
            .finish()
    }
}
