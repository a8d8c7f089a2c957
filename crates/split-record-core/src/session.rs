use std::collections::BTreeMap;
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::MtiError;
use crate::mode;
use crate::model::{ImplementationBinding, ModelType, Registry, Relation, RelationKind, Role};
use crate::storage::Storage;
use crate::value::{FieldValue, RecordId, Row};

const SAVE_SAVEPOINT: &str = "split_record_save";
const DESTROY_SAVEPOINT: &str = "split_record_destroy";

/// Unit of work over one storage connection.
///
/// Every load of a base type goes through mode-aware instantiation: outside
/// [`mode::as_base_instance`] the linked implementation is returned in place
/// of the base row.
pub struct Session {
    registry: Arc<Registry>,
    storage: Box<dyn Storage>,
}

impl Session {
    #[must_use]
    pub fn new(registry: Arc<Registry>, storage: Box<dyn Storage>) -> Self {
        Self { registry, storage }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn storage_mut(&mut self) -> &mut dyn Storage {
        self.storage.as_mut()
    }

    #[must_use]
    pub fn into_storage(self) -> Box<dyn Storage> {
        self.storage
    }

    /// Run `f` with base-type loads returning plain base entities.
    pub fn as_base_instance<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        mode::as_base_instance(|| f(self))
    }

    /// Unsaved entity of `model` with every known column set to NULL.
    ///
    /// # Errors
    /// Returns `MtiError::UnknownModel` or a schema read failure.
    pub fn new_entity(&mut self, model: &str) -> Result<Entity, MtiError> {
        let model = Arc::clone(self.registry.model(model)?);
        let columns = self.columns_of(&model)?;
        Ok(Entity::blank(model, &columns))
    }

    /// # Errors
    /// Returns `MtiError::NotFound` when no row has `id`, or a storage error.
    pub fn find(&mut self, model: &str, id: impl Into<RecordId>) -> Result<Entity, MtiError> {
        let id = id.into();
        let model = Arc::clone(self.registry.model(model)?);
        let rows = self.storage.select_ids(model.table(), &[id])?;
        self.instantiate_all(&model, rows)?
            .into_iter()
            .next()
            .ok_or_else(|| MtiError::NotFound {
                model: model.name().to_string(),
                id,
            })
    }

    /// First row of `model` whose `field` equals `value`.
    ///
    /// # Errors
    /// Returns a storage or resolution error.
    pub fn find_by(
        &mut self,
        model: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<Option<Entity>, MtiError> {
        let found = self.where_eq(model, &[(field, value.into())])?;
        Ok(found.into_iter().next())
    }

    /// # Errors
    /// Returns a storage or resolution error.
    pub fn where_eq(
        &mut self,
        model: &str,
        filters: &[(&str, FieldValue)],
    ) -> Result<Vec<Entity>, MtiError> {
        let model = Arc::clone(self.registry.model(model)?);
        let filters = filters
            .iter()
            .map(|(column, value)| ((*column).to_string(), value.clone()))
            .collect::<Vec<_>>();
        let rows = self.storage.select(model.table(), &filters)?;
        self.instantiate_all(&model, rows)
    }

    /// # Errors
    /// Returns a storage or resolution error.
    pub fn all(&mut self, model: &str) -> Result<Vec<Entity>, MtiError> {
        self.where_eq(model, &[])
    }

    /// New entity, attributes assigned from a JSON object, then saved.
    ///
    /// # Errors
    /// Returns attribute, validation or storage errors; nothing is written on
    /// failure.
    pub fn create(
        &mut self,
        model: &str,
        attributes: &serde_json::Value,
    ) -> Result<Entity, MtiError> {
        let mut entity = self.new_entity(model)?;
        entity.assign_attributes(self, attributes)?;
        self.save(&mut entity)?;
        Ok(entity)
    }

    /// Validate and persist `entity` together with its autosaved relations.
    /// New implementations get their base built and saved in the same step.
    ///
    /// # Errors
    /// Returns `MtiError::Validation` or a storage error. On error the
    /// storage is rolled back and `entity` is left as it was before the call.
    pub fn save(&mut self, entity: &mut Entity) -> Result<(), MtiError> {
        let snapshot = entity.clone();
        self.storage.savepoint(SAVE_SAVEPOINT)?;

        let result = self.save_entity(entity);
        match result {
            Ok(()) => {
                self.storage.release(SAVE_SAVEPOINT)?;
                tracing::debug!(model = entity.model_name(), id = ?entity.id(), "saved entity");
                Ok(())
            }
            Err(err) => {
                *entity = snapshot;
                self.rollback(SAVE_SAVEPOINT);
                tracing::debug!(model = entity.model_name(), error = %err, "save rolled back");
                Err(err)
            }
        }
    }

    /// Delete `entity` together with the records its `dependent_destroy`
    /// relations point at. For a base/implementation pair that is the other
    /// half.
    ///
    /// # Errors
    /// Returns a storage error; nothing is deleted on failure.
    pub fn destroy(&mut self, mut entity: Entity) -> Result<(), MtiError> {
        self.storage.savepoint(DESTROY_SAVEPOINT)?;
        match self.destroy_entity(&mut entity) {
            Ok(()) => {
                self.storage.release(DESTROY_SAVEPOINT)?;
                Ok(())
            }
            Err(err) => {
                self.rollback(DESTROY_SAVEPOINT);
                Err(err)
            }
        }
    }

    /// Roll back `savepoint` after a failed write. A rollback failure is
    /// logged so the caller still sees the error that caused it.
    fn rollback(&mut self, savepoint: &str) {
        if let Err(err) = self.storage.rollback_to(savepoint) {
            tracing::warn!(savepoint, error = %err, "rollback failed");
        }
    }

    /// Re-read the entity's own row, dropping unsaved changes and loaded
    /// relations. Unsaved entities are left untouched.
    ///
    /// # Errors
    /// Returns `MtiError::NotFound` when the row is gone.
    pub fn reload(&mut self, entity: &mut Entity) -> Result<(), MtiError> {
        let Some(id) = entity.id() else {
            return Ok(());
        };
        let row = self
            .storage
            .select_ids(entity.model().table(), &[id])?
            .into_iter()
            .next()
            .ok_or_else(|| MtiError::NotFound {
                model: entity.model_name().to_string(),
                id,
            })?;
        entity.replace_values(row.values);
        Ok(())
    }

    /// Materialise `rows` of `model`. Base-type rows resolve to their linked
    /// implementations unless base instance mode is on; implementations are
    /// fetched with one query per implementation type and keep the base row
    /// under the relation's `inverse_of` name.
    pub(crate) fn instantiate_all(
        &mut self,
        model: &Arc<ModelType>,
        rows: Vec<Row>,
    ) -> Result<Vec<Entity>, MtiError> {
        let entities = rows
            .into_iter()
            .map(|row| Entity::from_row(Arc::clone(model), row))
            .collect::<Vec<_>>();

        let Role::Base(binding) = model.role() else {
            return Ok(entities);
        };
        if mode::base_instance_mode() {
            return Ok(entities);
        }

        let inverse = model
            .relation(&binding.relation)
            .and_then(|relation| relation.options.inverse_of.clone())
            .unwrap_or_else(|| binding.relation.clone());
        let type_column = binding.type_column();
        let id_column = binding.id_column();
        let reference = |entity: &Entity| -> Option<(String, RecordId)> {
            let type_name = entity.attribute(&type_column).and_then(FieldValue::as_str)?;
            let id = reference_id(entity, &id_column)?;
            Some((type_name.to_string(), id))
        };

        let mut wanted: BTreeMap<String, Vec<RecordId>> = BTreeMap::new();
        for entity in &entities {
            if let Some((type_name, id)) = reference(entity) {
                wanted.entry(type_name).or_default().push(id);
            }
        }

        let mut implementations = BTreeMap::new();
        let mut loaded: BTreeMap<(String, RecordId), Row> = BTreeMap::new();
        for (type_name, ids) in wanted {
            let implementation = Arc::clone(self.registry.model(&type_name)?);
            match implementation.role() {
                Role::Implementation(link) if link.base_model == model.name() => {}
                _ => {
                    return Err(MtiError::Declaration(format!(
                        "{type_name} is referenced by {} but is not one of its implementations",
                        model.name()
                    )));
                }
            }
            for row in self.storage.select_ids(implementation.table(), &ids)? {
                if let Some(id) = row.id {
                    loaded.insert((type_name.clone(), id), row);
                }
            }
            implementations.insert(type_name, implementation);
        }

        let mut resolved = Vec::with_capacity(entities.len());
        for base in entities {
            let Some(key) = reference(&base) else {
                tracing::debug!(
                    model = model.name(),
                    id = ?base.id(),
                    "base row has no implementation"
                );
                resolved.push(base);
                continue;
            };
            let (Some(implementation), Some(row)) =
                (implementations.get(&key.0), loaded.get(&key))
            else {
                return Err(MtiError::NotFound {
                    model: key.0.clone(),
                    id: key.1,
                });
            };
            let mut entity = Entity::from_row(Arc::clone(implementation), row.clone());
            entity.attach(&inverse, base);
            resolved.push(entity);
        }
        Ok(resolved)
    }

    /// The base row linked to implementation `id`, read as a plain base.
    pub(crate) fn load_base_of(
        &mut self,
        model: &ModelType,
        binding: &ImplementationBinding,
        id: RecordId,
    ) -> Result<Option<Entity>, MtiError> {
        let base = Arc::clone(self.registry.model(&binding.base_model)?);
        let filters = [
            (binding.type_column(), FieldValue::from(model.name())),
            (binding.id_column(), FieldValue::from(id)),
        ];
        let rows = self.storage.select(base.table(), &filters)?;
        if rows.len() > 1 {
            tracing::warn!(
                model = model.name(),
                %id,
                base = base.name(),
                count = rows.len(),
                "implementation is linked from several base rows; using the first"
            );
        }
        let found = mode::as_base_instance(|| self.instantiate_all(&base, rows))?;
        Ok(found.into_iter().next())
    }

    /// Unsaved base for an implementation that has none yet, with the
    /// polymorphic reference preset. Fails with `MtiError::BrokenPair` while
    /// the base table does not exist.
    pub(crate) fn build_base_of(
        &mut self,
        model: &ModelType,
        binding: &ImplementationBinding,
        id: Option<RecordId>,
    ) -> Result<Entity, MtiError> {
        let base = Arc::clone(self.registry.model(&binding.base_model)?);
        if !self.storage.table_exists(base.table())? {
            return Err(MtiError::BrokenPair {
                model: model.name().to_string(),
                base: base.name().to_string(),
            });
        }
        let columns = self.columns_of(&base)?;
        let mut entity = Entity::blank(base, &columns);
        entity.write_attribute(&binding.type_column(), model.name().into());
        if let Some(id) = id {
            entity.write_attribute(&binding.id_column(), id.into());
        }
        tracing::debug!(model = model.name(), id = ?id, base = %binding.base_model, "built base");
        Ok(entity)
    }

    pub(crate) fn load_relation(
        &mut self,
        owner: &Entity,
        relation: &Relation,
    ) -> Result<Option<Entity>, MtiError> {
        match &relation.kind {
            RelationKind::BelongsTo { target, foreign_key } => {
                let Some(id) = reference_id(owner, foreign_key) else {
                    return Ok(None);
                };
                let target = Arc::clone(self.registry.model(target)?);
                let rows = self.storage.select_ids(target.table(), &[id])?;
                Ok(self.instantiate_all(&target, rows)?.into_iter().next())
            }
            RelationKind::PolymorphicBelongsTo { foreign_type, foreign_key } => {
                let type_name = owner.attribute(foreign_type).and_then(FieldValue::as_str);
                let id = reference_id(owner, foreign_key);
                let (Some(type_name), Some(id)) = (type_name, id) else {
                    return Ok(None);
                };
                let target = Arc::clone(self.registry.model(type_name)?);
                let rows = self.storage.select_ids(target.table(), &[id])?;
                Ok(self.instantiate_all(&target, rows)?.into_iter().next())
            }
            RelationKind::PolymorphicHasOne { target, as_name } => {
                let Some(id) = owner.id() else {
                    return Ok(None);
                };
                let target = Arc::clone(self.registry.model(target)?);
                let owner_type = FieldValue::from(owner.model_name());
                let filters = [
                    (format!("{as_name}_type"), owner_type),
                    (format!("{as_name}_id"), FieldValue::from(id)),
                ];
                let rows = self.storage.select(target.table(), &filters)?;
                Ok(self.instantiate_all(&target, rows)?.into_iter().next())
            }
        }
    }

    fn columns_of(&self, model: &ModelType) -> Result<Vec<String>, MtiError> {
        if !model.columns().is_empty() {
            return Ok(model.columns().to_vec());
        }
        Ok(self
            .storage
            .columns(model.table())?
            .into_iter()
            .filter(|column| !column.primary_key)
            .map(|column| column.name)
            .collect())
    }

    fn save_entity(&mut self, entity: &mut Entity) -> Result<(), MtiError> {
        if entity.is_new() && matches!(entity.model().role(), Role::Implementation(_)) {
            entity.base(self)?;
        }
        validate(entity)?;
        self.persist(entity)
    }

    fn persist(&mut self, entity: &mut Entity) -> Result<(), MtiError> {
        let model = Arc::clone(entity.model());

        for relation in model.relations().values() {
            let RelationKind::BelongsTo { foreign_key, .. } = &relation.kind else {
                continue;
            };
            let target_id = match entity.associations.get_mut(&relation.name) {
                Some(Some(target)) => {
                    if target.is_new() || target.has_changes() {
                        self.persist(target)?;
                    }
                    target.id()
                }
                _ => continue,
            };
            entity.write_attribute(foreign_key, target_id.into());
        }

        match entity.id() {
            None => {
                let id = self.storage.insert(model.table(), &entity.changes())?;
                entity.set_id(id);
                tracing::debug!(model = model.name(), %id, "inserted row");
            }
            Some(id) if entity.has_changes() => {
                self.storage.update(model.table(), id, &entity.changes())?;
                tracing::debug!(model = model.name(), %id, "updated row");
            }
            Some(_) => {}
        }
        entity.clear_changes();

        let owner_id = entity.id();
        for relation in model.relations().values() {
            let RelationKind::PolymorphicHasOne { as_name, .. } = &relation.kind else {
                continue;
            };
            if !relation.options.autosave {
                continue;
            }
            let Some(Some(target)) = entity.associations.get_mut(&relation.name) else {
                continue;
            };
            target.write_attribute(&format!("{as_name}_type"), model.name().into());
            target.write_attribute(&format!("{as_name}_id"), owner_id.into());
            if target.is_new() || target.has_changes() {
                self.persist(target)?;
            }
        }

        Ok(())
    }

    fn destroy_entity(&mut self, entity: &mut Entity) -> Result<(), MtiError> {
        let model = Arc::clone(entity.model());

        let mut dependents = Vec::new();
        for relation in model.relations().values() {
            if !relation.options.dependent_destroy {
                continue;
            }
            if let Some(target) = entity.related(self, &relation.name)? {
                if let Some(id) = target.id() {
                    dependents.push((target.model().table().to_string(), id));
                }
            }
        }

        if let Some(id) = entity.id() {
            self.storage.delete(model.table(), id)?;
        }
        for (table, id) in &dependents {
            self.storage.delete(table, *id)?;
        }
        tracing::debug!(
            model = model.name(),
            id = ?entity.id(),
            dependents = dependents.len(),
            "destroyed entity"
        );
        Ok(())
    }
}

fn reference_id(entity: &Entity, column: &str) -> Option<RecordId> {
    entity.attribute(column).and_then(FieldValue::as_record_id)
}

/// Run the validators of `entity` and of loaded relations that require it.
fn validate(entity: &Entity) -> Result<(), MtiError> {
    let model = entity.model();
    for validator in &model.validators {
        validator(entity).map_err(|message| MtiError::Validation {
            model: model.name().to_string(),
            message,
        })?;
    }

    for (name, target) in &entity.associations {
        let Some(target) = target else {
            continue;
        };
        let Some(relation) = model.relation(name) else {
            continue;
        };
        if relation.options.validate || (relation.is_belongs_to() && target.is_new()) {
            validate(target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{anyhow, Result};
    use serde_json::json;

    use super::*;
    use crate::model::ModelDef;
    use crate::storage::{Column, SchemaSource};

    type Table = (Vec<&'static str>, BTreeMap<RecordId, BTreeMap<String, FieldValue>>);

    #[derive(Default)]
    struct MemoryStorage {
        tables: BTreeMap<String, Table>,
        next_id: i64,
        snapshots: Vec<(String, BTreeMap<String, Table>)>,
        selects: Arc<AtomicUsize>,
        fail_rollbacks: bool,
    }

    impl MemoryStorage {
        fn with_tables(tables: &[(&str, &[&'static str])]) -> Self {
            let tables = tables
                .iter()
                .map(|(name, columns)| ((*name).to_string(), (columns.to_vec(), BTreeMap::new())))
                .collect();
            Self {
                tables,
                next_id: 1,
                ..Self::default()
            }
        }

        fn table(&self, table: &str) -> Result<&Table> {
            self.tables
                .get(table)
                .ok_or_else(|| anyhow!("no such table: {table}"))
        }

        fn table_mut(&mut self, table: &str) -> Result<&mut Table> {
            self.tables
                .get_mut(table)
                .ok_or_else(|| anyhow!("no such table: {table}"))
        }
    }

    fn to_row(id: RecordId, values: &BTreeMap<String, FieldValue>) -> Row {
        Row {
            id: Some(id),
            values: values.clone(),
        }
    }

    impl SchemaSource for MemoryStorage {
        fn table_exists(&self, table: &str) -> Result<bool> {
            Ok(self.tables.contains_key(table))
        }

        fn columns(&self, table: &str) -> Result<Vec<Column>> {
            let id = Column {
                name: "id".to_string(),
                primary_key: true,
            };
            Ok(self
                .tables
                .get(table)
                .map(|(columns, _)| {
                    std::iter::once(id)
                        .chain(columns.iter().map(|name| Column {
                            name: (*name).to_string(),
                            primary_key: false,
                        }))
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    impl Storage for MemoryStorage {
        fn select(&mut self, table: &str, filters: &[(String, FieldValue)]) -> Result<Vec<Row>> {
            self.selects.fetch_add(1, Ordering::SeqCst);
            let (_, rows) = self.table(table)?;
            Ok(rows
                .iter()
                .filter(|(_, values)| {
                    filters.iter().all(|(column, value)| {
                        values.get(column).unwrap_or(&FieldValue::Null) == value
                    })
                })
                .map(|(id, values)| to_row(*id, values))
                .collect())
        }

        fn select_ids(&mut self, table: &str, ids: &[RecordId]) -> Result<Vec<Row>> {
            self.selects.fetch_add(1, Ordering::SeqCst);
            let (_, rows) = self.table(table)?;
            Ok(rows
                .iter()
                .filter(|(id, _)| ids.contains(id))
                .map(|(id, values)| to_row(*id, values))
                .collect())
        }

        fn insert(
            &mut self,
            table: &str,
            values: &BTreeMap<String, FieldValue>,
        ) -> Result<RecordId> {
            let id = RecordId(self.next_id);
            let (columns, rows) = self.table_mut(table)?;
            let mut row: BTreeMap<String, FieldValue> = columns
                .iter()
                .map(|column| ((*column).to_string(), FieldValue::Null))
                .collect();
            row.extend(values.clone());
            rows.insert(id, row);
            self.next_id += 1;
            Ok(id)
        }

        fn update(
            &mut self,
            table: &str,
            id: RecordId,
            values: &BTreeMap<String, FieldValue>,
        ) -> Result<()> {
            let (_, rows) = self.table_mut(table)?;
            let row = rows
                .get_mut(&id)
                .ok_or_else(|| anyhow!("no row {id} in {table}"))?;
            row.extend(values.clone());
            Ok(())
        }

        fn delete(&mut self, table: &str, id: RecordId) -> Result<()> {
            if let Some((_, rows)) = self.tables.get_mut(table) {
                rows.remove(&id);
            }
            Ok(())
        }

        fn savepoint(&mut self, name: &str) -> Result<()> {
            self.snapshots.push((name.to_string(), self.tables.clone()));
            Ok(())
        }

        fn release(&mut self, name: &str) -> Result<()> {
            match self.snapshots.pop() {
                Some((open, _)) if open == name => Ok(()),
                _ => Err(anyhow!("no savepoint {name}")),
            }
        }

        fn rollback_to(&mut self, name: &str) -> Result<()> {
            if self.fail_rollbacks {
                return Err(anyhow!("disk I/O error during rollback to {name}"));
            }
            match self.snapshots.pop() {
                Some((open, tables)) if open == name => {
                    self.tables = tables;
                    Ok(())
                }
                _ => Err(anyhow!("no savepoint {name}")),
            }
        }
    }

    fn device_registry(storage: &MemoryStorage) -> Result<Registry, MtiError> {
        let mut registry = Registry::new();
        registry.register(storage, ModelDef::new("Owner", "owners"))?;
        let device = ModelDef::new("Device", "devices")
            .belongs_to("owner", "Owner")
            .mti_base()
            .validates(|device| match device.attribute("name") {
                Some(name) if name.is_present() => Ok(()),
                _ => Err("name can't be blank".to_string()),
            });
        registry.register(storage, device)?;
        for (name, table) in [("Computer", "computers"), ("Camera", "cameras")] {
            let def = ModelDef::new(name, table).mti_implementation_of("Device");
            registry.register(storage, def)?;
        }
        Ok(registry)
    }

    fn device_session() -> Result<Session, MtiError> {
        device_session_counting().map(|(session, _)| session)
    }

    fn device_session_counting() -> Result<(Session, Arc<AtomicUsize>), MtiError> {
        let storage = MemoryStorage::with_tables(&[
            ("owners", &["name"]),
            ("devices", &["name", "owner_id", "device_id", "device_type"]),
            ("computers", &["cpu_model"]),
            ("cameras", &["matrix_size"]),
        ]);
        let registry = device_registry(&storage)?;
        let selects = Arc::clone(&storage.selects);
        Ok((Session::new(Arc::new(registry), Box::new(storage)), selects))
    }

    fn session_over(storage: MemoryStorage) -> Result<Session, MtiError> {
        let registry = device_registry(&storage)?;
        Ok(Session::new(Arc::new(registry), Box::new(storage)))
    }

    #[test]
    fn base_rows_resolve_to_implementations_unless_in_base_mode() -> Result<(), MtiError> {
        let mut session = device_session()?;
        let computer = session.create(
            "Computer",
            &json!({ "cpu_model": "core i7", "name": "Macbook" }),
        )?;
        let device_id = session
            .as_base_instance(|session| session.find_by("Device", "name", "Macbook"))?
            .and_then(|device| device.id());

        let resolved = session.find_by("Device", "name", "Macbook")?;
        assert_eq!(resolved.as_ref().map(Entity::model_name), Some("Computer"));
        assert_eq!(resolved.as_ref().and_then(Entity::id), computer.id());

        let plain = session.as_base_instance(|session| session.all("Device"))?;
        let names = plain.iter().map(Entity::model_name).collect::<Vec<_>>();
        assert_eq!(names, vec!["Device"]);
        assert_eq!(plain.first().and_then(Entity::id), device_id);
        Ok(())
    }

    #[test]
    fn resolved_implementation_keeps_the_base_row_it_came_from() -> Result<(), MtiError> {
        let mut session = device_session()?;
        session.create("Camera", &json!({ "name": "Canon" }))?;

        let resolved = session.find_by("Device", "name", "Canon")?;
        let base = resolved.as_ref().and_then(|camera| camera.loaded("device"));
        let base_model = base.flatten().map(Entity::model_name);
        assert_eq!(base_model, Some("Device"));
        Ok(())
    }

    #[test]
    fn resolution_batches_one_query_per_implementation_type() -> Result<(), MtiError> {
        let (mut session, selects) = device_session_counting()?;
        for index in 0..3 {
            session.create("Computer", &json!({ "name": format!("pc {index}") }))?;
            session.create("Camera", &json!({ "name": format!("cam {index}") }))?;
        }

        let before = selects.load(Ordering::SeqCst);
        let devices = session.all("Device")?;
        assert_eq!(devices.len(), 6);
        assert_eq!(selects.load(Ordering::SeqCst) - before, 3);
        Ok(())
    }

    #[test]
    fn failed_validation_rolls_back_and_restores_the_entity() -> Result<(), MtiError> {
        let mut session = device_session()?;
        let mut computer = session.new_entity("Computer")?;
        computer.set(&mut session, "cpu_model", "core i7")?;

        match session.save(&mut computer) {
            Err(MtiError::Validation { model, .. }) => assert_eq!(model, "Device"),
            other => panic!("expected Validation, got {other:?}"),
        }
        assert!(computer.is_new());
        assert!(session.all("Computer")?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_rollback_keeps_the_error_that_caused_it() -> Result<(), MtiError> {
        let mut storage = MemoryStorage::with_tables(&[
            ("owners", &["name"]),
            ("devices", &["name", "owner_id", "device_id", "device_type"]),
        ]);
        storage.fail_rollbacks = true;
        let mut session = session_over(storage)?;
        let mut computer = session.new_entity("Computer")?;
        computer.set(&mut session, "name", "Macbook")?;

        match session.save(&mut computer) {
            Err(MtiError::Storage(cause)) => {
                assert_eq!(cause.to_string(), "no such table: computers");
            }
            other => panic!("expected the insert failure, got {other:?}"),
        }
        assert!(computer.is_new());
        Ok(())
    }

    #[test]
    fn base_cannot_be_built_without_its_table() -> Result<(), MtiError> {
        let storage = MemoryStorage::with_tables(&[("computers", &["cpu_model"])]);
        let mut session = session_over(storage)?;
        let mut computer = session.new_entity("Computer")?;

        match computer.base(&mut session).map(|base| base.id()) {
            Err(MtiError::BrokenPair { model, base }) => {
                assert_eq!((model.as_str(), base.as_str()), ("Computer", "Device"));
            }
            other => panic!("expected BrokenPair, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn destroying_an_implementation_removes_its_base() -> Result<(), MtiError> {
        let mut session = device_session()?;
        let camera = session.create("Camera", &json!({ "name": "Canon" }))?;

        session.destroy(camera)?;

        assert!(session.all("Camera")?.is_empty());
        let devices = session.as_base_instance(|session| session.all("Device"))?;
        assert!(devices.is_empty());
        Ok(())
    }

    #[test]
    fn destroy_leaves_records_of_non_dependent_relations() -> Result<(), MtiError> {
        let mut session = device_session()?;
        let owner = session.create("Owner", &json!({ "name": "Ann" }))?;
        let mut camera = session.create("Camera", &json!({ "name": "Canon" }))?;
        camera.assign_related(&mut session, "owner", Some(owner))?;
        session.save(&mut camera)?;

        session.destroy(camera)?;

        assert!(session.all("Camera")?.is_empty());
        assert_eq!(session.all("Owner")?.len(), 1);
        Ok(())
    }

    #[test]
    fn destroying_a_base_removes_its_implementation() -> Result<(), MtiError> {
        let mut session = device_session()?;
        session.create("Computer", &json!({ "name": "Macbook" }))?;
        let device = session
            .as_base_instance(|session| session.find_by("Device", "name", "Macbook"))?
            .ok_or(MtiError::Declaration("missing device".to_string()))?;

        session.destroy(device)?;

        assert!(session.all("Computer")?.is_empty());
        assert!(session.all("Device")?.is_empty());
        Ok(())
    }

    #[test]
    fn dangling_reference_is_reported_as_not_found() -> Result<(), MtiError> {
        let mut session = device_session()?;
        let camera = session.create("Camera", &json!({ "name": "Canon" }))?;
        let camera_id = camera
            .id()
            .ok_or(MtiError::Declaration("unsaved".to_string()))?;
        session.storage_mut().delete("cameras", camera_id)?;

        match session.find_by("Device", "name", "Canon") {
            Err(MtiError::NotFound { model, .. }) => assert_eq!(model, "Camera"),
            other => panic!("expected NotFound, got {other:?}"),
        }
        Ok(())
    }
}
