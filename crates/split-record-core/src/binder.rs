//! Wiring of base/implementation pairs at declaration time.
//!
//! A base type gets a polymorphic relation to its implementation and is
//! resolved to that implementation on load (see [`crate::Session`]). An
//! implementation type gets a relation back to its base, a fixed table of
//! forwarding entries generated from the base's schema and relations, and a
//! delegation fallback to the base for everything else.

use crate::delegation::{accessor, Accessor, Dynamic, Selector};
use crate::entity::Entity;
use crate::error::MtiError;
use crate::introspection;
use crate::model::{
    BaseBinding, Forward, ImplementationBinding, ModelType, Relation, RelationKind,
    RelationOptions, Role,
};
use crate::session::Session;
use crate::storage::SchemaSource;
use crate::value::snake_case;

pub(crate) fn declare_base(model: &mut ModelType) {
    let relation = snake_case(&model.name);
    let binding = BaseBinding {
        relation: relation.clone(),
    };

    model.relations.insert(
        relation.clone(),
        Relation {
            name: relation.clone(),
            kind: RelationKind::PolymorphicBelongsTo {
                foreign_type: binding.type_column(),
                foreign_key: binding.id_column(),
            },
            options: RelationOptions {
                dependent_destroy: true,
                inverse_of: Some(relation),
                ..Default::default()
            },
        },
    );
    model.role = Role::Base(binding);
}

pub(crate) fn declare_implementation_of(
    model: &mut ModelType,
    base: &ModelType,
    schema: &dyn SchemaSource,
) -> Result<(), MtiError> {
    let Role::Base(base_binding) = base.role() else {
        return Err(MtiError::Declaration(format!(
            "{} cannot be an implementation of {}: not declared as a base type",
            model.name, base.name
        )));
    };
    let relation = base_binding.relation.clone();

    model.relations.insert(
        relation.clone(),
        Relation {
            name: relation.clone(),
            kind: RelationKind::PolymorphicHasOne {
                target: base.name.clone(),
                as_name: relation.clone(),
            },
            options: RelationOptions {
                autosave: true,
                dependent_destroy: true,
                validate: true,
                inverse_of: Some(relation.clone()),
            },
        },
    );

    // Entity::base applies the base instance mode and the auto-build.
    model.role = Role::Implementation(ImplementationBinding {
        base_model: base.name.clone(),
        relation: relation.clone(),
    });

    match introspection::content_fields(schema, &base.table)? {
        Some(fields) => {
            for field in fields {
                model.forwards.insert(Selector::read(field.as_str()), Forward::Base);
                model.forwards.insert(Selector::write(field.as_str()), Forward::Base);
                model.forwards.insert(Selector::presence(field), Forward::Base);
            }
        }
        None => {
            tracing::warn!(
                model = %model.name,
                base = %base.name,
                table = %base.table,
                "base table missing; base fields resolve through delegation only"
            );
        }
    }

    for name in introspection::relation_names(base, &relation) {
        model.forwarded_relations.insert(name);
    }

    model.delegation.delegate_missing_to([(relation.clone(), base_accessor())]);
    model.nested_attributes.insert(relation.clone());
    model
        .forwards
        .insert(Selector::read(format!("{relation}_id")), Forward::BaseId);

    Ok(())
}

fn base_accessor() -> Accessor<Entity, Session> {
    accessor(|entity: &mut Entity, cx: &mut Session| {
        Ok(Some(entity.base(cx)? as &mut dyn Dynamic<Session>))
    })
}
