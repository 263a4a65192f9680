//! Caller field names to storage field names.
//!
//! Every entity declares a static [`EntityDescriptor`] mapping its DTO-level
//! names onto the names stored in documents. Related objects map onto their
//! foreign-key surrogate (`owner` → `ownerId`), never onto a join.

use crate::{Error, Result, query::SortSpec};

/// Caller marker for "every field".
pub const WILDCARD: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Id,
    Text,
    Number,
    Timestamp,
    /// Related entity stored as the id of the other document.
    Reference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldMapping {
    pub dto: &'static str,
    pub storage: &'static str,
    pub kind: FieldKind,
}

/// Static description of one entity type.
#[derive(Debug)]
pub struct EntityDescriptor {
    pub name: &'static str,
    pub collection: &'static str,
    /// Storage name of the primary key.
    pub primary_key: &'static str,
    /// Storage name of the creation timestamp, the default sort.
    pub created_at: &'static str,
    pub fields: &'static [FieldMapping],
    /// Storage names searched by pattern-mode free text.
    pub text_fields: &'static [&'static str],
    /// Permission the caller must hold before any query runs.
    pub read_permission: Option<&'static str>,
}

const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

impl EntityDescriptor {
    /// Checks the table when evaluated in a `const`: the primary key and the
    /// creation field must be mapped, and DTO names must be unique.
    pub const fn checked(self) -> Self {
        let mut has_pk = false;
        let mut has_created = false;
        let mut i = 0;
        while i < self.fields.len() {
            let field = &self.fields[i];
            if str_eq(field.storage, self.primary_key) {
                has_pk = true;
            }
            if str_eq(field.storage, self.created_at) {
                has_created = true;
            }
            let mut j = i + 1;
            while j < self.fields.len() {
                assert!(
                    !str_eq(field.dto, self.fields[j].dto),
                    "duplicate DTO field name"
                );
                j += 1;
            }
            i += 1;
        }
        assert!(has_pk, "primary key is not a mapped field");
        assert!(has_created, "creation timestamp is not a mapped field");
        self
    }

    /// Mapping for a caller field name, ignoring ASCII case.
    pub fn field(&self, dto: &str) -> Option<&'static FieldMapping> {
        self.fields.iter().find(|f| f.dto.eq_ignore_ascii_case(dto))
    }

    pub fn kind_of(&self, storage: &str) -> Option<FieldKind> {
        self.fields
            .iter()
            .find(|f| f.storage == storage)
            .map(|f| f.kind)
    }
}

/// Entity types the projector and pipeline know how to address.
pub trait Entity {
    const DESCRIPTOR: &'static EntityDescriptor;
}

/// Builds a `&'static [FieldMapping]` table.
///
/// ```
/// use kennel::entity_fields;
/// use kennel::projector::FieldMapping;
///
/// const PET_FIELDS: &[FieldMapping] = entity_fields! {
///     "id" => "id": Id,
///     "name" => "name": Text,
///     "breed" => "breedId": Reference,
/// };
/// assert_eq!(PET_FIELDS[2].storage, "breedId");
/// ```
#[macro_export]
macro_rules! entity_fields {
    ($($dto:literal => $storage:literal : $kind:ident),* $(,)?) => {
        &[$(
            $crate::projector::FieldMapping {
                dto: $dto,
                storage: $storage,
                kind: $crate::projector::FieldKind::$kind,
            }
        ),*]
    };
}

/// Resolved storage fields, primary key first, without duplicates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectionSet {
    fields: Vec<String>,
}

impl ProjectionSet {
    fn with_key(primary_key: &str) -> Self {
        Self {
            fields: vec![primary_key.to_string()],
        }
    }

    fn push(&mut self, storage: &str) {
        if !self.contains(storage) {
            self.fields.push(storage.to_string());
        }
    }

    pub fn contains(&self, storage: &str) -> bool {
        self.fields.iter().any(|f| f == storage)
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_fields(self) -> Vec<String> {
        self.fields
    }
}

pub struct FieldProjector;

impl FieldProjector {
    /// Storage fields needed to answer `fields`.
    ///
    /// An empty list or [`WILDCARD`] selects every mapped field. Unknown names
    /// are dropped so older and newer callers keep working. A dotted name
    /// whose head is a reference resolves to the reference's surrogate.
    pub fn resolve<S: AsRef<str>>(entity: &EntityDescriptor, fields: &[S]) -> ProjectionSet {
        let mut set = ProjectionSet::with_key(entity.primary_key);
        let wildcard = fields.is_empty() || fields.iter().any(|f| f.as_ref().trim() == WILDCARD);
        if wildcard {
            for mapping in entity.fields {
                set.push(mapping.storage);
            }
            return set;
        }
        for requested in fields {
            let requested = requested.as_ref().trim();
            let mapping = entity.field(requested).or_else(|| {
                let (head, _) = requested.split_once('.')?;
                entity
                    .field(head)
                    .filter(|m| m.kind == FieldKind::Reference)
            });
            match mapping {
                Some(mapping) => set.push(mapping.storage),
                None => {
                    tracing::debug!(target: "kennel::pipeline", entity = entity.name, field = requested, "dropping unknown field");
                }
            }
        }
        set
    }

    /// Sort key for a caller field name. Unlike projection, unknown names fail.
    pub fn resolve_sort_key(entity: &EntityDescriptor, key: &str) -> Result<SortSpec> {
        let mapping = entity.field(key.trim()).ok_or_else(|| {
            Error::validation("sortBy", format!("`{key}` is not a sortable field of {}", entity.name))
        })?;
        let spec = SortSpec::asc(mapping.storage);
        Ok(match mapping.kind {
            FieldKind::Number => spec.numeric(),
            _ => spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortKind;

    const PET: &EntityDescriptor = &EntityDescriptor {
        name: "Pet",
        collection: "pets",
        primary_key: "id",
        created_at: "createdAt",
        fields: entity_fields! {
            "id" => "id": Id,
            "name" => "name": Text,
            "breed" => "breedId": Reference,
            "owner" => "ownerId": Reference,
            "age" => "ageMonths": Number,
            "createdAt" => "createdAt": Timestamp,
        },
        text_fields: &["name"],
        read_permission: None,
    }
    .checked();

    #[test]
    fn references_map_to_surrogates() {
        let set = FieldProjector::resolve(PET, &["name", "breed"]);
        assert_eq!(set.fields(), ["id", "name", "breedId"]);
    }

    #[test]
    fn primary_key_is_always_kept() {
        let set = FieldProjector::resolve(PET, &["age"]);
        assert!(set.contains("id"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn empty_and_wildcard_select_everything() {
        let none: [&str; 0] = [];
        let all = FieldProjector::resolve(PET, &none);
        assert_eq!(all.len(), PET.fields.len());
        assert_eq!(FieldProjector::resolve(PET, &["name", "*"]), all);
    }

    #[test]
    fn unknown_fields_are_dropped() {
        let set = FieldProjector::resolve(PET, &["Name", "colour", "owner.email", "name.first"]);
        assert_eq!(set.fields(), ["id", "name", "ownerId"]);
    }

    #[test]
    fn sort_keys_resolve_with_kind() {
        let key = FieldProjector::resolve_sort_key(PET, "age").unwrap();
        assert_eq!(key.kind, SortKind::Numeric);
        assert_eq!(key.path.dotted(), "ageMonths");
        let err = FieldProjector::resolve_sort_key(PET, "colour").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
