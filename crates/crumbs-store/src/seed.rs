//! Built-in property definitions.
//!
//! Seeded on attach only when the property set is empty, so a data
//! directory that already carries them (or any user-defined property) is
//! left alone and repeated attach cycles never duplicate them.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::db;
use crate::error::StoreResult;
use crate::tables::property::{self, Property, ValueType};
use crate::tables::{Category, category};

/// One built-in property and its categories, in ordinal order.
struct Builtin {
    name: &'static str,
    description: &'static str,
    value_type: ValueType,
    categories: &'static [&'static str],
}

static BUILTINS: &[Builtin] = &[
    Builtin {
        name: "priority",
        description: "How urgent the crumb is",
        value_type: ValueType::Categorical,
        categories: &["highest", "high", "medium", "low", "lowest"],
    },
    Builtin {
        name: "type",
        description: "Kind of work",
        value_type: ValueType::Categorical,
        categories: &["task", "epic", "bug", "chore"],
    },
    Builtin {
        name: "description",
        description: "Free-form details",
        value_type: ValueType::Text,
        categories: &[],
    },
    Builtin {
        name: "owner",
        description: "Who is working on it",
        value_type: ValueType::Text,
        categories: &[],
    },
    Builtin {
        name: "labels",
        description: "Tags",
        value_type: ValueType::List,
        categories: &[],
    },
];

/// Names of the seeded properties.
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|b| b.name)
}

/// Insert the built-ins if no property exists. Returns how many properties
/// were seeded.
///
/// This is a **synchronous** function; call it through
/// [`Database::execute_mut`](crate::db::Database::execute_mut).
pub(crate) fn seed_builtins(conn: &mut Connection) -> StoreResult<usize> {
    let existing = property::count(conn)?;
    if existing > 0 {
        debug!(existing, "properties present, skipping built-in seed");
        return Ok(0);
    }

    let tx = conn.transaction()?;
    for builtin in BUILTINS {
        let definition = Property {
            id: db::new_id(),
            name: builtin.name.to_string(),
            description: builtin.description.to_string(),
            value_type: builtin.value_type,
            created_at: db::now(),
        };
        property::insert(&tx, &definition)?;
        property::backfill(&tx, &definition)?;

        for (ordinal, name) in builtin.categories.iter().enumerate() {
            let mut entry = Category::new(&definition.id, *name, ordinal as i64);
            entry.id = db::new_id();
            category::insert(&tx, &entry)?;
        }
    }
    tx.commit()?;

    info!(properties = BUILTINS.len(), "seeded built-in properties");
    Ok(BUILTINS.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn names(conn: &Connection) -> Vec<String> {
        property::load_all(conn)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect()
    }

    #[tokio::test]
    async fn seeds_once() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.execute_mut(seed_builtins).await.unwrap(), BUILTINS.len());
        assert_eq!(db.execute_mut(seed_builtins).await.unwrap(), 0);

        let seeded = db.execute(|conn| Ok(names(conn))).await.unwrap();
        let expected: Vec<String> = builtin_names().map(String::from).collect();
        assert_eq!(seeded, expected);
    }

    #[tokio::test]
    async fn priority_categories_are_ordered() {
        let db = Database::open_in_memory().unwrap();
        db.execute_mut(seed_builtins).await.unwrap();

        let (priority, categories) = db
            .execute(|conn| {
                let priority = property::load_all(conn)?
                    .into_iter()
                    .find(|p| p.name == "priority")
                    .map(|p| p.id);
                Ok((priority, category::dump(conn)?))
            })
            .await
            .unwrap();
        assert_eq!(categories.len(), 9);

        let priority = priority.unwrap();
        let ordered: Vec<(&str, i64)> = categories
            .iter()
            .filter(|c| c.property_id == priority)
            .map(|c| (c.name.as_str(), c.ordinal))
            .collect();
        assert_eq!(
            ordered,
            vec![("highest", 0), ("high", 1), ("medium", 2), ("low", 3), ("lowest", 4)]
        );
    }

    #[tokio::test]
    async fn skipped_when_user_properties_exist() {
        let db = Database::open_in_memory().unwrap();
        let mut mine = Property::new("mine", ValueType::Text);
        mine.id = db::new_id();
        db.execute(move |conn| property::insert(conn, &mine))
            .await
            .unwrap();
        assert_eq!(db.execute_mut(seed_builtins).await.unwrap(), 0);
        assert_eq!(db.execute(|conn| Ok(names(conn))).await.unwrap(), vec!["mine"]);
    }
}
