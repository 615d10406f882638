use std::collections::HashMap;

use mirror_db::destination::models::{ColumnInfo, ColumnKind};

/// Destination columns by id, as read during pre-flight.
#[derive(Debug, Clone, Default)]
pub struct ColumnCatalog {
    columns: HashMap<String, ColumnInfo>,
}

impl ColumnCatalog {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self {
            columns: columns.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ColumnInfo> {
        self.columns.get(id)
    }

    pub fn kind(&self, id: &str) -> Option<ColumnKind> {
        self.get(id).map(|c| c.kind)
    }

    /// Columns of unknown kind are assumed to take a list.
    pub fn accepts_list(&self, id: &str) -> bool {
        self.get(id).map(ColumnInfo::accepts_list).unwrap_or(true)
    }

    pub fn enumerated(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.values().filter(|c| c.is_enumerated())
    }

    /// `id → display name` for mapping validation.
    pub fn names(&self) -> HashMap<String, String> {
        self.columns
            .values()
            .map(|c| (c.id.clone(), c.name.clone()))
            .collect()
    }
}
