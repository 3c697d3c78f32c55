//! Table catalog: name/id indexes and per-table data
//!
//! The catalog owns every table, the two lookup indexes, and the dense
//! table-id counter. Ids are never reused; dropping a table leaves a gap.
//! All access happens under the engine's global latch.

use hashbrown::HashMap;

use crate::error::{KvtError, KvtResult};
use crate::storage::TableData;

/// Partition method recorded per table. Metadata only: data is always
/// stored sorted in a single keyspace regardless of the method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMethod {
    Hash,
    Range,
}

impl PartitionMethod {
    /// Parse the external token; anything but "hash" or "range" fails.
    pub fn parse(token: &str) -> KvtResult<Self> {
        match token {
            "hash" => Ok(PartitionMethod::Hash),
            "range" => Ok(PartitionMethod::Range),
            other => Err(KvtError::InvalidPartitionMethod { token: other.to_string() }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionMethod::Hash => "hash",
            PartitionMethod::Range => "range",
        }
    }
}

/// A named table and its ordered keyspace.
#[derive(Debug, Clone)]
pub struct Table {
    pub id: u64,
    pub name: String,
    pub partition: PartitionMethod,
    pub data: TableData,
}

/// Authoritative table registry.
#[derive(Debug)]
pub struct Catalog {
    tables: HashMap<u64, Table>,
    name_to_id: HashMap<String, u64>,
    next_table_id: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            name_to_id: HashMap::new(),
            next_table_id: 1,
        }
    }

    /// Rebuild a catalog from snapshot contents.
    pub fn from_parts(tables: Vec<Table>, next_table_id: u64) -> Self {
        let mut catalog = Self::new();
        catalog.next_table_id = next_table_id;
        for table in tables {
            catalog.name_to_id.insert(table.name.clone(), table.id);
            catalog.tables.insert(table.id, table);
        }
        catalog
    }

    /// Create a table, allocating the next dense id.
    pub fn create_table(&mut self, name: &str, partition: PartitionMethod) -> KvtResult<u64> {
        if name.is_empty() {
            return Err(KvtError::Unknown { message: "table name must not be empty".into() });
        }
        if self.name_to_id.contains_key(name) {
            return Err(KvtError::TableAlreadyExists { name: name.to_string() });
        }
        let id = self.next_table_id;
        self.next_table_id += 1;
        self.name_to_id.insert(name.to_string(), id);
        self.tables.insert(
            id,
            Table { id, name: name.to_string(), partition, data: TableData::new() },
        );
        Ok(id)
    }

    /// Drop a table: data and both index entries go atomically. The id is
    /// not reclaimed.
    pub fn drop_table(&mut self, table_id: u64) -> KvtResult<()> {
        let table = self
            .tables
            .remove(&table_id)
            .ok_or(KvtError::TableNotFound { table: format!("id {}", table_id) })?;
        self.name_to_id.remove(&table.name);
        Ok(())
    }

    pub fn get_table_name(&self, table_id: u64) -> KvtResult<String> {
        self.tables
            .get(&table_id)
            .map(|t| t.name.clone())
            .ok_or(KvtError::TableNotFound { table: format!("id {}", table_id) })
    }

    pub fn get_table_id(&self, name: &str) -> KvtResult<u64> {
        self.name_to_id
            .get(name)
            .copied()
            .ok_or(KvtError::TableNotFound { table: format!("'{}'", name) })
    }

    /// All (name, id) pairs, sorted by id for a stable listing.
    pub fn list_tables(&self) -> Vec<(String, u64)> {
        let mut listing: Vec<(String, u64)> =
            self.tables.values().map(|t| (t.name.clone(), t.id)).collect();
        listing.sort_by_key(|(_, id)| *id);
        listing
    }

    pub fn table(&self, table_id: u64) -> KvtResult<&Table> {
        self.tables
            .get(&table_id)
            .ok_or(KvtError::TableNotFound { table: format!("id {}", table_id) })
    }

    pub fn table_mut(&mut self, table_id: u64) -> KvtResult<&mut Table> {
        self.tables
            .get_mut(&table_id)
            .ok_or(KvtError::TableNotFound { table: format!("id {}", table_id) })
    }

    pub fn contains(&self, table_id: u64) -> bool {
        self.tables.contains_key(&table_id)
    }

    /// Tables in id order, for snapshot serialization.
    pub fn tables_ordered(&self) -> Vec<&Table> {
        let mut tables: Vec<&Table> = self.tables.values().collect();
        tables.sort_by_key(|t| t.id);
        tables
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn next_table_id(&self) -> u64 {
        self.next_table_id
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_allocates_dense_ids() {
        let mut catalog = Catalog::new();
        let a = catalog.create_table("a", PartitionMethod::Hash).unwrap();
        let b = catalog.create_table("b", PartitionMethod::Range).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut catalog = Catalog::new();
        catalog.create_table("t", PartitionMethod::Hash).unwrap();
        assert!(matches!(
            catalog.create_table("t", PartitionMethod::Range),
            Err(KvtError::TableAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut catalog = Catalog::new();
        assert!(catalog.create_table("", PartitionMethod::Hash).is_err());
    }

    #[test]
    fn test_partition_method_tokens() {
        assert_eq!(PartitionMethod::parse("hash").unwrap(), PartitionMethod::Hash);
        assert_eq!(PartitionMethod::parse("range").unwrap(), PartitionMethod::Range);
        assert!(matches!(
            PartitionMethod::parse("round_robin"),
            Err(KvtError::InvalidPartitionMethod { .. })
        ));
    }

    #[test]
    fn test_drop_removes_both_indexes_and_keeps_id_gap() {
        let mut catalog = Catalog::new();
        let id = catalog.create_table("gone", PartitionMethod::Hash).unwrap();
        catalog.drop_table(id).unwrap();

        assert!(matches!(
            catalog.get_table_id("gone"),
            Err(KvtError::TableNotFound { .. })
        ));
        assert!(matches!(
            catalog.get_table_name(id),
            Err(KvtError::TableNotFound { .. })
        ));

        // the dropped id is never handed out again
        let next = catalog.create_table("other", PartitionMethod::Hash).unwrap();
        assert_eq!(next, id + 1);
    }

    #[test]
    fn test_drop_unknown_table() {
        let mut catalog = Catalog::new();
        assert!(matches!(
            catalog.drop_table(42),
            Err(KvtError::TableNotFound { .. })
        ));
    }

    #[test]
    fn test_list_tables_sorted_by_id() {
        let mut catalog = Catalog::new();
        catalog.create_table("zeta", PartitionMethod::Hash).unwrap();
        catalog.create_table("alpha", PartitionMethod::Range).unwrap();
        let listing = catalog.list_tables();
        assert_eq!(listing, vec![("zeta".to_string(), 1), ("alpha".to_string(), 2)]);
    }

    #[test]
    fn test_from_parts_restores_counter() {
        let mut catalog = Catalog::new();
        catalog.create_table("a", PartitionMethod::Hash).unwrap();
        catalog.create_table("b", PartitionMethod::Hash).unwrap();

        let tables: Vec<Table> = catalog.tables_ordered().into_iter().cloned().collect();
        let restored = Catalog::from_parts(tables, catalog.next_table_id());
        assert_eq!(restored.table_count(), 2);
        assert_eq!(restored.get_table_id("b").unwrap(), 2);

        let mut restored = restored;
        assert_eq!(restored.create_table("c", PartitionMethod::Hash).unwrap(), 3);
    }
}
