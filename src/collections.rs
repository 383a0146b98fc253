//! Named collections of saved color samples.
//!
//! The connection machine never stores samples itself. Callers that want to keep a sample append
//! it to a collection here. Collections and entries keep insertion order and are addressed by
//! opaque string ids.

use std::time::SystemTime;
use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use crate::device::types::ColorSample;
use crate::error::CollectionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorEntry {
    pub id: String,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub hex: String,
    pub name: Option<String>,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorCollection {
    pub id: String,
    pub name: String,
    pub entries: IndexMap<String, ColorEntry>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl ColorCollection {
    fn touch(&mut self) {
        self.updated_at = SystemTime::now();
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub trait CollectionStore {
    /// Returns the id of the new collection.
    fn create_collection(&mut self, name: &str) -> String;

    fn rename_collection(&mut self, collection_id: &str, name: &str) -> Result<(), CollectionError>;

    fn delete_collection(&mut self, collection_id: &str) -> Result<ColorCollection, CollectionError>;

    /// Returns the id of the new entry.
    fn append_sample(&mut self, collection_id: &str, sample: &ColorSample, name: Option<&str>) -> Result<String, CollectionError>;

    fn rename_entry(&mut self, collection_id: &str, entry_id: &str, name: &str) -> Result<(), CollectionError>;

    fn remove_entry(&mut self, collection_id: &str, entry_id: &str) -> Result<ColorEntry, CollectionError>;

    fn collection(&self, collection_id: &str) -> Option<&ColorCollection>;

    fn collections(&self) -> Vec<&ColorCollection>;
}

#[derive(Debug, Default, Serialize)]
pub struct MemoryCollectionStore {
    collections: IndexMap<String, ColorCollection>,
}

impl MemoryCollectionStore {
    pub fn new() -> Self {
        MemoryCollectionStore::default()
    }

    fn collection_mut(&mut self, collection_id: &str) -> Result<&mut ColorCollection, CollectionError> {
        self.collections
            .get_mut(collection_id)
            .ok_or_else(|| CollectionError::UnknownCollection { id: collection_id.to_string() })
    }
}

impl CollectionStore for MemoryCollectionStore {
    fn create_collection(&mut self, name: &str) -> String {
        let now = SystemTime::now();
        let collection = ColorCollection {
            id: new_id(),
            name: name.to_string(),
            entries: IndexMap::new(),
            created_at: now,
            updated_at: now,
        };

        let id = collection.id.clone();
        self.collections.insert(id.clone(), collection);
        id
    }

    fn rename_collection(&mut self, collection_id: &str, name: &str) -> Result<(), CollectionError> {
        let collection = self.collection_mut(collection_id)?;
        collection.name = name.to_string();
        collection.touch();
        Ok(())
    }

    fn delete_collection(&mut self, collection_id: &str) -> Result<ColorCollection, CollectionError> {
        self.collections
            .shift_remove(collection_id)
            .ok_or_else(|| CollectionError::UnknownCollection { id: collection_id.to_string() })
    }

    fn append_sample(&mut self, collection_id: &str, sample: &ColorSample, name: Option<&str>) -> Result<String, CollectionError> {
        let collection = self.collection_mut(collection_id)?;
        let (r, g, b) = sample.channels();
        let entry = ColorEntry {
            id: new_id(),
            r,
            g,
            b,
            hex: sample.hex(),
            name: name.map(str::to_string),
            created_at: sample.captured_at,
        };

        let id = entry.id.clone();
        collection.entries.insert(id.clone(), entry);
        collection.touch();
        Ok(id)
    }

    fn rename_entry(&mut self, collection_id: &str, entry_id: &str, name: &str) -> Result<(), CollectionError> {
        let collection = self.collection_mut(collection_id)?;
        let entry = collection.entries.get_mut(entry_id).ok_or_else(|| CollectionError::UnknownEntry {
            collection_id: collection_id.to_string(),
            entry_id: entry_id.to_string(),
        })?;

        entry.name = Some(name.to_string());
        collection.touch();
        Ok(())
    }

    fn remove_entry(&mut self, collection_id: &str, entry_id: &str) -> Result<ColorEntry, CollectionError> {
        let collection = self.collection_mut(collection_id)?;
        let entry = collection.entries.shift_remove(entry_id).ok_or_else(|| CollectionError::UnknownEntry {
            collection_id: collection_id.to_string(),
            entry_id: entry_id.to_string(),
        })?;

        collection.touch();
        Ok(entry)
    }

    fn collection(&self, collection_id: &str) -> Option<&ColorCollection> {
        self.collections.get(collection_id)
    }

    fn collections(&self) -> Vec<&ColorCollection> {
        self.collections.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(r: u8, g: u8, b: u8) -> ColorSample {
        ColorSample::new(r, g, b, SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn collections_keep_insertion_order() {
        let mut store = MemoryCollectionStore::new();
        let walls = store.create_collection("Walls");
        let floors = store.create_collection("Floors");
        let doors = store.create_collection("Doors");

        store.delete_collection(&floors).unwrap();

        let ids: Vec<&str> = store.collections().iter().map(|collection| collection.id.as_str()).collect();
        assert_eq!(ids, vec![walls.as_str(), doors.as_str()]);
        assert_ne!(walls, doors);
    }

    #[test]
    fn entries_are_created_from_samples() {
        let mut store = MemoryCollectionStore::new();
        let walls = store.create_collection("Walls");

        let first = store.append_sample(&walls, &sample(12, 200, 5), Some("Mint")).unwrap();
        let second = store.append_sample(&walls, &sample(1, 2, 3), None).unwrap();
        let third = store.append_sample(&walls, &sample(4, 5, 6), None).unwrap();
        store.remove_entry(&walls, &second).unwrap();
        store.rename_entry(&walls, &third, "Dark").unwrap();

        let collection = store.collection(&walls).unwrap();
        let entries: Vec<&ColorEntry> = collection.entries.values().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first);
        assert_eq!(entries[0].hex, "#0CC805");
        assert_eq!(entries[0].name.as_deref(), Some("Mint"));
        assert_eq!(entries[1].name.as_deref(), Some("Dark"));
    }

    #[test]
    fn rename_collection_touches_it() {
        let mut store = MemoryCollectionStore::new();
        let id = store.create_collection("Walls");
        let created = store.collection(&id).unwrap().updated_at;

        store.rename_collection(&id, "Ceilings").unwrap();

        let collection = store.collection(&id).unwrap();
        assert_eq!(collection.name, "Ceilings");
        assert!(collection.updated_at >= created);
    }

    #[test]
    fn unknown_ids_are_errors() {
        let mut store = MemoryCollectionStore::new();
        let id = store.create_collection("Walls");

        assert_eq!(
            store.append_sample("nope", &sample(1, 1, 1), None),
            Err(CollectionError::UnknownCollection { id: "nope".to_string() }),
        );
        assert_eq!(
            store.remove_entry(&id, "nope"),
            Err(CollectionError::UnknownEntry { collection_id: id.clone(), entry_id: "nope".to_string() }),
        );
        assert!(store.rename_collection("nope", "x").is_err());
        assert!(store.delete_collection("nope").is_err());
    }

    #[test]
    fn serializes_to_camel_case_json() {
        let mut store = MemoryCollectionStore::new();
        let id = store.create_collection("Walls");
        store.append_sample(&id, &sample(255, 0, 16), None).unwrap();

        let json = serde_json::to_value(store.collection(&id).unwrap()).unwrap();
        assert_eq!(json["name"], "Walls");
        assert!(json.get("updatedAt").is_some());
        let entry = json["entries"].as_object().unwrap().values().next().unwrap();
        assert_eq!(entry["hex"], "#FF0010");
    }
}
