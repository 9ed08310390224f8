use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use docdrop_core::{ClientError, ConnectionError, Device, DeviceError, DocumentType};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Entry {
    pub kind: DocumentType,
    pub name: String,
    pub parent: Option<Uuid>,
    pub deleted: bool,
}

/// In-memory device that records every mutating call.
#[derive(Default)]
pub struct FakeDevice {
    entries: Mutex<HashMap<Uuid, Entry>>,
    calls: Mutex<Vec<(&'static str, Uuid)>>,
    unreachable_for: Mutex<HashSet<Uuid>>,
    busy_for: Mutex<HashSet<Uuid>>,
}

impl FakeDevice {
    pub fn with_entry(self, id: Uuid, kind: DocumentType, parent: Option<Uuid>) -> Self {
        self.entries.lock().unwrap().insert(
            id,
            Entry {
                kind,
                name: id.to_string(),
                parent,
                deleted: false,
            },
        );
        self
    }

    /// Any call touching `id` fails as if the device dropped off the network.
    pub fn disconnect_on(&self, id: Uuid) {
        self.unreachable_for.lock().unwrap().insert(id);
    }

    /// Any call touching `id` finds the client guard already taken.
    pub fn busy_on(&self, id: Uuid) {
        self.busy_for.lock().unwrap().insert(id);
    }

    pub fn reconnect(&self) {
        self.unreachable_for.lock().unwrap().clear();
        self.busy_for.lock().unwrap().clear();
    }

    pub fn entry(&self, id: Uuid) -> Option<Entry> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<(&'static str, Uuid)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, op: &str) -> Vec<Uuid> {
        self.calls()
            .into_iter()
            .filter(|(name, _)| *name == op)
            .map(|(_, id)| id)
            .collect()
    }

    fn reach(&self, id: Uuid) -> Result<(), ClientError> {
        if self.unreachable_for.lock().unwrap().contains(&id) {
            return Err(ConnectionError::Task(format!("device unreachable while handling {id}")).into());
        }
        if self.busy_for.lock().unwrap().contains(&id) {
            return Err(ClientError::Busy);
        }
        Ok(())
    }

    fn live(&self, id: Uuid) -> Option<Entry> {
        self.entry(id).filter(|entry| !entry.deleted)
    }

    fn ensure_absent(&self, id: Uuid) -> Result<(), ClientError> {
        match self.entry(id) {
            Some(_) => Err(DeviceError::EntryExists(id).into()),
            None => Ok(()),
        }
    }

    fn record(&self, op: &'static str, id: Uuid) {
        self.calls.lock().unwrap().push((op, id));
    }

    fn insert(&self, id: Uuid, kind: DocumentType, name: &str, parent: Option<Uuid>) {
        self.entries.lock().unwrap().insert(
            id,
            Entry {
                kind,
                name: name.to_string(),
                parent,
                deleted: false,
            },
        );
    }
}

#[async_trait]
impl Device for FakeDevice {
    async fn folder_exists(&self, id: Uuid) -> Result<bool, ClientError> {
        self.reach(id)?;
        match self.entry(id) {
            None => Ok(false),
            Some(entry) if entry.kind == DocumentType::Folder => Ok(!entry.deleted),
            Some(entry) => Err(DeviceError::NotAFolder {
                id,
                kind: entry.kind,
            }
            .into()),
        }
    }

    async fn file_exists(&self, id: Uuid) -> Result<bool, ClientError> {
        self.reach(id)?;
        match self.entry(id) {
            None => Ok(false),
            Some(entry) if entry.kind == DocumentType::Document => Ok(!entry.deleted),
            Some(entry) => Err(DeviceError::NotADocument {
                id,
                kind: entry.kind,
            }
            .into()),
        }
    }

    async fn entry_exists(&self, id: Uuid) -> Result<bool, ClientError> {
        self.reach(id)?;
        Ok(self.live(id).is_some())
    }

    async fn has_children(&self, id: Uuid) -> Result<bool, ClientError> {
        self.reach(id)?;
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .any(|entry| entry.parent == Some(id) && !entry.deleted))
    }

    async fn create_folder(
        &self,
        id: Uuid,
        name: &str,
        parent: Option<Uuid>,
    ) -> Result<(), ClientError> {
        self.reach(id)?;
        self.record("create_folder", id);
        self.ensure_absent(id)?;
        self.insert(id, DocumentType::Folder, name, parent);
        Ok(())
    }

    async fn upload_file(
        &self,
        id: Uuid,
        parent: Option<Uuid>,
        name: &str,
        content_path: &Path,
        _thumbnail_path: Option<&Path>,
    ) -> Result<(), ClientError> {
        self.reach(id)?;
        self.record("upload_file", id);
        if let Err(source) = std::fs::metadata(content_path) {
            return Err(DeviceError::LocalFile {
                path: content_path.to_path_buf(),
                source,
            }
            .into());
        }
        self.ensure_absent(id)?;
        self.insert(id, DocumentType::Document, name, parent);
        Ok(())
    }

    async fn rename(&self, id: Uuid, new_name: &str) -> Result<(), ClientError> {
        self.reach(id)?;
        self.record("rename", id);
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id).ok_or(DeviceError::MissingEntry(id))?;
        entry.name = new_name.to_string();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), ClientError> {
        self.reach(id)?;
        self.record("delete", id);
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id).ok_or(DeviceError::MissingEntry(id))?;
        entry.deleted = true;
        Ok(())
    }
}
