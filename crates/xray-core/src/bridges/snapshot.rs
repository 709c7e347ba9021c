//! A recorded object graph that can be replayed through the bridge engine.
//!
//! Snapshots are plain serde data: they can be dumped from a live scan and
//! re-analysed offline, and they are how the engine is exercised in tests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::object_model::{ObjectId, ObjectModel, ObjectShape};
use crate::errors::{XrayError, XrayResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotObject {
    pub shape: ObjectShape,
    #[serde(default)]
    pub attributes: BTreeMap<String, ObjectId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// Importable modules by dotted name.
    #[serde(default)]
    pub modules: BTreeMap<String, ObjectId>,
    #[serde(default)]
    pub objects: BTreeMap<ObjectId, SnapshotObject>,
}

impl RuntimeSnapshot {
    pub fn insert(&mut self, id: ObjectId, shape: ObjectShape) {
        self.objects.insert(
            id,
            SnapshotObject {
                shape,
                attributes: BTreeMap::new(),
            },
        );
    }

    /// Register an importable module object.
    pub fn add_module(&mut self, import_name: &str, id: ObjectId, shape: ObjectShape) {
        self.insert(id, shape);
        self.modules.insert(import_name.to_string(), id);
    }

    /// Record `owner.name -> target`. Unknown owners are ignored.
    pub fn set_attr(&mut self, owner: ObjectId, name: &str, target: ObjectId) {
        if let Some(obj) = self.objects.get_mut(&owner) {
            obj.attributes.insert(name.to_string(), target);
        }
    }

    pub fn from_json(text: &str) -> XrayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> XrayResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn object(&self, id: ObjectId) -> XrayResult<&SnapshotObject> {
        self.objects
            .get(&id)
            .ok_or_else(|| XrayError::Introspection(format!("unknown object {id:#x}")))
    }
}

impl ObjectModel for RuntimeSnapshot {
    fn import_module(&self, import_name: &str) -> XrayResult<ObjectId> {
        self.modules
            .get(import_name)
            .copied()
            .ok_or_else(|| XrayError::NotFound(format!("module {import_name}")))
    }

    fn shape(&self, id: ObjectId) -> XrayResult<ObjectShape> {
        Ok(self.object(id)?.shape.clone())
    }

    fn attributes(&self, id: ObjectId) -> XrayResult<Vec<(String, ObjectId)>> {
        Ok(self
            .object(id)?
            .attributes
            .iter()
            .map(|(name, target)| (name.clone(), *target))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::object_model::NativeKind;

    #[test]
    fn snapshot_survives_json() {
        let mut snap = RuntimeSnapshot::default();
        snap.add_module("pkg", 1, ObjectShape::Module { file: None });
        snap.insert(
            2,
            ObjectShape::Native {
                kind: NativeKind::Ufunc,
                entries: vec![0x10, 0x20],
                declared_name: None,
            },
        );
        snap.set_attr(1, "add", 2);

        let text = snap.to_json().unwrap();
        assert!(text.contains("\"shape\":\"native\""));
        let back = RuntimeSnapshot::from_json(&text).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.attributes(1).unwrap(), vec![("add".to_string(), 2)]);
    }

    #[test]
    fn missing_module_is_not_found() {
        let snap = RuntimeSnapshot::default();
        assert!(matches!(snap.import_module("nope"), Err(XrayError::NotFound(_))));
        assert!(matches!(snap.shape(7), Err(XrayError::Introspection(_))));
    }
}
