use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use dicom_attrs::Attributes;
use dicom_dictionary_std::tags;

use crate::error::ModelError;
use crate::events::{EventBus, ModelEvent};
use crate::model::builders::{
    instance_attributes, instance_key, patient_attributes, patient_pseudo_uid,
    series_attributes, study_attributes,
};
use crate::model::{HierarchyNode, Level, NodeRef, RetrievalField};

#[derive(Debug)]
struct Entry {
    node: NodeRef,
    children: BTreeMap<String, Entry>,
}

impl Entry {
    fn new(node: NodeRef) -> Self {
        Self {
            node,
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Tree {
    patients: BTreeMap<String, Entry>,
    /// Study UID to owning patient keys, oldest first. Archives are not
    /// guaranteed to keep a UID under one patient.
    studies: HashMap<String, Vec<String>>,
    /// Series UID to (patient key, study UID) owners, oldest first
    series: HashMap<String, Vec<(String, String)>>,
}

impl Tree {
    fn entry_mut(&mut self, path: &[String]) -> Option<&mut Entry> {
        let (first, rest) = path.split_first()?;
        let mut entry = self.patients.get_mut(first)?;
        for key in rest {
            entry = entry.children.get_mut(key)?;
        }
        Some(entry)
    }

    fn entry(&self, path: &[String]) -> Option<&Entry> {
        let (first, rest) = path.split_first()?;
        let mut entry = self.patients.get(first)?;
        for key in rest {
            entry = entry.children.get(key)?;
        }
        Some(entry)
    }

    fn unindex_study(&mut self, patient_key: &str, study: &Entry) {
        let study_uid = study.node.key();
        unindex(&mut self.studies, study_uid, |owner| owner == patient_key);
        for series_uid in study.children.keys() {
            unindex(&mut self.series, series_uid, |(p, s)| p == patient_key && s == study_uid);
        }
    }
}

fn unindex<T>(index: &mut HashMap<String, Vec<T>>, uid: &str, owner: impl Fn(&T) -> bool) {
    if let Some(owners) = index.get_mut(uid) {
        owners.retain(|o| !owner(o));
        if owners.is_empty() {
            index.remove(uid);
        }
    }
}

/// Read-only copy of a patient subtree
#[derive(Debug, Clone)]
pub struct PatientView {
    pub node: NodeRef,
    pub studies: Vec<StudyView>,
}

#[derive(Debug, Clone)]
pub struct StudyView {
    pub node: NodeRef,
    pub series: Vec<SeriesView>,
}

#[derive(Debug, Clone)]
pub struct SeriesView {
    pub node: NodeRef,
    pub instances: Vec<InstanceView>,
}

#[derive(Debug, Clone)]
pub struct InstanceView {
    pub node: NodeRef,
}

/// Shared hierarchy store.
///
/// All mutations go through one mutex, so concurrent resolvers asking for the
/// same key always get the same node back.
#[derive(Debug)]
pub struct HierarchyModel {
    tree: Mutex<Tree>,
    events: EventBus,
}

impl HierarchyModel {
    pub fn new(events: EventBus) -> Self {
        Self {
            tree: Mutex::new(Tree::default()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        match self.tree.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Return the node stored under `parent` with `key`, creating it with
    /// `build` when absent. An existing node is returned unchanged.
    pub fn get_or_create<F>(
        &self,
        level: Level,
        parent: Option<&NodeRef>,
        key: &str,
        build: F,
    ) -> Result<NodeRef, ModelError>
    where
        F: FnOnce() -> Attributes,
    {
        let parent_level = parent.map(|p| p.level());
        if parent_level != level.parent() {
            return Err(ModelError::WrongParentLevel {
                parent: parent_level.map(|l| l.to_string()).unwrap_or_else(|| "root".into()),
                child: level.to_string(),
            });
        }

        let mut tree = self.lock();
        let created = {
            let siblings = match parent {
                None => &mut tree.patients,
                Some(p) => {
                    let mut path = p.path().to_vec();
                    path.push(p.key().to_string());
                    &mut tree
                        .entry_mut(&path)
                        .ok_or_else(|| ModelError::MissingParent(p.key().to_string()))?
                        .children
                }
            };
            if let Some(existing) = siblings.get(key) {
                return Ok(existing.node.clone());
            }

            let path = match parent {
                None => Vec::new(),
                Some(p) => {
                    let mut path = p.path().to_vec();
                    path.push(p.key().to_string());
                    path
                }
            };
            let node = Arc::new(HierarchyNode::new(level, key.to_string(), path, build()));
            siblings.insert(key.to_string(), Entry::new(node.clone()));
            node
        };

        match level {
            Level::Study => {
                let owner = created.path()[0].clone();
                tree.studies.entry(key.to_string()).or_default().push(owner);
            }
            Level::Series => {
                let path = created.path();
                let owner = (path[0].clone(), path[1].clone());
                tree.series.entry(key.to_string()).or_default().push(owner);
            }
            _ => {}
        }
        drop(tree);

        tracing::trace!("created {} node {}", level, key);
        if level == Level::Series {
            self.events.publish(ModelEvent::SeriesAdded {
                study_uid: created.path()[1].clone(),
                series_uid: key.to_string(),
            });
        }
        Ok(created)
    }

    /// Patient node for a query result (keyed by PatientID and issuer)
    pub fn patient(&self, attrs: &Attributes) -> Result<NodeRef, ModelError> {
        let key = patient_pseudo_uid(
            attrs.string(tags::PATIENT_ID),
            attrs.string(tags::ISSUER_OF_PATIENT_ID),
        );
        self.get_or_create(Level::Patient, None, &key, || patient_attributes(attrs))
    }

    pub fn study(&self, patient: &NodeRef, attrs: &Attributes) -> Result<NodeRef, ModelError> {
        let uid = required_uid(attrs, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?;
        self.get_or_create(Level::Study, Some(patient), &uid, || study_attributes(attrs))
    }

    pub fn series(&self, study: &NodeRef, attrs: &Attributes) -> Result<NodeRef, ModelError> {
        let uid = required_uid(attrs, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?;
        self.get_or_create(Level::Series, Some(study), &uid, || series_attributes(attrs))
    }

    pub fn instance(
        &self,
        series: &NodeRef,
        attrs: &Attributes,
        frame: Option<u32>,
    ) -> Result<NodeRef, ModelError> {
        let uid = required_uid(attrs, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?;
        let key = instance_key(&uid, frame);
        self.get_or_create(Level::Instance, Some(series), &key, || {
            instance_attributes(attrs)
        })
    }

    /// Overwrite a retrieval field
    pub fn update_field(&self, node: &NodeRef, field: RetrievalField, value: impl Into<String>) {
        node.set_retrieval(field, value.into(), true);
    }

    /// Set a retrieval field unless a value is already present
    pub fn default_field(
        &self,
        node: &NodeRef,
        field: RetrievalField,
        value: impl Into<String>,
    ) -> bool {
        node.set_retrieval(field, value.into(), false)
    }

    /// Update a field addressed by name; only retrieval fields are mutable
    pub fn update_field_by_name(
        &self,
        node: &NodeRef,
        name: &str,
        value: impl Into<String>,
    ) -> Result<(), ModelError> {
        let field =
            RetrievalField::from_name(name).ok_or_else(|| ModelError::ImmutableField(name.into()))?;
        self.update_field(node, field, value);
        Ok(())
    }

    pub fn patient_by_key(&self, key: &str) -> Option<NodeRef> {
        self.lock().patients.get(key).map(|e| e.node.clone())
    }

    /// Study with this UID. When several patients hold it, the one that
    /// received it first.
    pub fn study_by_uid(&self, study_uid: &str) -> Option<NodeRef> {
        let tree = self.lock();
        let patient = tree.studies.get(study_uid)?.first()?;
        tree.entry(&[patient.clone(), study_uid.to_string()])
            .map(|e| e.node.clone())
    }

    pub fn series_by_uid(&self, series_uid: &str) -> Option<NodeRef> {
        let tree = self.lock();
        let (patient, study) = tree.series.get(series_uid)?.first()?;
        tree.entry(&[patient.clone(), study.clone(), series_uid.to_string()])
            .map(|e| e.node.clone())
    }

    /// Parent of a node, `None` for patients
    pub fn parent(&self, node: &NodeRef) -> Option<NodeRef> {
        if node.path().is_empty() {
            return None;
        }
        self.lock().entry(node.path()).map(|e| e.node.clone())
    }

    pub fn children(&self, node: &NodeRef) -> Vec<NodeRef> {
        let mut path = node.path().to_vec();
        path.push(node.key().to_string());
        self.lock()
            .entry(&path)
            .map(|e| e.children.values().map(|c| c.node.clone()).collect())
            .unwrap_or_default()
    }

    /// Cascading removal of a patient and everything under it
    pub fn remove_patient(&self, patient_key: &str) -> Result<(), ModelError> {
        let removed_studies: Vec<String> = {
            let mut tree = self.lock();
            let entry = tree
                .patients
                .remove(patient_key)
                .ok_or_else(|| ModelError::NotFound(patient_key.to_string()))?;
            for study in entry.children.values() {
                tree.unindex_study(patient_key, study);
            }
            entry.children.keys().cloned().collect()
        };

        for study_uid in removed_studies {
            self.events.publish(ModelEvent::StudyRemoved { study_uid });
        }
        self.events.publish(ModelEvent::PatientRemoved {
            patient_key: patient_key.to_string(),
        });
        Ok(())
    }

    /// Cascading removal of a study from every patient holding it. The
    /// patients stay, even when left empty.
    pub fn remove_study(&self, study_uid: &str) -> Result<(), ModelError> {
        {
            let mut tree = self.lock();
            let owners = tree
                .studies
                .get(study_uid)
                .cloned()
                .ok_or_else(|| ModelError::NotFound(study_uid.to_string()))?;
            for patient in owners {
                let study = tree
                    .patients
                    .get_mut(&patient)
                    .and_then(|p| p.children.remove(study_uid));
                if let Some(study) = study {
                    tree.unindex_study(&patient, &study);
                }
            }
        }
        self.events.publish(ModelEvent::StudyRemoved {
            study_uid: study_uid.to_string(),
        });
        Ok(())
    }

    /// Consistent copy of the whole tree
    pub fn snapshot(&self) -> Vec<PatientView> {
        let tree = self.lock();
        tree.patients.values().map(patient_view).collect()
    }

    /// Patient subtree restricted to the given studies. Unknown UIDs are ignored.
    pub fn snapshot_studies(&self, study_uids: &[String]) -> Vec<PatientView> {
        let tree = self.lock();
        let mut by_patient: BTreeMap<String, PatientView> = BTreeMap::new();
        for uid in study_uids {
            let Some(owners) = tree.studies.get(uid) else {
                continue;
            };
            for patient_key in owners {
                let Some(patient) = tree.patients.get(patient_key) else {
                    continue;
                };
                let Some(study) = patient.children.get(uid) else {
                    continue;
                };
                let view = by_patient
                    .entry(patient_key.clone())
                    .or_insert_with(|| PatientView {
                        node: patient.node.clone(),
                        studies: Vec::new(),
                    });
                if !view.studies.iter().any(|s| s.node.key() == uid) {
                    view.studies.push(study_view(study));
                }
            }
        }
        by_patient.into_values().collect()
    }
}

fn required_uid(attrs: &Attributes, tag: dicom_core::Tag, name: &str) -> Result<String, ModelError> {
    attrs
        .string(tag)
        .map(str::to_string)
        .ok_or_else(|| ModelError::NotFound(name.to_string()))
}

fn patient_view(entry: &Entry) -> PatientView {
    PatientView {
        node: entry.node.clone(),
        studies: entry.children.values().map(study_view).collect(),
    }
}

fn study_view(entry: &Entry) -> StudyView {
    StudyView {
        node: entry.node.clone(),
        series: entry
            .children
            .values()
            .map(|s| SeriesView {
                node: s.node.clone(),
                instances: s
                    .children
                    .values()
                    .map(|i| InstanceView { node: i.node.clone() })
                    .collect(),
            })
            .collect(),
    }
}
