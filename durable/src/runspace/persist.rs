use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{RunSpace, RunSpaceId, RunState};
use crate::{
    DurableError, ObjectRef, Result, VmException,
    storage::{Datum, RUNSPACE_TABLE, Row, Statement, Storage, StorageExt},
};

const NAME_COLUMN: &str = "name";
const NODE_COLUMN: &str = "node";
const STATE_COLUMN: &str = "state";
const CURRENT_COLUMN: &str = "current";
const RELATIONS_COLUMN: &str = "relations";
const RESULT_COLUMN: &str = "result";
const EXCEPTION_COLUMN: &str = "exception";

/// Everything needed to rebuild a run space in a later process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpaceDescriptor {
    pub id: RunSpaceId,
    pub name: String,
    /// Process that last owned the run space.
    pub node: String,
    pub state: RunState,
    pub current: Option<ObjectRef>,
    pub parent: Option<RunSpaceId>,
    pub forked: Vec<RunSpaceId>,
    pub pausing: Vec<RunSpaceId>,
    pub awaiting: Option<RunSpaceId>,
    pub result: Datum,
    pub exception: Option<VmException>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Relations {
    parent: Option<RunSpaceId>,
    #[serde(default)]
    forked: Vec<RunSpaceId>,
    #[serde(default)]
    pausing: Vec<RunSpaceId>,
    awaiting: Option<RunSpaceId>,
}

fn text(row: &Row, column: &str) -> Result<String> {
    row.get(column)
        .and_then(Datum::as_str)
        .map(str::to_owned)
        .ok_or_else(|| DurableError::Codec(format!("run space row without `{column}`")))
}

fn document<T: DeserializeOwned>(row: &Row, column: &str) -> Result<T> {
    Ok(serde_json::from_value(row.get(column).cloned().unwrap_or(Datum::Null))?)
}

impl RunSpaceDescriptor {
    pub fn to_row(&self) -> Result<Row> {
        let relations = Relations {
            parent: self.parent,
            forked: self.forked.clone(),
            pausing: self.pausing.clone(),
            awaiting: self.awaiting,
        };
        let mut row = Row::new();
        row.insert(NAME_COLUMN.into(), Datum::String(self.name.clone()));
        row.insert(NODE_COLUMN.into(), Datum::String(self.node.clone()));
        row.insert(STATE_COLUMN.into(), serde_json::to_value(self.state)?);
        row.insert(
            CURRENT_COLUMN.into(),
            self.current.as_ref().map_or(Datum::Null, ObjectRef::to_document),
        );
        row.insert(RELATIONS_COLUMN.into(), serde_json::to_value(relations)?);
        row.insert(RESULT_COLUMN.into(), self.result.clone());
        row.insert(EXCEPTION_COLUMN.into(), serde_json::to_value(&self.exception)?);
        Ok(row)
    }

    pub fn from_row(id: i64, row: &Row) -> Result<Self> {
        let relations: Relations = match row.get(RELATIONS_COLUMN) {
            None | Some(Datum::Null) => Relations::default(),
            Some(_) => document(row, RELATIONS_COLUMN)?,
        };
        let current = match row.get(CURRENT_COLUMN) {
            None | Some(Datum::Null) => None,
            Some(doc) => Some(ObjectRef::from_document(doc)?),
        };
        Ok(Self {
            id: RunSpaceId(id),
            name: text(row, NAME_COLUMN)?,
            node: text(row, NODE_COLUMN)?,
            state: document(row, STATE_COLUMN)?,
            current,
            parent: relations.parent,
            forked: relations.forked,
            pausing: relations.pausing,
            awaiting: relations.awaiting,
            result: row.get(RESULT_COLUMN).cloned().unwrap_or(Datum::Null),
            exception: document(row, EXCEPTION_COLUMN)?,
        })
    }
}

/// Outcome of a resume. Failures of single descriptors do not stop the
/// others.
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub spaces: Vec<Arc<RunSpace>>,
    pub failures: Vec<(RunSpaceId, DurableError)>,
}

impl ResumeReport {
    pub fn scheduled(&self) -> usize {
        self.spaces
            .iter()
            .filter(|s| s.state() == RunState::Running)
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub(crate) fn store_descriptor(storage: &dyn Storage, descriptor: &RunSpaceDescriptor) -> Result<()> {
    storage.write(Statement::Upsert {
        table: RUNSPACE_TABLE.to_owned(),
        id: descriptor.id.0,
        row: descriptor.to_row()?,
    })?;
    Ok(())
}

/// Reads every stored descriptor. Rows that fail to decode are reported
/// next to the good ones.
pub(crate) fn load_descriptors(
    storage: &dyn Storage,
) -> Result<(Vec<RunSpaceDescriptor>, Vec<(RunSpaceId, DurableError)>)> {
    let mut good = Vec::new();
    let mut bad = Vec::new();
    for (id, row) in storage.select_all(RUNSPACE_TABLE)? {
        match RunSpaceDescriptor::from_row(id, &row) {
            Ok(descriptor) => good.push(descriptor),
            Err(err) => bad.push((RunSpaceId(id), err)),
        }
    }
    Ok((good, bad))
}

pub(crate) fn delete_descriptor(storage: &dyn Storage, id: RunSpaceId) -> Result<bool> {
    let removed = storage.write(Statement::Delete {
        table: RUNSPACE_TABLE.to_owned(),
        id: id.0,
    })?;
    Ok(removed > 0)
}
