//! Work-file codec (C5): six-column CSV describing the Director's task
//! queue, with atomic rename-based durability.
//!
//! Ground truth: `examples/original_source/director/director.go`'s
//! `readTaskFile`/`writeTasksToFile`/`updateOutput`. Uses the `csv` crate
//! (ecosystem-standard — see `other_examples/manifests/Notgnoshi-csvizmo/Cargo.toml`)
//! rather than hand-rolled splitting, but (de)serializes rows manually
//! instead of via `serde`, since the `#`-prefix disable marker and
//! empty-vs-absent value semantics don't map cleanly onto a struct-level
//! derive.

use crate::error::{DppeError, Result};
use crate::transport::Addr;
use crate::types::{self, ParameterType};
use std::path::Path;

/// One row of the work file: a single parameter operation on a single
/// node (spec.md §3).
#[derive(Debug, Clone)]
pub struct DirectorTask {
    /// Target node's active-message address. Never `0` or `0xFFFF`.
    pub address: Addr,
    /// Parameter name, 1..16 bytes.
    pub parameter: String,
    /// Declared wire type.
    pub ty: ParameterType,
    /// Value to write, or `None` for a read-only task.
    pub desired: Option<Vec<u8>>,
    /// Last observed value, or `None` if the task has not completed.
    pub actual: Option<Vec<u8>>,
    /// Free-text status: a timestamp on success, an error message on
    /// failure.
    pub info: String,
    /// `#`-prefixed in the file; skipped entirely by the Director.
    pub disabled: bool,
    /// Set by the Director when a task fails in a way that will never
    /// succeed on retry (spec.md §4.6 / `DppeError::blocks_task`).
    pub blocked: bool,
}

impl DirectorTask {
    /// A fresh, unattempted task.
    pub fn new(address: Addr, parameter: String, ty: ParameterType, desired: Option<Vec<u8>>) -> Self {
        Self {
            address,
            parameter,
            ty,
            desired,
            actual: None,
            info: String::new(),
            disabled: false,
            blocked: false,
        }
    }

    /// This task still needs work: not disabled, not blocked, and no
    /// `actual` value recorded yet (spec.md §4.6's active-node rule).
    pub fn pending(&self) -> bool {
        !self.disabled && !self.blocked && self.actual.is_none()
    }

    fn to_record(&self) -> [String; 6] {
        let addr = format!("{:04x}", self.address);
        let addr = if self.disabled {
            format!("#{addr}")
        } else {
            addr
        };
        let desired = self
            .desired
            .as_deref()
            .map(|b| types::format(self.ty, b).unwrap_or_else(|(dump, _)| dump))
            .unwrap_or_default();
        let actual = self
            .actual
            .as_deref()
            .map(|b| types::format(self.ty, b).unwrap_or_else(|(dump, _)| dump))
            .unwrap_or_default();
        [
            addr,
            self.parameter.clone(),
            self.ty.type_name().to_string(),
            desired,
            actual,
            self.info.clone(),
        ]
    }

    fn from_record(record: &csv::StringRecord) -> Result<Self> {
        if record.len() != 6 {
            return Err(DppeError::MalformedWorkFile(format!(
                "expected 6 fields, got {}",
                record.len()
            )));
        }
        let mut address_field = record[0].to_string();
        let disabled = address_field.starts_with('#');
        if disabled {
            address_field.remove(0);
        }
        let address = u16::from_str_radix(&address_field, 16).map_err(|e| {
            DppeError::MalformedWorkFile(format!("'{address_field}' is not a valid address: {e}"))
        })?;
        if address == 0 || address == 0xFFFF {
            return Err(DppeError::MalformedWorkFile(format!(
                "'{address_field}' is not a valid address"
            )));
        }

        let parameter = record[1].to_string();
        if parameter.is_empty() || parameter.len() > 16 {
            return Err(DppeError::MalformedWorkFile(format!(
                "'{parameter}' is not a valid parameter name"
            )));
        }

        let ty = ParameterType::parse_name(&record[2])?;

        let desired = if record[3].is_empty() {
            None
        } else {
            Some(types::parse(ty, &record[3]).map_err(|_| {
                DppeError::MalformedWorkFile(format!("'{}' is not a valid value", &record[3]))
            })?)
        };
        let actual = if record[4].is_empty() {
            None
        } else {
            Some(types::parse(ty, &record[4]).map_err(|_| {
                DppeError::MalformedWorkFile(format!("'{}' is not a valid value", &record[4]))
            })?)
        };
        let info = record[5].to_string();

        Ok(Self {
            address,
            parameter,
            ty,
            desired,
            actual,
            info,
            disabled,
            blocked: false,
        })
    }
}

const HEADER: [&str; 6] = ["address", "parameter", "type", "desired", "actual", "info"];

/// Read a work file. The header row, if present, is skipped; any other
/// malformed row fails the whole read (spec.md §4.5: "a malformed row
/// invalidates the whole file, rather than being skipped").
pub fn read_tasks(path: &Path) -> Result<Vec<DirectorTask>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .trim(csv::Trim::Fields)
        .from_path(path)?;

    let mut tasks = Vec::new();
    for result in reader.records() {
        let record = result?;
        if record.get(0) == Some("address") {
            continue;
        }
        tasks.push(DirectorTask::from_record(&record)?);
    }
    Ok(tasks)
}

/// Read a plain list of node addresses, one hex value per line, `#`
/// comments allowed (spec.md §4.6's template-mode node list).
pub fn read_node_list(path: &Path) -> Result<Vec<Addr>> {
    let text = std::fs::read_to_string(path)?;
    let mut nodes = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let addr = u16::from_str_radix(line, 16)
            .map_err(|e| DppeError::MalformedWorkFile(format!("'{line}' is not a valid address: {e}")))?;
        nodes.push(addr);
    }
    Ok(nodes)
}

/// Write `tasks` to `path` in one shot (no header skip on read-back:
/// always writes the header row).
pub fn write_tasks(tasks: &[DirectorTask], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(HEADER)?;
    for task in tasks {
        writer.write_record(task.to_record())?;
    }
    writer.flush()?;
    Ok(())
}

/// Durably replace the contents of `path` with `tasks`: write to
/// `path.new`, then rename over `path`. A crash leaves either the old
/// file intact or the new one fully written, never a half-written file
/// (spec.md §4.5 / §8 scenario 6).
pub fn write_tasks_atomic(tasks: &[DirectorTask], path: &Path) -> Result<()> {
    let tmp_path = {
        let mut s = path.as_os_str().to_owned();
        s.push(".new");
        std::path::PathBuf::from(s)
    };
    {
        let mut writer = csv::Writer::from_path(&tmp_path)?;
        writer.write_record(HEADER)?;
        for task in tasks {
            writer.write_record(task.to_record())?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
