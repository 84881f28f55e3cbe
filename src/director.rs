//! Fleet Director (C6): durable, resumable orchestration of a task queue
//! across many nodes.
//!
//! Ground truth: `examples/original_source/director/director.go`. The Go
//! source's `run()` walks the active node set, opens one
//! `DeviceParameterActiveMessageManager` per node, and persists the whole
//! task vector to disk after every single task completes so a killed
//! process resumes exactly where it left off. We keep that shape; the
//! `Option`/functional-option builder becomes ordinary constructor
//! parameters and setters, since Rust doesn't need Go's variadic-option
//! idiom to get optional configuration.

use crate::error::DppeError;
use crate::session::DppeSession;
use crate::taskfile::{self, DirectorTask};
use crate::transport::{Addr, Transport};
use crate::types::ParameterType;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

/// Owns the task queue and the work-file it is persisted to, and walks it
/// to completion (or until interrupted).
pub struct FleetDirector {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    retries: u8,
    filepath: PathBuf,
    tasks: Vec<DirectorTask>,
}

impl FleetDirector {
    /// Bind a Director to `transport`'s bus (its addressing mode and own
    /// local address are fixed when the transport itself was built),
    /// loading the initial task queue from `filepath` (spec.md §4.6: "the
    /// work-file and the task vector are the same durable state").
    pub fn start(
        transport: Arc<dyn Transport>,
        filepath: impl Into<PathBuf>,
    ) -> crate::error::Result<Self> {
        let filepath = filepath.into();
        let tasks = taskfile::read_tasks(&filepath)?;
        Ok(Self {
            transport,
            timeout: Duration::from_secs(30),
            retries: 2,
            filepath,
            tasks,
        })
    }

    /// Like [`FleetDirector::start`], but if `filepath` does not yet
    /// exist, materialize it first from a template task list expanded
    /// across every node in `nodelist` (spec.md §4.6's template mode,
    /// `director.go:StartWithTemplate`). Requires both a template and a
    /// node list; using one without the other is a usage error at the
    /// CLI layer, not handled here.
    pub fn start_with_template(
        transport: Arc<dyn Transport>,
        filepath: impl Into<PathBuf>,
        template: &Path,
        nodelist: &Path,
    ) -> crate::error::Result<Self> {
        let filepath = filepath.into();
        if !filepath.exists() {
            log::info!("task file does not exist, expanding template");
            let template_tasks = taskfile::read_tasks(template)?;
            let nodes = taskfile::read_node_list(nodelist)?;
            let mut expanded = Vec::with_capacity(nodes.len() * template_tasks.len());
            for node in &nodes {
                for task in &template_tasks {
                    let mut t = task.clone();
                    t.address = *node;
                    expanded.push(t);
                }
            }
            taskfile::write_tasks(&expanded, &filepath)?;
        } else {
            log::info!("task file exists, not using template");
        }
        Self::start(transport, filepath)
    }

    /// Override the per-request timeout (default 30s).
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Override the additional-retry count (default 2).
    pub fn set_retries(&mut self, retries: u8) {
        self.retries = retries;
    }

    fn active_nodes(&self) -> BTreeSet<Addr> {
        self.tasks
            .iter()
            .filter(|t| t.pending())
            .map(|t| t.address)
            .collect()
    }

    fn persist(&self) {
        if let Err(e) = taskfile::write_tasks_atomic(&self.tasks, &self.filepath) {
            log::error!("error updating task file: {e}");
        }
    }

    /// Run the task queue to completion, checking `interrupted` once per
    /// task and once per node (spec.md §5's cancellation model: at most
    /// one in-flight operation is abandoned mid-retry). Returns whether
    /// the run completed all tasks (`true`) or was interrupted (`false`).
    pub fn run(&mut self, interrupted: &AtomicBool) -> bool {
        log::debug!("{} tasks in queue", self.tasks.len());
        loop {
            let nodes = self.active_nodes();
            if nodes.is_empty() {
                return true;
            }
            log::debug!("{} nodes in queue", nodes.len());
            for node in nodes {
                let session = DppeSession::new(
                    self.transport.clone(),
                    Some(node),
                    self.timeout,
                    self.retries,
                );

                for idx in 0..self.tasks.len() {
                    if !(self.tasks[idx].address == node && self.tasks[idx].pending()) {
                        continue;
                    }
                    log::debug!("{:?}", self.tasks[idx]);
                    let skip = self.run_one(&session, idx);
                    self.persist();
                    if skip {
                        break;
                    }
                    if interrupted.load(Ordering::SeqCst) {
                        log::debug!("interrupted");
                        return false;
                    }
                }
                drop(session);
                if interrupted.load(Ordering::SeqCst) {
                    log::debug!("interrupted");
                    return false;
                }
            }
        }
    }

    /// Execute the single task at `idx` against `session`. Returns
    /// `true` if the queue should abandon this node for the pass and move
    /// on to the next one (a timeout, or any error the engine did not
    /// classify as permanently blocking); `false` if the node has more
    /// pending tasks worth trying, including right after a blocking error
    /// (`ParameterNotFound`/`InvalidValue`/`ValueMismatch`) on this task.
    fn run_one(&mut self, session: &DppeSession, idx: usize) -> bool {
        let task = &self.tasks[idx];
        let address = task.address;
        let parameter = task.parameter.clone();

        // A read is only requested when no desired value was given *and*
        // the declared type isn't NIL; a NIL-typed task with no desired
        // value is a trigger write with an empty value (director.go:193).
        let is_read = task.desired.is_none() && task.ty != ParameterType::Nil;
        let result = if is_read {
            session.get_value(&parameter)
        } else {
            session.set_value(&parameter, task.desired.clone().unwrap_or_default())
        };

        let task = &mut self.tasks[idx];
        match result {
            Ok(p) => {
                if task.ty != p.ty {
                    log::warn!(
                        "parameter {parameter} on node {address:04x} reported type {}, task declared {}",
                        p.ty,
                        task.ty
                    );
                }
                task.ty = p.ty;
                task.actual = Some(p.value);
                task.info = format_timestamp(SystemTime::now());
                if is_read {
                    log::info!("got parameter {parameter} from node {address:04x}");
                } else {
                    log::info!("set parameter {parameter} on node {address:04x}");
                }
                false
            }
            Err(e) => {
                log::warn!("failed to get/set parameter {parameter} on node {address:04x}: {e}");
                task.info = e.to_string();
                if let DppeError::ValueMismatch { ref actual, .. } = e {
                    // Record what the device actually holds; blocked
                    // below pending more advanced reconciliation.
                    task.actual = Some(actual.clone());
                }
                task.blocked = e.blocks_task();
                // A blocking error (ParameterNotFound/InvalidValue/
                // ValueMismatch) is done with for this node; move on to
                // the next pending task on the same node. Timeout or
                // anything unclassified instead abandons this node for
                // the pass and moves to the next one.
                !e.blocks_task()
            }
        }
    }
}

fn format_timestamp(t: SystemTime) -> String {
    let duration = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let datetime = chrono::DateTime::<chrono::Utc>::from(
        SystemTime::UNIX_EPOCH + duration,
    );
    datetime.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use super::*;
    use crate::mock_transport::MockTransport;
    use crate::packet::Frame;
    use crate::transport::{Packet, TransportMode};
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn write_work_file(path: &Path) {
        let tasks = vec![
            DirectorTask::new(0x0001, "chan".to_string(), ParameterType::Uint8, Some(vec![5])),
            DirectorTask::new(0x0002, "chan".to_string(), ParameterType::Uint8, Some(vec![5])),
        ];
        taskfile::write_tasks(&tasks, path).unwrap();
    }

    fn spawn_autoresponder(mock: Arc<MockTransport>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            let mut answered = 0;
            while answered < 2 && std::time::Instant::now() < deadline {
                let sent = mock.sent();
                if sent.len() > answered {
                    let request = &sent[answered];
                    if let Ok(Frame::SetById { id, value }) = Frame::decode(request.get_payload()) {
                        let mut reply = Packet::default();
                        reply.set_payload(
                            Frame::Parameter {
                                ty: ParameterType::Uint8.code(),
                                seqnum: 0,
                                id,
                                value,
                            }
                            .encode()
                            .unwrap(),
                        );
                        // The device "echoes" from the address the
                        // request was sent to.
                        mock.inject_from(reply, request.destination().unwrap());
                        answered += 1;
                    }
                } else {
                    std::thread::yield_now();
                }
            }
        })
    }

    #[test]
    fn run_completes_and_persists_progress() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.csv");
        write_work_file(&path);

        let mock = Arc::new(MockTransport::new(TransportMode::ActiveMessage {
            group: 0x22,
            local: 1,
        }));
        let responder = spawn_autoresponder(mock.clone());

        let mut director = FleetDirector::start(mock, &path).unwrap();
        director.set_timeout(Duration::from_millis(500));
        let interrupted = AtomicBool::new(false);
        let finished = director.run(&interrupted);
        responder.join().unwrap();

        assert!(finished);
        let persisted = taskfile::read_tasks(&path).unwrap();
        assert_eq!(persisted.len(), 2);
        assert!(persisted.iter().all(|t| t.actual == Some(vec![5])));
    }

    #[test]
    fn blocking_error_does_not_abandon_remaining_tasks_on_node() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.csv");
        let tasks = vec![
            DirectorTask::new(0x0001, "missing".to_string(), ParameterType::Uint8, None),
            DirectorTask::new(0x0001, "chan".to_string(), ParameterType::Uint8, Some(vec![5])),
        ];
        taskfile::write_tasks(&tasks, &path).unwrap();

        let mock = Arc::new(MockTransport::new(TransportMode::ActiveMessage {
            group: 0x22,
            local: 1,
        }));
        let responder = std::thread::spawn({
            let mock = mock.clone();
            move || {
                let deadline = std::time::Instant::now() + Duration::from_secs(3);
                let mut answered = 0;
                while answered < 2 && std::time::Instant::now() < deadline {
                    let sent = mock.sent();
                    if sent.len() > answered {
                        let request = &sent[answered];
                        let reply_payload = match Frame::decode(request.get_payload()).unwrap() {
                            Frame::GetById { id } => Frame::ErrorById {
                                exists: false,
                                err: 0,
                                id,
                            },
                            Frame::SetById { id, value } => Frame::Parameter {
                                ty: ParameterType::Uint8.code(),
                                seqnum: 0,
                                id,
                                value,
                            },
                            other => panic!("unexpected frame {other:?}"),
                        };
                        let mut reply = Packet::default();
                        reply.set_payload(reply_payload.encode().unwrap());
                        reply.set_source(request.destination().unwrap());
                        mock.inject(reply);
                        answered += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        });

        let mut director = FleetDirector::start(mock, &path).unwrap();
        director.set_timeout(Duration::from_millis(500));
        let interrupted = AtomicBool::new(false);
        let finished = director.run(&interrupted);
        responder.join().unwrap();

        assert!(finished);
        let persisted = taskfile::read_tasks(&path).unwrap();
        assert!(persisted[0].blocked);
        assert_eq!(persisted[1].actual, Some(vec![5]));
    }

    #[test]
    fn template_mode_expands_tasks_across_node_list() {
        let dir = tempdir().unwrap();
        let template_path = dir.path().join("template.csv");
        let nodes_path = dir.path().join("nodes.txt");
        let work_path = dir.path().join("work.csv");

        taskfile::write_tasks(
            &[DirectorTask::new(
                0x0001,
                "chan".to_string(),
                ParameterType::Uint8,
                None,
            )],
            &template_path,
        )
        .unwrap();
        std::fs::write(&nodes_path, "0002\n0003\n").unwrap();

        let mock = Arc::new(MockTransport::new(TransportMode::ActiveMessage {
            group: 0x22,
            local: 1,
        }));
        let director =
            FleetDirector::start_with_template(mock, &work_path, &template_path, &nodes_path)
                .unwrap();

        assert_eq!(director.tasks.len(), 2);
        assert_eq!(director.tasks[0].address, 0x0002);
        assert_eq!(director.tasks[1].address, 0x0003);
    }
}
